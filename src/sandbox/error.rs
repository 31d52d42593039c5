//! Error types for the container sandbox.

use std::time::Duration;

/// Errors that can occur while provisioning, running or tearing down the sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Docker daemon is not available or not running.
    #[error("Docker not available: {reason}")]
    DockerNotAvailable { reason: String },

    /// Failed to pull or inspect an image.
    #[error("Image pull failed for {image}: {reason}")]
    ImagePullFailed { image: String, reason: String },

    /// Failed to create a network.
    #[error("Network creation failed: {reason}")]
    NetworkCreationFailed { reason: String },

    /// Failed to create container.
    #[error("Container creation failed: {reason}")]
    ContainerCreationFailed { reason: String },

    /// Failed to start container.
    #[error("Container start failed: {reason}")]
    ContainerStartFailed { reason: String },

    /// Copying files into or out of a container failed.
    #[error("Copy failed for {path}: {reason}")]
    CopyFailed { path: String, reason: String },

    /// Command execution failed inside container.
    #[error("Execution failed: {reason}")]
    ExecutionFailed { reason: String },

    /// A container reported a non-zero exit status.
    #[error("{role} container exited with non-zero exit code: {code}")]
    NonZeroExit { role: String, code: i64 },

    /// The run deadline elapsed.
    #[error("Command timed out after {0:?}")]
    Timeout(Duration),

    /// The run was cancelled by an interrupt signal.
    #[error("Run interrupted")]
    Interrupted,

    /// Generating the run's certificate authority failed.
    #[error("Certificate generation failed: {reason}")]
    Certificate { reason: String },

    /// Network proxy error.
    #[error("Proxy error: {reason}")]
    ProxyError { reason: String },

    /// One or more resources could not be released.
    #[error("Teardown failed: {}", failures.join("; "))]
    Teardown { failures: Vec<String> },

    /// Docker API error.
    #[error("Docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error.
    #[error("Configuration error: {reason}")]
    Config { reason: String },
}

/// Result type for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;
