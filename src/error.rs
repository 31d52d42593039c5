//! Error types for the update sandbox.

pub use crate::sandbox::error::SandboxError;

/// Top-level error returned by a run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Control plane error: {0}")]
    Api(#[from] ApiError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    /// The updater's calls did not match the scenario.
    #[error("update failed expectations ({count} errors)")]
    FailedExpectations { count: usize },

    /// The update command itself exited non-zero.
    #[error("updater exited with code {code}")]
    UpdaterExit { code: i64 },
}

impl Error {
    /// Whether the run was cut short by its deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Sandbox(SandboxError::Timeout(_)))
    }
}

/// Errors in run parameters and job input. These are raised before any
/// container exists.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("job is required")]
    MissingJob,

    #[error("commit must be a SHA, or not provided")]
    InvalidCommit,

    #[error("unknown package manager: {0}")]
    UnknownPackageManager(String),

    #[error("invalid volume syntax: {0}")]
    InvalidVolume(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Failed to parse input: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Credential checks that refuse to hand a token to the sandbox.
#[derive(Debug, thiserror::Error)]
pub enum SecurityError {
    #[error(
        "for security, credentials used in update are not allowed to have write access to GitHub API"
    )]
    WriteAccess,

    #[error("failed making request: {0}")]
    Request(#[from] reqwest::Error),

    #[error("failed request to GitHub API to check access: {status}")]
    UnexpectedStatus { status: String },
}

/// Control-plane mock lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Failed to bind control plane to {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Input listener failed: {reason}")]
    InputListener { reason: String },
}

/// Writing the recorded scenario.
#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("failed to write output: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize output: {0}")]
    Serialize(String),
}

/// Result type for run operations.
pub type Result<T> = std::result::Result<T, Error>;
