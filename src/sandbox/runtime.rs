//! Container runtime capability.
//!
//! Everything the sandbox needs from a container engine goes through
//! [`ContainerRuntime`]. The production implementation talks to Docker via
//! bollard ([`super::docker::DockerRuntime`]); tests substitute an in-memory
//! fake.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio::io::AsyncWrite;

use super::error::Result;

/// Credentials for pulling from a private registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub server: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSpec {
    pub name: String,
    /// Internal networks have no route off the host.
    pub internal: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeSpec {
    pub name: String,
    pub driver: String,
    pub options: BTreeMap<String, String>,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: Option<String>,
    pub image: String,
    pub user: Option<String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub tty: bool,
    /// Docker bind/volume strings, `source:target[:ro]`.
    pub binds: Vec<String>,
    /// `host:address` entries added to `/etc/hosts`.
    pub extra_hosts: Vec<String>,
    /// Network attached at creation.
    pub network: Option<String>,
}

/// A command to run in an existing container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub user: Option<String>,
    pub env: Vec<String>,
    pub tty: bool,
    pub attach_stdin: bool,
}

impl ExecSpec {
    /// Run `script` with `/bin/sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            cmd: vec!["/bin/sh".to_string(), "-c".to_string(), script.into()],
            ..Default::default()
        }
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

pub type OutputStream = BoxStream<'static, Result<Bytes>>;

/// A started exec: its combined output and, when attached, its stdin.
pub struct ExecSession {
    pub id: String,
    pub output: OutputStream,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl std::fmt::Debug for ExecSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecSession").field("id", &self.id).finish()
    }
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Make `image` available locally, pulling only when it is absent.
    async fn ensure_image(&self, image: &str, auth: Option<RegistryAuth>) -> Result<()>;

    async fn create_network(&self, spec: &NetworkSpec) -> Result<()>;
    async fn remove_network(&self, name: &str) -> Result<()>;
    async fn connect_network(&self, network: &str, container_id: &str) -> Result<()>;

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<()>;
    async fn remove_volume(&self, name: &str) -> Result<()>;

    /// Create a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()>;
    /// Force-remove a container.
    async fn remove_container(&self, id: &str) -> Result<()>;
    /// Exit code from the container's state; 0 while it is still running.
    async fn container_exit_code(&self, id: &str) -> Result<i64>;
    /// IP address of the container on `network`.
    async fn container_address(&self, id: &str, network: &str) -> Result<String>;

    /// Extract a tar archive into `dest` inside the container.
    async fn upload_archive(&self, id: &str, dest: &str, archive: Bytes) -> Result<()>;
    /// Read a single file out of the container.
    async fn download_file(&self, id: &str, path: &str) -> Result<Vec<u8>>;

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecSession>;
    /// Exit code of a finished exec.
    async fn exec_exit_code(&self, exec_id: &str) -> Result<i64>;
    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> Result<()>;

    /// Follow the container's combined stdout/stderr.
    fn logs(&self, id: &str) -> OutputStream;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_exec_spec() {
        let spec = ExecSpec::shell("echo hi").user("root");
        assert_eq!(spec.cmd, vec!["/bin/sh", "-c", "echo hi"]);
        assert_eq!(spec.user.as_deref(), Some("root"));
        assert!(!spec.tty);
    }
}
