//! Docker-backed [`ContainerRuntime`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{
    Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
    LogsOptions, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions};
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};

use super::archive;
use super::error::{Result, SandboxError};
use super::runtime::{
    ContainerRuntime, ContainerSpec, ExecSession, ExecSpec, NetworkSpec, OutputStream,
    RegistryAuth, VolumeSpec,
};

/// Connect to the local Docker daemon and make sure it answers.
pub async fn connect_docker() -> Result<Docker> {
    let docker =
        Docker::connect_with_local_defaults().map_err(|e| SandboxError::DockerNotAvailable {
            reason: e.to_string(),
        })?;
    docker
        .ping()
        .await
        .map_err(|e| SandboxError::DockerNotAvailable {
            reason: e.to_string(),
        })?;
    Ok(docker)
}

fn none_if_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() { None } else { Some(items) }
}

#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect with local defaults.
    pub async fn connect() -> Result<Self> {
        Ok(Self::new(connect_docker().await?))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ensure_image(&self, image: &str, auth: Option<RegistryAuth>) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        tracing::info!(image = %image, "Pulling image");
        let credentials = auth.map(|auth| DockerCredentials {
            username: Some(auth.username),
            password: Some(auth.password),
            serveraddress: auth.server,
            ..Default::default()
        });
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, credentials);
        while let Some(update) = progress.next().await {
            let update = update.map_err(|e| SandboxError::ImagePullFailed {
                image: image.to_string(),
                reason: e.to_string(),
            })?;
            if let Some(status) = update.status {
                tracing::debug!(image = %image, "{}", status);
            }
        }
        Ok(())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<()> {
        let options = CreateNetworkOptions {
            name: spec.name.clone(),
            driver: "bridge".to_string(),
            internal: spec.internal,
            ..Default::default()
        };
        self.docker
            .create_network(options)
            .await
            .map_err(|e| SandboxError::NetworkCreationFailed {
                reason: format!("{}: {}", spec.name, e),
            })?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.docker.remove_network(name).await?;
        Ok(())
    }

    async fn connect_network(&self, network: &str, container_id: &str) -> Result<()> {
        let options = ConnectNetworkOptions {
            container: container_id.to_string(),
            endpoint_config: EndpointSettings::default(),
        };
        self.docker.connect_network(network, options).await?;
        Ok(())
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<()> {
        let options = CreateVolumeOptions {
            name: spec.name.clone(),
            driver: spec.driver.clone(),
            driver_opts: spec
                .options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
            labels: HashMap::new(),
        };
        self.docker.create_volume(options).await?;
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        let host_config = HostConfig {
            binds: none_if_empty(spec.binds.clone()),
            extra_hosts: none_if_empty(spec.extra_hosts.clone()),
            network_mode: spec.network.clone(),
            ..Default::default()
        };
        let config = Config {
            image: Some(spec.image.clone()),
            user: spec.user.clone(),
            entrypoint: spec.entrypoint.clone(),
            cmd: spec.cmd.clone(),
            env: none_if_empty(spec.env.clone()),
            tty: Some(spec.tty),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = spec.name.clone().map(|name| CreateContainerOptions {
            name,
            platform: None,
        });

        let response = self
            .docker
            .create_container(options, config)
            .await
            .map_err(|e| SandboxError::ContainerCreationFailed {
                reason: format!("{}: {}", spec.image, e),
            })?;
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::ContainerStartFailed {
                reason: e.to_string(),
            })
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        self.docker.stop_container(id, Some(options)).await?;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn container_exit_code(&self, id: &str) -> Result<i64> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        Ok(info.state.and_then(|s| s.exit_code).unwrap_or(0))
    }

    async fn container_address(&self, id: &str, network: &str) -> Result<String> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        info.network_settings
            .and_then(|settings| settings.networks)
            .and_then(|mut networks| networks.remove(network))
            .and_then(|endpoint| endpoint.ip_address)
            .filter(|ip| !ip.is_empty())
            .ok_or_else(|| SandboxError::Config {
                reason: format!("container {id} has no address on network {network}"),
            })
    }

    async fn upload_archive(&self, id: &str, dest: &str, archive: Bytes) -> Result<()> {
        let options = UploadToContainerOptions {
            path: dest.to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), archive)
            .await
            .map_err(|e| SandboxError::CopyFailed {
                path: dest.to_string(),
                reason: e.to_string(),
            })
    }

    async fn download_file(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let chunks: Vec<Bytes> = self
            .docker
            .download_from_container(id, Some(options))
            .try_collect()
            .await
            .map_err(|e| SandboxError::CopyFailed {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        let tarball = chunks.concat();
        archive::extract_single_file(&tarball).map_err(|e| SandboxError::CopyFailed {
            path: path.to_string(),
            reason: e.to_string(),
        })
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecSession> {
        let options = CreateExecOptions {
            cmd: Some(spec.cmd.clone()),
            user: spec.user.clone(),
            env: none_if_empty(spec.env.clone()),
            tty: Some(spec.tty),
            attach_stdin: Some(spec.attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let created = self.docker.create_exec(id, options).await.map_err(|e| {
            SandboxError::ExecutionFailed {
                reason: format!("create exec: {e}"),
            }
        })?;

        let start = StartExecOptions {
            detach: false,
            tty: spec.tty,
            output_capacity: None,
        };
        let started = self
            .docker
            .start_exec(&created.id, Some(start))
            .await
            .map_err(|e| SandboxError::ExecutionFailed {
                reason: format!("start exec: {e}"),
            })?;

        match started {
            StartExecResults::Attached { output, input } => {
                let output: OutputStream = output
                    .map(|chunk| chunk.map(|log| log.into_bytes()).map_err(SandboxError::from))
                    .boxed();
                Ok(ExecSession {
                    id: created.id,
                    output,
                    input,
                })
            }
            StartExecResults::Detached => Ok(ExecSession {
                id: created.id,
                output: futures::stream::empty().boxed(),
                input: Box::pin(tokio::io::sink()),
            }),
        }
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<i64> {
        let info = self.docker.inspect_exec(exec_id).await?;
        Ok(info.exit_code.unwrap_or(0))
    }

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> Result<()> {
        let options = ResizeExecOptions {
            height: rows,
            width: cols,
        };
        self.docker.resize_exec(exec_id, options).await?;
        Ok(())
    }

    fn logs(&self, id: &str) -> OutputStream {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        self.docker
            .logs(id, Some(options))
            .map(|chunk| chunk.map(|log| log.into_bytes()).map_err(SandboxError::from))
            .boxed()
    }
}
