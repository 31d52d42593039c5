//! The credential-injecting proxy container.
//!
//! The proxy is the only container attached to both networks. It receives
//! the unredacted credentials and the run's CA through `/config.json`,
//! installs any extra trusted certificate at startup, and listens on
//! [`PROXY_PORT`].

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::archive;
use super::ca::CertificateAuthority;
use super::error::{Result, SandboxError};
use super::logs;
use super::network::NetworkTopology;
use super::runtime::{ContainerRuntime, ContainerSpec};
use super::teardown::{Resource, Teardown};
use crate::model::Credential;

pub const PROXY_PORT: u16 = 1080;

const CONFIG_PATH: &str = "/config.json";
const CUSTOM_CERT_PATH: &str = "/usr/local/share/ca-certificates/custom-ca-cert.crt";
const CACHE_PATH: &str = "/cache";
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Payload written to the proxy's config file.
#[derive(Serialize)]
struct ProxyConfig<'a> {
    all_credentials: &'a [Credential],
    ca: &'a CertificateAuthority,
}

/// Caller-controlled proxy settings.
#[derive(Debug, Clone, Default)]
pub struct ProxyOptions {
    pub image: String,
    pub job_id: String,
    /// Expanded credentials.
    pub credentials: Vec<Credential>,
    pub extra_hosts: Vec<String>,
    /// Extra certificate the proxy should trust for upstream TLS.
    pub proxy_cert: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ProxyGateway {
    pub container_id: String,
    /// `http://<address>:1080`, as seen from the no-internet network.
    pub url: String,
}

fn proxy_error(action: &str, e: impl std::fmt::Display) -> SandboxError {
    SandboxError::ProxyError {
        reason: format!("failed to {action}: {e}"),
    }
}

/// Host binds for the proxy container.
fn proxy_binds(options: &ProxyOptions) -> Result<Vec<String>> {
    let mut binds = Vec::new();
    if let Some(cert) = &options.proxy_cert {
        let cert = std::path::absolute(cert)?;
        binds.push(format!("{}:{}:ro", cert.display(), CUSTOM_CERT_PATH));
    }
    if let Some(cache) = &options.cache_dir {
        std::fs::create_dir_all(cache)?;
        let cache = std::path::absolute(cache)?;
        binds.push(format!("{}:{}", cache.display(), CACHE_PATH));
    }
    Ok(binds)
}

impl ProxyGateway {
    /// Create, configure and start the proxy.
    pub async fn start(
        runtime: &dyn ContainerRuntime,
        teardown: &mut Teardown,
        networks: &NetworkTopology,
        ca: &CertificateAuthority,
        options: &ProxyOptions,
    ) -> Result<Self> {
        let mut extra_hosts = vec!["host.docker.internal:host-gateway".to_string()];
        extra_hosts.extend(options.extra_hosts.iter().cloned());

        let spec = ContainerSpec {
            name: Some(format!("update-sandbox-proxy-{}", Uuid::new_v4().simple())),
            image: options.image.clone(),
            entrypoint: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "update-ca-certificates && /update-job-proxy".to_string(),
            ]),
            env: vec![
                format!("JOB_ID={}", options.job_id),
                "PROXY_CACHE=true".to_string(),
            ],
            binds: proxy_binds(options)?,
            extra_hosts,
            network: Some(networks.no_internet.clone()),
            ..Default::default()
        };

        let resource = Resource::Container {
            id: String::new(),
            role: "proxy".to_string(),
            stop_grace: Some(STOP_GRACE),
            check_exit: true,
        };
        let id = teardown
            .create_container(spec, resource)
            .await
            .map_err(|e| proxy_error("create proxy container", e))?;

        let config = ProxyConfig {
            all_credentials: &options.credentials,
            ca,
        };
        let data = serde_json::to_vec(&config).map_err(|e| proxy_error("marshal config", e))?;
        let tarball = archive::single_file(CONFIG_PATH.trim_start_matches('/'), &data, 0o644)?;
        runtime
            .upload_archive(&id, "/", tarball)
            .await
            .map_err(|e| proxy_error("copy config to proxy", e))?;

        runtime
            .connect_network(&networks.internet, &id)
            .await
            .map_err(|e| proxy_error("connect to network", e))?;

        runtime
            .start_container(&id)
            .await
            .map_err(|e| proxy_error("start proxy container", e))?;

        let address = runtime.container_address(&id, &networks.no_internet).await?;
        let url = format!("http://{address}:{PROXY_PORT}");
        tracing::info!(container_id = %id, url = %url, "Proxy started");

        Ok(Self {
            container_id: id,
            url,
        })
    }

    pub fn tail_logs(&self, runtime: &dyn ContainerRuntime, token: CancellationToken) -> JoinHandle<()> {
        logs::spawn_tail(runtime.logs(&self.container_id), "proxy | ", token)
    }
}
