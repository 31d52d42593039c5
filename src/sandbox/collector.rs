//! Optional telemetry collector side-car.

use std::path::Path;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::archive;
use super::ca::CertificateAuthority;
use super::error::{Result, SandboxError};
use super::logs;
use super::network::NetworkTopology;
use super::proxy::ProxyGateway;
use super::runtime::{ContainerRuntime, ContainerSpec};
use super::teardown::{Resource, Teardown};

/// OTLP over HTTP.
pub const COLLECTOR_PORT: u16 = 4318;

const CONFIG_PATH: &str = "/etc/otelcol-contrib/config.yaml";
const TRUST_STORE_PATH: &str = "/etc/ssl/certs/ca-certificates.crt";

#[derive(Debug, Clone)]
pub struct Collector {
    pub container_id: String,
    /// OTLP endpoint handed to the updater.
    pub url: String,
}

impl Collector {
    /// Start a collector on the no-internet network, exporting through the proxy.
    pub async fn start(
        runtime: &dyn ContainerRuntime,
        teardown: &mut Teardown,
        networks: &NetworkTopology,
        proxy: &ProxyGateway,
        ca: &CertificateAuthority,
        image: &str,
        config_path: &Path,
    ) -> Result<Self> {
        let config_path = std::path::absolute(config_path)?;
        let spec = ContainerSpec {
            image: image.to_string(),
            env: vec![
                format!("HTTP_PROXY={}", proxy.url),
                format!("HTTPS_PROXY={}", proxy.url),
            ],
            binds: vec![format!("{}:{}:ro", config_path.display(), CONFIG_PATH)],
            network: Some(networks.no_internet.clone()),
            ..Default::default()
        };

        let id = teardown
            .create_container(spec, Resource::container("", "collector"))
            .await?;

        let tarball = archive::single_file(
            TRUST_STORE_PATH.trim_start_matches('/'),
            ca.cert.as_bytes(),
            0o644,
        )?;
        runtime
            .upload_archive(&id, "/", tarball)
            .await
            .map_err(|e| SandboxError::CopyFailed {
                path: TRUST_STORE_PATH.to_string(),
                reason: e.to_string(),
            })?;

        runtime.start_container(&id).await?;
        let address = runtime.container_address(&id, &networks.no_internet).await?;
        let url = format!("http://{address}:{COLLECTOR_PORT}");
        tracing::info!(container_id = %id, url = %url, "Collector started");

        Ok(Self {
            container_id: id,
            url,
        })
    }

    pub fn tail_logs(&self, runtime: &dyn ContainerRuntime, token: CancellationToken) -> JoinHandle<()> {
        logs::spawn_tail(runtime.logs(&self.container_id), "collector | ", token)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::sandbox::testing::FakeRuntime;

    #[tokio::test]
    async fn test_collector_wiring() {
        let fake = Arc::new(FakeRuntime::default());
        let mut teardown = Teardown::new(fake.clone());
        let networks = NetworkTopology {
            internet: "egress".to_string(),
            no_internet: "isolated".to_string(),
        };
        let proxy = ProxyGateway {
            container_id: "proxy".to_string(),
            url: "http://172.20.0.9:1080".to_string(),
        };
        let ca = CertificateAuthority {
            cert: "CERT".to_string(),
            key: "KEY".to_string(),
        };

        let collector = Collector::start(
            fake.as_ref(),
            &mut teardown,
            &networks,
            &proxy,
            &ca,
            "otel:latest",
            Path::new("/etc/otel.yaml"),
        )
        .await
        .unwrap();
        assert_eq!(collector.url, "http://172.20.0.2:4318");

        let spec = &fake.containers()[0];
        assert_eq!(spec.network.as_deref(), Some("isolated"));
        assert_eq!(
            spec.env,
            vec![
                "HTTP_PROXY=http://172.20.0.9:1080",
                "HTTPS_PROXY=http://172.20.0.9:1080"
            ]
        );
        assert_eq!(
            spec.binds,
            vec!["/etc/otel.yaml:/etc/otelcol-contrib/config.yaml:ro"]
        );

        let (_, _, tarball) = &fake.uploads()[0];
        let mut archive = tar::Archive::new(tarball.as_ref());
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(
            entry.path().unwrap().to_string_lossy(),
            "etc/ssl/certs/ca-certificates.crt"
        );

        teardown.release().await.unwrap();
        assert!(fake.calls().contains(&format!("remove_container {}", collector.container_id)));
    }
}
