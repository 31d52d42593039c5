//! Case-insensitive storage side-car.
//!
//! Some ecosystems need a case-insensitive checkout. A storage container
//! exports one SMB share; the updater mounts it twice through CIFS-backed
//! volumes, once as-is at `/dpdbot` and once with `nocase` at `/nocase`.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::StreamExt;

use super::error::{Result, SandboxError};
use super::network::NetworkTopology;
use super::runtime::{ContainerRuntime, ContainerSpec, ExecSpec, VolumeSpec};
use super::teardown::{Resource, Teardown};

pub const CASE_SENSITIVE_ROOT: &str = "/dpdbot";
pub const CASE_SENSITIVE_REPO: &str = "/dpdbot/repo";
pub const CASE_INSENSITIVE_ROOT: &str = "/nocase";
pub const CASE_INSENSITIVE_REPO: &str = "/nocase/repo";

const SMB_PORT: u16 = 445;
const STORAGE_USER: &str = "dpduser";
const STORAGE_PASSWORD: &str = "dpdpass";
const PORT_ATTEMPTS: usize = 5;
const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct StorageSidecar {
    pub container_id: String,
    /// Volume binds for the updater container.
    pub binds: Vec<String>,
}

/// Shell test for a listening TCP port; `/proc/net/tcp` lists ports as 4 hex digits.
pub fn port_probe(port: u16) -> String {
    format!(
        "test -f /proc/net/tcp && grep ' *\\d+: [A-F0-9]{{8}}:{port:04X} ' /proc/net/tcp >/dev/null 2>&1"
    )
}

/// Poll until `port` is listening inside the container.
pub async fn wait_for_port(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    port: u16,
    interval: Duration,
) -> Result<()> {
    let probe = ExecSpec::shell(port_probe(port)).user("root");
    for attempt in 1..=PORT_ATTEMPTS {
        let mut session = runtime.exec(container_id, &probe).await?;
        while session.output.next().await.is_some() {}
        if runtime.exec_exit_code(&session.id).await? == 0 {
            tracing::info!("Port {} is listening after {} attempts", port, attempt);
            // An open port does not mean the service accepts connections yet.
            tokio::time::sleep(interval).await;
            return Ok(());
        }
        if attempt < PORT_ATTEMPTS {
            tokio::time::sleep(interval).await;
        }
    }
    Err(SandboxError::ContainerStartFailed {
        reason: format!("port {port} is not listening after {PORT_ATTEMPTS} attempts"),
    })
}

fn cifs_volume(name: String, address: &str, extra: Option<&str>) -> VolumeSpec {
    let credentials = format!("username={STORAGE_USER},password={STORAGE_PASSWORD},uid=1000,gid=1000");
    let o = match extra {
        Some(extra) => format!("{extra},{credentials}"),
        None => credentials,
    };
    VolumeSpec {
        name,
        driver: "local".to_string(),
        options: BTreeMap::from([
            ("type".to_string(), "cifs".to_string()),
            ("device".to_string(), format!("//{address}/dpdbot")),
            ("o".to_string(), o),
        ]),
    }
}

impl StorageSidecar {
    pub async fn start(
        runtime: &dyn ContainerRuntime,
        teardown: &mut Teardown,
        networks: &NetworkTopology,
        image: &str,
    ) -> Result<Self> {
        Self::start_with_interval(runtime, teardown, networks, image, POLL_INTERVAL).await
    }

    async fn start_with_interval(
        runtime: &dyn ContainerRuntime,
        teardown: &mut Teardown,
        networks: &NetworkTopology,
        image: &str,
        interval: Duration,
    ) -> Result<Self> {
        tracing::info!("Preparing case insensitive filesystem");
        let spec = ContainerSpec {
            image: image.to_string(),
            user: Some("root".to_string()),
            tty: true,
            network: Some(networks.no_internet.clone()),
            ..Default::default()
        };
        let id = teardown
            .create_container(spec, Resource::container("", "storage"))
            .await?;

        runtime.start_container(&id).await?;
        wait_for_port(runtime, &id, SMB_PORT, interval).await?;

        // The host mounts the share directly, so it needs the container's address.
        let address = runtime.container_address(&id, &networks.no_internet).await?;
        let short_id = id.get(..12).unwrap_or(&id);

        let mut binds = Vec::new();
        for (volume, root, extra) in [
            (
                format!("dpdbot-storage-{short_id}"),
                CASE_SENSITIVE_ROOT,
                None,
            ),
            (
                format!("dpdbot-nocase-{short_id}"),
                CASE_INSENSITIVE_ROOT,
                Some("nocase"),
            ),
        ] {
            runtime
                .create_volume(&cifs_volume(volume.clone(), &address, extra))
                .await?;
            teardown.push(Resource::Volume {
                name: volume.clone(),
            });
            binds.push(format!("{volume}:{root}"));
        }

        Ok(Self {
            container_id: id,
            binds,
        })
    }
}
