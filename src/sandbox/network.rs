//! The two networks of a run.
//!
//! The updater only ever joins `no_internet`, which is internal to the host.
//! The proxy joins both and is the updater's only way out.

use uuid::Uuid;

use super::error::Result;
use super::runtime::{ContainerRuntime, NetworkSpec};
use super::teardown::{Resource, Teardown};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkTopology {
    pub internet: String,
    pub no_internet: String,
}

fn random_name(label: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("update-sandbox-{label}-{}", &id[..12])
}

impl NetworkTopology {
    /// Create both networks, registering each for teardown as it appears.
    pub async fn create(runtime: &dyn ContainerRuntime, teardown: &mut Teardown) -> Result<Self> {
        let no_internet = random_name("isolated");
        runtime
            .create_network(&NetworkSpec {
                name: no_internet.clone(),
                internal: true,
            })
            .await?;
        teardown.push(Resource::Network {
            name: no_internet.clone(),
        });

        let internet = random_name("egress");
        runtime
            .create_network(&NetworkSpec {
                name: internet.clone(),
                internal: false,
            })
            .await?;
        teardown.push(Resource::Network {
            name: internet.clone(),
        });

        tracing::debug!(internet = %internet, no_internet = %no_internet, "Created networks");
        Ok(Self {
            internet,
            no_internet,
        })
    }
}
