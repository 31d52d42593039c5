//! Reverse-order release of sandbox resources.
//!
//! Every network, volume and container is registered here the moment it
//! exists. [`Teardown::release`] unwinds the stack newest-first, attempting
//! every release even after failures, so no resource outlives the run.
//!
//! Containers are created through [`Teardown::create_container`], which runs
//! the create on its own task. A caller cancelled mid-create leaves the task
//! behind, and release waits for it before unwinding.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::error::{Result, SandboxError};
use super::runtime::{ContainerRuntime, ContainerSpec};

/// A resource owned by the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Network {
        name: String,
    },
    Volume {
        name: String,
    },
    Container {
        id: String,
        role: String,
        /// Stop with this grace period before removal.
        stop_grace: Option<Duration>,
        /// Treat a non-zero exit code as a teardown failure.
        check_exit: bool,
    },
}

impl Resource {
    pub fn container(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self::Container {
            id: id.into(),
            role: role.into(),
            stop_grace: None,
            check_exit: false,
        }
    }

    fn with_id(self, id: String) -> Self {
        match self {
            Self::Container {
                role,
                stop_grace,
                check_exit,
                ..
            } => Self::Container {
                id,
                role,
                stop_grace,
                check_exit,
            },
            other => other,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Network { name } => format!("network {name}"),
            Self::Volume { name } => format!("volume {name}"),
            Self::Container { id, role, .. } => format!("{role} container {id}"),
        }
    }
}

/// A container create whose caller may have gone away.
struct PendingCreate {
    task: JoinHandle<Result<String>>,
    /// Registered with the created id once the task finishes.
    resource: Resource,
}

impl PendingCreate {
    /// The resource to release, if the create succeeded.
    async fn settle(self) -> Option<Resource> {
        match self.task.await {
            Ok(Ok(id)) => Some(self.resource.with_id(id)),
            Ok(Err(_)) => None,
            Err(e) => {
                tracing::warn!("Container create task failed: {}", e);
                None
            }
        }
    }
}

pub struct Teardown {
    runtime: Arc<dyn ContainerRuntime>,
    stack: Vec<Resource>,
    pending: Option<PendingCreate>,
}

impl Teardown {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            stack: Vec::new(),
            pending: None,
        }
    }

    /// Create a container and register it as `resource` under the new id.
    pub async fn create_container(
        &mut self,
        spec: ContainerSpec,
        resource: Resource,
    ) -> Result<String> {
        self.settle_pending().await;
        let runtime = Arc::clone(&self.runtime);
        let task = tokio::spawn(async move { runtime.create_container(&spec).await });
        let pending = self.pending.insert(PendingCreate { task, resource });

        let joined = (&mut pending.task).await;
        let resource = self.pending.take().map(|p| p.resource);
        let id = joined.map_err(|e| SandboxError::ContainerCreationFailed {
            reason: e.to_string(),
        })??;
        if let Some(resource) = resource {
            self.push(resource.with_id(id.clone()));
        }
        Ok(id)
    }

    async fn settle_pending(&mut self) {
        if let Some(pending) = self.pending.take()
            && let Some(resource) = pending.settle().await
        {
            self.push(resource);
        }
    }

    pub fn push(&mut self, resource: Resource) {
        tracing::debug!("Registered {}", resource.describe());
        self.stack.push(resource);
    }

    pub fn len(&self) -> usize {
        self.stack.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stack.is_empty() && self.pending.is_none()
    }

    /// Release everything, newest first.
    pub async fn release(&mut self) -> Result<()> {
        self.settle_pending().await;
        let mut failures = Vec::new();
        while let Some(resource) = self.stack.pop() {
            if let Err(e) = release_one(self.runtime.as_ref(), &resource, &mut failures).await {
                tracing::warn!("Failed to release {}: {}", resource.describe(), e);
                failures.push(format!("{}: {}", resource.describe(), e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::Teardown { failures })
        }
    }
}

async fn release_one(
    runtime: &dyn ContainerRuntime,
    resource: &Resource,
    failures: &mut Vec<String>,
) -> Result<()> {
    match resource {
        Resource::Network { name } => runtime.remove_network(name).await,
        Resource::Volume { name } => runtime.remove_volume(name).await,
        Resource::Container {
            id,
            role,
            stop_grace,
            check_exit,
        } => {
            // Read the status first; stopping would overwrite it.
            if *check_exit {
                match runtime.container_exit_code(id).await {
                    Ok(0) => {}
                    Ok(code) => failures.push(
                        SandboxError::NonZeroExit {
                            role: role.clone(),
                            code,
                        }
                        .to_string(),
                    ),
                    Err(e) => failures.push(format!("inspect {role} container: {e}")),
                }
            }
            if let Some(grace) = stop_grace
                && let Err(e) = runtime.stop_container(id, *grace).await
            {
                tracing::debug!(container_id = %id, "Stop failed, removing anyway: {}", e);
            }
            runtime.remove_container(id).await
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if self.is_empty() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("{} sandbox resources leaked: no runtime", self.stack.len());
            return;
        };
        let runtime = Arc::clone(&self.runtime);
        let mut stack = std::mem::take(&mut self.stack);
        let pending = self.pending.take();
        handle.spawn(async move {
            if let Some(pending) = pending
                && let Some(resource) = pending.settle().await
            {
                stack.push(resource);
            }
            while let Some(resource) = stack.pop() {
                let mut ignored = Vec::new();
                if let Err(e) = release_one(runtime.as_ref(), &resource, &mut ignored).await {
                    tracing::warn!("Background release of {} failed: {}", resource.describe(), e);
                }
            }
        });
    }
}
