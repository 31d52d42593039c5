//! Container sandbox for update jobs.
//!
//! A run provisions a small, disposable topology:
//!
//! ```text
//!                 ┌──────────────┐
//!   internet ◀────│    proxy     │  credentials + CA via /config.json
//!   (egress)      └──────┬───────┘
//!                        │ http://<proxy>:1080
//!   ─────────────────────┼──────────────────────── no-internet (internal)
//!          │             │               │
//!   ┌──────┴─────┐ ┌─────┴──────┐ ┌──────┴─────┐
//!   │  updater   │ │ collector  │ │  storage   │
//!   │ (tty, sh)  │ │ (optional) │ │ (optional) │
//!   └──────┬─────┘ └────────────┘ └────────────┘
//!          │ host.docker.internal
//!          ▼
//!   control-plane mock on the host
//! ```
//!
//! Only the proxy can reach the internet. Every resource is registered with
//! a [`Teardown`] as soon as it exists and released in reverse order, so a
//! failure at any step leaves nothing behind.
//!
//! All Docker access goes through the [`ContainerRuntime`] trait;
//! [`DockerRuntime`] is the bollard-backed implementation.

pub mod archive;
pub mod ca;
pub mod collector;
pub mod docker;
pub mod error;
pub mod logs;
pub mod network;
pub mod proxy;
pub mod runtime;
pub mod storage;
pub mod teardown;
pub mod tty;
pub mod updater;

#[cfg(test)]
pub(crate) mod testing;

pub use ca::CertificateAuthority;
pub use collector::{COLLECTOR_PORT, Collector};
pub use docker::{DockerRuntime, connect_docker};
pub use error::{Result, SandboxError};
pub use network::NetworkTopology;
pub use proxy::{PROXY_PORT, ProxyGateway, ProxyOptions};
pub use runtime::{
    ContainerRuntime, ContainerSpec, ExecSession, ExecSpec, NetworkSpec, OutputStream,
    RegistryAuth, VolumeSpec,
};
pub use storage::StorageSidecar;
pub use teardown::{Resource, Teardown};
pub use updater::{Updater, UpdaterEnv, VolumeMount};
