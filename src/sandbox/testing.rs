//! In-memory runtime for unit tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use super::error::{Result, SandboxError};
use super::runtime::{
    ContainerRuntime, ContainerSpec, ExecSession, ExecSpec, NetworkSpec, OutputStream,
    RegistryAuth, VolumeSpec,
};

#[derive(Default)]
struct State {
    calls: Vec<String>,
    fail_on: Vec<String>,
    exit_codes: HashMap<String, i64>,
    exec_exit_codes: Vec<(String, i64)>,
    containers: Vec<ContainerSpec>,
    volumes: Vec<VolumeSpec>,
    execs: Vec<ExecSpec>,
    uploads: Vec<(String, String, Bytes)>,
    files: HashMap<String, Vec<u8>>,
    exec_output: Vec<(String, Vec<u8>)>,
}

/// Records every call as a short string and answers from canned state.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<State>,
}

impl FakeRuntime {
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn containers(&self) -> Vec<ContainerSpec> {
        self.state.lock().unwrap().containers.clone()
    }

    pub fn volumes(&self) -> Vec<VolumeSpec> {
        self.state.lock().unwrap().volumes.clone()
    }

    pub fn execs(&self) -> Vec<ExecSpec> {
        self.state.lock().unwrap().execs.clone()
    }

    pub fn uploads(&self) -> Vec<(String, String, Bytes)> {
        self.state.lock().unwrap().uploads.clone()
    }

    /// Fail every call whose recorded form contains `call`.
    pub fn fail_on(&self, call: &str) {
        self.state.lock().unwrap().fail_on.push(call.to_string());
    }

    pub fn set_exit_code(&self, container_id: &str, code: i64) {
        self.state
            .lock()
            .unwrap()
            .exit_codes
            .insert(container_id.to_string(), code);
    }

    /// Execs whose command line contains `needle` exit with `code`.
    pub fn set_exec_exit_code(&self, needle: &str, code: i64) {
        self.state
            .lock()
            .unwrap()
            .exec_exit_codes
            .push((needle.to_string(), code));
    }

    /// Execs whose command line contains `needle` print `output`.
    pub fn set_exec_output(&self, needle: &str, output: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .exec_output
            .push((needle.to_string(), output.to_vec()));
    }

    pub fn put_file(&self, path: &str, contents: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(path.to_string(), contents.to_vec());
    }

    fn record(&self, call: String) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let fail = state.fail_on.iter().any(|needle| call.contains(needle.as_str()));
        state.calls.push(call.clone());
        if fail {
            return Err(SandboxError::ExecutionFailed {
                reason: format!("injected failure: {call}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ensure_image(&self, image: &str, _auth: Option<RegistryAuth>) -> Result<()> {
        self.record(format!("ensure_image {image}"))
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<()> {
        self.record(format!(
            "create_network {} internal={}",
            spec.name, spec.internal
        ))
    }

    async fn remove_network(&self, name: &str) -> Result<()> {
        self.record(format!("remove_network {name}"))
    }

    async fn connect_network(&self, network: &str, container_id: &str) -> Result<()> {
        self.record(format!("connect_network {network} {container_id}"))
    }

    async fn create_volume(&self, spec: &VolumeSpec) -> Result<()> {
        self.record(format!("create_volume {}", spec.name))?;
        self.state.lock().unwrap().volumes.push(spec.clone());
        Ok(())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.record(format!("remove_volume {name}"))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        self.record(format!("create_container {}", spec.image))?;
        let mut state = self.state.lock().unwrap();
        state.containers.push(spec.clone());
        Ok(format!("container-{}", state.containers.len()))
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.record(format!("start_container {id}"))
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<()> {
        self.record(format!("stop_container {id} {grace:?}"))
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.record(format!("remove_container {id}"))
    }

    async fn container_exit_code(&self, id: &str) -> Result<i64> {
        self.record(format!("container_exit_code {id}"))?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .exit_codes
            .get(id)
            .copied()
            .unwrap_or(0))
    }

    async fn container_address(&self, id: &str, network: &str) -> Result<String> {
        self.record(format!("container_address {id} {network}"))?;
        Ok("172.20.0.2".to_string())
    }

    async fn upload_archive(&self, id: &str, dest: &str, archive: Bytes) -> Result<()> {
        self.record(format!("upload_archive {id} {dest}"))?;
        self.state
            .lock()
            .unwrap()
            .uploads
            .push((id.to_string(), dest.to_string(), archive));
        Ok(())
    }

    async fn download_file(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        self.record(format!("download_file {id} {path}"))?;
        self.state
            .lock()
            .unwrap()
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| SandboxError::CopyFailed {
                path: path.to_string(),
                reason: "no such file".to_string(),
            })
    }

    async fn exec(&self, id: &str, spec: &ExecSpec) -> Result<ExecSession> {
        let line = spec.cmd.join(" ");
        self.record(format!("exec {id} {line}"))?;
        let mut state = self.state.lock().unwrap();
        state.execs.push(spec.clone());
        let exec_id = format!("exec-{}", state.execs.len());
        let output = state
            .exec_output
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();
        let code = state
            .exec_exit_codes
            .iter()
            .find(|(needle, _)| line.contains(needle.as_str()))
            .map(|(_, code)| *code)
            .unwrap_or(0);
        state.exit_codes.insert(exec_id.clone(), code);
        Ok(ExecSession {
            id: exec_id,
            output: futures::stream::iter(vec![Ok(Bytes::from(output))]).boxed(),
            input: Box::pin(tokio::io::sink()),
        })
    }

    async fn exec_exit_code(&self, exec_id: &str) -> Result<i64> {
        self.record(format!("exec_exit_code {exec_id}"))?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .exit_codes
            .get(exec_id)
            .copied()
            .unwrap_or(0))
    }

    async fn resize_exec(&self, exec_id: &str, rows: u16, cols: u16) -> Result<()> {
        self.record(format!("resize_exec {exec_id} {rows}x{cols}"))
    }

    fn logs(&self, _id: &str) -> OutputStream {
        futures::stream::empty().boxed()
    }
}
