//! The updater container.
//!
//! The container idles on `/bin/sh` with a tty so it outlives individual
//! commands; all work happens through execs. It only ever joins the
//! no-internet network, so every request leaves through the proxy.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use super::archive;
use super::ca::CertificateAuthority;
use super::error::{Result, SandboxError};
use super::logs::PrefixWriter;
use super::network::NetworkTopology;
use super::runtime::{ContainerRuntime, ContainerSpec, ExecSpec, OutputStream};
use super::storage::{CASE_INSENSITIVE_REPO, CASE_SENSITIVE_REPO};
use super::teardown::{Resource, Teardown};
use super::tty::{self, RawModeGuard};
use crate::context::RunContext;
use crate::error::ConfigError;
use crate::model::{Job, JobCommand};

pub const DEPENDABOT_USER: &str = "dependabot";
pub const ROOT_USER: &str = "root";

pub const JOB_PATH: &str = "/home/dependabot/dependabot-updater/job.json";
pub const OUTPUT_PATH: &str = "/home/dependabot/dependabot-updater/output.json";
pub const REPO_PATH: &str = "/home/dependabot/dependabot-updater/repo";

const CA_CERT_PATH: &str = "/usr/local/share/ca-certificates/dbot-ca.crt";
const CERT_BUNDLE_PATH: &str = "/etc/ssl/certs/ca-certificates.crt";
const FLAMEGRAPH_PATH: &str = "/tmp/dependabot-flamegraph.html";

/// Copy exec output to `out` line by line until the stream ends.
///
/// A failed final flush only loses the tail of the log, so it is not an error.
async fn relay_output<W: Write>(
    ctx: &RunContext,
    mut output: OutputStream,
    out: W,
) -> Result<()> {
    let mut writer = PrefixWriter::new("updater | ", out);
    let relay = async {
        while let Some(chunk) = output.next().await {
            writer.write_chunk(&chunk?)?;
        }
        Ok::<(), SandboxError>(())
    };
    ctx.guard(relay).await?;
    if let Err(e) = writer.finish() {
        tracing::warn!("Failed to flush updater output: {}", e);
    }
    Ok(())
}

/// Payload of the job file.
#[derive(Serialize)]
struct JobFile<'a> {
    job: &'a Job,
}

/// A `local:remote[:ro]` bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub local: PathBuf,
    pub remote: String,
    pub read_only: bool,
}

impl VolumeMount {
    /// Parse `local:remote[:ro]`. Relative local paths resolve against the working directory.
    pub fn parse(spec: &str) -> std::result::Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidVolume(spec.to_string());
        let parts: Vec<&str> = spec.split(':').collect();
        let (local, remote, read_only) = match parts.as_slice() {
            [local, remote] => (*local, *remote, false),
            [local, remote, "ro"] => (*local, *remote, true),
            _ => return Err(invalid()),
        };
        if local.is_empty() || remote.is_empty() {
            return Err(invalid());
        }
        let local = std::path::absolute(local)?;
        Ok(Self {
            local,
            remote: remote.to_string(),
            read_only,
        })
    }

    pub fn bind(&self) -> String {
        let mut bind = format!("{}:{}", self.local.display(), self.remote);
        if self.read_only {
            bind.push_str(":ro");
        }
        bind
    }
}

/// Inputs to the updater's environment.
#[derive(Debug, Clone, Default)]
pub struct UpdaterEnv<'a> {
    pub proxy_url: &'a str,
    pub api_url: &'a str,
    pub job_id: &'a str,
    pub case_insensitive: bool,
    pub collector_url: Option<&'a str>,
    pub flamegraph: bool,
}

impl UpdaterEnv<'_> {
    pub fn to_vec(&self) -> Vec<String> {
        let mut env = vec![
            "GITHUB_ACTIONS=true".to_string(),
            format!("http_proxy={}", self.proxy_url),
            format!("HTTP_PROXY={}", self.proxy_url),
            format!("https_proxy={}", self.proxy_url),
            format!("HTTPS_PROXY={}", self.proxy_url),
            format!("DEPENDABOT_JOB_ID={}", self.job_id),
            "DEPENDABOT_JOB_TOKEN=".to_string(),
            format!("DEPENDABOT_JOB_PATH={JOB_PATH}"),
            format!("DEPENDABOT_OUTPUT_PATH={OUTPUT_PATH}"),
            format!("DEPENDABOT_API_URL={}", self.api_url),
            format!("SSL_CERT_FILE={CERT_BUNDLE_PATH}"),
            "UPDATER_ONE_CONTAINER=true".to_string(),
            "UPDATER_DETERMINISTIC=true".to_string(),
        ];
        if self.case_insensitive {
            env.push(format!(
                "DEPENDABOT_CASE_INSENSITIVE_REPO_CONTENTS_PATH={CASE_INSENSITIVE_REPO}"
            ));
            env.push(format!("DEPENDABOT_REPO_CONTENTS_PATH={CASE_SENSITIVE_REPO}"));
        } else {
            env.push(format!("DEPENDABOT_REPO_CONTENTS_PATH={REPO_PATH}"));
        }
        if let Some(collector) = self.collector_url {
            env.push("OTEL_ENABLED=true".to_string());
            env.push(format!("OTEL_EXPORTER_OTLP_ENDPOINT={collector}"));
        }
        if self.flamegraph {
            env.push("FLAMEGRAPH=1".to_string());
        }
        env
    }
}

/// Shell sequence for a batch run.
pub fn batch_script(command: JobCommand) -> String {
    format!(
        "update-ca-certificates && bin/run fetch_files && bin/run {}",
        command.phase()
    )
}

pub struct Updater {
    runtime: Arc<dyn ContainerRuntime>,
    pub container_id: String,
}

impl Updater {
    /// Create the container, deliver the CA and job file, and start it.
    ///
    /// `binds` holds caller volumes and any storage side-car volumes.
    pub async fn start(
        runtime: Arc<dyn ContainerRuntime>,
        teardown: &mut Teardown,
        networks: &NetworkTopology,
        ca: &CertificateAuthority,
        job: &Job,
        image: &str,
        binds: Vec<String>,
    ) -> Result<Self> {
        let spec = ContainerSpec {
            image: image.to_string(),
            user: Some(DEPENDABOT_USER.to_string()),
            cmd: Some(vec!["/bin/sh".to_string()]),
            tty: true,
            binds,
            network: Some(networks.no_internet.clone()),
            ..Default::default()
        };
        let resource = Resource::Container {
            id: String::new(),
            role: "updater".to_string(),
            stop_grace: None,
            check_exit: true,
        };
        let id = teardown.create_container(spec, resource).await?;

        let updater = Self {
            runtime,
            container_id: id,
        };
        if !ca.cert.is_empty() {
            updater.put_file(CA_CERT_PATH, ca.cert.as_bytes()).await?;
        }
        let job_file = serde_json::to_vec(&JobFile { job }).map_err(|e| SandboxError::CopyFailed {
            path: JOB_PATH.to_string(),
            reason: format!("failed to marshal job file: {e}"),
        })?;
        updater.put_file(JOB_PATH, &job_file).await?;

        updater.runtime.start_container(&updater.container_id).await?;
        tracing::info!(container_id = %updater.container_id, image = %image, "Updater started");
        Ok(updater)
    }

    async fn put_file(&self, path: &str, contents: &[u8]) -> Result<()> {
        let tarball = archive::single_file(path.trim_start_matches('/'), contents, 0o644)?;
        self.runtime
            .upload_archive(&self.container_id, "/", tarball)
            .await
    }

    /// Run `script` with `/bin/sh -c` as `user`, relaying output, and return its exit code.
    pub async fn run_cmd(
        &self,
        ctx: &RunContext,
        script: &str,
        user: &str,
        env: Vec<String>,
    ) -> Result<i64> {
        let spec = ExecSpec {
            env,
            ..ExecSpec::shell(script).user(user)
        };
        let session = ctx.guard(self.runtime.exec(&self.container_id, &spec)).await?;

        relay_output(ctx, session.output, std::io::stderr()).await?;
        ctx.guard(self.runtime.exec_exit_code(&session.id)).await
    }

    async fn run_setup(&self, ctx: &RunContext, script: &str, user: &str) -> Result<()> {
        match self.run_cmd(ctx, script, user, Vec::new()).await? {
            0 => Ok(()),
            code => Err(SandboxError::ExecutionFailed {
                reason: format!("`{script}` exited with code {code}"),
            }),
        }
    }

    /// Copy a local checkout into the repo path and commit it as a fresh git repository.
    pub async fn put_clone_dir(&self, ctx: &RunContext, dir: &Path) -> Result<()> {
        self.run_setup(ctx, &format!("mkdir -p {REPO_PATH}"), DEPENDABOT_USER)
            .await?;

        let tarball = archive::directory(dir).map_err(|e| SandboxError::CopyFailed {
            path: dir.display().to_string(),
            reason: e.to_string(),
        })?;
        ctx.guard(
            self.runtime
                .upload_archive(&self.container_id, REPO_PATH, tarball),
        )
        .await?;

        self.run_setup(ctx, &format!("chown -R dependabot {REPO_PATH}"), ROOT_USER)
            .await?;

        let init = [
            format!("cd {REPO_PATH}"),
            "git config --global init.defaultBranch main".to_string(),
            "git init".to_string(),
            "git config user.email 'dependabot@github.com'".to_string(),
            "git config user.name 'dependabot'".to_string(),
            "git add .".to_string(),
            "git commit --quiet -m 'initial commit'".to_string(),
        ]
        .join(" && ");
        self.run_setup(ctx, &init, DEPENDABOT_USER).await
    }

    /// Run the fetch and update phases; returns the exit code.
    pub async fn run_batch(
        &self,
        ctx: &RunContext,
        command: JobCommand,
        env: Vec<String>,
    ) -> Result<i64> {
        let code = self
            .run_cmd(ctx, &batch_script(command), DEPENDABOT_USER, env)
            .await?;
        tracing::info!(exit_code = code, "Updater finished");
        Ok(code)
    }

    /// Interactive bash session wired to the local terminal.
    pub async fn run_shell(&self, ctx: &RunContext, mut env: Vec<String>) -> Result<()> {
        env.push("DEBUG=1".to_string());
        let spec = ExecSpec {
            cmd: vec!["/bin/bash".to_string()],
            user: Some(DEPENDABOT_USER.to_string()),
            env,
            tty: true,
            attach_stdin: true,
        };
        let session = ctx.guard(self.runtime.exec(&self.container_id, &spec)).await?;

        let _raw = RawModeGuard::enable();
        let token = ctx.token().child_token();
        let resize = tty::watch_resize(Arc::clone(&self.runtime), session.id.clone(), token.clone());

        let mut output = session.output;
        let mut input = session.input;
        let to_terminal = async {
            let mut stdout = tokio::io::stdout();
            while let Some(chunk) = output.next().await {
                stdout.write_all(&chunk?).await?;
                stdout.flush().await?;
            }
            Ok::<(), SandboxError>(())
        };
        let from_terminal = async {
            let mut stdin = tokio::io::stdin();
            tokio::io::copy(&mut stdin, &mut input).await?;
            Ok::<(), SandboxError>(())
        };

        let result = tokio::select! {
            reason = ctx.done() => Err(reason),
            r = to_terminal => r,
            r = from_terminal => r,
        };
        token.cancel();
        let _ = resize.await;
        result
    }

    /// Copy the profiler output to `dest`.
    pub async fn copy_flamegraph(&self, dest: &Path) -> Result<()> {
        let contents = self
            .runtime
            .download_file(&self.container_id, FLAMEGRAPH_PATH)
            .await?;
        tokio::fs::write(dest, contents).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::Value;

    use super::*;
    use crate::model::Source;
    use crate::sandbox::testing::FakeRuntime;

    fn networks() -> NetworkTopology {
        NetworkTopology {
            internet: "egress".to_string(),
            no_internet: "isolated".to_string(),
        }
    }

    fn ca() -> CertificateAuthority {
        CertificateAuthority {
            cert: "CERT".to_string(),
            key: "KEY".to_string(),
        }
    }

    fn job() -> Job {
        Job {
            package_manager: "go_modules".to_string(),
            source: Source {
                repo: "org/repo".to_string(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn started(fake: &Arc<FakeRuntime>, teardown: &mut Teardown) -> Updater {
        Updater::start(
            fake.clone(),
            teardown,
            &networks(),
            &ca(),
            &job(),
            "updater:latest",
            vec!["/src:/mnt/src:ro".to_string()],
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_volume_mount_parse() {
        let mount = VolumeMount::parse("/host/cache:/cache:ro").unwrap();
        assert_eq!(mount.local, PathBuf::from("/host/cache"));
        assert_eq!(mount.bind(), "/host/cache:/cache:ro");

        let relative = VolumeMount::parse("cache:/cache").unwrap();
        assert!(relative.local.is_absolute());
        assert!(!relative.read_only);

        for bad in ["/only-one", "/a:/b:rw", "/a:/b:ro:x", ":/b"] {
            assert!(
                matches!(VolumeMount::parse(bad), Err(ConfigError::InvalidVolume(_))),
                "{bad} should be invalid"
            );
        }
    }

    #[test]
    fn test_env_layout() {
        let env = UpdaterEnv {
            proxy_url: "http://172.20.0.2:1080",
            api_url: "http://host.docker.internal:8080",
            job_id: "cli",
            ..Default::default()
        }
        .to_vec();
        assert!(env.contains(&"HTTPS_PROXY=http://172.20.0.2:1080".to_string()));
        assert!(env.contains(&"https_proxy=http://172.20.0.2:1080".to_string()));
        assert!(env.contains(&"DEPENDABOT_API_URL=http://host.docker.internal:8080".to_string()));
        assert!(env.contains(&format!("DEPENDABOT_REPO_CONTENTS_PATH={REPO_PATH}")));
        assert!(!env.iter().any(|e| e.starts_with("OTEL_")));
        assert!(!env.iter().any(|e| e.starts_with("FLAMEGRAPH")));
    }

    #[test]
    fn test_env_optional_features() {
        let env = UpdaterEnv {
            case_insensitive: true,
            collector_url: Some("http://172.20.0.3:4318"),
            flamegraph: true,
            ..Default::default()
        }
        .to_vec();
        assert!(env.contains(&"DEPENDABOT_REPO_CONTENTS_PATH=/dpdbot/repo".to_string()));
        assert!(env.contains(
            &"DEPENDABOT_CASE_INSENSITIVE_REPO_CONTENTS_PATH=/nocase/repo".to_string()
        ));
        assert!(env.contains(&"OTEL_EXPORTER_OTLP_ENDPOINT=http://172.20.0.3:4318".to_string()));
        assert!(env.contains(&"FLAMEGRAPH=1".to_string()));
    }

    #[test]
    fn test_batch_script_phase() {
        assert_eq!(
            batch_script(JobCommand::Update),
            "update-ca-certificates && bin/run fetch_files && bin/run update_files"
        );
        assert!(batch_script(JobCommand::Graph).ends_with("bin/run update_graph"));
    }

    #[tokio::test]
    async fn test_start_delivers_inputs_before_start() {
        let fake = Arc::new(FakeRuntime::default());
        let mut teardown = Teardown::new(fake.clone());
        let updater = started(&fake, &mut teardown).await;

        let spec = &fake.containers()[0];
        assert_eq!(spec.user.as_deref(), Some("dependabot"));
        assert_eq!(spec.network.as_deref(), Some("isolated"));
        assert!(spec.tty);
        assert_eq!(spec.binds, vec!["/src:/mnt/src:ro"]);

        let uploads = fake.uploads();
        assert_eq!(uploads.len(), 2);
        let mut job_archive = tar::Archive::new(uploads[1].2.as_ref());
        let mut entry = job_archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(
            entry.path().unwrap().to_string_lossy(),
            JOB_PATH.trim_start_matches('/')
        );
        let mut body = String::new();
        std::io::Read::read_to_string(&mut entry, &mut body).unwrap();
        let payload: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(payload["job"]["package-manager"], "go_modules");

        let calls = fake.calls();
        let last_upload = calls.iter().rposition(|c| c.starts_with("upload_archive")).unwrap();
        let start = calls
            .iter()
            .position(|c| c == &format!("start_container {}", updater.container_id))
            .unwrap();
        assert!(last_upload < start);
        teardown.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_returns_exit_code() {
        let fake = Arc::new(FakeRuntime::default());
        fake.set_exec_exit_code("bin/run update_files", 2);
        fake.set_exec_output("bin/run update_files", b"fetching\nupdating\n");
        let mut teardown = Teardown::new(fake.clone());
        let updater = started(&fake, &mut teardown).await;

        let ctx = RunContext::new(None);
        let code = updater
            .run_batch(&ctx, JobCommand::Update, vec!["A=1".to_string()])
            .await
            .unwrap();
        assert_eq!(code, 2);
        let exec = fake.execs().pop().unwrap();
        assert_eq!(exec.user.as_deref(), Some("dependabot"));
        assert_eq!(exec.env, vec!["A=1"]);
        teardown.release().await.unwrap();
    }

    /// Accepts writes but fails every flush after the first.
    struct FailingFlush {
        flushes: usize,
    }

    impl Write for FailingFlush {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            self.flushes += 1;
            if self.flushes > 1 {
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_relay_tolerates_failed_final_flush() {
        let chunks = vec![Ok(bytes::Bytes::from_static(b"done
no newline"))];
        let output: OutputStream = futures::stream::iter(chunks).boxed();
        let out = FailingFlush { flushes: 0 };

        relay_output(&RunContext::new(None), output, out).await.unwrap();
    }

    #[tokio::test]
    async fn test_batch_observes_deadline() {
        let fake = Arc::new(FakeRuntime::default());
        let mut teardown = Teardown::new(fake.clone());
        let updater = started(&fake, &mut teardown).await;

        let ctx = RunContext::new(Some(Duration::from_millis(1)));
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = updater
            .run_batch(&ctx, JobCommand::Update, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
        teardown.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_clone_dir_sequence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("go.mod"), "module example.com/x\n").unwrap();

        let fake = Arc::new(FakeRuntime::default());
        let mut teardown = Teardown::new(fake.clone());
        let updater = started(&fake, &mut teardown).await;
        let ctx = RunContext::new(None);
        updater.put_clone_dir(&ctx, dir.path()).await.unwrap();

        let execs = fake.execs();
        assert_eq!(execs[0].cmd[2], format!("mkdir -p {REPO_PATH}"));
        assert_eq!(execs[0].user.as_deref(), Some("dependabot"));
        assert_eq!(execs[1].cmd[2], format!("chown -R dependabot {REPO_PATH}"));
        assert_eq!(execs[1].user.as_deref(), Some("root"));
        assert!(execs[2].cmd[2].contains("git commit --quiet -m 'initial commit'"));
        assert!(
            fake.calls()
                .contains(&format!("upload_archive {} {REPO_PATH}", updater.container_id))
        );
        teardown.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_clone_dir_setup_failure_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeRuntime::default());
        fake.set_exec_exit_code("chown", 1);
        let mut teardown = Teardown::new(fake.clone());
        let updater = started(&fake, &mut teardown).await;
        let err = updater
            .put_clone_dir(&RunContext::new(None), dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with code 1"));
        teardown.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_copy_flamegraph() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeRuntime::default());
        fake.put_file(FLAMEGRAPH_PATH, b"<html></html>");
        let mut teardown = Teardown::new(fake.clone());
        let updater = started(&fake, &mut teardown).await;
        let dest = dir.path().join("flamegraph.html");
        updater.copy_flamegraph(&dest).await.unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"<html></html>");
        teardown.release().await.unwrap();
    }
}
