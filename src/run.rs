//! The run coordinator.
//!
//! [`Runner::run`] drives one job through a fixed sequence: validate,
//! start the control-plane mock, gate credentials, resolve and pull images,
//! provision the sandbox, execute, record the output, tear down. Each step
//! is a hard sequence point; resources only exist from the provisioning
//! step on, and every one of them is released before `run` returns.

use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::{ApiReport, ControlPlaneMock, StreamSink};
use crate::config::{HarnessConfig, ImageTable};
use crate::context::RunContext;
use crate::credentials;
use crate::error::{ConfigError, Error, Result};
use crate::model::{Credential, Job, Message};
use crate::output::{self, Format, OutputFile};
use crate::sandbox::{
    CertificateAuthority, Collector, ContainerRuntime, NetworkTopology, ProxyGateway,
    ProxyOptions, SandboxError, StorageSidecar, Teardown, Updater, UpdaterEnv, VolumeMount,
};
use crate::security::CredentialGate;

static COMMIT_SHA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9a-f]{40}$").expect("valid commit regex"));

/// Where `--flamegraph` output lands.
const FLAMEGRAPH_OUTPUT: &str = "flamegraph.html";

/// Everything one run needs.
#[derive(Default)]
pub struct RunParams {
    pub job: Job,
    /// Credentials as written in the input, placeholders unexpanded.
    pub credentials: Vec<Credential>,
    /// Ordered expectations. `Some` puts the run in test mode, where the
    /// updater's exit code is part of what is asserted rather than a failure.
    pub expected: Option<Vec<Message>>,
    /// Live stream for accepted messages when there are no expectations.
    pub stream: Option<StreamSink>,
    /// Name and raw bytes of the input document, for the failure diff.
    pub input_name: Option<String>,
    pub input_raw: Vec<u8>,
    /// Scenario file to record to.
    pub output: Option<PathBuf>,
    /// Local checkout to seed the updater's repository with.
    pub local_dir: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub proxy_cert: Option<PathBuf>,
    pub collector_config: Option<PathBuf>,
    pub extra_hosts: Vec<String>,
    /// `local:remote[:ro]` mounts for the updater.
    pub volumes: Vec<String>,
    pub updater_image: Option<String>,
    pub proxy_image: Option<String>,
    pub collector_image: Option<String>,
    pub pull_images: bool,
    /// Open an interactive shell instead of running the update.
    pub debug: bool,
    pub flamegraph: bool,
    pub timeout: Option<Duration>,
    /// Control-plane URL as seen from the updater; derived from the mock's port when unset.
    pub api_url: Option<String>,
}

/// Images a run uses.
#[derive(Debug, Clone)]
struct Images {
    updater: String,
    proxy: String,
    collector: Option<String>,
    storage: Option<String>,
}

impl Images {
    fn all(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.proxy.as_str())
            .chain(self.collector.as_deref())
            .chain(self.storage.as_deref())
            .chain(std::iter::once(self.updater.as_str()))
    }
}

/// What the sandbox is built from once the run has been vetted.
struct SandboxPlan {
    images: Images,
    /// Expanded credentials, for the proxy only.
    credentials: Vec<Credential>,
    api_url: String,
    volumes: Vec<VolumeMount>,
}

/// Background log tails, stopped together once the sandbox is gone.
struct LogTails {
    token: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl LogTails {
    fn new(token: CancellationToken) -> Self {
        Self {
            token,
            handles: Vec::new(),
        }
    }

    fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn push(&mut self, handle: JoinHandle<()>) {
        self.handles.push(handle);
    }

    async fn finish(self) {
        self.token.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::debug!("Log tail ended abnormally: {}", e);
            }
        }
    }
}

/// Reject parameters that cannot produce a run. Nothing has been created yet.
fn validate(params: &RunParams) -> std::result::Result<Vec<VolumeMount>, ConfigError> {
    if params.job.package_manager.is_empty() {
        return Err(ConfigError::MissingJob);
    }
    if let Some(commit) = params.job.source.commit()
        && !COMMIT_SHA.is_match(commit)
    {
        return Err(ConfigError::InvalidCommit);
    }
    params
        .volumes
        .iter()
        .map(|spec| VolumeMount::parse(spec))
        .collect()
}

/// Coordinates one run against a container runtime.
pub struct Runner {
    runtime: Arc<dyn ContainerRuntime>,
    images: ImageTable,
    config: HarnessConfig,
    gate: CredentialGate,
}

impl Runner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, images: ImageTable, config: HarnessConfig) -> Self {
        Self {
            runtime,
            images,
            config,
            gate: CredentialGate::new(),
        }
    }

    pub fn with_gate(mut self, gate: CredentialGate) -> Self {
        self.gate = gate;
        self
    }

    /// Run a job to completion.
    ///
    /// Errors are ranked: failed expectations, then the execution error
    /// (including timeouts), then teardown. A run cut short by its deadline
    /// or an interrupt reports that instead of the expectations it never
    /// had a chance to meet.
    pub async fn run(&self, mut params: RunParams) -> Result<()> {
        let volumes = validate(&params)?;

        let ctx = RunContext::new(params.timeout);
        let signals = ctx.watch_signals();
        let result = self.run_in_context(&ctx, &mut params, volumes).await;
        ctx.cancel();
        if let Err(e) = signals.await {
            tracing::debug!("Signal watcher ended abnormally: {}", e);
        }
        result
    }

    async fn run_in_context(
        &self,
        ctx: &RunContext,
        params: &mut RunParams,
        volumes: Vec<VolumeMount>,
    ) -> Result<()> {
        let mut api = ControlPlaneMock::start(
            &self.config.api_host,
            self.config.api_port,
            params.expected.clone().unwrap_or_default(),
            params.stream.take(),
        )
        .await?;

        // Opened up front so an unwritable path fails before any work.
        let mut out_file = params.output.as_deref().map(OutputFile::open).transpose()?;

        let expanded = credentials::expand_from_env(&params.credentials);
        tokio::select! {
            biased;
            reason = ctx.done() => return Err(reason.into()),
            checked = self.gate.check(&params.job, &expanded) => checked?,
        }

        let images = self.resolve_images(params)?;
        let api_url = params
            .api_url
            .clone()
            .unwrap_or_else(|| format!("http://host.docker.internal:{}", api.port()));

        let plan = SandboxPlan {
            images,
            credentials: expanded,
            api_url,
            volumes,
        };
        let execution = self.run_sandbox(ctx, params, plan).await;

        api.complete().await;
        api.stop().await;
        let report = api.report().await;

        let recorded = record_output(params, &report, out_file.as_mut());
        if let Err(e) = &recorded {
            tracing::error!("Failed to record output: {}", e);
        }

        let cut_short = matches!(
            &execution,
            Err(Error::Sandbox(SandboxError::Timeout(_) | SandboxError::Interrupted))
        );
        if !report.errors.is_empty() {
            if let Ok(rendered) = &recorded {
                print_diff(params, out_file.as_ref().map(OutputFile::path), rendered);
            }
            if !cut_short {
                if let Err(e) = &execution {
                    tracing::warn!("Run also failed: {}", e);
                }
                return Err(Error::FailedExpectations {
                    count: report.errors.len(),
                });
            }
        }

        execution?;
        recorded?;
        Ok(())
    }

    fn resolve_images(&self, params: &RunParams) -> Result<Images> {
        let updater = match &params.updater_image {
            Some(image) => image.clone(),
            None => self.images.updater_image(&params.job.package_manager)?,
        };
        let collector = params.collector_config.as_ref().map(|_| {
            params
                .collector_image
                .clone()
                .unwrap_or_else(|| self.config.collector_image.clone())
        });
        let storage = params
            .job
            .use_case_insensitive_filesystem()
            .then(|| self.config.storage_image.clone());
        Ok(Images {
            updater,
            proxy: params
                .proxy_image
                .clone()
                .unwrap_or_else(|| self.config.proxy_image.clone()),
            collector,
            storage,
        })
    }

    /// Provision, execute, and always tear down.
    async fn run_sandbox(
        &self,
        ctx: &RunContext,
        params: &RunParams,
        plan: SandboxPlan,
    ) -> Result<()> {
        let mut teardown = Teardown::new(Arc::clone(&self.runtime));
        let mut tails = LogTails::new(ctx.token().child_token());

        let result = self
            .provision_and_execute(ctx, &mut teardown, &mut tails, params, plan)
            .await;

        let released = teardown.release().await;
        tails.finish().await;

        match (result, released) {
            (Err(e), Err(teardown_err)) => {
                tracing::warn!("Teardown after failed run: {}", teardown_err);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Err(teardown_err)) => Err(teardown_err.into()),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn provision_and_execute(
        &self,
        ctx: &RunContext,
        teardown: &mut Teardown,
        tails: &mut LogTails,
        params: &RunParams,
        plan: SandboxPlan,
    ) -> Result<()> {
        let SandboxPlan {
            images,
            credentials,
            api_url,
            volumes,
        } = plan;
        let runtime = self.runtime.as_ref();

        if params.pull_images {
            for image in images.all() {
                ctx.guard(runtime.ensure_image(image, self.config.registry_auth(image)))
                    .await?;
            }
        }

        let ca = ctx
            .guard(async {
                tokio::task::spawn_blocking(CertificateAuthority::generate)
                    .await
                    .map_err(|e| SandboxError::Certificate {
                        reason: e.to_string(),
                    })
                    .and_then(|generated| generated)
            })
            .await?;

        let networks = ctx.guard(NetworkTopology::create(runtime, teardown)).await?;

        let proxy_options = ProxyOptions {
            image: images.proxy.clone(),
            job_id: self.config.job_id.clone(),
            credentials,
            extra_hosts: params.extra_hosts.clone(),
            proxy_cert: params.proxy_cert.clone(),
            cache_dir: params.cache_dir.clone(),
        };
        let proxy = ctx
            .guard(ProxyGateway::start(runtime, teardown, &networks, &ca, &proxy_options))
            .await?;
        // Proxy chatter would garble an interactive session.
        if !params.debug {
            let token = tails.token();
            tails.push(proxy.tail_logs(runtime, token));
        }

        let collector = match (&params.collector_config, &images.collector) {
            (Some(config), Some(image)) => {
                let collector = ctx
                    .guard(Collector::start(
                        runtime, teardown, &networks, &proxy, &ca, image, config,
                    ))
                    .await?;
                if !params.debug {
                    let token = tails.token();
                    tails.push(collector.tail_logs(runtime, token));
                }
                Some(collector)
            }
            _ => None,
        };

        let mut binds: Vec<String> = volumes.iter().map(VolumeMount::bind).collect();
        if let Some(image) = &images.storage {
            let storage = ctx
                .guard(StorageSidecar::start(runtime, teardown, &networks, image))
                .await?;
            binds.extend(storage.binds);
        }

        let updater = ctx
            .guard(Updater::start(
                Arc::clone(&self.runtime),
                teardown,
                &networks,
                &ca,
                &params.job,
                &images.updater,
                binds,
            ))
            .await?;

        if let Some(dir) = &params.local_dir {
            updater.put_clone_dir(ctx, dir).await?;
        }

        let env = UpdaterEnv {
            proxy_url: &proxy.url,
            api_url: &api_url,
            job_id: &self.config.job_id,
            case_insensitive: images.storage.is_some(),
            collector_url: collector.as_ref().map(|c| c.url.as_str()),
            flamegraph: params.flamegraph,
        }
        .to_vec();

        if params.debug {
            updater.run_shell(ctx, env).await?;
            return Ok(());
        }

        let code = updater.run_batch(ctx, params.job.command(), env).await?;

        if params.flamegraph
            && let Err(e) = updater.copy_flamegraph(Path::new(FLAMEGRAPH_OUTPUT)).await
        {
            tracing::warn!("Failed to copy flamegraph: {}", e);
        }

        if params.expected.is_none() && code != 0 {
            return Err(Error::UpdaterExit { code });
        }
        Ok(())
    }
}

/// Render the recorded scenario and write it if an output file was requested.
fn record_output(
    params: &RunParams,
    report: &ApiReport,
    out_file: Option<&mut OutputFile>,
) -> std::result::Result<String, crate::error::OutputError> {
    let scenario = output::recorded_scenario(
        &params.job,
        &params.credentials,
        report,
        params.output.as_deref(),
    )?;
    let format = out_file.as_ref().map_or(Format::Yaml, |f| f.format());
    let rendered = output::render(&scenario, format)?;
    if let Some(file) = out_file {
        file.replace(&rendered)?;
        tracing::info!(path = %file.path().display(), "Wrote scenario");
    }
    Ok(rendered)
}

fn print_diff(params: &RunParams, output_path: Option<&Path>, rendered: &str) {
    let input_name = params.input_name.as_deref().unwrap_or("input.yml");
    let output_name = output_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "output.yml".to_string());
    let input = String::from_utf8_lossy(&params.input_raw);
    let diff = output::unified_diff(input_name, &output_name, &input, rendered);
    eprintln!("{diff}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Source;

    fn params(commit: Option<&str>) -> RunParams {
        RunParams {
            job: Job {
                package_manager: "go_modules".to_string(),
                source: Source {
                    repo: "org/repo".to_string(),
                    commit: commit.map(str::to_string),
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_commit_format() {
        assert!(validate(&params(None)).is_ok());
        assert!(validate(&params(Some(""))).is_ok());
        assert!(validate(&params(Some("0123456789abcdef0123456789abcdef01234567"))).is_ok());
        for bad in [
            "abc",
            "0123456789ABCDEF0123456789ABCDEF01234567",
            "0123456789abcdef0123456789abcdef012345678",
        ] {
            assert!(
                matches!(validate(&params(Some(bad))), Err(ConfigError::InvalidCommit)),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_validate_requires_job() {
        let err = validate(&RunParams::default()).unwrap_err();
        assert!(matches!(err, ConfigError::MissingJob));
    }

    #[test]
    fn test_validate_volumes() {
        let mut p = params(None);
        p.volumes = vec!["/host:/mnt:ro".to_string()];
        assert_eq!(validate(&p).unwrap()[0].bind(), "/host:/mnt:ro");
        p.volumes = vec!["nonsense".to_string()];
        assert!(matches!(validate(&p), Err(ConfigError::InvalidVolume(_))));
    }

    #[test]
    fn test_image_order_and_overrides() {
        let runner = Runner::new(
            Arc::new(crate::sandbox::testing::FakeRuntime::default()),
            ImageTable::default(),
            HarnessConfig::default(),
        );
        let mut p = params(None);
        p.collector_config = Some(PathBuf::from("otel.yml"));
        p.proxy_image = Some("proxy:dev".to_string());
        let images = runner.resolve_images(&p).unwrap();
        let all: Vec<&str> = images.all().collect();
        assert_eq!(
            all,
            vec![
                "proxy:dev",
                crate::config::COLLECTOR_IMAGE,
                "ghcr.io/dependabot/dependabot-updater-gomod",
            ]
        );

        p.job.package_manager = "not_a_real_pm".to_string();
        assert!(runner.resolve_images(&p).is_err());
        p.updater_image = Some("updater:dev".to_string());
        assert_eq!(runner.resolve_images(&p).unwrap().updater, "updater:dev");
    }

    #[tokio::test]
    async fn test_log_tails_finish_survives_panicked_tail() {
        let mut tails = LogTails::new(CancellationToken::new());
        tails.push(tokio::spawn(async { panic!("tail failed") }));
        let token = tails.token();
        tails.push(tokio::spawn(async move { token.cancelled().await }));

        tails.finish().await;
    }
}
