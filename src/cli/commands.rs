//! Turning parsed commands into runs.

use serde_json::Value;

use crate::cli::{Cli, Command, SharedArgs, TestArgs, UpdateArgs};
use crate::config::HarnessConfig;
use crate::credentials::{self, LocalTokens};
use crate::error::Result;
use crate::input::{self, InputSource, JobArgs};
use crate::model::{DEPENDENCY_GRAPH_EXPERIMENT, JobCommand};
use crate::run::{RunParams, Runner};

fn local_tokens(config: &HarnessConfig) -> LocalTokens {
    LocalTokens {
        github: config.github_token.is_some(),
        azure: config.azure_token.is_some(),
    }
}

/// Copy the flags every command shares onto the run.
fn apply_shared(params: &mut RunParams, cli: &Cli, shared: &SharedArgs) {
    params.output = shared.output.clone();
    params.cache_dir = shared.cache.clone();
    params.local_dir = shared.local.clone();
    params.proxy_cert = shared.proxy_cert.clone();
    params.collector_config = shared.collector_config.clone();
    params.pull_images = shared.pull;
    params.debug = shared.debug;
    params.volumes = shared.volumes.clone();
    params.extra_hosts = shared.extra_hosts.clone();
    params.timeout = shared.timeout;
    params.updater_image = cli.updater_image.clone();
    params.proxy_image = cli.proxy_image.clone();
    params.collector_image = cli.collector_image.clone();
}

/// Build the run for `update`: read the job, normalize it, stream to stdout.
pub async fn update_params(
    cli: &Cli,
    args: &UpdateArgs,
    config: &HarnessConfig,
) -> Result<RunParams> {
    build_update_params(cli, args, config, input::stdin_has_data()).await
}

async fn build_update_params(
    cli: &Cli,
    args: &UpdateArgs,
    config: &HarnessConfig,
    stdin_has_data: bool,
) -> Result<RunParams> {
    let source = InputSource::select(
        args.file.as_deref(),
        &args.args,
        args.input_port,
        stdin_has_data,
    )?;
    let job_args = JobArgs {
        provider: args.provider.clone(),
        directory: args.directory.clone(),
        branch: args.branch.clone(),
        commit: args.commit.clone(),
        dependencies: args.dependencies.clone(),
    };
    let mut loaded = input::load(source, &job_args).await?;
    credentials::normalize_input(
        &mut loaded.input,
        local_tokens(config),
        args.api_url.as_deref(),
    );

    let mut params = RunParams {
        job: loaded.input.job,
        credentials: loaded.input.credentials,
        input_name: loaded.name,
        input_raw: loaded.raw,
        flamegraph: args.flamegraph,
        api_url: args.api_url.clone(),
        ..Default::default()
    };
    apply_shared(&mut params, cli, &args.shared);
    // An interactive shell owns the terminal.
    if !params.debug {
        params.stream = Some(Box::new(std::io::stdout()));
    }
    Ok(params)
}

/// Same as `update`, with the dependency-graph experiment forced on.
pub async fn graph_params(
    cli: &Cli,
    args: &UpdateArgs,
    config: &HarnessConfig,
) -> Result<RunParams> {
    let params = update_params(cli, args, config).await?;
    Ok(into_graph(params))
}

fn into_graph(mut params: RunParams) -> RunParams {
    params
        .job
        .experiments
        .insert(DEPENDENCY_GRAPH_EXPERIMENT.to_string(), Value::Bool(true));
    if params.job.command.is_none() {
        params.job.command = Some(JobCommand::Graph);
    }
    params
}

/// Build the run for `test`: the scenario's output becomes the expectations.
pub fn test_params(cli: &Cli, args: &TestArgs, config: &HarnessConfig) -> Result<RunParams> {
    let (mut scenario, raw) = input::read_scenario_file(&args.file)?;
    credentials::normalize_input(&mut scenario.input, local_tokens(config), None);

    let mut params = RunParams {
        job: scenario.input.job,
        credentials: scenario.input.credentials,
        expected: Some(scenario.output),
        input_name: Some(args.file.display().to_string()),
        input_raw: raw,
        ..Default::default()
    };
    apply_shared(&mut params, cli, &args.shared);
    Ok(params)
}

/// Run whichever command was parsed.
pub async fn run_command(cli: &Cli, runner: &Runner, config: &HarnessConfig) -> Result<()> {
    let params = match &cli.command {
        Command::Update(args) => update_params(cli, args, config).await?,
        Command::Graph(args) => graph_params(cli, args, config).await?,
        Command::Test(args) => test_params(cli, args, config)?,
    };
    runner.run(params).await
}
