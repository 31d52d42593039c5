use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use update_sandbox::cli::{Cli, run_command};
use update_sandbox::config::{HarnessConfig, ImageTable};
use update_sandbox::run::Runner;
use update_sandbox::sandbox::DockerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("update_sandbox=info"));

    // Logs go to stderr; stdout carries the streamed messages.
    let text_layer = (!cli.log_json).then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
    });
    let json_layer = cli
        .log_json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(text_layer)
        .with(json_layer)
        .init();

    let config = HarnessConfig::from_env()?;
    let runtime = DockerRuntime::connect().await?;
    let runner = Runner::new(Arc::new(runtime), ImageTable::default(), config.clone());

    if let Err(e) = run_command(&cli, &runner, &config).await {
        if e.is_timeout()
            && let Some(timeout) = cli.timeout()
        {
            anyhow::bail!("update timed out after {:?}", timeout);
        }
        anyhow::bail!("updater failure: {}", e);
    }

    Ok(())
}
