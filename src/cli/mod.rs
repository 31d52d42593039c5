//! CLI command handling.
//!
//! Provides subcommands for:
//! - Running an update job (`update`)
//! - Replaying a scenario and asserting its output (`test`)
//! - Listing a manifest's dependency graph (`graph`)

mod commands;

pub use commands::{graph_params, run_command, test_params, update_params};

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "update-sandbox")]
#[command(about = "Run dependency update jobs inside an isolated container sandbox")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Container image to use for the updater
    #[arg(long, global = true)]
    pub updater_image: Option<String>,

    /// Container image to use for the proxy
    #[arg(long, global = true)]
    pub proxy_image: Option<String>,

    /// Container image to use for the telemetry collector
    #[arg(long, global = true)]
    pub collector_image: Option<String>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Perform an update job
    Update(UpdateArgs),

    /// Test scenarios
    Test(TestArgs),

    /// [Experimental] List the dependencies of a manifest/lockfile
    Graph(UpdateArgs),
}

impl Cli {
    /// The run deadline of whichever command was chosen.
    pub fn timeout(&self) -> Option<Duration> {
        match &self.command {
            Command::Update(args) | Command::Graph(args) => args.shared.timeout,
            Command::Test(args) => args.shared.timeout,
        }
    }
}

/// Flags every command accepts.
#[derive(Args, Debug, Clone)]
pub struct SharedArgs {
    /// Write scenario to file
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Cache import/export directory
    #[arg(long)]
    pub cache: Option<PathBuf>,

    /// Local directory to use as fetched source
    #[arg(long)]
    pub local: Option<PathBuf>,

    /// Path to a certificate the proxy will trust
    #[arg(long)]
    pub proxy_cert: Option<PathBuf>,

    /// Path to an OpenTelemetry collector config file
    #[arg(long)]
    pub collector_config: Option<PathBuf>,

    /// Pull the image if it isn't present
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub pull: bool,

    /// Run an interactive shell inside the updater
    #[arg(long)]
    pub debug: bool,

    /// Mount volumes in Docker (local:remote[:ro])
    #[arg(short = 'v', long = "volume")]
    pub volumes: Vec<String>,

    /// Docker extra hosts setting on the proxy
    #[arg(long = "extra-hosts")]
    pub extra_hosts: Vec<String>,

    /// Max time to run an update (e.g. 90s, 30m, 1h30m)
    #[arg(short, long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,
}

#[derive(Args, Debug, Clone)]
pub struct UpdateArgs {
    /// <package_manager> <repo>
    pub args: Vec<String>,

    /// Path to input file
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Provider of the repository
    #[arg(short, long, default_value = "github")]
    pub provider: String,

    /// Target branch to update
    #[arg(short, long)]
    pub branch: Option<String>,

    /// Directory to update
    #[arg(short, long, default_value = "/")]
    pub directory: String,

    /// Commit to update
    #[arg(long)]
    pub commit: Option<String>,

    /// Dependencies to update
    #[arg(long = "dep")]
    pub dependencies: Vec<String>,

    /// Port to use for securely passing input to the updater
    #[arg(long)]
    pub input_port: Option<u16>,

    /// The API the updater should connect to
    #[arg(short, long)]
    pub api_url: Option<String>,

    /// Generate a flamegraph and other metrics
    #[arg(long)]
    pub flamegraph: bool,

    #[command(flatten)]
    pub shared: SharedArgs,
}

#[derive(Args, Debug, Clone)]
pub struct TestArgs {
    /// Path to scenario file
    #[arg(short, long)]
    pub file: PathBuf,

    #[command(flatten)]
    pub shared: SharedArgs,
}

/// Parse `90`, `90s`, `500ms`, `30m`, `1h30m`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in duration {s:?}"))?;
        if digits == 0 {
            return Err(format!("invalid duration {s:?}"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid duration {s:?}"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        total += match unit {
            "h" => Duration::from_secs(value * 3600),
            "m" => Duration::from_secs(value * 60),
            "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            _ => return Err(format!("unknown unit {unit:?} in duration {s:?}")),
        };
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_update_with_arguments() {
        let cli = Cli::try_parse_from(["update-sandbox", "update", "go_modules", "rsc/quote"]).unwrap();
        let Command::Update(args) = cli.command else {
            panic!("expected update");
        };
        assert_eq!(args.args, vec!["go_modules", "rsc/quote"]);
        assert_eq!(args.provider, "github");
        assert_eq!(args.directory, "/");
        assert!(args.shared.pull);
        assert!(!args.shared.debug);
    }

    #[test]
    fn parse_update_flags() {
        let cli = Cli::try_parse_from([
            "update-sandbox",
            "update",
            "-f",
            "input.yml",
            "-o",
            "out.yml",
            "--dep",
            "a",
            "--dep",
            "b",
            "-v",
            "/src:/mnt:ro",
            "--pull",
            "false",
            "--timeout",
            "30m",
            "--updater-image",
            "updater:dev",
        ])
        .unwrap();
        assert_eq!(cli.updater_image.as_deref(), Some("updater:dev"));
        assert_eq!(cli.timeout(), Some(Duration::from_secs(1800)));
        let Command::Update(args) = cli.command else {
            panic!("expected update");
        };
        assert_eq!(args.file, Some(PathBuf::from("input.yml")));
        assert_eq!(args.dependencies, vec!["a", "b"]);
        assert_eq!(args.shared.volumes, vec!["/src:/mnt:ro"]);
        assert!(!args.shared.pull);
    }

    #[test]
    fn parse_test_requires_file() {
        assert!(Cli::try_parse_from(["update-sandbox", "test"]).is_err());
        let cli = Cli::try_parse_from(["update-sandbox", "test", "-f", "scenario.yml"]).unwrap();
        assert!(matches!(cli.command, Command::Test(ref t) if t.file == PathBuf::from("scenario.yml")));
    }

    #[test]
    fn parse_graph_command() {
        let cli = Cli::try_parse_from(["update-sandbox", "graph", "bundler", "org/repo"]).unwrap();
        assert!(matches!(cli.command, Command::Graph(_)));
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_ok());
        assert!(parse_duration("m").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("5").is_ok());
    }
}
