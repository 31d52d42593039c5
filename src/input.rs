//! Where a run's input comes from.
//!
//! A job arrives from exactly one of: positional `<package_manager> <repo>`
//! arguments, an input file, piped stdin, or a one-shot HTTP listener that
//! accepts a single POSTed document and shuts itself down. The listener
//! keeps secrets out of the process arguments and the shell history.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::error::{ApiError, ConfigError, Error};
use crate::model::{Allowed, Input, Job, Scenario, Source, parse_document};

/// The single source a command reads its input from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    File(PathBuf),
    Arguments(Vec<String>),
    Listener(u16),
    Stdin,
}

impl InputSource {
    /// Pick the source, refusing ambiguous combinations.
    pub fn select(
        file: Option<&Path>,
        positional: &[String],
        input_port: Option<u16>,
        stdin_has_data: bool,
    ) -> Result<Self, ConfigError> {
        let input_port = input_port.filter(|p| *p != 0);
        let count = [
            file.is_some(),
            !positional.is_empty(),
            input_port.is_some(),
            stdin_has_data,
        ]
        .into_iter()
        .filter(|present| *present)
        .count();
        if count > 1 {
            return Err(ConfigError::InvalidInput(
                "can only use one of: input file, arguments, server, or stdin".to_string(),
            ));
        }

        if let Some(file) = file {
            Ok(Self::File(file.to_path_buf()))
        } else if !positional.is_empty() {
            Ok(Self::Arguments(positional.to_vec()))
        } else if let Some(port) = input_port {
            Ok(Self::Listener(port))
        } else if stdin_has_data {
            Ok(Self::Stdin)
        } else {
            Err(ConfigError::InvalidInput(
                "requires input as arguments, input file, or stdin".to_string(),
            ))
        }
    }
}

/// Job fields settable from flags when the job comes from arguments.
#[derive(Debug, Clone)]
pub struct JobArgs {
    pub provider: String,
    pub directory: String,
    pub branch: Option<String>,
    pub commit: Option<String>,
    pub dependencies: Vec<String>,
}

impl Default for JobArgs {
    fn default() -> Self {
        Self {
            provider: "github".to_string(),
            directory: "/".to_string(),
            branch: None,
            commit: None,
            dependencies: Vec::new(),
        }
    }
}

/// Build a job from `<package_manager> <repo>`.
pub fn from_arguments(positional: &[String], args: &JobArgs) -> Result<Input, ConfigError> {
    let [package_manager, repo] = positional else {
        return Err(ConfigError::InvalidInput(
            "requires a package manager and repo argument".to_string(),
        ));
    };
    if package_manager.is_empty() {
        return Err(ConfigError::InvalidInput(
            "requires a package manager argument".to_string(),
        ));
    }
    if repo.is_empty() {
        return Err(ConfigError::InvalidInput("requires a repo argument".to_string()));
    }
    if args.branch.is_some() && args.commit.is_some() {
        return Err(ConfigError::InvalidInput(
            "cannot specify both branch and commit".to_string(),
        ));
    }

    let allowed_updates = if args.dependencies.is_empty() {
        vec![Allowed::all()]
    } else {
        args.dependencies.iter().map(Allowed::dependency).collect()
    };

    Ok(Input {
        job: Job {
            package_manager: package_manager.clone(),
            allowed_updates,
            source: Source {
                provider: args.provider.clone(),
                repo: repo.clone(),
                directory: args.directory.clone(),
                branch: args.branch.clone(),
                commit: args.commit.clone(),
                ..Default::default()
            },
            ..Default::default()
        },
        credentials: Vec::new(),
    })
}

/// A decoded input plus the bytes it came from, for diffs.
#[derive(Debug, Clone, Default)]
pub struct LoadedInput {
    pub input: Input,
    pub raw: Vec<u8>,
    /// File name shown in diff headers.
    pub name: Option<String>,
}

pub fn read_input_file(path: &Path) -> Result<LoadedInput, ConfigError> {
    let raw = std::fs::read(path).map_err(|e| {
        ConfigError::InvalidInput(format!("failed to open input file: {e}"))
    })?;
    let input = parse_document(&raw)?;
    Ok(LoadedInput {
        input,
        raw,
        name: Some(path.display().to_string()),
    })
}

/// Read a scenario and keep its raw bytes.
pub fn read_scenario_file(path: &Path) -> Result<(Scenario, Vec<u8>), ConfigError> {
    let raw = std::fs::read(path).map_err(|e| {
        ConfigError::InvalidInput(format!("failed to open scenario file: {e}"))
    })?;
    let scenario = parse_document(&raw).map_err(|e| match e {
        ConfigError::Parse(reason) => {
            ConfigError::Parse(reason.replace("input file", "scenario file"))
        }
        other => other,
    })?;
    Ok((scenario, raw))
}

fn read_stdin() -> Result<LoadedInput, ConfigError> {
    let mut raw = Vec::new();
    std::io::stdin().read_to_end(&mut raw)?;
    let input = parse_document(&raw)?;
    Ok(LoadedInput {
        input,
        raw,
        name: None,
    })
}

/// Whether stdin is a pipe or a redirected file rather than a terminal.
pub fn stdin_has_data() -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        std::fs::metadata("/dev/stdin")
            .map(|m| m.file_type().is_fifo() || m.is_file())
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        use std::io::IsTerminal;
        !std::io::stdin().is_terminal()
    }
}

/// Read the input from `source`.
pub async fn load(source: InputSource, args: &JobArgs) -> Result<LoadedInput, Error> {
    let loaded = match source {
        InputSource::File(path) => read_input_file(&path)?,
        InputSource::Arguments(positional) => LoadedInput {
            input: from_arguments(&positional, args)?,
            ..Default::default()
        },
        InputSource::Listener(port) => {
            let listener = TcpListener::bind(("127.0.0.1", port))
                .await
                .map_err(|e| ApiError::Bind {
                    addr: format!("127.0.0.1:{port}"),
                    reason: e.to_string(),
                })?;
            LoadedInput {
                input: receive_input(listener).await?,
                ..Default::default()
            }
        }
        InputSource::Stdin => read_stdin()?,
    };
    Ok(loaded)
}

#[derive(Clone)]
struct InputSlot {
    input: Arc<Mutex<Option<Input>>>,
    received: CancellationToken,
}

async fn accept_input(State(slot): State<InputSlot>, body: Bytes) -> StatusCode {
    let input: Input = match serde_json::from_slice(&body) {
        Ok(input) => input,
        Err(e) => {
            tracing::warn!("Rejected input payload: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };
    if let Ok(mut guard) = slot.input.lock() {
        *guard = Some(input);
    }
    slot.received.cancel();
    StatusCode::OK
}

/// Serve until one valid input document is POSTed, then shut down and return it.
pub async fn receive_input(listener: TcpListener) -> Result<Input, ApiError> {
    let addr = listener.local_addr().map_err(|e| ApiError::InputListener {
        reason: e.to_string(),
    })?;
    let slot = InputSlot {
        input: Arc::new(Mutex::new(None)),
        received: CancellationToken::new(),
    };
    let app = Router::new().fallback(accept_input).with_state(slot.clone());

    tracing::info!("waiting for input on {}", addr);
    let received = slot.received.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { received.cancelled().await })
        .await
        .map_err(|e| ApiError::InputListener {
            reason: e.to_string(),
        })?;

    slot.input
        .lock()
        .ok()
        .and_then(|mut guard| guard.take())
        .ok_or_else(|| ApiError::InputListener {
            reason: "listener closed without receiving input".to_string(),
        })
}
