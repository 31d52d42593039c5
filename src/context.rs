//! Cancellable run context.
//!
//! One context governs a whole run. It ends when the optional deadline
//! elapses or when the process receives SIGINT/SIGTERM, and every blocking
//! sandbox call is raced against it through [`RunContext::guard`].

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::sandbox::SandboxError;

#[derive(Debug, Clone)]
pub struct RunContext {
    token: CancellationToken,
    deadline: Option<(Instant, Duration)>,
}

impl RunContext {
    /// A context bounded by `timeout`; zero or `None` means no deadline.
    pub fn new(timeout: Option<Duration>) -> Self {
        let deadline = timeout
            .filter(|t| !t.is_zero())
            .map(|t| (Instant::now() + t, t));
        Self {
            token: CancellationToken::new(),
            deadline,
        }
    }

    /// Cancel this context when the process is interrupted.
    ///
    /// The returned task ends on its own once the context is cancelled.
    pub fn watch_signals(&self) -> JoinHandle<()> {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = interrupted() => {
                    tracing::warn!("Interrupt received, cancelling run");
                    token.cancel();
                }
            }
        })
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token for tasks that only need to stop when the run ends.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Resolves when the context ends, yielding why.
    pub async fn done(&self) -> SandboxError {
        let deadline = async {
            match self.deadline {
                Some((at, timeout)) => {
                    tokio::time::sleep_until(at).await;
                    timeout
                }
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = self.token.cancelled() => SandboxError::Interrupted,
            timeout = deadline => SandboxError::Timeout(timeout),
        }
    }

    /// Run `fut` unless the context ends first.
    pub async fn guard<T, E, F>(&self, fut: F) -> Result<T, SandboxError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<SandboxError>,
    {
        tokio::select! {
            biased;
            reason = self.done() => Err(reason),
            result = fut => result.map_err(Into::into),
        }
    }
}

#[cfg(unix)]
async fn interrupted() {
    use tokio::signal::unix::{SignalKind, signal};

    match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(mut int), Ok(mut term)) => {
            tokio::select! {
                _ = int.recv() => {}
                _ = term.recv() => {}
            }
        }
        _ => {
            tracing::warn!("Failed to install signal handlers, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn interrupted() {
    let _ = tokio::signal::ctrl_c().await;
}
