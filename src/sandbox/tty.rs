//! Terminal plumbing for interactive sessions.

use std::sync::Arc;

use crossterm::terminal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::runtime::ContainerRuntime;

/// Puts the local terminal in raw mode until dropped.
pub struct RawModeGuard {
    enabled: bool,
}

impl RawModeGuard {
    /// Raw mode is best effort; without a terminal the session still works.
    pub fn enable() -> Self {
        let enabled = match terminal::enable_raw_mode() {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Raw mode unavailable: {}", e);
                false
            }
        };
        Self { enabled }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.enabled {
            let _ = terminal::disable_raw_mode();
        }
    }
}

async fn resize_to_terminal(runtime: &dyn ContainerRuntime, exec_id: &str) {
    let Ok((cols, rows)) = terminal::size() else {
        return;
    };
    if let Err(e) = runtime.resize_exec(exec_id, rows, cols).await {
        tracing::debug!(exec_id = %exec_id, "Resize failed: {}", e);
    }
}

/// Keep the exec's pty sized like the local terminal until `token` fires.
pub fn watch_resize(
    runtime: Arc<dyn ContainerRuntime>,
    exec_id: String,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = ResizeEvents::new();
        resize_to_terminal(runtime.as_ref(), &exec_id).await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                changed = events.next() => {
                    if !changed {
                        break;
                    }
                    resize_to_terminal(runtime.as_ref(), &exec_id).await;
                }
            }
        }
    })
}

/// SIGWINCH where available, polling elsewhere.
struct ResizeEvents {
    #[cfg(unix)]
    winch: Option<tokio::signal::unix::Signal>,
}

impl ResizeEvents {
    #[cfg(unix)]
    fn new() -> Self {
        use tokio::signal::unix::{SignalKind, signal};
        Self {
            winch: signal(SignalKind::window_change()).ok(),
        }
    }

    #[cfg(not(unix))]
    fn new() -> Self {
        Self {}
    }

    #[cfg(unix)]
    async fn next(&mut self) -> bool {
        match self.winch.as_mut() {
            Some(winch) => winch.recv().await.is_some(),
            None => std::future::pending().await,
        }
    }

    #[cfg(not(unix))]
    async fn next(&mut self) -> bool {
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        true
    }
}
