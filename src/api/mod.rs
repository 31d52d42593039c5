//! Control-plane mock.
//!
//! The updater reports its work by POSTing JSON to `<api-url>/.../<kind>`.
//! This server stands in for the real service: it decodes every call,
//! records it, and either streams it live or asserts it against the next
//! expected message.
//!
//! ```text
//!   updater ──POST /update_jobs/cli/<kind>──► ControlPlaneMock
//!                                                  │
//!                                  ┌───────────────┴──────────────┐
//!                                  ▼                              ▼
//!                      no expectations: stream        expectations: assert
//!                      {"type","data"} to sink        against Ledger cursor
//! ```

mod ledger;
mod protocol;

pub use ledger::{Ledger, Outcome, Phase, StreamSink};
pub use protocol::ProtocolError;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::extract::rejection::BytesRejection;
use axum::http::{StatusCode, Uri};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;

use crate::error::ApiError;
use crate::model::Message;

/// Grace period for in-flight requests on stop.
const STOP_GRACE: Duration = Duration::from_secs(1);

type SharedLedger = Arc<Mutex<Ledger>>;

/// Everything the mock observed during a run.
#[derive(Debug, Clone, Default)]
pub struct ApiReport {
    /// Accepted messages in arrival order, file content hashed.
    pub recorded: Vec<Message>,
    pub errors: Vec<ProtocolError>,
    /// Commit from the last `mark_as_processed` call.
    pub processed_commit: Option<String>,
}

/// HTTP server recording and asserting updater calls.
pub struct ControlPlaneMock {
    ledger: SharedLedger,
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ControlPlaneMock {
    /// Bind `host:port` and start serving. Port 0 picks a free port.
    pub async fn start(
        host: &str,
        port: u16,
        expectations: Vec<Message>,
        sink: Option<StreamSink>,
    ) -> Result<Self, ApiError> {
        let listener = tokio::net::TcpListener::bind((host, port))
            .await
            .map_err(|e| ApiError::Bind {
                addr: format!("{host}:{port}"),
                reason: e.to_string(),
            })?;
        let addr = listener.local_addr().map_err(|e| ApiError::Bind {
            addr: format!("{host}:{port}"),
            reason: e.to_string(),
        })?;

        let ledger = Arc::new(Mutex::new(Ledger::new(expectations, sink)));
        let app = router(Arc::clone(&ledger));

        tracing::info!("Control plane listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::debug!("Control plane shutting down");
                })
                .await
            {
                tracing::error!("Control plane server error: {}", e);
            }
        });

        Ok(Self {
            ledger,
            addr,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn phase(&self) -> Phase {
        self.ledger.lock().await.phase()
    }

    /// Stop accepting messages and report unconsumed expectations.
    pub async fn complete(&self) {
        self.ledger.lock().await.complete();
    }

    /// Shut the server down, waiting briefly for in-flight requests.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(mut handle) = self.handle.take()
            && tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err()
        {
            tracing::warn!("Control plane did not stop within {:?}, aborting", STOP_GRACE);
            handle.abort();
        }
        self.ledger.lock().await.mark_stopped();
    }

    pub async fn report(&self) -> ApiReport {
        let ledger = self.ledger.lock().await;
        ApiReport {
            recorded: ledger.recorded().to_vec(),
            errors: ledger.errors().to_vec(),
            processed_commit: ledger.processed_commit().map(str::to_string),
        }
    }
}

impl Drop for ControlPlaneMock {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Every path is routed to the same handler; the last segment names the kind.
///
/// Bodies are unbounded: a pull request carries whole dependency files.
fn router(ledger: SharedLedger) -> Router {
    Router::new()
        .fallback(intercept)
        .layer(DefaultBodyLimit::disable())
        .with_state(ledger)
}

async fn intercept(
    State(ledger): State<SharedLedger>,
    uri: Uri,
    body: Result<Bytes, BytesRejection>,
) -> StatusCode {
    let kind = uri.path().rsplit('/').next().unwrap_or_default();
    let mut ledger = ledger.lock().await;

    let body = match body {
        Ok(body) => body,
        Err(e) => {
            ledger.reject_body(e.body_text());
            return StatusCode::BAD_REQUEST;
        }
    };

    match ledger.accept(kind, &body) {
        Outcome::Accepted => StatusCode::NO_CONTENT,
        Outcome::UnknownKind => StatusCode::NOT_IMPLEMENTED,
        Outcome::Malformed => StatusCode::BAD_REQUEST,
        Outcome::Closed => StatusCode::CONFLICT,
    }
}
