//! Readiness endpoint
//!
//! A single HTTP route that answers 200 once the certificate API is bound and
//! 503 before that or after it stops.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Error;

/// Shared readiness flag
#[derive(Clone, Debug, Default)]
pub struct Readiness {
    ready: Arc<AtomicBool>,
}

impl Readiness {
    /// Create a flag that starts not ready
    pub fn new() -> Self {
        Self::default()
    }

    /// Set readiness
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    /// Current readiness
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Build the readiness router serving `path`
pub fn readiness_routes(path: &str, readiness: Readiness) -> Router {
    Router::new()
        .route(path, get(ready))
        .with_state(readiness)
}

async fn ready(State(readiness): State<Readiness>) -> (StatusCode, &'static str) {
    if readiness.is_ready() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Serve the readiness endpoint on `addr` until `shutdown` is cancelled
pub async fn serve(
    addr: SocketAddr,
    path: String,
    readiness: Readiness,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal(format!("binding readiness endpoint {addr}: {e}")))?;
    info!(addr = %addr, path = %path, "readiness endpoint listening");

    axum::serve(listener, readiness_routes(&path, readiness))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| Error::internal(format!("readiness endpoint: {e}")))
}
