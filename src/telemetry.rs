//! Logging initialization
//!
//! Structured logs via `tracing-subscriber`, filtered by `RUST_LOG` when set
//! and by `--log-level` otherwise.

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::LogFormat;

/// Filter used when neither `RUST_LOG` nor a log level is given
pub const DEFAULT_FILTER: &str = "info,istio_csr=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize tracing subscriber
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Filter directives for an explicit level
///
/// HTTP plumbing stays at warn so `debug` shows our own decisions.
pub fn filter_directives(level: Option<Level>) -> String {
    match level {
        None => DEFAULT_FILTER.to_string(),
        Some(level) => {
            let level = level.as_str().to_lowercase();
            format!("{level},tower=warn,hyper=warn,h2=warn")
        }
    }
}

/// Install the global tracing subscriber
pub fn init_tracing(format: LogFormat, level: Option<Level>) -> Result<(), TelemetryError> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives(level)));

    let fmt_layer = match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::SubscriberInit(e.to_string())
        })
}
