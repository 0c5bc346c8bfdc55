//! Root CA trust bundle
//!
//! The bundle is the PEM root certificate distributed to every namespace.
//! It is held in a shared handle that the controllers read on demand and
//! that can be swapped at runtime; swapping it wakes anyone subscribed to
//! [`SharedTrustBundle::changes`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Provides the current PEM encoded root CA
#[cfg_attr(test, automock)]
pub trait TrustBundleSource: Send + Sync {
    /// Current root CA bytes; empty when not yet known
    fn root_ca_pem(&self) -> Vec<u8>;
}

/// Shared, replaceable trust bundle
#[derive(Clone)]
pub struct SharedTrustBundle {
    tx: Arc<watch::Sender<Vec<u8>>>,
}

impl Default for SharedTrustBundle {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl SharedTrustBundle {
    /// Create a bundle with initial content
    pub fn new(pem: Vec<u8>) -> Self {
        let (tx, _) = watch::channel(pem);
        Self { tx: Arc::new(tx) }
    }

    /// Load the bundle from a PEM file
    pub async fn from_file(path: &Path) -> Result<Self, Error> {
        Ok(Self::new(read_bundle(path).await?))
    }

    /// Replace the content, returning true if it changed
    pub fn replace(&self, pem: Vec<u8>) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == pem {
                return false;
            }
            *current = pem;
            true
        })
    }

    /// Stream that yields once per content change
    pub fn changes(&self) -> impl Stream<Item = ()> + Send + Sync + 'static {
        WatchStream::from_changes(self.tx.subscribe()).map(|_| ())
    }

    /// Re-read `path` every `interval` until cancelled, replacing the content
    /// when the file changes
    pub async fn watch_file(&self, path: PathBuf, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // first tick fires immediately and the file was just loaded
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match read_bundle(&path).await {
                Ok(pem) => {
                    if self.replace(pem) {
                        info!(path = %path.display(), "root CA changed, updating trust bundle");
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to reload root CA"),
            }
        }
    }
}

impl TrustBundleSource for SharedTrustBundle {
    fn root_ca_pem(&self) -> Vec<u8> {
        self.tx.borrow().clone()
    }
}

async fn read_bundle(path: &Path) -> Result<Vec<u8>, Error> {
    let pem = tokio::fs::read(path)
        .await
        .map_err(|e| Error::config(format!("reading root CA {}: {e}", path.display())))?;
    if pem::parse_many(&pem).map(|blocks| blocks.is_empty()).unwrap_or(true) {
        return Err(Error::config(format!(
            "root CA {} contains no PEM certificates",
            path.display()
        )));
    }
    Ok(pem)
}
