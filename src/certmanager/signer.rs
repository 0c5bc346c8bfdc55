//! Issuance through cert-manager
//!
//! The signer turns an authorized CSR into a CertificateRequest, waits for
//! cert-manager to finish with it and cleans it up afterwards. The wait is
//! driven by a watch on the single request; if the watch breaks we fall back
//! to polling. Either way the wait races a deadline and the caller's
//! cancellation token. Cleanup runs in the background after the outcome is
//! known; [`Signer::drain`] waits for it at shutdown.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use kube::ResourceExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::client::CertificateRequestClient;
use super::resource::{CertificateRequest, IssuerRef, RequestOutcome};
use crate::identity::Caller;
use crate::retry::{retry_when, RetryConfig};
use crate::Error;

/// Issuance settings
#[derive(Clone, Debug)]
pub struct SignerConfig {
    /// Issuer that signs workload certificates
    pub issuer_ref: IssuerRef,
    /// Namespace CertificateRequests are created in
    pub namespace: String,
    /// Upper bound on certificate lifetime
    pub max_duration: Duration,
    /// Keep CertificateRequests after issuance
    pub preserve_requests: bool,
    /// How long to wait for a request to become ready
    pub timeout: Duration,
    /// Poll interval used when the watch is unavailable
    pub poll_interval: Duration,
    /// Retry policy for deleting finished requests
    pub cleanup_retry: RetryConfig,
}

impl SignerConfig {
    /// Settings with the default poll interval and cleanup retry
    pub fn new(issuer_ref: IssuerRef, namespace: impl Into<String>, max_duration: Duration) -> Self {
        Self {
            issuer_ref,
            namespace: namespace.into(),
            max_duration,
            preserve_requests: false,
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            cleanup_retry: RetryConfig::with_max_attempts(3),
        }
    }
}

/// Result of a successful issuance
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// PEM chain, leaf first
    pub chain: Vec<u8>,
    /// PEM CA certificate, if cert-manager returned one
    pub ca: Option<Vec<u8>>,
}

/// Requested lifetime capped at `max`; non-positive requests get `max`
pub fn clamp_duration(requested_secs: i64, max: Duration) -> Duration {
    if requested_secs <= 0 {
        return max;
    }
    Duration::from_secs(requested_secs as u64).min(max)
}

/// Drives CertificateRequests to completion
#[derive(Clone)]
pub struct Signer {
    client: Arc<dyn CertificateRequestClient>,
    config: Arc<SignerConfig>,
    cleanups: TaskTracker,
}

impl Signer {
    /// Create a signer
    pub fn new(client: Arc<dyn CertificateRequestClient>, config: SignerConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
            cleanups: TaskTracker::new(),
        }
    }

    /// Wait for background CertificateRequest deletions to finish
    pub async fn drain(&self) {
        self.cleanups.close();
        self.cleanups.wait().await;
    }

    /// Issue a certificate for an authorized caller
    ///
    /// The requested lifetime is capped at the configured maximum.
    #[instrument(skip_all, fields(identities = %caller.identities_csv()))]
    pub async fn sign(
        &self,
        caller: &Caller,
        csr: &[u8],
        requested_secs: i64,
        cancel: CancellationToken,
    ) -> Result<IssuedCertificate, Error> {
        let duration = clamp_duration(requested_secs, self.config.max_duration);
        if requested_secs > 0 && duration.as_secs() < requested_secs as u64 {
            debug!(
                requested_secs,
                max_secs = duration.as_secs(),
                "capping requested certificate duration"
            );
        }

        self.issue(&caller.identities_csv(), csr, duration, cancel)
            .await
    }

    /// Have the issuer sign `csr` for exactly `duration`
    ///
    /// `identities` is recorded on the CertificateRequest for auditing. The
    /// request is deleted in the background once the outcome is known unless
    /// requests are preserved. Cancelling `cancel` abandons the wait but
    /// still cleans up.
    pub async fn issue(
        &self,
        identities: &str,
        csr: &[u8],
        duration: Duration,
        cancel: CancellationToken,
    ) -> Result<IssuedCertificate, Error> {
        let request = CertificateRequest::for_workload(
            &self.config.namespace,
            csr,
            &self.config.issuer_ref,
            duration,
            identities,
        );

        let created = self.client.create(&request).await?;
        let name = created.name_any();
        info!(certificate_request = %name, duration_secs = duration.as_secs(), "created certificate request");

        let result = self.wait_for_ready(&created, &cancel).await;
        self.spawn_cleanup(name.clone());

        let issued = result?;
        info!(certificate_request = %name, "certificate issued");
        Ok(issued)
    }

    async fn wait_for_ready(
        &self,
        created: &CertificateRequest,
        cancel: &CancellationToken,
    ) -> Result<IssuedCertificate, Error> {
        let name = created.name_any();
        if let Some(issued) = evaluate(&name, created)? {
            return Ok(issued);
        }

        let deadline = Instant::now() + self.config.timeout;
        let mut events = Some(self.client.watch(&name));
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let observed = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(certificate_request = %name, "request cancelled while waiting");
                    return Err(Error::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(certificate_request = %name, "timed out waiting for certificate request");
                    return Err(Error::Timeout { name, after: self.config.timeout });
                }
                event = next_event(&mut events) => match event {
                    Some(Ok(cr)) => Some(cr),
                    Some(Err(e)) => {
                        warn!(certificate_request = %name, error = %e, "watch failed, falling back to polling");
                        events = None;
                        None
                    }
                    None => {
                        debug!(certificate_request = %name, "watch ended, falling back to polling");
                        events = None;
                        None
                    }
                },
                _ = poll.tick(), if events.is_none() => match self.client.get(&name).await {
                    Ok(Some(cr)) => Some(cr),
                    Ok(None) => {
                        return Err(Error::issuance(&name, "certificate request was deleted"));
                    }
                    Err(e) => {
                        warn!(certificate_request = %name, error = %e, "failed to poll certificate request");
                        None
                    }
                },
            };

            if let Some(cr) = observed {
                if let Some(issued) = evaluate(&name, &cr)? {
                    return Ok(issued);
                }
            }
        }
    }

    fn spawn_cleanup(&self, name: String) {
        if self.config.preserve_requests {
            debug!(certificate_request = %name, "preserving certificate request");
            return;
        }

        let client = Arc::clone(&self.client);
        let config = Arc::clone(&self.config);
        self.cleanups
            .spawn(async move { cleanup(client.as_ref(), &config.cleanup_retry, &name).await });
    }
}

async fn cleanup(client: &dyn CertificateRequestClient, retry: &RetryConfig, name: &str) {
    let result = retry_when(
        retry,
        "delete_certificate_request",
        || client.delete(name),
        Error::is_retryable,
    )
    .await;

    match result {
        Ok(()) => debug!(certificate_request = %name, "deleted certificate request"),
        Err(e) => error!(
            certificate_request = %name,
            error = %e,
            "failed to delete certificate request"
        ),
    }
}

fn evaluate(name: &str, cr: &CertificateRequest) -> Result<Option<IssuedCertificate>, Error> {
    match cr.outcome() {
        RequestOutcome::Pending => Ok(None),
        RequestOutcome::Ready { certificate, ca } => Ok(Some(IssuedCertificate {
            chain: certificate,
            ca,
        })),
        RequestOutcome::Failed(reason) => {
            warn!(certificate_request = %name, reason = %reason, "certificate request failed");
            Err(Error::issuance(name, reason))
        }
    }
}

async fn next_event(
    events: &mut Option<BoxStream<'static, Result<CertificateRequest, Error>>>,
) -> Option<Result<CertificateRequest, Error>> {
    match events {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}
