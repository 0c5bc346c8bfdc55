//! Leader election using Kubernetes Leases
//!
//! Only the leader runs the trust bundle controllers; every replica serves
//! certificates. Leadership is tracked in a coordination.k8s.io/v1 Lease.
//!
//! # Atomicity
//!
//! Writes carry the resourceVersion that was read. If the lease changes
//! between read and write, the write fails with 409 Conflict and the attempt
//! counts as "not leader", so two replicas can never both believe they
//! acquired it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::Error;

/// Lease name for the trust bundle controllers
pub const LEADER_LEASE_NAME: &str = "istio-csr-leader";

// Timing constants
const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Lease reads and compare-and-swap writes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LeaseClient: Send + Sync {
    /// Fetch the lease, `None` if it does not exist
    async fn get(&self, name: &str) -> Result<Option<Lease>, Error>;
    /// Create the lease; `false` if someone else created it first
    async fn create(&self, lease: &Lease) -> Result<bool, Error>;
    /// Replace the lease at its resourceVersion; `false` on conflict
    async fn replace(&self, lease: &Lease) -> Result<bool, Error>;
}

/// [`LeaseClient`] backed by the Kubernetes API
pub struct KubeLeaseClient {
    api: Api<Lease>,
}

impl KubeLeaseClient {
    /// Leases in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

fn is_conflict(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(ae) if ae.code == 409)
}

#[async_trait]
impl LeaseClient for KubeLeaseClient {
    async fn get(&self, name: &str) -> Result<Option<Lease>, Error> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn create(&self, lease: &Lease) -> Result<bool, Error> {
        match self.api.create(&PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, lease: &Lease) -> Result<bool, Error> {
        let name = lease.metadata.name.as_deref().unwrap_or_default();
        match self.api.replace(name, &PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Identity recorded as lease holder: `POD_NAME`, then the hostname
pub fn default_identity() -> String {
    resolve_identity(
        std::env::var("POD_NAME").ok(),
        std::env::var("HOSTNAME").ok(),
    )
}

fn resolve_identity(pod_name: Option<String>, hostname: Option<String>) -> String {
    pod_name
        .filter(|s| !s.is_empty())
        .or(hostname.filter(|s| !s.is_empty()))
        .unwrap_or_else(|| format!("istio-csr-{:08x}", rand::random::<u32>()))
}

/// What to write to hold the lease
#[derive(Debug, PartialEq)]
enum LeaseAction {
    /// No lease exists yet
    Create(Lease),
    /// Renew our own lease or take over an expired one
    Replace(Lease),
    /// Held by someone else and still valid
    Wait,
}

/// Leader elector using Kubernetes Leases
pub struct LeaderElector {
    leases: Arc<dyn LeaseClient>,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl LeaderElector {
    /// Create a new leader elector with default timing (30s lease, 10s renew, 5s retry)
    pub fn new(
        leases: Arc<dyn LeaseClient>,
        lease_name: &str,
        namespace: &str,
        identity: &str,
    ) -> Self {
        Self {
            leases,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            retry_interval: RETRY_INTERVAL,
        }
    }

    /// Block until leadership is acquired, then return a guard
    ///
    /// The guard keeps renewing the lease; [`LeaderGuard::lost`] resolves if
    /// a renewal fails.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "waiting for leadership"
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "leadership acquired");
                    return self.create_guard();
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = self.retry_interval.as_secs(),
                        "lease held by another replica"
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs(),
                        "failed to acquire lease, retrying"
                    );
                }
            }
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    async fn try_acquire_or_renew(&self) -> Result<bool, Error> {
        let existing = self.leases.get(&self.lease_name).await?;
        match self.next_action(existing, Utc::now())? {
            LeaseAction::Create(lease) => {
                let created = self.leases.create(&lease).await?;
                if created {
                    info!(identity = %self.identity, "created new lease");
                }
                Ok(created)
            }
            LeaseAction::Replace(lease) => self.leases.replace(&lease).await,
            LeaseAction::Wait => Ok(false),
        }
    }

    /// Decide how to claim the lease given its current state
    fn next_action(&self, existing: Option<Lease>, now: DateTime<Utc>) -> Result<LeaseAction, Error> {
        let Some(mut lease) = existing else {
            return Ok(LeaseAction::Create(Lease {
                metadata: ObjectMeta {
                    name: Some(self.lease_name.clone()),
                    namespace: Some(self.namespace.clone()),
                    ..Default::default()
                },
                spec: Some(self.held_spec(now, 0)),
            }));
        };

        if lease.metadata.resource_version.is_none() {
            return Err(Error::internal("lease missing resourceVersion"));
        }

        let spec = lease.spec.clone().unwrap_or_default();
        if spec.holder_identity.as_deref() == Some(self.identity.as_str()) {
            let mut renewed = spec;
            renewed.renew_time = Some(MicroTime(now));
            lease.spec = Some(renewed);
            return Ok(LeaseAction::Replace(lease));
        }

        let expired = match (&spec.renew_time, spec.lease_duration_seconds) {
            (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
            _ => true,
        };
        if !expired {
            return Ok(LeaseAction::Wait);
        }

        let transitions = spec.lease_transitions.unwrap_or(0) + 1;
        lease.spec = Some(self.held_spec(now, transitions));
        Ok(LeaseAction::Replace(lease))
    }

    fn held_spec(&self, now: DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        loop {
            tokio::time::sleep(self.renew_interval).await;

            match self.try_acquire_or_renew().await {
                Ok(true) => debug!(identity = %self.identity, "lease renewed"),
                Ok(false) | Err(_) => {
                    warn!(identity = %self.identity, "leadership lost");
                    let _ = lost_tx.send(());
                    return;
                }
            }
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release_lease(&self) -> Result<(), Error> {
        let Some(mut lease) = self.leases.get(&self.lease_name).await? else {
            debug!(identity = %self.identity, "lease not found, nothing to release");
            return Ok(());
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity.as_str()) {
            debug!(identity = %self.identity, "not the lease holder, nothing to release");
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        if let Some(spec) = lease.spec.as_mut() {
            spec.holder_identity = None;
            spec.renew_time = Some(MicroTime(past));
        }

        if self.leases.replace(&lease).await? {
            info!(identity = %self.identity, "lease released for fast failover");
        } else {
            debug!(identity = %self.identity, "lease changed before release");
        }
        Ok(())
    }
}

/// Guard that maintains leadership
///
/// The renewal task is aborted when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }

    /// Stop renewing and hand the lease back
    pub async fn release(self) -> Result<(), Error> {
        self.renewal_task.abort();
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "leadership released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn elector(leases: MockLeaseClient, identity: &str) -> Arc<LeaderElector> {
        Arc::new(LeaderElector::new(
            Arc::new(leases),
            LEADER_LEASE_NAME,
            "istio-system",
            identity,
        ))
    }

    fn lease(holder: Option<&str>, renewed: DateTime<Utc>, transitions: i32) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(LEADER_LEASE_NAME.into()),
                namespace: Some("istio-system".into()),
                resource_version: Some("42".into()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: holder.map(String::from),
                lease_duration_seconds: Some(30),
                renew_time: Some(MicroTime(renewed)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    fn holder(lease: &Lease) -> Option<String> {
        lease.spec.as_ref().and_then(|s| s.holder_identity.clone())
    }

    #[test]
    fn missing_lease_is_created() {
        let e = elector(MockLeaseClient::new(), "pod-a");
        let now = Utc::now();
        let LeaseAction::Create(created) = e.next_action(None, now).unwrap() else {
            panic!("expected create");
        };
        assert_eq!(holder(&created).as_deref(), Some("pod-a"));
        let spec = created.spec.unwrap();
        assert_eq!(spec.lease_duration_seconds, Some(30));
        assert_eq!(spec.lease_transitions, Some(0));
    }

    #[test]
    fn own_lease_is_renewed_at_same_version() {
        let e = elector(MockLeaseClient::new(), "pod-a");
        let then = Utc::now() - chrono::Duration::seconds(5);
        let now = Utc::now();
        let LeaseAction::Replace(renewed) = e
            .next_action(Some(lease(Some("pod-a"), then, 3)), now)
            .unwrap()
        else {
            panic!("expected renew");
        };
        assert_eq!(renewed.metadata.resource_version.as_deref(), Some("42"));
        let spec = renewed.spec.unwrap();
        assert_eq!(spec.renew_time, Some(MicroTime(now)));
        assert_eq!(spec.lease_transitions, Some(3));
    }

    #[test]
    fn live_lease_of_another_is_respected() {
        let e = elector(MockLeaseClient::new(), "pod-a");
        let now = Utc::now();
        let action = e
            .next_action(Some(lease(Some("pod-b"), now - chrono::Duration::seconds(10), 1)), now)
            .unwrap();
        assert_eq!(action, LeaseAction::Wait);
    }

    #[test]
    fn expired_lease_is_taken_over() {
        let e = elector(MockLeaseClient::new(), "pod-a");
        let now = Utc::now();
        let LeaseAction::Replace(taken) = e
            .next_action(Some(lease(Some("pod-b"), now - chrono::Duration::seconds(31), 1)), now)
            .unwrap()
        else {
            panic!("expected takeover");
        };
        assert_eq!(holder(&taken).as_deref(), Some("pod-a"));
        assert_eq!(taken.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(taken.spec.unwrap().lease_transitions, Some(2));
    }

    #[test]
    fn lease_without_resource_version_is_an_error() {
        let e = elector(MockLeaseClient::new(), "pod-a");
        let mut l = lease(Some("pod-b"), Utc::now(), 0);
        l.metadata.resource_version = None;
        assert!(e.next_action(Some(l), Utc::now()).is_err());
    }

    #[tokio::test]
    async fn acquire_creates_missing_lease() {
        let mut leases = MockLeaseClient::new();
        leases.expect_get().returning(|_| Ok(None));
        leases.expect_create().times(1).returning(|_| Ok(true));

        let guard = elector(leases, "pod-a").acquire().await;
        assert!(!guard.renewal_task.is_finished());
        drop(guard);
    }

    #[tokio::test(start_paused = true)]
    async fn create_conflict_retries() {
        let mut leases = MockLeaseClient::new();
        leases.expect_get().returning(|_| Ok(None));
        let mut seq = mockall::Sequence::new();
        leases
            .expect_create()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(false));
        leases
            .expect_create()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(true));

        let guard = elector(leases, "pod-a").acquire().await;
        assert!(!guard.renewal_task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_conflict_signals_loss() {
        let mut leases = MockLeaseClient::new();
        leases
            .expect_get()
            .returning(|_| Ok(Some(lease(Some("pod-a"), Utc::now(), 0))));
        let mut seq = mockall::Sequence::new();
        leases
            .expect_replace()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(true));
        leases
            .expect_replace()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(false));

        let mut guard = elector(leases, "pod-a").acquire().await;
        guard.lost().await;
        tokio::task::yield_now().await;
        assert!(guard.renewal_task.is_finished());
    }

    #[tokio::test]
    async fn release_clears_holder() {
        let mut leases = MockLeaseClient::new();
        leases
            .expect_get()
            .returning(|_| Ok(Some(lease(Some("pod-a"), Utc::now(), 0))));
        let mut seq = mockall::Sequence::new();
        leases
            .expect_replace()
            .withf(|l| holder(l).as_deref() == Some("pod-a"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(true));
        leases
            .expect_replace()
            .withf(|l| holder(l).is_none())
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(true));

        let guard = elector(leases, "pod-a").acquire().await;
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn release_leaves_foreign_lease_alone() {
        let mut leases = MockLeaseClient::new();
        leases
            .expect_get()
            .returning(|_| Ok(Some(lease(Some("pod-b"), Utc::now(), 0))));
        leases.expect_replace().never();

        elector(leases, "pod-a").release_lease().await.unwrap();
    }

    #[test]
    fn identity_prefers_pod_name() {
        assert_eq!(
            resolve_identity(Some("istio-csr-7d9f".into()), Some("host".into())),
            "istio-csr-7d9f"
        );
        assert_eq!(resolve_identity(Some(String::new()), Some("host".into())), "host");
        assert!(resolve_identity(None, None).starts_with("istio-csr-"));
    }
}
