//! Trust bundle controllers
//!
//! Two level-triggered controllers keep the root CA ConfigMap present and
//! correct in every live namespace. Both delegate to one shared
//! [`TrustBundleEnforcer`], so whichever fires first converges the object and
//! the other finds nothing to do.
//!
//! - The namespace controller reacts to namespace events, to any event on the
//!   well-known ConfigMap (including deletion) mapped back to its namespace,
//!   and to trust bundle rotation (all namespaces).
//! - The ConfigMap controller reacts to edits of the well-known ConfigMap.

pub mod configmap;
pub mod enforcer;
pub mod namespace;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use parking_lot::Mutex;

pub use configmap::ConfigMapContext;
pub use enforcer::{
    ConfigMapClient, Convergence, KubeConfigMapClient, TrustBundleEnforcer, ISTIO_CONFIG_LABEL,
    ROOT_CERT_KEY,
};
pub use namespace::{KubeNamespaceClient, NamespaceClient, NamespaceContext};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Per-key exponential requeue delay, reset on success
#[derive(Clone, Debug)]
pub struct RequeueBackoff {
    attempts: Arc<Mutex<HashMap<String, u32>>>,
    base: Duration,
    max: Duration,
}

impl Default for RequeueBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(300))
    }
}

impl RequeueBackoff {
    /// Backoff starting at `base` and doubling up to `max`
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            attempts: Arc::new(Mutex::new(HashMap::new())),
            base,
            max,
        }
    }

    /// Record a failure for `key` and return how long to wait
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut attempts = self.attempts.lock();
        let n = attempts.entry(key.to_string()).or_insert(0);
        let delay = self.base.saturating_mul(2u32.saturating_pow(*n)).min(self.max);
        *n = n.saturating_add(1);
        delay
    }

    /// Forget failures for `key`
    pub fn reset(&self, key: &str) {
        self.attempts.lock().remove(key);
    }

    /// Forget failures for a namespace and every `<namespace>/<name>` key in it
    pub fn forget_namespace(&self, namespace: &str) {
        let prefix = format!("{namespace}/");
        self.attempts
            .lock()
            .retain(|key, _| key != namespace && !key.starts_with(&prefix));
    }
}

/// Build the namespace and ConfigMap controller futures
///
/// `bundle_changes` yields whenever the trust bundle content changes; each
/// item requeues every namespace.
pub fn build_controllers(
    client: Client,
    enforcer: Arc<TrustBundleEnforcer>,
    bundle_changes: impl Stream<Item = ()> + Send + Sync + 'static,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let selector = format!("metadata.name={}", enforcer.config_map_name());

    let namespaces: Api<Namespace> = Api::all(client.clone());
    let config_maps: Api<ConfigMap> = Api::all(client.clone());

    // Shared so a namespace going away also drops its ConfigMap's failures
    let backoff = RequeueBackoff::default();

    let ns_ctx = Arc::new(
        NamespaceContext::new(
            Arc::new(KubeNamespaceClient::new(client.clone())),
            enforcer.clone(),
        )
        .with_backoff(backoff.clone()),
    );
    let ns_ctrl = Controller::new(
        namespaces,
        WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS),
    )
    .watches(
        config_maps.clone(),
        WatcherConfig::default()
            .fields(&selector)
            .timeout(WATCH_TIMEOUT_SECS),
        |cm: ConfigMap| cm.namespace().map(|ns| ObjectRef::<Namespace>::new(&ns)),
    )
    .reconcile_all_on(bundle_changes)
    .shutdown_on_signal()
    .run(namespace::reconcile, namespace::error_policy, ns_ctx)
    .for_each(log_reconcile_result("Namespace"));

    let cm_ctx = Arc::new(ConfigMapContext::new(enforcer).with_backoff(backoff));
    let cm_ctrl = Controller::new(
        config_maps,
        WatcherConfig::default()
            .fields(&selector)
            .timeout(WATCH_TIMEOUT_SECS),
    )
    .shutdown_on_signal()
    .run(configmap::reconcile, configmap::error_policy, cm_ctx)
    .for_each(log_reconcile_result("ConfigMap"));

    tracing::info!(config_map = %selector, "built trust bundle controllers");

    vec![Box::pin(ns_ctrl), Box::pin(cm_ctrl)]
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::trace!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::debug!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
