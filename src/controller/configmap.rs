//! Trust bundle ConfigMap reconciler
//!
//! Reacts to edits of the well-known ConfigMap in any namespace. Only objects
//! with that name reach this reconciler: the watch uses a field selector.

use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{instrument, warn};

use super::enforcer::{Convergence, TrustBundleEnforcer};
use super::RequeueBackoff;
use crate::Error;

/// Shared state for the ConfigMap reconciler
pub struct ConfigMapContext {
    enforcer: Arc<TrustBundleEnforcer>,
    backoff: RequeueBackoff,
}

impl ConfigMapContext {
    /// Create a context
    pub fn new(enforcer: Arc<TrustBundleEnforcer>) -> Self {
        Self {
            enforcer,
            backoff: RequeueBackoff::default(),
        }
    }

    /// Use a backoff shared with the namespace reconciler
    pub fn with_backoff(mut self, backoff: RequeueBackoff) -> Self {
        self.backoff = backoff;
        self
    }
}

fn key(cm: &ConfigMap) -> String {
    format!("{}/{}", cm.namespace().unwrap_or_default(), cm.name_any())
}

/// Restore the trust bundle ConfigMap in the object's namespace
#[instrument(skip_all, fields(namespace = ?cm.namespace(), config_map = %cm.name_any()))]
pub async fn reconcile(cm: Arc<ConfigMap>, ctx: Arc<ConfigMapContext>) -> Result<Action, Error> {
    let Some(namespace) = cm.namespace() else {
        return Ok(Action::await_change());
    };

    match ctx.enforcer.converge(&namespace).await? {
        Convergence::Skipped => ctx.backoff.forget_namespace(&namespace),
        _ => ctx.backoff.reset(&key(&cm)),
    }
    Ok(Action::await_change())
}

/// Requeue failed ConfigMaps with per-object exponential backoff
pub fn error_policy(cm: Arc<ConfigMap>, error: &Error, ctx: Arc<ConfigMapContext>) -> Action {
    let key = key(&cm);
    let delay = ctx.backoff.next_delay(&key);
    warn!(
        config_map = %key,
        error = %error,
        retry_in_secs = delay.as_secs(),
        "config map reconciliation failed"
    );
    Action::requeue(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::enforcer::testing::{FakeConfigMaps, StaticBundle};
    use crate::controller::enforcer::{ISTIO_CONFIG_LABEL, ROOT_CERT_KEY};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    const CM: &str = "istio-ca-root-cert";
    const ROOT: &str = "-----BEGIN CERTIFICATE-----\nROOT\n-----END CERTIFICATE-----\n";

    fn context(store: &FakeConfigMaps) -> Arc<ConfigMapContext> {
        Arc::new(ConfigMapContext::new(Arc::new(TrustBundleEnforcer::new(
            Arc::new(store.client()),
            Arc::new(StaticBundle(ROOT.as_bytes().to_vec())),
            CM,
        ))))
    }

    fn event(namespace: &str) -> Arc<ConfigMap> {
        Arc::new(ConfigMap {
            metadata: ObjectMeta {
                name: Some(CM.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn tampered_config_map_is_restored() {
        let store = FakeConfigMaps::new();
        store.insert(
            "sandbox",
            ConfigMap {
                metadata: ObjectMeta {
                    name: Some(CM.into()),
                    namespace: Some("sandbox".into()),
                    labels: Some(BTreeMap::from([(ISTIO_CONFIG_LABEL.into(), "true".into())])),
                    ..Default::default()
                },
                data: Some(BTreeMap::from([(ROOT_CERT_KEY.into(), "tampered".into())])),
                ..Default::default()
            },
        );

        reconcile(event("sandbox"), context(&store)).await.unwrap();

        let cm = store.get("sandbox", CM).unwrap();
        assert_eq!(cm.data.unwrap()[ROOT_CERT_KEY], ROOT);
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn deleted_config_map_is_recreated() {
        let store = FakeConfigMaps::new();
        let ctx = context(&store);

        reconcile(event("sandbox"), ctx.clone()).await.unwrap();
        store.remove("sandbox", CM);
        assert!(store.get("sandbox", CM).is_none());

        reconcile(event("sandbox"), ctx).await.unwrap();
        let cm = store.get("sandbox", CM).unwrap();
        assert_eq!(cm.data.unwrap()[ROOT_CERT_KEY], ROOT);
        assert_eq!(store.writes(), 2);
    }

    #[tokio::test]
    async fn correct_config_map_is_left_alone() {
        let store = FakeConfigMaps::new();
        let ctx = context(&store);

        reconcile(event("sandbox"), ctx.clone()).await.unwrap();
        reconcile(event("sandbox"), ctx).await.unwrap();
        assert_eq!(store.writes(), 1);
    }
}
