//! Namespace reconciler
//!
//! Every live namespace gets the trust bundle ConfigMap. The namespace is
//! re-read on each pass so stale cache entries for deleted or terminating
//! namespaces are ignored.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, instrument, warn};

#[cfg(test)]
use mockall::automock;

use super::enforcer::TrustBundleEnforcer;
use super::RequeueBackoff;
use crate::Error;

const TERMINATING_PHASE: &str = "Terminating";

/// Namespace lookups used by the reconciler
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NamespaceClient: Send + Sync {
    /// Fetch a namespace, `None` if it does not exist
    async fn get(&self, name: &str) -> Result<Option<Namespace>, Error>;
}

/// [`NamespaceClient`] backed by the Kubernetes API
pub struct KubeNamespaceClient {
    client: Client,
}

impl KubeNamespaceClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NamespaceClient for KubeNamespaceClient {
    async fn get(&self, name: &str) -> Result<Option<Namespace>, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }
}

/// Shared state for the namespace reconciler
pub struct NamespaceContext {
    namespaces: Arc<dyn NamespaceClient>,
    enforcer: Arc<TrustBundleEnforcer>,
    backoff: RequeueBackoff,
}

impl NamespaceContext {
    /// Create a context
    pub fn new(namespaces: Arc<dyn NamespaceClient>, enforcer: Arc<TrustBundleEnforcer>) -> Self {
        Self {
            namespaces,
            enforcer,
            backoff: RequeueBackoff::default(),
        }
    }

    /// Use a backoff shared with the ConfigMap reconciler
    pub fn with_backoff(mut self, backoff: RequeueBackoff) -> Self {
        self.backoff = backoff;
        self
    }
}

fn is_terminating(ns: &Namespace) -> bool {
    ns.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == TERMINATING_PHASE)
}

/// Ensure the trust bundle ConfigMap exists in a live namespace
#[instrument(skip_all, fields(namespace = %ns.name_any()))]
pub async fn reconcile(ns: Arc<Namespace>, ctx: Arc<NamespaceContext>) -> Result<Action, Error> {
    let name = ns.name_any();

    let Some(current) = ctx.namespaces.get(&name).await? else {
        debug!("namespace doesn't exist, ignoring");
        ctx.backoff.forget_namespace(&name);
        return Ok(Action::await_change());
    };

    if is_terminating(&current) {
        debug!("namespace is terminating, ignoring");
        ctx.backoff.forget_namespace(&name);
        return Ok(Action::await_change());
    }

    ctx.enforcer.converge(&name).await?;
    ctx.backoff.reset(&name);
    Ok(Action::await_change())
}

/// Requeue failed namespaces with per-namespace exponential backoff
pub fn error_policy(ns: Arc<Namespace>, error: &Error, ctx: Arc<NamespaceContext>) -> Action {
    let name = ns.name_any();
    let delay = ctx.backoff.next_delay(&name);
    warn!(
        namespace = %name,
        error = %error,
        retry_in_secs = delay.as_secs(),
        "namespace reconciliation failed"
    );
    Action::requeue(delay)
}
