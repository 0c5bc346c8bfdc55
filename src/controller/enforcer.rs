//! Trust bundle ConfigMap convergence
//!
//! Both reconcilers share one [`TrustBundleEnforcer`]. Convergence is
//! idempotent: it writes only when the root certificate entry or the mesh
//! config label differs from what is desired, and never touches other keys.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::trust_bundle::TrustBundleSource;
use crate::Error;

/// Data key holding the PEM root certificate
pub const ROOT_CERT_KEY: &str = "root-cert.pem";

/// Label marking the ConfigMap as mesh configuration
pub const ISTIO_CONFIG_LABEL: &str = "istio.io/config";

/// Value of [`ISTIO_CONFIG_LABEL`]
pub const ISTIO_CONFIG_LABEL_VALUE: &str = "true";

/// ConfigMap operations used by the enforcer
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigMapClient: Send + Sync {
    /// Fetch a ConfigMap, `None` if it does not exist
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, Error>;

    /// Create a ConfigMap
    async fn create(&self, namespace: &str, config_map: &ConfigMap) -> Result<(), Error>;

    /// Replace a ConfigMap; the resourceVersion guards against lost updates
    async fn replace(&self, namespace: &str, config_map: &ConfigMap) -> Result<(), Error>;
}

/// [`ConfigMapClient`] backed by the Kubernetes API
pub struct KubeConfigMapClient {
    client: Client,
}

impl KubeConfigMapClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConfigMapClient for KubeConfigMapClient {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>, Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create(&self, namespace: &str, config_map: &ConfigMap) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), config_map).await?;
        Ok(())
    }

    async fn replace(&self, namespace: &str, config_map: &ConfigMap) -> Result<(), Error> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        let name = config_map
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::internal("ConfigMap has no name"))?;
        api.replace(name, &PostParams::default(), config_map).await?;
        Ok(())
    }
}

/// What a convergence pass did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Convergence {
    /// The ConfigMap did not exist and was created
    Created,
    /// The ConfigMap existed and was updated
    Updated,
    /// The ConfigMap was already correct
    Unchanged,
    /// The namespace is gone or going away
    Skipped,
}

/// Keeps the trust bundle ConfigMap correct in a namespace
pub struct TrustBundleEnforcer {
    client: Arc<dyn ConfigMapClient>,
    bundle: Arc<dyn TrustBundleSource>,
    config_map_name: String,
}

impl TrustBundleEnforcer {
    /// Create an enforcer for the ConfigMap named `config_map_name`
    pub fn new(
        client: Arc<dyn ConfigMapClient>,
        bundle: Arc<dyn TrustBundleSource>,
        config_map_name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            bundle,
            config_map_name: config_map_name.into(),
        }
    }

    /// Name of the managed ConfigMap
    pub fn config_map_name(&self) -> &str {
        &self.config_map_name
    }

    /// Bring the ConfigMap in `namespace` to the desired state
    pub async fn converge(&self, namespace: &str) -> Result<Convergence, Error> {
        let root = self.bundle.root_ca_pem();
        if root.is_empty() {
            return Err(Error::TrustBundleUnavailable);
        }
        let root = String::from_utf8(root)
            .map_err(|_| Error::internal("root CA is not valid UTF-8"))?;

        let existing = self.client.get(namespace, &self.config_map_name).await?;

        let result = match existing {
            None => {
                let config_map = self.desired(namespace, root.clone());
                match self.client.create(namespace, &config_map).await {
                    Err(e) if e.is_already_exists() => {
                        debug!(namespace = %namespace, "config map created concurrently, re-reading");
                        self.update_current(namespace, root).await
                    }
                    other => other.map(|()| Convergence::Created),
                }
            }
            Some(config_map) => self.update(namespace, config_map, root).await,
        };

        match result {
            Ok(Convergence::Unchanged) => Ok(Convergence::Unchanged),
            Ok(outcome) => {
                info!(
                    namespace = %namespace,
                    config_map = %self.config_map_name,
                    ?outcome,
                    "trust bundle converged"
                );
                Ok(outcome)
            }
            Err(e) if e.is_not_found() || e.is_namespace_terminating() => {
                debug!(namespace = %namespace, error = %e, "namespace gone, skipping trust bundle");
                Ok(Convergence::Skipped)
            }
            Err(e) => Err(e),
        }
    }

    /// Converge the object another writer just created
    async fn update_current(&self, namespace: &str, root: String) -> Result<Convergence, Error> {
        match self.client.get(namespace, &self.config_map_name).await? {
            Some(config_map) => self.update(namespace, config_map, root).await,
            None => Err(Error::internal(format!(
                "config map {} disappeared after a concurrent create",
                self.config_map_name
            ))),
        }
    }

    async fn update(
        &self,
        namespace: &str,
        mut config_map: ConfigMap,
        root: String,
    ) -> Result<Convergence, Error> {
        if !apply_desired(&mut config_map, root) {
            return Ok(Convergence::Unchanged);
        }
        self.client
            .replace(namespace, &config_map)
            .await
            .map(|()| Convergence::Updated)
    }

    fn desired(&self, namespace: &str, root: String) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.config_map_name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    ISTIO_CONFIG_LABEL.to_string(),
                    ISTIO_CONFIG_LABEL_VALUE.to_string(),
                )])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([(ROOT_CERT_KEY.to_string(), root)])),
            ..Default::default()
        }
    }
}

/// Merge the desired entry and label into `config_map`, returning true if
/// anything changed. Absent maps count as empty and are allocated on write.
fn apply_desired(config_map: &mut ConfigMap, root: String) -> bool {
    let mut changed = false;

    let current = config_map.data.as_ref().and_then(|d| d.get(ROOT_CERT_KEY));
    if current != Some(&root) {
        config_map
            .data
            .get_or_insert_with(BTreeMap::new)
            .insert(ROOT_CERT_KEY.to_string(), root);
        changed = true;
    }

    let label = config_map
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(ISTIO_CONFIG_LABEL));
    if label.map(String::as_str) != Some(ISTIO_CONFIG_LABEL_VALUE) {
        config_map
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(
                ISTIO_CONFIG_LABEL.to_string(),
                ISTIO_CONFIG_LABEL_VALUE.to_string(),
            );
        changed = true;
    }

    changed
}
