//! CertificateRequest store
//!
//! All signing requests live in a single namespace, so the client is bound
//! to that namespace at construction.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use kube::api::{DeleteParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client};

#[cfg(test)]
use mockall::automock;

use super::resource::CertificateRequest;
use crate::Error;

/// Operations on CertificateRequests needed to drive issuance
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CertificateRequestClient: Send + Sync {
    /// Create a request, returning it with its generated name filled in
    async fn create(&self, request: &CertificateRequest) -> Result<CertificateRequest, Error>;

    /// Fetch a request by name, `None` if it does not exist
    async fn get(&self, name: &str) -> Result<Option<CertificateRequest>, Error>;

    /// Delete a request by name; deleting a missing request succeeds
    async fn delete(&self, name: &str) -> Result<(), Error>;

    /// Stream every observed version of the named request
    fn watch(&self, name: &str) -> BoxStream<'static, Result<CertificateRequest, Error>>;
}

/// [`CertificateRequestClient`] backed by the Kubernetes API
pub struct KubeCertificateRequestClient {
    api: Api<CertificateRequest>,
}

impl KubeCertificateRequestClient {
    /// Create a client for requests in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl CertificateRequestClient for KubeCertificateRequestClient {
    async fn create(&self, request: &CertificateRequest) -> Result<CertificateRequest, Error> {
        Ok(self.api.create(&PostParams::default(), request).await?)
    }

    async fn get(&self, name: &str) -> Result<Option<CertificateRequest>, Error> {
        Ok(self.api.get_opt(name).await?)
    }

    async fn delete(&self, name: &str) -> Result<(), Error> {
        match self.api.delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn watch(&self, name: &str) -> BoxStream<'static, Result<CertificateRequest, Error>> {
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        watcher(self.api.clone(), config)
            .applied_objects()
            .map_err(|e| Error::internal(format!("watching certificate request: {e}")))
            .boxed()
    }
}
