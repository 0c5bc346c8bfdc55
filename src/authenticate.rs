//! Caller authentication
//!
//! The [`Authenticator`] trait is the seam between the signing endpoint and
//! whatever proves a caller's identity. The production implementation,
//! [`KubeJwtAuthenticator`], validates the workload's ServiceAccount token
//! with the Kubernetes TokenReview API and maps the ServiceAccount to its
//! SPIFFE identity.

use std::net::SocketAddr;

use async_trait::async_trait;
use k8s_openapi::api::authentication::v1::{TokenReview, TokenReviewSpec, TokenReviewStatus};
use kube::api::PostParams;
use kube::{Api, Client};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::identity::{spiffe_id, Caller};
use crate::Error;

/// Authenticator type tag for ServiceAccount token authentication
pub const KUBE_JWT_AUTHENTICATOR: &str = "KubeJWTAuthenticator";

const BEARER_PREFIX: &str = "Bearer ";
const SERVICE_ACCOUNT_PREFIX: &str = "system:serviceaccount:";

/// What the authenticator gets to see about an inbound request
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    /// Bearer token from the `authorization` header, without the scheme
    pub bearer_token: Option<String>,
    /// Remote address of the caller, if known
    pub peer: Option<SocketAddr>,
}

impl RequestContext {
    /// Build a context from gRPC request metadata
    pub fn from_metadata(metadata: &tonic::metadata::MetadataMap, peer: Option<SocketAddr>) -> Self {
        let bearer_token = metadata
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix(BEARER_PREFIX))
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        Self { bearer_token, peer }
    }
}

/// Proves the identity of the caller of a signing request
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Authenticate the caller, returning its proven identities
    async fn authenticate(&self, ctx: &RequestContext) -> Result<Caller, Error>;

    /// Short name of this authenticator, used in logs
    fn authenticator_type(&self) -> &str;
}

/// ServiceAccount token authenticator backed by the TokenReview API
pub struct KubeJwtAuthenticator {
    client: Client,
    trust_domain: String,
    audiences: Vec<String>,
}

impl KubeJwtAuthenticator {
    /// Create an authenticator for the given trust domain and token audiences
    pub fn new(client: Client, trust_domain: impl Into<String>, audiences: Vec<String>) -> Self {
        Self {
            client,
            trust_domain: trust_domain.into(),
            audiences,
        }
    }
}

#[async_trait]
impl Authenticator for KubeJwtAuthenticator {
    async fn authenticate(&self, ctx: &RequestContext) -> Result<Caller, Error> {
        let token = ctx
            .bearer_token
            .as_deref()
            .ok_or_else(|| Error::Unauthenticated("no bearer token in request".into()))?;

        let api: Api<TokenReview> = Api::all(self.client.clone());
        let review = TokenReview {
            metadata: Default::default(),
            spec: TokenReviewSpec {
                token: Some(token.to_string()),
                audiences: (!self.audiences.is_empty()).then(|| self.audiences.clone()),
            },
            status: None,
        };

        let result = api.create(&PostParams::default(), &review).await?;
        let status = result
            .status
            .ok_or_else(|| Error::Unauthenticated("TokenReview returned no status".into()))?;

        let identity = identity_from_review(&status, &self.trust_domain)?;
        debug!(identity = %identity, peer = ?ctx.peer, "token review succeeded");

        Ok(Caller::new(vec![identity], KUBE_JWT_AUTHENTICATOR))
    }

    fn authenticator_type(&self) -> &str {
        KUBE_JWT_AUTHENTICATOR
    }
}

/// Extract the SPIFFE identity from a TokenReview status
fn identity_from_review(status: &TokenReviewStatus, trust_domain: &str) -> Result<String, Error> {
    if !status.authenticated.unwrap_or(false) {
        let reason = status.error.as_deref().unwrap_or("token authentication failed");
        return Err(Error::Unauthenticated(reason.to_string()));
    }

    let username = status
        .user
        .as_ref()
        .and_then(|u| u.username.as_deref())
        .ok_or_else(|| Error::Unauthenticated("TokenReview returned no username".into()))?;

    let (namespace, service_account) = parse_service_account(username).ok_or_else(|| {
        Error::Unauthenticated(format!("{username} is not a ServiceAccount"))
    })?;

    Ok(spiffe_id(trust_domain, namespace, service_account))
}

/// Split `system:serviceaccount:<namespace>:<name>` into its parts
fn parse_service_account(username: &str) -> Option<(&str, &str)> {
    let rest = username.strip_prefix(SERVICE_ACCOUNT_PREFIX)?;
    let (namespace, name) = rest.split_once(':')?;
    if namespace.is_empty() || name.is_empty() || name.contains(':') {
        return None;
    }
    Some((namespace, name))
}
