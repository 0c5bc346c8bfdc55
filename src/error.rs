//! Error types for the certificate signing bridge
//!
//! Errors fall into the categories callers care about: authentication and
//! authorization failures are terminal for a signing request, issuance
//! failures come from the external signer, and Kubernetes errors during
//! reconciliation are retried by the controller.

use std::time::Duration;

use thiserror::Error;

/// Main error type for istio-csr operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The caller could not be authenticated
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// The caller is authenticated but the request does not match its identity
    #[error("permission denied for [{identities}]: {reason}")]
    PermissionDenied {
        /// Comma separated identities proven by the authenticator
        identities: String,
        /// Why the request was rejected
        reason: String,
    },

    /// The CertificateRequest failed or was rejected by the signer
    #[error("issuance of {name} failed: {message}")]
    Issuance {
        /// Name of the CertificateRequest
        name: String,
        /// Description of what failed
        message: String,
    },

    /// The CertificateRequest did not become ready in time
    #[error("timed out after {after:?} waiting for {name} to become ready")]
    Timeout {
        /// Name of the CertificateRequest
        name: String,
        /// How long we waited
        after: Duration,
    },

    /// The inbound request went away before issuance finished
    #[error("request cancelled")]
    Cancelled,

    /// No root CA content is available yet
    #[error("trust bundle is not available yet")]
    TrustBundleUnavailable,

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an issuance error for the named CertificateRequest
    pub fn issuance(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Issuance {
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a permission denied error
    pub fn permission_denied(identities: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            identities: identities.into(),
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// True if this is a 404 from the API server
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 404)
    }

    /// True if a create lost to an object that already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(ae)) if ae.code == 409 && ae.reason == "AlreadyExists")
    }

    /// True if the API server refused a write because the namespace is going away
    pub fn is_namespace_terminating(&self) -> bool {
        match self {
            Error::Kube(kube::Error::Api(ae)) => {
                ae.code == 403 && ae.message.contains("being terminated")
            }
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Caller-facing failures (authn, authz, issuance, cancellation) are
    /// terminal. Kubernetes errors are retried unless they are 4xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(source) => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Unauthenticated(_) => false,
            Error::PermissionDenied { .. } => false,
            Error::Issuance { .. } => false,
            Error::Timeout { .. } => false,
            Error::Cancelled => false,
            Error::TrustBundleUnavailable => true,
            Error::Config(_) => false,
            Error::Internal(_) => true,
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match err {
            Error::Unauthenticated(_) => tonic::Status::unauthenticated("request authenticate failure"),
            Error::PermissionDenied { .. } => {
                tonic::Status::permission_denied("request authorize failure")
            }
            Error::Timeout { .. } => {
                tonic::Status::deadline_exceeded("timed out waiting for certificate")
            }
            Error::Cancelled => tonic::Status::cancelled("request cancelled"),
            _ => tonic::Status::internal("failed to sign certificate request"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, message: &str) -> Error {
        Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: String::new(),
            code,
        }))
    }

    #[test]
    fn not_found_is_detected() {
        assert!(api_error(404, "configmaps \"x\" not found").is_not_found());
        assert!(!api_error(409, "conflict").is_not_found());
        assert!(!Error::internal("boom").is_not_found());
    }

    #[test]
    fn already_exists_is_not_a_write_conflict() {
        let exists = Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "configmaps \"istio-ca-root-cert\" already exists".to_string(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        }));
        assert!(exists.is_already_exists());
        assert!(!api_error(409, "the object has been modified").is_already_exists());
    }

    #[test]
    fn terminating_namespace_is_detected() {
        let err = api_error(
            403,
            "configmaps \"istio-ca-root-cert\" is forbidden: unable to create new content in \
             namespace foo because it is being terminated",
        );
        assert!(err.is_namespace_terminating());
        assert!(!api_error(403, "forbidden by RBAC").is_namespace_terminating());
    }

    #[test]
    fn caller_facing_errors_are_terminal() {
        assert!(!Error::Unauthenticated("no token".into()).is_retryable());
        assert!(!Error::permission_denied("spiffe://a", "mismatch").is_retryable());
        assert!(!Error::issuance("istio-csr-abc", "denied").is_retryable());
        assert!(!Error::Cancelled.is_retryable());
    }

    #[test]
    fn kube_errors_retry_unless_client_error() {
        assert!(api_error(500, "etcd unavailable").is_retryable());
        assert!(api_error(409, "the object has been modified").is_retryable());
        assert!(!api_error(422, "invalid").is_retryable());
        assert!(Error::TrustBundleUnavailable.is_retryable());
    }

    #[test]
    fn grpc_status_mapping() {
        let status: tonic::Status = Error::Unauthenticated("x".into()).into();
        assert_eq!(status.code(), tonic::Code::Unauthenticated);

        let status: tonic::Status = Error::permission_denied("spiffe://a", "x").into();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);

        let status: tonic::Status = Error::Timeout {
            name: "istio-csr-abc".into(),
            after: Duration::from_secs(30),
        }
        .into();
        assert_eq!(status.code(), tonic::Code::DeadlineExceeded);

        // Issuance details never leak to the caller
        let status: tonic::Status = Error::issuance("istio-csr-abc", "issuer secret missing").into();
        assert_eq!(status.code(), tonic::Code::Internal);
        assert!(!status.message().contains("secret"));
    }
}
