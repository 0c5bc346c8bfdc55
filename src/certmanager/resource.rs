//! cert-manager CertificateRequest resource
//!
//! Only the fields this bridge reads or writes are modelled. The schema is
//! owned by cert-manager, so no CRD is generated from these types.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

/// Annotation carrying the caller's comma separated identities
pub const IDENTITIES_ANNOTATION: &str = "istio.cert-manager.io/identities";

/// Prefix for generated CertificateRequest names
pub const GENERATE_NAME_PREFIX: &str = "istio-csr-";

/// Key usages requested for workload certificates
pub const WORKLOAD_USAGES: &[&str] = &["client auth", "server auth"];

/// Spec of a cert-manager CertificateRequest
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, PartialEq)]
#[kube(
    group = "cert-manager.io",
    version = "v1",
    kind = "CertificateRequest",
    plural = "certificaterequests",
    namespaced,
    status = "CertificateRequestStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestSpec {
    /// PEM encoded PKCS#10 request
    pub request: ByteString,

    /// Issuer that should sign the request
    pub issuer_ref: IssuerRef,

    /// Requested certificate lifetime, e.g. `3600s`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    /// Requested key usages
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usages: Vec<String>,

    /// Whether a CA certificate is requested
    #[serde(default, rename = "isCA")]
    pub is_ca: bool,
}

/// Reference to a cert-manager issuer
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct IssuerRef {
    /// Issuer name
    pub name: String,
    /// Issuer kind, `Issuer` or `ClusterIssuer` for built-in issuers
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    /// API group of the issuer
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group: String,
}

/// Status of a CertificateRequest, written by cert-manager
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestStatus {
    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<CertificateRequestCondition>,

    /// Signed certificate chain, leaf first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<ByteString>,

    /// Certificate of the signing CA
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<ByteString>,

    /// Set when the request failed permanently
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_time: Option<String>,
}

/// A single status condition
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct CertificateRequestCondition {
    /// Condition type (`Ready`, `Approved`, `Denied`, `InvalidRequest`)
    #[serde(rename = "type")]
    pub type_: String,
    /// `True`, `False` or `Unknown`
    pub status: String,
    /// Machine readable reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Human readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Where a CertificateRequest is in its lifecycle
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Still being processed
    Pending,
    /// Signed
    Ready {
        /// PEM chain, leaf first
        certificate: Vec<u8>,
        /// PEM CA certificate, if cert-manager reported one
        ca: Option<Vec<u8>>,
    },
    /// Terminally failed
    Failed(String),
}

impl CertificateRequest {
    /// Build a request for a workload certificate
    pub fn for_workload(
        namespace: &str,
        csr: &[u8],
        issuer_ref: &IssuerRef,
        duration: Duration,
        identities: &str,
    ) -> Self {
        Self {
            metadata: ObjectMeta {
                generate_name: Some(GENERATE_NAME_PREFIX.to_string()),
                namespace: Some(namespace.to_string()),
                annotations: Some(BTreeMap::from([(
                    IDENTITIES_ANNOTATION.to_string(),
                    identities.to_string(),
                )])),
                ..Default::default()
            },
            spec: CertificateRequestSpec {
                request: ByteString(csr.to_vec()),
                issuer_ref: issuer_ref.clone(),
                duration: Some(format!("{}s", duration.as_secs())),
                usages: WORKLOAD_USAGES.iter().map(|u| u.to_string()).collect(),
                is_ca: false,
            },
            status: None,
        }
    }

    fn condition(&self, type_: &str) -> Option<&CertificateRequestCondition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == type_)
    }

    /// Classify the current status
    pub fn outcome(&self) -> RequestOutcome {
        for type_ in ["Denied", "InvalidRequest"] {
            if let Some(c) = self.condition(type_) {
                if c.status == "True" {
                    return RequestOutcome::Failed(describe(c));
                }
            }
        }

        let ready = self.condition("Ready");
        if let Some(c) = ready {
            let reason = c.reason.as_deref().unwrap_or_default();
            if c.status == "False" && (reason == "Failed" || reason == "Denied") {
                return RequestOutcome::Failed(describe(c));
            }
        }

        let Some(status) = &self.status else {
            return RequestOutcome::Pending;
        };

        if let Some(failed_at) = &status.failure_time {
            return RequestOutcome::Failed(match ready {
                Some(c) => format!("failed at {failed_at}: {}", describe(c)),
                None => format!("failed at {failed_at}"),
            });
        }

        let is_ready = ready.is_some_and(|c| c.status == "True");
        match &status.certificate {
            Some(cert) if is_ready && !cert.0.is_empty() => RequestOutcome::Ready {
                certificate: cert.0.clone(),
                ca: status
                    .ca
                    .as_ref()
                    .filter(|ca| !ca.0.is_empty())
                    .map(|ca| ca.0.clone()),
            },
            _ => RequestOutcome::Pending,
        }
    }
}

fn describe(c: &CertificateRequestCondition) -> String {
    let reason = c.reason.as_deref().unwrap_or("Unknown");
    match c.message.as_deref() {
        Some(msg) if !msg.is_empty() => format!("{}: {reason}: {msg}", c.type_),
        _ => format!("{}: {reason}", c.type_),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn workload_request_shape() {
        let issuer = IssuerRef {
            name: "istio-ca".into(),
            kind: "Issuer".into(),
            group: "cert-manager.io".into(),
        };
        let cr = CertificateRequest::for_workload(
            "istio-system",
            b"-----BEGIN CERTIFICATE REQUEST-----",
            &issuer,
            Duration::from_secs(3600),
            "spiffe://foo,spiffe://bar",
        );

        assert_eq!(cr.metadata.generate_name.as_deref(), Some("istio-csr-"));
        assert_eq!(cr.metadata.namespace.as_deref(), Some("istio-system"));
        assert_eq!(
            cr.metadata.annotations.as_ref().unwrap()[IDENTITIES_ANNOTATION],
            "spiffe://foo,spiffe://bar"
        );
        assert_eq!(cr.spec.duration.as_deref(), Some("3600s"));
        assert_eq!(cr.spec.usages, vec!["client auth", "server auth"]);
        assert!(!cr.spec.is_ca);
        assert_eq!(cr.spec.issuer_ref, issuer);
    }

    #[test]
    fn serializes_in_cert_manager_shape() {
        let cr = with_status("istio-csr-abc", None);
        let json = serde_json::to_value(&cr).unwrap();
        assert_eq!(json["apiVersion"], "cert-manager.io/v1");
        assert_eq!(json["kind"], "CertificateRequest");
        assert_eq!(json["spec"]["issuerRef"]["name"], "istio-ca");
        assert_eq!(json["spec"]["isCA"], false);
        assert_eq!(json["spec"]["duration"], "3600s");
        // request bytes are base64 on the wire
        assert_eq!(json["spec"]["request"], "Y3Ny");
    }

    #[test]
    fn outcome_of_fresh_request_is_pending() {
        assert_eq!(with_status("a", None).outcome(), RequestOutcome::Pending);
        assert_eq!(pending("a").outcome(), RequestOutcome::Pending);
    }

    #[test]
    fn outcome_ready_needs_certificate() {
        let cr = ready("a", "CHAIN", "CA");
        assert_eq!(
            cr.outcome(),
            RequestOutcome::Ready {
                certificate: b"CHAIN".to_vec(),
                ca: Some(b"CA".to_vec())
            }
        );

        // Ready=True without a certificate is not done yet
        let mut cr = ready("a", "", "CA");
        assert_eq!(cr.outcome(), RequestOutcome::Pending);

        cr.status.as_mut().unwrap().certificate = None;
        assert_eq!(cr.outcome(), RequestOutcome::Pending);
    }

    #[test]
    fn outcome_failures() {
        assert!(matches!(failed("a", "Failed").outcome(), RequestOutcome::Failed(_)));
        assert!(matches!(failed("a", "Denied").outcome(), RequestOutcome::Failed(_)));

        let cr = with_status(
            "a",
            Some(CertificateRequestStatus {
                conditions: vec![condition("Denied", "True", "PolicyDenied")],
                ..Default::default()
            }),
        );
        match cr.outcome() {
            RequestOutcome::Failed(msg) => assert_eq!(msg, "Denied: PolicyDenied"),
            other => panic!("expected failure, got {other:?}"),
        }

        let cr = with_status(
            "a",
            Some(CertificateRequestStatus {
                conditions: vec![condition("InvalidRequest", "True", "BadCSR")],
                ..Default::default()
            }),
        );
        assert!(matches!(cr.outcome(), RequestOutcome::Failed(_)));

        let cr = with_status(
            "a",
            Some(CertificateRequestStatus {
                failure_time: Some("2024-01-01T00:00:00Z".into()),
                ..Default::default()
            }),
        );
        assert!(matches!(cr.outcome(), RequestOutcome::Failed(_)));
    }

    #[test]
    fn denied_false_is_not_a_failure() {
        let cr = with_status(
            "a",
            Some(CertificateRequestStatus {
                conditions: vec![
                    condition("Denied", "False", ""),
                    condition("Ready", "False", "Pending"),
                ],
                ..Default::default()
            }),
        );
        assert_eq!(cr.outcome(), RequestOutcome::Pending);
    }
}
