//! cert-manager integration
//!
//! Signing is delegated to cert-manager: each workload CSR becomes a
//! `CertificateRequest` in a single namespace, and the [`Signer`] waits for
//! cert-manager to sign or reject it.

mod client;
mod resource;
mod signer;

pub use client::{CertificateRequestClient, KubeCertificateRequestClient};
#[cfg(test)]
pub use client::MockCertificateRequestClient;
pub use resource::{
    CertificateRequest, CertificateRequestCondition, CertificateRequestSpec,
    CertificateRequestStatus, IssuerRef, RequestOutcome, GENERATE_NAME_PREFIX,
    IDENTITIES_ANNOTATION, WORKLOAD_USAGES,
};
pub use signer::{clamp_duration, IssuedCertificate, Signer, SignerConfig};

#[cfg(test)]
pub(crate) use resource::testing;
