//! istio-csr - workload certificate signing bridge between the mesh CA API and cert-manager
//!
//! Workloads send a CSR over the mesh CA gRPC API. The bridge authenticates
//! the caller, checks that the CSR asks for exactly the caller's identities
//! and has cert-manager sign it through a CertificateRequest. Alongside,
//! controllers keep the root CA ConfigMap present and correct in every
//! namespace.
//!
//! # Modules
//!
//! - [`identity`] - Identity matching and authenticated callers
//! - [`authenticate`] - Caller authentication (ServiceAccount tokens)
//! - [`csr`] - CSR decoding and verification
//! - [`server`] - gRPC endpoint and request authorization
//! - [`serving`] - TLS serving certificate obtained from the issuer
//! - [`certmanager`] - CertificateRequest resource, store and signer
//! - [`trust_bundle`] - Shared root CA content
//! - [`controller`] - Trust bundle ConfigMap controllers
//! - [`leader_election`] - Lease-based leader election for the controllers
//! - [`config`] - Command line configuration
//! - [`telemetry`] - Logging initialization
//! - [`readiness`] - Readiness endpoint
//! - [`retry`] - Retry with backoff
//! - [`proto`] - gRPC protocol definitions
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod authenticate;
pub mod certmanager;
pub mod config;
pub mod controller;
pub mod csr;
pub mod error;
pub mod identity;
pub mod leader_election;
pub mod proto;
pub mod readiness;
pub mod retry;
pub mod server;
pub mod serving;
pub mod telemetry;
pub mod trust_bundle;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Grace period for in-flight work after a shutdown signal
pub const SHUTDOWN_GRACE_PERIOD: std::time::Duration = std::time::Duration::from_secs(10);
