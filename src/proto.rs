//! gRPC contract for the mesh certificate service
//!
//! Sidecars call `IstioCertificateService/CreateCertificate` with a PEM CSR
//! and a bearer token, and get back a PEM chain ordered leaf to root.

#![allow(missing_docs)] // Generated code doesn't have docs
#![allow(clippy::doc_overindented_list_items)] // Generated proto docs have formatting issues

/// Generated protobuf and gRPC code for the certificate service
pub mod istio {
    /// Version 1 of the mesh auth API
    pub mod v1 {
        /// Certificate signing service
        pub mod auth {
            tonic::include_proto!("istio.v1.auth");
        }
    }
}

pub use istio::v1::auth::*;
