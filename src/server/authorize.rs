//! Request authorization
//!
//! A signing request is only accepted when the identities it asks for are
//! exactly the identities the caller proved. Identity may only be requested
//! through URI SANs; a request carrying DNS names, IPs, emails, other SAN
//! types or a common name is refused even if its URIs match.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::authenticate::{Authenticator, RequestContext};
use crate::csr::parse_csr_pem;
use crate::identity::{identities_match, Caller};
use crate::Error;

/// Authorizes signing requests against the authenticated caller
#[derive(Clone)]
pub struct Authorizer {
    authenticator: Arc<dyn Authenticator>,
}

impl Authorizer {
    /// Create an authorizer backed by the given authenticator
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self { authenticator }
    }

    /// Authenticate the caller and check the CSR against its identities
    ///
    /// Returns [`Error::Unauthenticated`] without looking at the CSR when
    /// authentication fails or proves no identities. Every other rejection
    /// is [`Error::PermissionDenied`] carrying the caller's identities.
    pub async fn authorize(&self, ctx: &RequestContext, csr: &[u8]) -> Result<Caller, Error> {
        let caller = match self.authenticator.authenticate(ctx).await {
            Ok(caller) => caller,
            Err(e) => {
                warn!(
                    authenticator = %self.authenticator.authenticator_type(),
                    error = %e,
                    "failed to authenticate request"
                );
                return Err(unauthenticated(e));
            }
        };

        if caller.identities.is_empty() {
            warn!(
                authenticator = %caller.authenticator_type,
                "authenticator returned no identities"
            );
            return Err(Error::Unauthenticated("no identities".into()));
        }

        let identities = caller.identities_csv();

        let claims = parse_csr_pem(csr).map_err(|e| {
            warn!(identities = %identities, error = %e, "failed to decode certificate request");
            Error::permission_denied(&identities, e.to_string())
        })?;

        let disallowed = claims.disallowed_fields();
        if !disallowed.is_empty() {
            let reason = format!("forbidden fields in request: {}", disallowed.join(", "));
            warn!(identities = %identities, reason = %reason, "denying certificate request");
            return Err(Error::permission_denied(identities, reason));
        }

        if !identities_match(&claims.uris, &caller.identities) {
            let reason = format!(
                "requested identities [{}] do not match authenticated identities",
                claims.uris.join(",")
            );
            warn!(identities = %identities, reason = %reason, "denying certificate request");
            return Err(Error::permission_denied(identities, reason));
        }

        debug!(identities = %identities, "certificate request authorized");
        Ok(caller)
    }
}

fn unauthenticated(err: Error) -> Error {
    match err {
        Error::Unauthenticated(_) => err,
        other => Error::Unauthenticated(other.to_string()),
    }
}
