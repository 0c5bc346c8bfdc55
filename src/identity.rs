//! Workload identities
//!
//! Identities are SPIFFE-style URIs (`spiffe://<trust-domain>/ns/<ns>/sa/<sa>`).
//! Two collections of identities are compared as sets: order and duplicates
//! never matter.

use std::collections::BTreeSet;
use std::fmt;

/// Returns true if both collections contain exactly the same identities
///
/// Duplicates and ordering are ignored. Two empty collections match; a
/// subset or superset on either side does not.
pub fn identities_match<A, B>(claimed: &[A], proven: &[B]) -> bool
where
    A: AsRef<str>,
    B: AsRef<str>,
{
    let claimed: BTreeSet<&str> = claimed.iter().map(AsRef::as_ref).collect();
    let proven: BTreeSet<&str> = proven.iter().map(AsRef::as_ref).collect();
    claimed == proven
}

/// The authenticated caller of a signing request
///
/// Created per inbound request by an [`Authenticator`](crate::authenticate::Authenticator)
/// and dropped when the request completes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Caller {
    /// Identities proven by the authenticator, in the order it returned them
    pub identities: Vec<String>,
    /// Which authenticator produced this caller
    pub authenticator_type: String,
}

impl Caller {
    /// Create a caller from proven identities
    pub fn new(identities: Vec<String>, authenticator_type: impl Into<String>) -> Self {
        Self {
            identities,
            authenticator_type: authenticator_type.into(),
        }
    }

    /// Identities joined with commas, in authenticator order
    ///
    /// Used for logs and audit annotations, so it is produced whether or
    /// not the request is later authorized.
    pub fn identities_csv(&self) -> String {
        self.identities.join(",")
    }
}

impl fmt::Display for Caller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.identities_csv(), self.authenticator_type)
    }
}

/// Build the SPIFFE identity for a Kubernetes ServiceAccount
pub fn spiffe_id(trust_domain: &str, namespace: &str, service_account: &str) -> String {
    format!("spiffe://{trust_domain}/ns/{namespace}/sa/{service_account}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const NONE: &[&str] = &[];

    #[test]
    fn identities_match_table() {
        let cases: &[(&str, &[&str], &[&str], bool)] = &[
            ("both empty", NONE, NONE, true),
            ("claimed only", &["spiffee://foo.bar"], NONE, false),
            ("proven only", NONE, &["spiffe://foo.bar"], false),
            ("same single", &["spiffe://foo.bar"], &["spiffe://foo.bar"], true),
            ("different single", &["spiffe://123.456"], &["spiffe://foo.bar"], false),
            (
                "same pair",
                &["spiffe://123.456", "spiffe://foo.bar"],
                &["spiffe://123.456", "spiffe://foo.bar"],
                true,
            ),
            (
                "same pair reordered",
                &["spiffe://123.456", "spiffe://foo.bar"],
                &["spiffe://foo.bar", "spiffe://123.456"],
                true,
            ),
            (
                "one different",
                &["spiffe://123.456", "spiffe://foo.bar"],
                &["spiffe://123.456", "spiffe://bar.foo"],
                false,
            ),
            (
                "subset",
                &["spiffe://foo.bar"],
                &["spiffe://123.456", "spiffe://foo.bar"],
                false,
            ),
        ];

        for (name, claimed, proven, expected) in cases {
            assert_eq!(
                identities_match(*claimed, *proven),
                *expected,
                "case {name:?}: {claimed:?} vs {proven:?}"
            );
        }
    }

    #[test]
    fn identities_match_is_symmetric() {
        let sets: &[&[&str]] = &[
            NONE,
            &["spiffe://a"],
            &["spiffe://a", "spiffe://b"],
            &["spiffe://b", "spiffe://a", "spiffe://a"],
            &["spiffe://c"],
        ];
        for a in sets {
            for b in sets {
                assert_eq!(
                    identities_match(*a, *b),
                    identities_match(*b, *a),
                    "{a:?} {b:?}"
                );
            }
        }
    }

    #[test]
    fn duplicates_are_ignored() {
        assert!(identities_match(
            &["spiffe://a", "spiffe://a", "spiffe://b"],
            &["spiffe://b", "spiffe://a"]
        ));
    }

    #[test]
    fn caller_csv_keeps_authenticator_order() {
        let caller = Caller::new(
            vec!["spiffe://foo".to_string(), "spiffe://bar".to_string()],
            "mock",
        );
        assert_eq!(caller.identities_csv(), "spiffe://foo,spiffe://bar");
        assert_eq!(caller.to_string(), "spiffe://foo,spiffe://bar (mock)");
    }

    #[test]
    fn spiffe_id_format() {
        assert_eq!(
            spiffe_id("cluster.local", "sandbox", "sleep"),
            "spiffe://cluster.local/ns/sandbox/sa/sleep"
        );
    }
}
