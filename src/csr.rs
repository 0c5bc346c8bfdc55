//! Certificate signing request decoding
//!
//! Workloads send a PEM encoded PKCS#10 request. We verify its self-signature
//! and pull out everything that could carry an identity: SAN entries of every
//! type and the subject common name. The authorizer decides what is allowed.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

const PEM_TAGS: &[&str] = &["CERTIFICATE REQUEST", "NEW CERTIFICATE REQUEST"];

/// Errors decoding a signing request
#[derive(Debug, Error)]
pub enum CsrError {
    /// Payload is not PEM
    #[error("invalid PEM: {0}")]
    Pem(#[from] pem::PemError),

    /// PEM block is not a certificate request
    #[error("unexpected PEM block {0:?}")]
    UnexpectedTag(String),

    /// DER content could not be parsed
    #[error("invalid certificate request: {0}")]
    Der(String),

    /// Self-signature does not verify
    #[error("certificate request signature verification failed: {0}")]
    Signature(String),
}

/// Identity-bearing fields found in a signing request
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CsrClaims {
    /// URI SANs, the only place identities may appear
    pub uris: Vec<String>,
    /// DNS name SANs
    pub dns_names: Vec<String>,
    /// IP address SANs
    pub ip_addresses: Vec<IpAddr>,
    /// Email (rfc822) SANs
    pub emails: Vec<String>,
    /// Any other SAN type (directory names, other names, registered IDs...)
    pub other_names: Vec<String>,
    /// Subject common name, if non-empty
    pub common_name: Option<String>,
}

impl CsrClaims {
    /// Names of populated fields that must not carry identity
    pub fn disallowed_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if !self.dns_names.is_empty() {
            fields.push("dns names");
        }
        if !self.ip_addresses.is_empty() {
            fields.push("ip addresses");
        }
        if !self.emails.is_empty() {
            fields.push("email addresses");
        }
        if !self.other_names.is_empty() {
            fields.push("other subject alternative names");
        }
        if self.common_name.is_some() {
            fields.push("common name");
        }
        fields
    }
}

/// Decode a PEM signing request, verify it and extract its claims
pub fn parse_csr_pem(input: &[u8]) -> Result<CsrClaims, CsrError> {
    let block = pem::parse(input)?;
    if !PEM_TAGS.contains(&block.tag()) {
        return Err(CsrError::UnexpectedTag(block.tag().to_string()));
    }
    parse_csr_der(block.contents())
}

/// Parse a DER signing request, verify it and extract its claims
pub fn parse_csr_der(der: &[u8]) -> Result<CsrClaims, CsrError> {
    let (_, csr) =
        X509CertificationRequest::from_der(der).map_err(|e| CsrError::Der(e.to_string()))?;

    csr.verify_signature()
        .map_err(|e| CsrError::Signature(e.to_string()))?;

    let mut claims = CsrClaims::default();

    for attr in csr.certification_request_info.subject.iter_common_name() {
        let cn = attr
            .as_str()
            .map_err(|e| CsrError::Der(format!("common name: {e}")))?;
        if !cn.is_empty() {
            claims.common_name = Some(cn.to_string());
        }
    }

    if let Some(extensions) = csr.requested_extensions() {
        for ext in extensions {
            match ext {
                ParsedExtension::SubjectAlternativeName(san) => {
                    for name in &san.general_names {
                        collect_general_name(name, &mut claims)?;
                    }
                }
                ParsedExtension::ParseError { error } => {
                    return Err(CsrError::Der(format!("extension: {error:?}")));
                }
                _ => {}
            }
        }
    }

    Ok(claims)
}

fn collect_general_name(name: &GeneralName<'_>, claims: &mut CsrClaims) -> Result<(), CsrError> {
    match name {
        GeneralName::URI(uri) => claims.uris.push(uri.to_string()),
        GeneralName::DNSName(dns) => claims.dns_names.push(dns.to_string()),
        GeneralName::RFC822Name(email) => claims.emails.push(email.to_string()),
        GeneralName::IPAddress(bytes) => claims.ip_addresses.push(ip_from_bytes(bytes)?),
        other => claims.other_names.push(format!("{other:?}")),
    }
    Ok(())
}

fn ip_from_bytes(bytes: &[u8]) -> Result<IpAddr, CsrError> {
    if let Ok(octets) = <[u8; 4]>::try_from(bytes) {
        return Ok(IpAddr::V4(Ipv4Addr::from(octets)));
    }
    if let Ok(octets) = <[u8; 16]>::try_from(bytes) {
        return Ok(IpAddr::V6(Ipv6Addr::from(octets)));
    }
    Err(CsrError::Der(format!(
        "ip address SAN has invalid length {}",
        bytes.len()
    )))
}

/// Signing request generation for tests
#[cfg(test)]
pub(crate) mod testing {
    use rcgen::Ia5String;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};

    /// Builds PEM signing requests with arbitrary identity fields
    #[derive(Default)]
    pub struct CsrBuilder {
        uris: Vec<String>,
        dns_names: Vec<String>,
        ips: Vec<String>,
        emails: Vec<String>,
        common_name: Option<String>,
    }

    impl CsrBuilder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn identities(mut self, uris: &[&str]) -> Self {
            self.uris = uris.iter().map(|s| s.to_string()).collect();
            self
        }

        pub fn dns(mut self, names: &[&str]) -> Self {
            self.dns_names = names.iter().map(|s| s.to_string()).collect();
            self
        }

        pub fn ips(mut self, ips: &[&str]) -> Self {
            self.ips = ips.iter().map(|s| s.to_string()).collect();
            self
        }

        pub fn emails(mut self, emails: &[&str]) -> Self {
            self.emails = emails.iter().map(|s| s.to_string()).collect();
            self
        }

        pub fn common_name(mut self, cn: &str) -> Self {
            self.common_name = Some(cn.to_string());
            self
        }

        pub fn pem(self) -> String {
            let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
            params.distinguished_name = DistinguishedName::new();
            if let Some(cn) = self.common_name {
                params.distinguished_name.push(DnType::CommonName, cn);
            }

            let ia5 = |s: String| Ia5String::try_from(s).unwrap();
            let mut sans = Vec::new();
            sans.extend(self.uris.into_iter().map(|u| SanType::URI(ia5(u))));
            sans.extend(self.dns_names.into_iter().map(|d| SanType::DnsName(ia5(d))));
            sans.extend(
                self.ips
                    .iter()
                    .map(|ip| SanType::IpAddress(ip.parse().unwrap())),
            );
            sans.extend(self.emails.into_iter().map(|e| SanType::Rfc822Name(ia5(e))));
            params.subject_alt_names = sans;

            let key = KeyPair::generate().unwrap();
            params.serialize_request(&key).unwrap().pem().unwrap()
        }
    }
}
