//! Command line configuration
//!
//! Every flag can also be set through the environment variable named next to
//! it. Invalid values abort startup.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::Level;

use crate::certmanager::IssuerRef;
use crate::Error;

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Certificate signing bridge between the mesh CA API and cert-manager
#[derive(Parser, Debug, Clone)]
#[command(name = "istio-csr", version, about, long_about = None)]
pub struct Options {
    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Log verbosity (error, warn, info, debug, trace or 1-5); ignored when
    /// RUST_LOG is set
    #[arg(short = 'v', long, env = "LOG_LEVEL")]
    pub log_level: Option<Level>,

    /// Port to expose the readiness endpoint on
    #[arg(long = "readiness-probe-port", env = "READINESS_PROBE_PORT", default_value_t = 6060)]
    pub readiness_port: u16,

    /// HTTP path of the readiness endpoint
    #[arg(long = "readiness-probe-path", env = "READINESS_PROBE_PATH", default_value = "/readyz")]
    pub readiness_path: String,

    /// Address to serve the certificate gRPC service on
    #[arg(short = 'a', long, env = "SERVING_ADDRESS", default_value = "0.0.0.0:443")]
    pub serving_address: SocketAddr,

    /// Lifetime of the serving certificate obtained from the issuer; it is
    /// renewed after two thirds of this
    #[arg(short = 't', long, env = "SERVING_CERTIFICATE_DURATION", default_value = "24h", value_parser = parse_duration)]
    pub serving_certificate_duration: Duration,

    /// DNS names of the serving certificate obtained from the issuer
    #[arg(
        long,
        env = "SERVING_CERTIFICATE_DNS_NAMES",
        value_delimiter = ',',
        default_value = "cert-manager-istio-csr.cert-manager.svc"
    )]
    pub serving_certificate_dns_names: Vec<String>,

    /// PEM certificate chain for the gRPC listener, used instead of a
    /// certificate from the issuer
    #[arg(long, env = "SERVING_CERT_FILE", requires = "serving_key_file")]
    pub serving_cert_file: Option<PathBuf>,

    /// PEM private key for the gRPC listener
    #[arg(long, env = "SERVING_KEY_FILE", requires = "serving_cert_file")]
    pub serving_key_file: Option<PathBuf>,

    /// PEM root CA published to every namespace. If unset, the CA returned
    /// by the issuer with the serving certificate is used.
    #[arg(long, env = "ROOT_CA_CERT")]
    pub root_ca_cert: Option<PathBuf>,

    /// How often the root CA file is re-read
    #[arg(long, env = "ROOT_CA_RELOAD_INTERVAL", default_value = "30s", value_parser = parse_duration)]
    pub root_ca_reload_interval: Duration,

    /// Name of the ConfigMap holding the root CA in each namespace
    #[arg(long, env = "ROOT_CA_CONFIGMAP_NAME", default_value = "istio-ca-root-cert")]
    pub root_ca_configmap_name: String,

    /// Name of the issuer signing workload certificates
    #[arg(short = 'u', long, env = "ISSUER_NAME", default_value = "istio-ca")]
    pub issuer_name: String,

    /// Kind of the issuer signing workload certificates
    #[arg(short = 'k', long, env = "ISSUER_KIND", default_value = "Issuer")]
    pub issuer_kind: String,

    /// Group of the issuer signing workload certificates
    #[arg(short = 'g', long, env = "ISSUER_GROUP", default_value = "cert-manager.io")]
    pub issuer_group: String,

    /// Longest validity a client may be issued; longer requests are capped
    #[arg(short = 'm', long, env = "MAX_CLIENT_CERTIFICATE_DURATION", default_value = "24h", value_parser = parse_duration)]
    pub max_client_certificate_duration: Duration,

    /// Keep CertificateRequests instead of deleting them once finished
    #[arg(short = 'd', long, env = "PRESERVE_CERTIFICATE_REQUESTS")]
    pub preserve_certificate_requests: bool,

    /// Namespace CertificateRequests are created in
    #[arg(short = 'c', long, env = "CERTIFICATE_NAMESPACE", default_value = "istio-system")]
    pub certificate_namespace: String,

    /// How long to wait for a CertificateRequest to be signed
    #[arg(long, env = "ISSUANCE_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub issuance_timeout: Duration,

    /// SPIFFE trust domain of workload identities
    #[arg(long, env = "TRUST_DOMAIN", default_value = "cluster.local")]
    pub trust_domain: String,

    /// Audiences accepted on workload tokens
    #[arg(long, env = "TOKEN_AUDIENCE", value_delimiter = ',', default_value = "istio-ca")]
    pub token_audience: Vec<String>,

    /// Run the trust bundle controllers only while holding the lease
    #[arg(
        long,
        env = "LEADER_ELECTION",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub leader_election: bool,

    /// Namespace of the leader election lease
    #[arg(long, env = "LEADER_ELECTION_NAMESPACE", default_value = "istio-system")]
    pub leader_election_namespace: String,
}

impl Options {
    /// Issuer reference from the issuer flags
    pub fn issuer_ref(&self) -> IssuerRef {
        IssuerRef {
            name: self.issuer_name.clone(),
            kind: self.issuer_kind.clone(),
            group: self.issuer_group.clone(),
        }
    }

    /// Readiness endpoint listen address
    pub fn readiness_address(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.readiness_port))
    }

    /// Static serving certificate and key, if configured
    pub fn serving_tls_files(&self) -> Option<(&PathBuf, &PathBuf)> {
        self.serving_cert_file.as_ref().zip(self.serving_key_file.as_ref())
    }

    /// Reject combinations clap cannot express
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_client_certificate_duration.is_zero() {
            return Err(Error::config("max-client-certificate-duration must be positive"));
        }
        if self.issuance_timeout.is_zero() {
            return Err(Error::config("issuance-timeout must be positive"));
        }
        if self.serving_certificate_duration.is_zero() {
            return Err(Error::config("serving-certificate-duration must be positive"));
        }
        if self.serving_tls_files().is_none()
            && self.serving_certificate_dns_names.iter().all(|n| n.is_empty())
        {
            return Err(Error::config(
                "serving-certificate-dns-names must name at least one DNS name",
            ));
        }
        if self.root_ca_reload_interval.is_zero() {
            return Err(Error::config("root-ca-reload-interval must be positive"));
        }
        if !self.readiness_path.starts_with('/') {
            return Err(Error::config(format!(
                "readiness-probe-path must start with '/': {}",
                self.readiness_path
            )));
        }
        if self.root_ca_configmap_name.is_empty() {
            return Err(Error::config("root-ca-configmap-name must not be empty"));
        }
        if self.token_audience.iter().all(|a| a.is_empty()) {
            return Err(Error::config("token-audience must name at least one audience"));
        }
        Ok(())
    }
}

/// Parse durations such as `90s`, `15m` or `24h`
///
/// A bare number is taken as seconds.
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);

    let amount: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration {value:?}: expected a number followed by s, m or h"))?;

    let multiplier = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        other => return Err(format!("invalid duration unit {other:?} in {value:?}")),
    };

    amount
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("duration {value:?} is too large"))
}
