//! Serving certificate for the certificate API
//!
//! The gRPC listener presents a certificate signed by the same issuer as
//! workload certificates. Every issuance uses a freshly generated key, and
//! the certificate is renewed once two thirds of its lifetime has passed.
//! When no root CA file is configured, the CA returned with each serving
//! certificate becomes the trust bundle, so the bundle is populated before
//! the first workload asks for a certificate.
//!
//! The rustls config lives behind an [`ArcSwap`]: every handshake takes the
//! current snapshot, so renewals apply to new connections without
//! restarting the listener.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::certmanager::Signer;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::trust_bundle::SharedTrustBundle;
use crate::Error;

const ALPN_H2: &[u8] = b"h2";

/// Wait before trying again when a renewed certificate cannot be used
const RENEW_FAILURE_BACKOFF_SECS: i64 = 30;

/// Hot-swappable TLS configuration for the gRPC listener
#[derive(Clone)]
pub struct ServingTls {
    config: Arc<ArcSwap<ServerConfig>>,
}

impl ServingTls {
    /// Build from a PEM chain (leaf first) and its PEM private key
    pub fn from_pem(chain: &[u8], key: &[u8]) -> Result<Self, Error> {
        Ok(Self {
            config: Arc::new(ArcSwap::from_pointee(server_config(chain, key)?)),
        })
    }

    /// Load a static certificate and key from disk
    pub async fn from_files(cert: &Path, key: &Path) -> Result<Self, Error> {
        let chain = tokio::fs::read(cert).await.map_err(|e| {
            Error::config(format!("reading serving certificate {}: {e}", cert.display()))
        })?;
        let key_pem = tokio::fs::read(key)
            .await
            .map_err(|e| Error::config(format!("reading serving key {}: {e}", key.display())))?;
        Self::from_pem(&chain, &key_pem)
    }

    /// Swap in a new certificate for subsequent handshakes
    pub fn replace(&self, chain: &[u8], key: &[u8]) -> Result<(), Error> {
        self.config.store(Arc::new(server_config(chain, key)?));
        Ok(())
    }

    /// Acceptor bound to the current certificate
    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(self.config.load_full())
    }
}

fn server_config(chain: &[u8], key: &[u8]) -> Result<ServerConfig, Error> {
    let certs = parse_chain(chain)?;
    let key = parse_key(key)?;

    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::config(format!("serving TLS protocol versions: {e}")))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::config(format!("serving certificate: {e}")))?;
    config.alpn_protocols = vec![ALPN_H2.to_vec()];
    Ok(config)
}

fn parse_chain(chain: &[u8]) -> Result<Vec<CertificateDer<'static>>, Error> {
    let blocks = pem::parse_many(chain)
        .map_err(|e| Error::config(format!("serving certificate is not PEM: {e}")))?;
    let certs: Vec<_> = blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| CertificateDer::from(block.into_contents()))
        .collect();
    if certs.is_empty() {
        return Err(Error::config("serving certificate contains no certificates"));
    }
    Ok(certs)
}

fn parse_key(key: &[u8]) -> Result<PrivateKeyDer<'static>, Error> {
    let blocks = pem::parse_many(key)
        .map_err(|e| Error::config(format!("serving key is not PEM: {e}")))?;
    for block in blocks {
        let key = match block.tag() {
            "PRIVATE KEY" => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(block.into_contents())),
            "EC PRIVATE KEY" => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(block.into_contents())),
            "RSA PRIVATE KEY" => {
                PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(block.into_contents()))
            }
            _ => continue,
        };
        return Ok(key);
    }
    Err(Error::config("serving key contains no private key"))
}

/// A freshly generated key and the PEM signing request for it
pub struct ServingRequest {
    /// PKCS#10 request carrying the DNS names
    pub csr_pem: String,
    /// PKCS#8 private key
    pub key_pem: String,
}

/// Generate a key and a signing request for `dns_names`
pub fn serving_request(dns_names: &[String]) -> Result<ServingRequest, Error> {
    let key = KeyPair::generate()
        .map_err(|e| Error::internal(format!("generating serving key: {e}")))?;
    let mut params = CertificateParams::new(dns_names.to_vec())
        .map_err(|e| Error::config(format!("serving certificate DNS names: {e}")))?;
    params.distinguished_name = DistinguishedName::new();
    let csr_pem = params
        .serialize_request(&key)
        .and_then(|csr| csr.pem())
        .map_err(|e| Error::internal(format!("building serving certificate request: {e}")))?;
    Ok(ServingRequest {
        csr_pem,
        key_pem: key.serialize_pem(),
    })
}

/// Validity window of the first certificate in a PEM chain
pub fn leaf_validity(chain: &[u8]) -> Result<(DateTime<Utc>, DateTime<Utc>), Error> {
    let blocks = pem::parse_many(chain)
        .map_err(|e| Error::internal(format!("issued chain is not PEM: {e}")))?;
    let leaf = blocks
        .iter()
        .find(|block| block.tag() == "CERTIFICATE")
        .ok_or_else(|| Error::internal("issued chain contains no certificates"))?;
    let (_, cert) = X509Certificate::from_der(leaf.contents())
        .map_err(|e| Error::internal(format!("issued certificate: {e}")))?;

    let validity = cert.validity();
    let timestamp = |t: i64| {
        DateTime::from_timestamp(t, 0)
            .ok_or_else(|| Error::internal(format!("certificate time {t} out of range")))
    };
    Ok((
        timestamp(validity.not_before.timestamp())?,
        timestamp(validity.not_after.timestamp())?,
    ))
}

/// Point at which two thirds of the validity window has elapsed
pub fn renew_at(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> DateTime<Utc> {
    not_before + (not_after - not_before) * 2 / 3
}

/// Time left until `at`; zero if it already passed
pub fn renewal_delay(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

/// Serving certificate settings
#[derive(Clone, Debug)]
pub struct ServingCertificateConfig {
    /// DNS names the certificate is valid for
    pub dns_names: Vec<String>,
    /// Requested lifetime
    pub duration: Duration,
    /// Retry policy for failed renewals
    pub retry: RetryConfig,
}

impl ServingCertificateConfig {
    /// Settings with unbounded renewal retries
    pub fn new(dns_names: Vec<String>, duration: Duration) -> Self {
        Self {
            dns_names,
            duration,
            retry: RetryConfig::default(),
        }
    }
}

/// Keeps the listener's certificate issued and fresh
pub struct ServingCertificate {
    signer: Signer,
    config: ServingCertificateConfig,
    bundle: Option<SharedTrustBundle>,
    tls: ServingTls,
    renew_at: DateTime<Utc>,
}

struct Issued {
    chain: Vec<u8>,
    key_pem: String,
    renew_at: DateTime<Utc>,
}

impl ServingCertificate {
    /// Obtain the first serving certificate
    ///
    /// With `bundle` set, the issuer's CA replaces the bundle content on this
    /// and every later issuance.
    pub async fn bootstrap(
        signer: Signer,
        config: ServingCertificateConfig,
        bundle: Option<SharedTrustBundle>,
        cancel: &CancellationToken,
    ) -> Result<Self, Error> {
        let issued = issue(&signer, &config, bundle.as_ref(), cancel).await?;
        let tls = ServingTls::from_pem(&issued.chain, issued.key_pem.as_bytes())?;
        Ok(Self {
            signer,
            config,
            bundle,
            tls,
            renew_at: issued.renew_at,
        })
    }

    /// Handle the listener reads the current certificate from
    pub fn tls(&self) -> ServingTls {
        self.tls.clone()
    }

    /// When the next renewal is due
    pub fn renew_at(&self) -> DateTime<Utc> {
        self.renew_at
    }

    /// Issue a new certificate and swap it in, retrying failed issuance
    pub async fn renew(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        let issued = retry_with_backoff(&self.config.retry, "renew_serving_certificate", || {
            issue(&self.signer, &self.config, self.bundle.as_ref(), cancel)
        })
        .await?;
        self.tls.replace(&issued.chain, issued.key_pem.as_bytes())?;
        self.renew_at = issued.renew_at;
        Ok(())
    }

    /// Renew on schedule until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        loop {
            let delay = renewal_delay(self.renew_at, Utc::now());
            info!(renew_at = %self.renew_at, "serving certificate renewal scheduled");
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let renewed = tokio::select! {
                _ = shutdown.cancelled() => return,
                renewed = self.renew(&shutdown) => renewed,
            };
            match renewed {
                Ok(()) => info!("serving certificate renewed"),
                Err(e) => {
                    warn!(error = %e, "failed to renew serving certificate");
                    self.renew_at =
                        Utc::now() + chrono::TimeDelta::seconds(RENEW_FAILURE_BACKOFF_SECS);
                }
            }
        }
    }
}

#[instrument(skip_all, fields(dns_names = %config.dns_names.join(",")))]
async fn issue(
    signer: &Signer,
    config: &ServingCertificateConfig,
    bundle: Option<&SharedTrustBundle>,
    cancel: &CancellationToken,
) -> Result<Issued, Error> {
    let request = serving_request(&config.dns_names)?;
    let issued = signer
        .issue(
            &config.dns_names.join(","),
            request.csr_pem.as_bytes(),
            config.duration,
            cancel.clone(),
        )
        .await?;

    let (not_before, not_after) = leaf_validity(&issued.chain)?;

    if let Some(bundle) = bundle {
        match &issued.ca {
            Some(ca) => {
                if bundle.replace(ca.clone()) {
                    info!("trust bundle updated from issuer CA");
                }
            }
            None => warn!("issuer returned no CA, trust bundle left unchanged"),
        }
    }

    Ok(Issued {
        chain: issued.chain,
        key_pem: request.key_pem,
        renew_at: renew_at(not_before, not_after),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certmanager::testing::ready;
    use crate::certmanager::{IssuerRef, MockCertificateRequestClient, SignerConfig};
    use crate::csr::parse_csr_pem;
    use crate::trust_bundle::TrustBundleSource;
    use chrono::TimeZone;
    use futures::{stream, StreamExt};
    use parking_lot::Mutex;
    use rcgen::{
        BasicConstraints, Certificate, CertificateSigningRequestParams, DnType, IsCa,
    };

    const DNS: &str = "cert-manager-istio-csr.cert-manager.svc";

    struct TestCa {
        cert: Certificate,
        key: KeyPair,
    }

    impl TestCa {
        fn new() -> Self {
            let key = KeyPair::generate().unwrap();
            let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params
                .distinguished_name
                .push(DnType::CommonName, "istio-csr test root");
            let cert = params.self_signed(&key).unwrap();
            Self { cert, key }
        }

        fn sign(&self, csr_pem: &[u8]) -> String {
            let csr = std::str::from_utf8(csr_pem).unwrap();
            CertificateSigningRequestParams::from_pem(csr)
                .unwrap()
                .signed_by(&self.cert, &self.key)
                .unwrap()
                .pem()
        }
    }

    /// Signer whose store signs every request with `ca` and records the requests
    fn signing_store(ca: Arc<TestCa>, requests: Arc<Mutex<Vec<Vec<u8>>>>) -> Signer {
        let issued = Arc::new(Mutex::new(String::new()));

        let mut mock = MockCertificateRequestClient::new();
        let chain = issued.clone();
        let signer_ca = ca.clone();
        mock.expect_create().returning(move |cr| {
            requests.lock().push(cr.spec.request.0.clone());
            *chain.lock() = signer_ca.sign(&cr.spec.request.0);
            let mut created = cr.clone();
            created.metadata.name = Some("istio-csr-serving".into());
            Ok(created)
        });
        mock.expect_watch().returning(move |name| {
            let leaf = issued.lock().clone();
            stream::iter(vec![Ok(ready(name, &leaf, &ca.cert.pem()))]).boxed()
        });
        mock.expect_delete().returning(|_| Ok(()));

        Signer::new(
            Arc::new(mock),
            SignerConfig::new(
                IssuerRef {
                    name: "istio-ca".into(),
                    kind: "Issuer".into(),
                    group: "cert-manager.io".into(),
                },
                "istio-system",
                Duration::from_secs(3600),
            ),
        )
    }

    fn config() -> ServingCertificateConfig {
        ServingCertificateConfig::new(vec![DNS.to_string()], Duration::from_secs(24 * 3600))
    }

    #[test]
    fn renewal_is_two_thirds_into_validity() {
        let not_before = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let not_after = not_before + chrono::Duration::hours(24);
        assert_eq!(
            renew_at(not_before, not_after),
            not_before + chrono::Duration::hours(16)
        );
    }

    #[test]
    fn renewal_delay_counts_down_and_floors_at_zero() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 16, 0, 0).unwrap();
        assert_eq!(
            renewal_delay(at, at - chrono::Duration::minutes(90)),
            Duration::from_secs(90 * 60)
        );
        assert_eq!(
            renewal_delay(at, at + chrono::Duration::seconds(1)),
            Duration::ZERO
        );
    }

    #[test]
    fn validity_is_read_from_the_leaf() {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec![DNS.to_string()]).unwrap();
        params.not_before = rcgen::date_time_ymd(2024, 1, 1);
        params.not_after = rcgen::date_time_ymd(2024, 1, 4);
        let cert = params.self_signed(&key).unwrap();

        let (not_before, not_after) = leaf_validity(cert.pem().as_bytes()).unwrap();
        assert_eq!(not_before, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(not_after, Utc.with_ymd_and_hms(2024, 1, 4, 0, 0, 0).unwrap());
        assert_eq!(
            renew_at(not_before, not_after),
            Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn request_carries_only_dns_names() {
        let request = serving_request(&[DNS.to_string()]).unwrap();
        let claims = parse_csr_pem(request.csr_pem.as_bytes()).unwrap();
        assert_eq!(claims.dns_names, vec![DNS.to_string()]);
        assert!(claims.uris.is_empty());
        assert!(claims.common_name.is_none());
        assert!(request.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn tls_rejects_material_without_certificates() {
        let request = serving_request(&[DNS.to_string()]).unwrap();
        assert!(matches!(
            ServingTls::from_pem(b"", request.key_pem.as_bytes()),
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn bootstrap_seeds_bundle_with_issuer_ca() {
        let ca = Arc::new(TestCa::new());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let signer = signing_store(ca.clone(), requests.clone());

        let bundle = SharedTrustBundle::default();
        let serving = ServingCertificate::bootstrap(
            signer,
            config(),
            Some(bundle.clone()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(bundle.root_ca_pem(), ca.cert.pem().into_bytes());
        assert!(serving.renew_at() > Utc::now());
        assert_eq!(requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn renewal_uses_a_fresh_key_and_swaps_config() {
        let ca = Arc::new(TestCa::new());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let signer = signing_store(ca, requests.clone());

        let mut serving =
            ServingCertificate::bootstrap(signer, config(), None, &CancellationToken::new())
                .await
                .unwrap();
        let before = serving.tls.config.load_full();

        serving.renew(&CancellationToken::new()).await.unwrap();

        assert!(!Arc::ptr_eq(&before, &serving.tls.config.load_full()));
        let requests = requests.lock();
        assert_eq!(requests.len(), 2);
        assert_ne!(requests[0], requests[1]);
    }

    #[tokio::test]
    async fn issuance_failure_fails_bootstrap() {
        let mut mock = MockCertificateRequestClient::new();
        mock.expect_create()
            .returning(|_| Err(Error::internal("apiserver unavailable")));
        let signer = Signer::new(
            Arc::new(mock),
            SignerConfig::new(IssuerRef::default(), "istio-system", Duration::from_secs(60)),
        );

        let result =
            ServingCertificate::bootstrap(signer, config(), None, &CancellationToken::new()).await;
        assert!(result.is_err());
    }
}
