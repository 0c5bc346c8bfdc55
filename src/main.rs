//! istio-csr - workload certificate signing bridge

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use istio_csr::authenticate::KubeJwtAuthenticator;
use istio_csr::certmanager::{KubeCertificateRequestClient, Signer, SignerConfig};
use istio_csr::config::Options;
use istio_csr::controller::{build_controllers, KubeConfigMapClient, TrustBundleEnforcer};
use istio_csr::leader_election::{
    default_identity, KubeLeaseClient, LeaderElector, LEADER_LEASE_NAME,
};
use istio_csr::readiness::{self, Readiness};
use istio_csr::server::{Authorizer, CertificateServer};
use istio_csr::serving::{ServingCertificate, ServingCertificateConfig, ServingTls};
use istio_csr::telemetry::init_tracing;
use istio_csr::trust_bundle::SharedTrustBundle;
use istio_csr::SHUTDOWN_GRACE_PERIOD;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider - FIPS-validated aws-lc-rs
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install FIPS-validated crypto provider: {:?}. \
             The application cannot operate securely without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let opts = Options::parse();
    init_tracing(opts.log_format, opts.log_level)?;
    opts.validate().context("invalid configuration")?;

    run(opts).await
}

async fn run(opts: Options) -> anyhow::Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "istio-csr starting");

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let bundle = match &opts.root_ca_cert {
        Some(path) => {
            let bundle = SharedTrustBundle::from_file(path)
                .await
                .with_context(|| format!("failed to load root CA from {}", path.display()))?;
            info!(path = %path.display(), "loaded root CA");
            tokio::spawn({
                let bundle = bundle.clone();
                let path = path.clone();
                let interval = opts.root_ca_reload_interval;
                let shutdown = shutdown.clone();
                async move { bundle.watch_file(path, interval, shutdown).await }
            });
            bundle
        }
        None => {
            info!("no root CA configured, publishing the CA returned with the serving certificate");
            SharedTrustBundle::default()
        }
    };

    let authenticator = Arc::new(KubeJwtAuthenticator::new(
        client.clone(),
        opts.trust_domain.clone(),
        opts.token_audience.clone(),
    ));
    let authorizer = Authorizer::new(authenticator);

    let mut signer_config = SignerConfig::new(
        opts.issuer_ref(),
        &opts.certificate_namespace,
        opts.max_client_certificate_duration,
    );
    signer_config.preserve_requests = opts.preserve_certificate_requests;
    signer_config.timeout = opts.issuance_timeout;
    let requests = Arc::new(KubeCertificateRequestClient::new(
        client.clone(),
        &opts.certificate_namespace,
    ));
    let signer = Signer::new(requests, signer_config);

    let tls = match opts.serving_tls_files() {
        Some((cert, key)) => {
            if opts.root_ca_cert.is_none() {
                warn!(
                    "serving certificate loaded from file and no root CA configured, \
                     trust bundle stays empty"
                );
            }
            ServingTls::from_files(cert, key)
                .await
                .context("failed to load serving certificate")?
        }
        None => {
            let serving = ServingCertificate::bootstrap(
                signer.clone(),
                ServingCertificateConfig::new(
                    opts.serving_certificate_dns_names.clone(),
                    opts.serving_certificate_duration,
                ),
                opts.root_ca_cert.is_none().then(|| bundle.clone()),
                &shutdown,
            )
            .await
            .context("failed to obtain serving certificate from the issuer")?;
            info!(renew_at = %serving.renew_at(), "obtained serving certificate");
            let tls = serving.tls();
            tokio::spawn(serving.run(shutdown.clone()));
            tls
        }
    };

    let readiness = Readiness::new();
    let cleanups = signer.clone();
    let server = CertificateServer::new(authorizer, signer);
    let grpc = tokio::spawn({
        let readiness = readiness.clone();
        let shutdown = shutdown.clone();
        let addr = opts.serving_address;
        async move {
            let result = server.serve(addr, tls, readiness, shutdown.clone()).await;
            if result.is_err() {
                shutdown.cancel();
            }
            result
        }
    });
    let health = tokio::spawn(readiness::serve(
        opts.readiness_address(),
        opts.readiness_path.clone(),
        readiness,
        shutdown.clone(),
    ));

    let enforcer = Arc::new(TrustBundleEnforcer::new(
        Arc::new(KubeConfigMapClient::new(client.clone())),
        Arc::new(bundle.clone()),
        opts.root_ca_configmap_name.clone(),
    ));
    let controllers = run_controllers(client, &opts, enforcer, bundle, shutdown.clone()).await;
    shutdown.cancel();

    match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, grpc).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => {
            error!(error = %e, "certificate server failed");
            controllers?;
            return Err(e.into());
        }
        Ok(Err(e)) => warn!(error = %e, "certificate server task panicked"),
        Err(_) => warn!("certificate server did not stop within the grace period"),
    }
    match tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, health).await {
        Ok(Ok(Err(e))) => warn!(error = %e, "readiness endpoint failed"),
        Ok(Err(e)) => warn!(error = %e, "readiness endpoint task panicked"),
        _ => {}
    }
    if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, cleanups.drain())
        .await
        .is_err()
    {
        warn!("certificate request cleanup did not finish within the grace period");
    }

    controllers?;
    info!("istio-csr stopped");
    Ok(())
}

/// Run the trust bundle controllers until shutdown
///
/// With leader election the controllers only start once the lease is held,
/// and losing it is fatal so a fresh process can compete again.
async fn run_controllers(
    client: Client,
    opts: &Options,
    enforcer: Arc<TrustBundleEnforcer>,
    bundle: SharedTrustBundle,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let guard = if opts.leader_election {
        let namespace = &opts.leader_election_namespace;
        let elector = Arc::new(LeaderElector::new(
            Arc::new(KubeLeaseClient::new(client.clone(), namespace)),
            LEADER_LEASE_NAME,
            namespace,
            &default_identity(),
        ));
        tokio::select! {
            guard = elector.acquire() => Some(guard),
            _ = shutdown.cancelled() => return Ok(()),
        }
    } else {
        None
    };

    let controllers = futures::future::join_all(build_controllers(
        client,
        enforcer,
        bundle.changes(),
    ));

    let Some(mut guard) = guard else {
        tokio::select! {
            _ = controllers => {}
            _ = shutdown.cancelled() => {}
        }
        return Ok(());
    };

    let lost = tokio::select! {
        _ = controllers => false,
        _ = shutdown.cancelled() => false,
        _ = guard.lost() => true,
    };
    if lost {
        bail!("leadership lost, exiting so a new instance can take over");
    }

    if let Err(e) = guard.release().await {
        warn!(error = %e, "failed to release leader lease");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("graceful shutdown initiated");
}
