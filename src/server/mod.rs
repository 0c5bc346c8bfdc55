//! Certificate signing endpoint
//!
//! Serves the mesh CA gRPC API over TLS. Each call is authorized, then issued
//! through cert-manager on its own task so that a caller hanging up cancels
//! the wait without skipping cleanup of the CertificateRequest.

pub mod authorize;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::server::TlsStream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::{debug, info, instrument, warn};

use crate::authenticate::RequestContext;
use crate::certmanager::{IssuedCertificate, Signer};
use crate::proto::istio_certificate_service_server::{
    IstioCertificateService, IstioCertificateServiceServer,
};
use crate::proto::{IstioCertificateRequest, IstioCertificateResponse};
use crate::readiness::Readiness;
use crate::serving::ServingTls;
use crate::Error;

pub use authorize::Authorizer;

/// Handshakes slower than this are dropped
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Completed handshakes waiting for the gRPC server
const ACCEPT_BACKLOG: usize = 128;

/// gRPC implementation of the mesh CA service
#[derive(Clone)]
pub struct CertificateServer {
    authorizer: Authorizer,
    signer: Signer,
}

impl CertificateServer {
    /// Create a server from an authorizer and a signer
    pub fn new(authorizer: Authorizer, signer: Signer) -> Self {
        Self { authorizer, signer }
    }

    /// Convert to a tonic service
    pub fn into_service(self) -> IstioCertificateServiceServer<Self> {
        IstioCertificateServiceServer::new(self)
    }

    /// Serve on `addr` until `shutdown` is cancelled
    ///
    /// Every handshake uses the certificate `tls` holds at that moment.
    /// Readiness is flipped once the listener is bound.
    pub async fn serve(
        self,
        addr: SocketAddr,
        tls: ServingTls,
        readiness: Readiness,
        shutdown: CancellationToken,
    ) -> Result<(), Error> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::internal(format!("binding {addr}: {e}")))?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::internal(format!("reading bound address: {e}")))?;
        info!(addr = %local, "serving certificate API with TLS");

        let incoming = tls_incoming(listener, tls, shutdown.clone());

        readiness.set_ready(true);
        let result = Server::builder()
            .add_service(self.into_service())
            .serve_with_incoming_shutdown(incoming, shutdown.cancelled_owned())
            .await;
        readiness.set_ready(false);

        result.map_err(|e| Error::internal(format!("certificate API server: {e}")))
    }
}

/// Accept TCP connections and hand completed TLS handshakes to the server
///
/// Handshakes run on their own tasks so a slow client cannot stall the
/// accept loop.
fn tls_incoming(
    listener: TcpListener,
    tls: ServingTls,
    shutdown: CancellationToken,
) -> ReceiverStream<Result<TlsStream<TcpStream>, std::io::Error>> {
    let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);

    tokio::spawn(async move {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => return,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            let acceptor = tls.acceptor();
            let tx = tx.clone();
            tokio::spawn(async move {
                match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                    Ok(Ok(stream)) => {
                        let _ = tx.send(Ok(stream)).await;
                    }
                    Ok(Err(e)) => debug!(%peer, error = %e, "TLS handshake failed"),
                    Err(_) => debug!(%peer, "TLS handshake timed out"),
                }
            });
        }
    });

    ReceiverStream::new(rx)
}

#[tonic::async_trait]
impl IstioCertificateService for CertificateServer {
    #[instrument(skip_all, fields(peer = ?request.remote_addr()))]
    async fn create_certificate(
        &self,
        request: Request<IstioCertificateRequest>,
    ) -> Result<Response<IstioCertificateResponse>, Status> {
        let ctx = RequestContext::from_metadata(request.metadata(), request.remote_addr());
        let request = request.into_inner();

        let caller = self.authorizer.authorize(&ctx, request.csr.as_bytes()).await?;

        // Dropping this handler (caller went away) cancels the token; the
        // spawned task notices, stops waiting and still cleans up.
        let cancel = CancellationToken::new();
        let _guard = cancel.clone().drop_guard();

        let signer = self.signer.clone();
        let csr = request.csr.into_bytes();
        let validity = request.validity_duration;
        let issued = tokio::spawn(async move { signer.sign(&caller, &csr, validity, cancel).await })
            .await
            .map_err(|e| Error::internal(format!("signing task failed: {e}")))??;

        let cert_chain = response_chain(&issued)?;
        Ok(Response::new(IstioCertificateResponse { cert_chain }))
    }
}

/// Split the issued chain into individual PEM certificates, leaf first,
/// ending with the CA certificate
pub fn response_chain(issued: &IssuedCertificate) -> Result<Vec<String>, Error> {
    let mut blocks = pem::parse_many(&issued.chain)
        .map_err(|e| Error::internal(format!("issued chain is not PEM: {e}")))?;
    if blocks.is_empty() {
        return Err(Error::internal("issued chain contains no certificates"));
    }

    if let Some(ca) = &issued.ca {
        let ca_blocks = pem::parse_many(ca)
            .map_err(|e| Error::internal(format!("issued CA is not PEM: {e}")))?;
        if let Some(root) = ca_blocks.into_iter().next() {
            let already_last = blocks
                .last()
                .is_some_and(|last| last.contents() == root.contents());
            if !already_last {
                blocks.push(root);
            }
        }
    }

    Ok(blocks
        .iter()
        .map(|block| pem::encode(block).replace("\r\n", "\n"))
        .collect())
}
