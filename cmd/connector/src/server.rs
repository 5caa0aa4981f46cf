//! The mTLS gRPC surface: a hand-rolled TLS accept loop so the serving
//! certificate and client trust roots follow the current identity handle,
//! and the GetCredentials handler gluing matcher, cache, and providers.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::Context as _;
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tonic::transport::server::Connected;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use connector_core::cache::CredentialStore;
use connector_core::identity::{spiffe_id_from_cert, Identity};
use connector_core::principal::{matching_acl, MatchError};
use connector_core::proto::spiffe_connector_server::{SpiffeConnector, SpiffeConnectorServer};
use connector_core::proto::{GetCredentialsRequest, GetCredentialsResponse};
use connector_core::provider::Provider;
use connector_core::spiffe_id::SpiffeId;
use connector_core::state::SharedState;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection info recorded at handshake time and made available to
/// request handlers.
#[derive(Clone, Debug)]
pub struct PeerIdentity {
    pub spiffe_id: Option<String>,
    pub remote_addr: Option<SocketAddr>,
}

/// An accepted, verified TLS connection ready to hand to tonic.
pub struct TlsConnection {
    inner: tokio_rustls::server::TlsStream<TcpStream>,
    peer: PeerIdentity,
}

impl Connected for TlsConnection {
    type ConnectInfo = PeerIdentity;

    fn connect_info(&self) -> PeerIdentity {
        self.peer.clone()
    }
}

impl AsyncRead for TlsConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

pub struct ConnectorService {
    state: Arc<SharedState>,
    providers: HashMap<String, Arc<dyn Provider>>,
    store: Arc<CredentialStore>,
}

#[tonic::async_trait]
impl SpiffeConnector for ConnectorService {
    async fn get_credentials(
        &self,
        request: Request<GetCredentialsRequest>,
    ) -> Result<Response<GetCredentialsResponse>, Status> {
        // The transport rejects clients without a verified SVID; this is
        // a defensive fallback.
        let peer = request
            .extensions()
            .get::<PeerIdentity>()
            .and_then(|peer| peer.spiffe_id.clone())
            .ok_or_else(|| Status::unauthenticated("no SVID provided"))?;
        let principal = SpiffeId::parse(&peer).map_err(|e| {
            Status::unauthenticated(format!("peer SVID {peer:?} is not a valid SPIFFE ID: {e}"))
        })?;

        // One config snapshot for the whole request.
        let config = self.state.config();
        let acl = match matching_acl(&config.acls, &principal) {
            Ok(Some(acl)) => acl,
            Ok(None) => {
                debug!("principal {principal} has no entitlements");
                return Ok(Response::new(GetCredentialsResponse::default()));
            }
            Err(MatchError::MultipleMatches) => {
                error!("principal {principal} matched multiple ACLs");
                return Err(Status::failed_precondition(format!(
                    "principal {principal} matched multiple ACLs"
                )));
            }
        };

        let mut credentials = Vec::with_capacity(acl.credentials.len());
        for credential_ref in &acl.credentials {
            let provider = self.providers.get(&credential_ref.provider).ok_or_else(|| {
                Status::failed_precondition(format!(
                    "unknown provider {:?}",
                    credential_ref.provider
                ))
            })?;
            let credential = self
                .store
                .get_or_fetch(provider.as_ref(), &credential_ref.object_reference)
                .await
                .map_err(|e| {
                    Status::unavailable(format!(
                        "provider {} failed for {}: {e}",
                        credential_ref.provider, credential_ref.object_reference
                    ))
                })?;
            credentials.push(credential);
        }

        debug!(
            "served {} credential(s) to {principal}",
            credentials.len()
        );
        Ok(Response::new(GetCredentialsResponse { credentials }))
    }
}

/// Accept TCP connections and perform TLS handshakes, building the
/// acceptor from the current identity snapshot so rotated SVIDs apply to
/// new connections without disturbing established ones.
async fn accept_loop(
    listener: TcpListener,
    state: Arc<SharedState>,
    conn_tx: mpsc::Sender<Result<TlsConnection, io::Error>>,
) {
    let mut cached: Option<(Arc<Identity>, Arc<rustls::ServerConfig>)> = None;
    loop {
        let (tcp, remote_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("failed to accept connection: {e}");
                continue;
            }
        };

        let identity = state.source().current_identity();
        let config = match &cached {
            Some((cached_identity, config)) if Arc::ptr_eq(cached_identity, &identity) => {
                config.clone()
            }
            _ => match connector_core::tls::server_config(&identity) {
                Ok(config) => {
                    let config = Arc::new(config);
                    cached = Some((identity, config.clone()));
                    config
                }
                Err(e) => {
                    error!("failed to build server TLS config: {e}");
                    continue;
                }
            },
        };

        let conn_tx = conn_tx.clone();
        tokio::spawn(async move {
            let acceptor = TlsAcceptor::from(config);
            match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
                Ok(Ok(stream)) => {
                    let spiffe_id = {
                        let (_, session) = stream.get_ref();
                        session
                            .peer_certificates()
                            .and_then(|certs| certs.first())
                            .and_then(spiffe_id_from_cert)
                            .map(|id| id.to_string())
                    };
                    let connection = TlsConnection {
                        inner: stream,
                        peer: PeerIdentity {
                            spiffe_id,
                            remote_addr: Some(remote_addr),
                        },
                    };
                    let _ = conn_tx.send(Ok(connection)).await;
                }
                Ok(Err(e)) => debug!("TLS handshake with {remote_addr} failed: {e}"),
                Err(_) => debug!("TLS handshake with {remote_addr} timed out"),
            }
        });
    }
}

pub async fn serve(
    listen_address: &str,
    state: Arc<SharedState>,
    providers: HashMap<String, Arc<dyn Provider>>,
    shutdown: impl Future<Output = ()> + Send,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_address)
        .await
        .with_context(|| format!("couldn't listen on {listen_address}"))?;
    serve_with_listener(listener, state, providers, shutdown).await
}

pub async fn serve_with_listener(
    listener: TcpListener,
    state: Arc<SharedState>,
    providers: HashMap<String, Arc<dyn Provider>>,
    shutdown: impl Future<Output = ()> + Send,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let service = ConnectorService {
        state: state.clone(),
        providers,
        store: Arc::new(CredentialStore::new()),
    };

    let (conn_tx, conn_rx) = mpsc::channel(1024);
    let accept = tokio::spawn(accept_loop(listener, state, conn_tx));

    let (mut health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_serving::<SpiffeConnectorServer<ConnectorService>>()
        .await;

    info!("spiffe-connector listening on {addr}");
    let result = Server::builder()
        .add_service(health_service)
        .add_service(SpiffeConnectorServer::new(service))
        .serve_with_incoming_shutdown(ReceiverStream::new(conn_rx), shutdown)
        .await;
    accept.abort();

    match result {
        Ok(()) => {
            info!("server shut down gracefully");
            Ok(())
        }
        Err(e) => {
            error!("server error: {e}");
            Err(e.into())
        }
    }
}
