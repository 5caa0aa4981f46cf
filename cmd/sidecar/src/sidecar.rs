//! The refresh loop: pull the credential bundle, materialize it, and
//! schedule the next pull from the earliest credential expiry.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use hyper_util::rt::TokioIo;
use log::{debug, error, info};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

use connector_core::proto::spiffe_connector_client::SpiffeConnectorClient;
use connector_core::proto::{Credential, GetCredentialsRequest};
use connector_core::source::SvidSource;
use connector_core::spiffe_id::SpiffeId;

use crate::materialize;

const CALL_TIMEOUT: Duration = Duration::from_secs(60);
const RETRY_INTERVAL: Duration = Duration::from_secs(60);

pub struct CredentialManager {
    server_address: String,
    server_spiffe_id: Option<SpiffeId>,
    source: Arc<SvidSource>,
    current: ArcSwap<Vec<Credential>>,
}

impl CredentialManager {
    pub fn new(
        server_address: String,
        server_spiffe_id: Option<SpiffeId>,
        source: Arc<SvidSource>,
    ) -> Self {
        Self {
            server_address,
            server_spiffe_id,
            source,
            current: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// The most recently retrieved bundle.
    pub fn current_credentials(&self) -> Arc<Vec<Credential>> {
        self.current.load_full()
    }

    /// Run until cancelled. The initial fetch must succeed; afterwards
    /// failures back off for a minute without clobbering materialized
    /// files.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) -> Result<()> {
        let mut client = self.connect().await.with_context(|| {
            format!("while attempting to connect to {}", self.server_address)
        })?;
        self.refresh(&mut client).await.with_context(|| {
            format!("couldn't retrieve credentials from {}", self.server_address)
        })?;
        let mut next = self.schedule();

        loop {
            match next {
                Some(delay) => debug!("next credential refresh in {delay:?}"),
                None => info!(
                    "no credential reports an expiry; refresh must be triggered externally"
                ),
            }
            tokio::select! {
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        info!("credential manager stopping");
                        return Ok(());
                    }
                }
                _ = sleep_opt(next) => {
                    match self.refresh(&mut client).await {
                        Ok(()) => next = self.schedule(),
                        Err(e) => {
                            error!("error retrieving credentials: {e:#}");
                            next = Some(RETRY_INTERVAL);
                        }
                    }
                }
            }
        }
    }

    fn schedule(&self) -> Option<Duration> {
        let credentials = self.current.load_full();
        next_refresh_delay(credentials.as_slice(), SystemTime::now())
    }

    async fn connect(&self) -> Result<SpiffeConnectorClient<Channel>> {
        let identity = self.source.current_identity();
        let tls = Arc::new(
            connector_core::tls::client_config(&identity, self.server_spiffe_id.clone())
                .context("couldn't build client TLS config")?,
        );
        let address = self.server_address.clone();
        let connector = service_fn(move |_uri: Uri| {
            let tls = tls.clone();
            let address = address.clone();
            async move {
                let tcp = TcpStream::connect(address.as_str()).await?;
                // SNI carries no meaning here; the verifier checks the
                // server's SPIFFE ID, not a hostname.
                let sni = rustls::pki_types::ServerName::try_from("spiffe-connector".to_string())
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
                let stream = tokio_rustls::TlsConnector::from(tls).connect(sni, tcp).await?;
                Ok::<_, std::io::Error>(TokioIo::new(stream))
            }
        });

        let channel = Endpoint::from_static("http://spiffe-connector")
            .connect_with_connector(connector)
            .await
            .context("gRPC connection failed")?;
        Ok(SpiffeConnectorClient::new(channel))
    }

    async fn refresh(&self, client: &mut SpiffeConnectorClient<Channel>) -> Result<()> {
        let mut request = tonic::Request::new(GetCredentialsRequest {});
        request.set_timeout(CALL_TIMEOUT);

        let response = client
            .get_credentials(request)
            .await
            .context("GetCredentials call failed")?
            .into_inner();
        info!("retrieved {} credential(s)", response.credentials.len());

        self.current.store(Arc::new(response.credentials.clone()));
        materialize::apply(&response.credentials)?;
        Ok(())
    }
}

/// Refresh two thirds of the way to the earliest expiry. `None` means no
/// credential reports an expiry and the timer should not fire at all.
pub fn next_refresh_delay(credentials: &[Credential], now: SystemTime) -> Option<Duration> {
    let earliest = credentials
        .iter()
        .filter_map(|credential| credential.not_after.clone())
        .filter_map(|not_after| SystemTime::try_from(not_after).ok())
        .min()?;
    let until = earliest.duration_since(now).unwrap_or(Duration::ZERO);
    Some(until / 3 * 2)
}

async fn sleep_opt(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending::<()>().await,
    }
}
