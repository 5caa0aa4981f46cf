use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};
use tokio::sync::watch;

use connector_core::source::SvidSource;
use connector_core::spiffe_id::SpiffeId;
use spiffe_connector_sidecar::cli::Cli;
use spiffe_connector_sidecar::sidecar::CredentialManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse_args();

    let log_level = if args.is_debug_enabled() {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level)).init();
    info!("spiffe-connector-sidecar starting up");

    let server_spiffe_id = args
        .server_spiffe_id
        .as_deref()
        .map(SpiffeId::parse)
        .transpose()
        .context("provided SPIFFE ID is invalid")?;

    let sources = args.svid_sources()?;
    let source = SvidSource::new(&sources)
        .await
        .context("couldn't get SVID from workload API or files")?;

    let manager = CredentialManager::new(
        args.server_address.clone(),
        server_spiffe_id,
        Arc::new(source),
    );

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to listen for shutdown signal: {e}");
            return;
        }
        info!("received interrupt, shutting down");
        let _ = cancel_tx.send(true);
    });

    manager.run(cancel_rx).await
}
