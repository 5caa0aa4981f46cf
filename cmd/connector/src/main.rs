use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};

use connector_core::config::load_config;
use connector_core::source::SvidSource;
use connector_core::state::SharedState;
use connector_core::watch::ConfigWatcher;
use spiffe_connector::{server, setup};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = setup::setup_logging_and_parse_args();

    let config = load_config(&args.config_file)
        .with_context(|| format!("couldn't load config file {}", args.config_file.display()))?;
    info!("loaded config {}", args.config_file.display());

    let source = SvidSource::new(&config.spiffe.svid_sources)
        .await
        .context("couldn't get SVID from workload API or files")?;
    let state = Arc::new(SharedState::new(config, source));

    let _watcher = ConfigWatcher::spawn(args.config_file.clone(), state.clone())
        .context("couldn't set up config reloader")?;

    let providers = setup::default_providers().await?;
    setup::ping_providers(&providers).await;

    server::serve(&args.listen_address, state, providers, shutdown_signal()).await
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    warn!("failed to install SIGTERM handler: {e}");
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received interrupt, shutting down");
    }
}
