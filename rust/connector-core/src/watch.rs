//! Debounced filesystem watching and the config reload loop.
//!
//! The reload loop re-reads and re-validates the config, rebuilds the SVID
//! source, and only then swaps the shared handles: config first, then
//! identity, then cancel the previous source. Any failure keeps the
//! previous config and identity untouched.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::load_config;
use crate::source::SvidSource;
use crate::state::SharedState;

/// Editors and orchestrators write config files in bursts; events closer
/// together than this are coalesced into one reload.
pub(crate) const DEBOUNCE: Duration = Duration::from_millis(250);

/// Watch the parent directories of `paths`, emitting one unit per
/// write/rename/remove event touching any of the given file names.
pub(crate) fn spawn_path_watcher(
    paths: Vec<PathBuf>,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<()>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let names: Vec<OsString> = paths
        .iter()
        .filter_map(|p| p.file_name().map(|n| n.to_os_string()))
        .collect();

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                let relevant = matches!(
                    event.kind,
                    EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
                ) && event.paths.iter().any(|p| {
                    p.file_name()
                        .map(|n| names.iter().any(|name| name == n))
                        .unwrap_or(false)
                });
                if relevant {
                    let _ = tx.send(());
                }
            }
            Err(e) => log::warn!("filesystem watcher error: {e}"),
        },
        notify::Config::default(),
    )?;

    let mut dirs: Vec<PathBuf> = paths
        .iter()
        .map(|p| {
            let parent = p.parent().unwrap_or_else(|| Path::new("."));
            if parent.as_os_str().is_empty() {
                PathBuf::from(".")
            } else {
                parent.to_path_buf()
            }
        })
        .collect();
    dirs.sort();
    dirs.dedup();
    for dir in &dirs {
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
    }

    Ok((watcher, rx))
}

/// Receive one settled change: waits for an event, then drains until the
/// channel has been quiet for `quiet`.
pub(crate) async fn debounced_recv(
    rx: &mut mpsc::UnboundedReceiver<()>,
    quiet: Duration,
) -> Option<()> {
    rx.recv().await?;
    loop {
        match tokio::time::timeout(quiet, rx.recv()).await {
            Ok(Some(())) => continue,
            Ok(None) | Err(_) => return Some(()),
        }
    }
}

/// Reloads config and identity when the config file changes.
pub struct ConfigWatcher {
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ConfigWatcher {
    pub fn spawn(path: PathBuf, state: Arc<SharedState>) -> notify::Result<Self> {
        let (watcher, mut events) = spawn_path_watcher(vec![path.clone()])?;
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            // Dropping the watcher releases the underlying OS watches.
            let _watcher = watcher;
            loop {
                tokio::select! {
                    changed = cancel_rx.changed() => {
                        if changed.is_err() || *cancel_rx.borrow() {
                            break;
                        }
                    }
                    event = debounced_recv(&mut events, DEBOUNCE) => {
                        match event {
                            None => break,
                            Some(()) => reload(&path, &state).await,
                        }
                    }
                }
            }
            log::debug!("config watcher stopped");
        });

        Ok(Self { cancel_tx, handle })
    }

    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.cancel();
        self.handle.abort();
    }
}

async fn reload(path: &Path, state: &SharedState) {
    let config = match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("config reload failed, keeping previous config: {e}");
            return;
        }
    };
    let source = match SvidSource::new(&config.spiffe.svid_sources).await {
        Ok(source) => source,
        Err(e) => {
            log::warn!(
                "config reload failed, keeping previous config and identity: \
                 couldn't construct SVID source: {e}"
            );
            return;
        }
    };

    // Publish config, then identity, then cancel the old rotation task so
    // readers never observe a window without a usable identity.
    state.store_config(Arc::new(config));
    let previous = state.store_source(Arc::new(source));
    previous.cancel();
    log::info!("reloaded configuration from {}", path.display());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        Acl, Config, InMemorySource, SpiffeConfig, SvidSources,
    };
    use crate::identity::test_certs::{issue_svid, test_ca};

    fn test_config(principal: &str) -> Config {
        let ca = test_ca();
        let svid = issue_svid(&ca, "spiffe://example.com/connector");
        Config {
            spiffe: SpiffeConfig {
                svid_sources: SvidSources {
                    in_memory: Some(InMemorySource {
                        trust_domain_ca: ca.ca_pem,
                        svid_cert: svid.cert_pem,
                        svid_key: svid.key_pem,
                    }),
                    ..Default::default()
                },
            },
            acls: vec![Acl {
                match_principal: principal.to_string(),
                credentials: Vec::new(),
            }],
        }
    }

    fn write_config(path: &Path, config: &Config) {
        std::fs::write(path, serde_yaml::to_string(config).unwrap()).unwrap();
    }

    async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..50 {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        false
    }

    #[tokio::test]
    async fn reloads_config_and_identity_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spiffe-connector.yaml");

        let initial = test_config("spiffe://example.com/old");
        write_config(&path, &initial);

        let source = SvidSource::new(&initial.spiffe.svid_sources).await.unwrap();
        let state = Arc::new(SharedState::new(initial, source));
        let _watcher = ConfigWatcher::spawn(path.clone(), state.clone()).unwrap();

        write_config(&path, &test_config("spiffe://example.com/new"));

        assert!(
            wait_for(|| state.config().acls[0].match_principal == "spiffe://example.com/new")
                .await,
            "config was not reloaded"
        );
    }

    #[tokio::test]
    async fn invalid_rewrite_keeps_previous_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spiffe-connector.yaml");

        let initial = test_config("spiffe://example.com/keep");
        write_config(&path, &initial);

        let source = SvidSource::new(&initial.spiffe.svid_sources).await.unwrap();
        let state = Arc::new(SharedState::new(initial, source));
        let _watcher = ConfigWatcher::spawn(path.clone(), state.clone()).unwrap();

        std::fs::write(&path, "acls: [this is not valid yaml: {").unwrap();
        tokio::time::sleep(Duration::from_millis(700)).await;

        assert_eq!(
            state.config().acls[0].match_principal,
            "spiffe://example.com/keep"
        );
    }
}
