//! SVID sources: obtaining and continuously rotating the process identity.
//!
//! A source is constructed from exactly one `SvidSources` variant, performs
//! an initial synchronous fetch so callers always see a usable identity,
//! and exposes an idempotent `cancel` that stops rotation and releases
//! sockets and file watches.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use spiffe::{
    BundleSource as _, SvidSource as _, TrustDomain, WorkloadApiClient, X509Source,
    X509SourceBuilder,
};
use tokio::sync::watch;

use crate::config::{FileSource, SvidSources};
use crate::identity::{Identity, IdentityError};
use crate::watch::{debounced_recv, spawn_path_watcher, DEBOUNCE};

#[derive(Debug)]
pub struct SvidSource {
    inner: SourceInner,
    cancel_tx: watch::Sender<bool>,
    cancelled: AtomicBool,
}

#[derive(Debug)]
enum SourceInner {
    Static { current: Arc<ArcSwap<Identity>> },
    Workload {
        source: Arc<X509Source>,
        last: ArcSwap<Identity>,
    },
}

impl SvidSource {
    /// Construct a source from the configured variant, fetching an initial
    /// identity before returning.
    pub async fn new(spec: &SvidSources) -> Result<Self, IdentityError> {
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let inner = if let Some(workload) = &spec.workload_api {
            let endpoint = normalize_socket_path(&workload.socket_path);
            let client = WorkloadApiClient::new_from_path(&endpoint)
                .await
                .map_err(|e| {
                    IdentityError::WorkloadApi(format!(
                        "failed to connect to SPIFFE Workload API at {endpoint}: {e}"
                    ))
                })?;
            let source = X509SourceBuilder::new()
                .with_client(client)
                .build()
                .await
                .map_err(|e| {
                    IdentityError::WorkloadApi(format!(
                        "failed to initialize X.509 source via {endpoint}: {e}"
                    ))
                })?;
            let initial = snapshot_workload(&source)?;
            log::info!(
                "obtained SVID {} from workload API at {endpoint}",
                initial.spiffe_id()
            );
            SourceInner::Workload {
                source,
                last: ArcSwap::from_pointee(initial),
            }
        } else if let Some(files) = &spec.files {
            let initial = Identity::load_files(files)?;
            log::info!(
                "loaded SVID {} from {}",
                initial.spiffe_id(),
                files.svid_cert.display()
            );
            let current = Arc::new(ArcSwap::from_pointee(initial));
            spawn_file_rotation(files.clone(), current.clone(), cancel_rx)?;
            SourceInner::Static { current }
        } else if let Some(in_memory) = &spec.in_memory {
            let initial = Identity::from_pem(
                in_memory.trust_domain_ca.as_bytes(),
                in_memory.svid_cert.as_bytes(),
                in_memory.svid_key.as_bytes(),
            )?;
            SourceInner::Static {
                current: Arc::new(ArcSwap::from_pointee(initial)),
            }
        } else {
            return Err(IdentityError::NoSource);
        };

        Ok(Self {
            inner,
            cancel_tx,
            cancelled: AtomicBool::new(false),
        })
    }

    /// The most recently observed identity. Non-blocking; snapshots are
    /// immutable and the handle behind them is replaced, not mutated.
    pub fn current_identity(&self) -> Arc<Identity> {
        match &self.inner {
            SourceInner::Static { current } => current.load_full(),
            SourceInner::Workload { source, last } => match snapshot_workload(source) {
                Ok(identity) => {
                    let identity = Arc::new(identity);
                    last.store(identity.clone());
                    identity
                }
                Err(e) => {
                    log::debug!("workload API snapshot unavailable, using last identity: {e}");
                    last.load_full()
                }
            },
        }
    }

    /// Stop rotation and release watches/sockets. Idempotent.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.cancel_tx.send(true);
        if let SourceInner::Workload { source, .. } = &self.inner {
            if let Err(e) = source.close() {
                log::warn!("failed to close workload API X.509 source: {e}");
            }
        }
    }
}

impl Drop for SvidSource {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn normalize_socket_path(path: &str) -> String {
    if path.starts_with("unix:") || path.starts_with("tcp:") {
        path.to_string()
    } else {
        format!("unix:{path}")
    }
}

fn snapshot_workload(source: &X509Source) -> Result<Identity, IdentityError> {
    let svid = source
        .get_svid()
        .map_err(|e| {
            IdentityError::WorkloadApi(format!("failed to fetch default X.509 SVID: {e}"))
        })?
        .ok_or_else(|| {
            IdentityError::WorkloadApi("workload API returned no default X.509 SVID".to_string())
        })?;

    let trust_domain: TrustDomain = svid.spiffe_id().trust_domain().clone();
    let bundle = source
        .get_bundle_for_trust_domain(&trust_domain)
        .map_err(|e| IdentityError::WorkloadApi(format!("failed to fetch X.509 bundle: {e}")))?
        .ok_or_else(|| {
            IdentityError::WorkloadApi(format!(
                "no X.509 bundle available for trust domain {trust_domain}"
            ))
        })?;

    let cert_chain = svid
        .cert_chain()
        .iter()
        .map(|cert| cert.as_ref().to_vec())
        .collect();
    let key = svid.private_key().as_ref().to_vec();
    let mut bundles = BTreeMap::new();
    bundles.insert(
        trust_domain.to_string(),
        bundle
            .authorities()
            .iter()
            .map(|cert| cert.as_ref().to_vec())
            .collect(),
    );

    Identity::from_der_parts(cert_chain, key, bundles)
}

/// Watch the three PEM paths and re-parse on modification. Parse failures
/// keep the previous identity.
fn spawn_file_rotation(
    files: FileSource,
    current: Arc<ArcSwap<Identity>>,
    mut cancel_rx: watch::Receiver<bool>,
) -> Result<(), IdentityError> {
    let paths = vec![
        files.trust_domain_ca.clone(),
        files.svid_cert.clone(),
        files.svid_key.clone(),
    ];
    let (watcher, mut events) =
        spawn_path_watcher(paths).map_err(|e| IdentityError::Watch(e.to_string()))?;

    tokio::spawn(async move {
        // The watcher must stay alive for as long as this task runs.
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
                        Some(()) => match Identity::load_files(&files) {
                            Ok(identity) => {
                                log::info!(
                                    "rotated SVID {} from {}",
                                    identity.spiffe_id(),
                                    files.svid_cert.display()
                                );
                                current.store(Arc::new(identity));
                            }
                            Err(e) => {
                                log::warn!(
                                    "failed to reload SVID files, keeping previous identity: {e}"
                                );
                            }
                        },
                    }
                }
            }
        }
        log::debug!("file-backed SVID rotation stopped");
    });

    Ok(())
}
