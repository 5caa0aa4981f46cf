//! Process-wide handles for the current configuration and identity source.
//!
//! Readers never block and never observe torn values; each handle is
//! replaced whole. The reload path publishes the new config first, then
//! the new source, and only then cancels the previous source so there is
//! no window without a usable identity.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::Config;
use crate::source::SvidSource;

pub struct SharedState {
    config: ArcSwap<Config>,
    source: ArcSwap<SvidSource>,
}

impl SharedState {
    pub fn new(config: Config, source: SvidSource) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            source: ArcSwap::from_pointee(source),
        }
    }

    /// Snapshot of the current config. Hold the returned Arc for the
    /// duration of a request to see one consistent ACL list end-to-end.
    pub fn config(&self) -> Arc<Config> {
        self.config.load_full()
    }

    pub fn store_config(&self, config: Arc<Config>) {
        self.config.store(config);
    }

    /// Snapshot of the current SVID source.
    pub fn source(&self) -> Arc<SvidSource> {
        self.source.load_full()
    }

    /// Publish a new source, returning the previous one so the caller can
    /// cancel it after the swap is visible.
    pub fn store_source(&self, source: Arc<SvidSource>) -> Arc<SvidSource> {
        self.source.swap(source)
    }
}
