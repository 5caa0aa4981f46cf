//! Expiry-aware credential store with at-most-one fetch per key.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use tokio::sync::Mutex as AsyncMutex;

use crate::proto::Credential;
use crate::provider::{Provider, ProviderError};

/// Credentials closer to expiry than this are refetched rather than reused.
pub const EXPIRY_SAFETY_MARGIN: Duration = Duration::from_secs(5 * 60);

/// A credential with no `not_after` is treated as always fresh: the
/// provider reported no expiry, so it is stored once and reused until the
/// process restarts.
pub fn is_fresh(credential: &Credential, now: SystemTime) -> bool {
    match &credential.not_after {
        None => true,
        Some(ts) => match SystemTime::try_from(ts.clone()) {
            Ok(not_after) => not_after >= now + EXPIRY_SAFETY_MARGIN,
            Err(_) => false,
        },
    }
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    provider: String,
    object_reference: String,
}

type Slot = std::sync::Arc<AsyncMutex<Option<Credential>>>;

/// Process-local credential cache keyed by `(provider, object_reference)`.
///
/// The per-key lock is held across the provider call so that concurrent
/// requests for one key serialize into a single upstream fetch; requests
/// for other keys proceed independently. Nothing is persisted.
#[derive(Default)]
pub struct CredentialStore {
    slots: Mutex<HashMap<CacheKey, Slot>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached credential for the key if it is still fresh,
    /// otherwise fetch from the provider. A failed fetch surfaces the error
    /// and leaves any previous (already stale) entry in place for the next
    /// attempt.
    pub async fn get_or_fetch(
        &self,
        provider: &dyn Provider,
        object_reference: &str,
    ) -> Result<Credential, ProviderError> {
        let slot = self.slot(provider.name(), object_reference);
        let mut entry = slot.lock().await;

        if let Some(credential) = entry.as_ref() {
            if is_fresh(credential, SystemTime::now()) {
                return Ok(credential.clone());
            }
        }

        let credential = provider.get_credential(object_reference).await?;
        *entry = Some(credential.clone());
        Ok(credential)
    }

    fn slot(&self, provider: &str, object_reference: &str) -> Slot {
        let key = CacheKey {
            provider: provider.to_string(),
            object_reference: object_reference.to_string(),
        };
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(key).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::File;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Test double that counts upstream calls and hands out credentials
    /// with a configurable expiry per call.
    struct FakeProvider {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        expirations: Mutex<Vec<Option<Duration>>>,
    }

    impl FakeProvider {
        fn new(expirations: Vec<Option<Duration>>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                expirations: Mutex::new(expirations),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn name(&self) -> &str {
            "FakeProvider"
        }

        async fn ping(&self) -> Result<(), ProviderError> {
            Ok(())
        }

        async fn get_credential(
            &self,
            object_reference: &str,
        ) -> Result<Credential, ProviderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let expiry = {
                let mut expirations = self.expirations.lock().unwrap();
                if expirations.is_empty() {
                    Some(Duration::from_secs(3600))
                } else {
                    expirations.remove(0)
                }
            };
            Ok(Credential {
                not_after: expiry
                    .map(|d| prost_types::Timestamp::from(SystemTime::now() + d)),
                files: vec![File {
                    path: format!("{object_reference}-{call}"),
                    mode: 0o644,
                    contents: format!("token-{call}").into_bytes(),
                }],
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn reuses_credentials_within_freshness_window() {
        let provider = FakeProvider::new(vec![Some(Duration::from_secs(3600))]);
        let store = CredentialStore::new();

        let first = store.get_or_fetch(&provider, "ref").await.unwrap();
        let second = store.get_or_fetch(&provider, "ref").await.unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn refetches_near_expiry() {
        let provider = FakeProvider::new(vec![
            Some(Duration::from_secs(1)),
            Some(Duration::from_secs(3600)),
        ]);
        let store = CredentialStore::new();

        let first = store.get_or_fetch(&provider, "ref").await.unwrap();
        let second = store.get_or_fetch(&provider, "ref").await.unwrap();

        assert_eq!(provider.calls(), 2);
        assert_ne!(first.files[0].contents, second.files[0].contents);
    }

    #[tokio::test]
    async fn credentials_without_expiry_are_always_fresh() {
        let provider = FakeProvider::new(vec![None]);
        let store = CredentialStore::new();

        let first = store.get_or_fetch(&provider, "ref").await.unwrap();
        let second = store.get_or_fetch(&provider, "ref").await.unwrap();

        assert_eq!(provider.calls(), 1);
        assert!(first.not_after.is_none());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_key_fetch_once() {
        let provider = Arc::new(FakeProvider::new(vec![Some(Duration::from_secs(3600))]));
        let store = Arc::new(CredentialStore::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let provider = provider.clone();
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.get_or_fetch(provider.as_ref(), "ref").await.unwrap()
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }

        assert_eq!(provider.calls(), 1);
        assert!(results.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[tokio::test]
    async fn distinct_keys_fetch_independently_and_concurrently() {
        let provider = Arc::new(FakeProvider::new(Vec::new()));
        let store = Arc::new(CredentialStore::new());

        let mut handles = Vec::new();
        for i in 0..8 {
            let provider = provider.clone();
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .get_or_fetch(provider.as_ref(), &format!("ref-{i}"))
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(provider.calls(), 8);
        assert!(
            provider.max_in_flight.load(Ordering::SeqCst) > 1,
            "distinct keys should not serialize on each other"
        );
    }

    #[tokio::test]
    async fn provider_failure_keeps_stale_entry() {
        struct FlakyProvider {
            calls: AtomicUsize,
        }

        #[async_trait]
        impl Provider for FlakyProvider {
            fn name(&self) -> &str {
                "FlakyProvider"
            }
            async fn ping(&self) -> Result<(), ProviderError> {
                Ok(())
            }
            async fn get_credential(&self, _: &str) -> Result<Credential, ProviderError> {
                match self.calls.fetch_add(1, Ordering::SeqCst) {
                    // First call succeeds with an already-stale credential.
                    0 => Ok(Credential {
                        not_after: Some(prost_types::Timestamp::from(SystemTime::now())),
                        ..Default::default()
                    }),
                    1 => Err(ProviderError::Upstream("boom".to_string())),
                    _ => Ok(Credential::default()),
                }
            }
        }

        let provider = FlakyProvider {
            calls: AtomicUsize::new(0),
        };
        let store = CredentialStore::new();

        store.get_or_fetch(&provider, "ref").await.unwrap();
        // Stale entry triggers a refetch which fails; the error surfaces.
        let err = store.get_or_fetch(&provider, "ref").await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        // Next call retries the provider again rather than giving up.
        store.get_or_fetch(&provider, "ref").await.unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn freshness_window_is_five_minutes() {
        let now = SystemTime::now();
        let fresh = Credential {
            not_after: Some(prost_types::Timestamp::from(
                now + Duration::from_secs(6 * 60),
            )),
            ..Default::default()
        };
        let stale = Credential {
            not_after: Some(prost_types::Timestamp::from(
                now + Duration::from_secs(4 * 60),
            )),
            ..Default::default()
        };
        let no_expiry = Credential::default();

        assert!(is_fresh(&fresh, now));
        assert!(!is_fresh(&stale, now));
        assert!(is_fresh(&no_expiry, now));
    }
}
