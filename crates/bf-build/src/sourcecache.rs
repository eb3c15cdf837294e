use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use bf_integrations::{IntegrationError, SourceClient};
use lru::LruCache;
use tokio::sync::{watch, Mutex};
use tracing::debug;

/// Compressed source tarballs kept in memory.
const CACHE_ENTRIES: usize = 40;

type Key = (String, String);
type FetchResult = Result<Arc<Vec<u8>>, IntegrationError>;

/// Small LRU of source tarballs keyed by `(repo, rev)`, with single-flight
/// deduplication: concurrent requests for the same key share one upstream
/// fetch. Thread-safe, lazy, finite.
pub struct SourceCache {
    client: Arc<dyn SourceClient>,
    state: Mutex<CacheState>,
}

struct CacheState {
    lru: LruCache<Key, Arc<Vec<u8>>>,
    inflight: HashMap<Key, watch::Receiver<Option<FetchResult>>>,
}

enum Role {
    Hit(Arc<Vec<u8>>),
    Leader(watch::Sender<Option<FetchResult>>),
    Follower(watch::Receiver<Option<FetchResult>>),
}

impl SourceCache {
    pub fn new(client: Arc<dyn SourceClient>) -> Self {
        Self {
            client,
            state: Mutex::new(CacheState {
                lru: LruCache::new(NonZeroUsize::new(CACHE_ENTRIES).expect("nonzero")),
                inflight: HashMap::new(),
            }),
        }
    }

    /// Get the tarball for `(repo, rev)`, fetching on miss.
    pub async fn get(&self, repo: &str, rev: &str) -> FetchResult {
        let key = (repo.to_string(), rev.to_string());
        let role = {
            let mut state = self.state.lock().await;
            if let Some(data) = state.lru.get(&key) {
                Role::Hit(data.clone())
            } else if let Some(rx) = state.inflight.get(&key) {
                Role::Follower(rx.clone())
            } else {
                let (tx, rx) = watch::channel(None);
                state.inflight.insert(key.clone(), rx);
                Role::Leader(tx)
            }
        };

        match role {
            Role::Hit(data) => Ok(data),
            Role::Follower(mut rx) => loop {
                if let Some(res) = rx.borrow().clone() {
                    return res;
                }
                if rx.changed().await.is_err() {
                    return Err(IntegrationError::Http(
                        "source fetch leader went away".to_string(),
                    ));
                }
            },
            Role::Leader(tx) => {
                debug!(repo, rev, "source cache miss, fetching");
                let res: FetchResult = self
                    .client
                    .fetch_tarball(repo, rev)
                    .await
                    .map(Arc::new);
                {
                    let mut state = self.state.lock().await;
                    state.inflight.remove(&key);
                    if let Ok(data) = &res {
                        state.lru.put(key, data.clone());
                    }
                }
                let _ = tx.send(Some(res.clone()));
                res
            }
        }
    }

    /// Entries currently cached, for the status page.
    pub async fn len(&self) -> usize {
        self.state.lock().await.lru.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bf_integrations::MemorySource;
    use std::time::Duration;

    #[tokio::test]
    async fn cache_hit_avoids_refetch() {
        let src = Arc::new(MemorySource::new());
        src.add_tarball("go", "abc", vec![1, 2, 3]);
        let cache = SourceCache::new(src.clone());

        assert_eq!(*cache.get("go", "abc").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(*cache.get("go", "abc").await.unwrap(), vec![1, 2, 3]);
        assert_eq!(src.fetches("go", "abc"), 1);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let src = Arc::new(MemorySource::new());
        let cache = SourceCache::new(src.clone());

        assert!(cache.get("go", "missing").await.is_err());
        src.add_tarball("go", "missing", vec![9]);
        assert_eq!(*cache.get("go", "missing").await.unwrap(), vec![9]);
        assert_eq!(src.fetches("go", "missing"), 2);
    }

    /// Source client that blocks until released, counting fetches.
    struct SlowSource {
        inner: MemorySource,
        gate: tokio::sync::Semaphore,
    }

    #[async_trait::async_trait]
    impl SourceClient for SlowSource {
        async fn fetch_tarball(
            &self,
            repo: &str,
            rev: &str,
        ) -> Result<Vec<u8>, IntegrationError> {
            let _permit = self.gate.acquire().await.expect("gate closed");
            self.inner.fetch_tarball(repo, rev).await
        }

        async fn has_ancestor(
            &self,
            repo: &str,
            rev: &str,
            ancestor: &str,
        ) -> Result<bool, IntegrationError> {
            self.inner.has_ancestor(repo, rev, ancestor).await
        }
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_fetch() {
        let slow = Arc::new(SlowSource {
            inner: MemorySource::new(),
            gate: tokio::sync::Semaphore::new(0),
        });
        slow.inner.add_tarball("go", "abc", vec![7]);
        let cache = Arc::new(SourceCache::new(slow.clone()));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            handles.push(tokio::spawn(
                async move { cache.get("go", "abc").await },
            ));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        slow.gate.add_permits(5);

        for h in handles {
            assert_eq!(*h.await.unwrap().unwrap(), vec![7]);
        }
        // All five requests collapsed into one upstream fetch.
        assert_eq!(slow.inner.fetches("go", "abc"), 1);
    }

    #[tokio::test]
    async fn lru_evicts_past_capacity() {
        let src = Arc::new(MemorySource::new());
        for i in 0..=CACHE_ENTRIES {
            src.add_tarball("go", &format!("rev{i}"), vec![i as u8]);
        }
        let cache = SourceCache::new(src.clone());
        for i in 0..=CACHE_ENTRIES {
            cache.get("go", &format!("rev{i}")).await.unwrap();
        }
        assert_eq!(cache.len().await, CACHE_ENTRIES);
        // rev0 was evicted; fetching it again hits upstream.
        cache.get("go", "rev0").await.unwrap();
        assert_eq!(src.fetches("go", "rev0"), 2);
    }
}
