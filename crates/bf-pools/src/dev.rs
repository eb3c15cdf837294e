use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bf_buildlet::{Buildlet, FakeBuildlet};
use tokio_util::sync::CancellationToken;

use crate::pool::{BuildletPool, CleanupBuildlet, PoolError, PoolStatus, Result};

/// Dev-mode pool: hands out in-memory [`FakeBuildlet`]s whose execs all
/// succeed. Lets the whole coordinator run on a laptop with no cloud or
/// cluster credentials; also the pool most tests wire in.
pub struct DevPool {
    host_types: Vec<String>,
    capacity: usize,
    active: Arc<AtomicUsize>,
    counter: AtomicUsize,
}

impl DevPool {
    pub fn new(host_types: Vec<String>, capacity: usize) -> Self {
        Self {
            host_types,
            capacity,
            active: Arc::new(AtomicUsize::new(0)),
            counter: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BuildletPool for DevPool {
    fn serves(&self, host_type: &str) -> bool {
        self.host_types.iter().any(|h| h == host_type)
    }

    async fn get(
        &self,
        token: &CancellationToken,
        host_type: &str,
    ) -> Result<Arc<dyn Buildlet>> {
        if !self.serves(host_type) {
            return Err(PoolError::UnknownHostType(host_type.to_string()));
        }
        if token.is_cancelled() {
            return Err(PoolError::Canceled);
        }
        let prev = self.active.fetch_add(1, Ordering::SeqCst);
        if prev >= self.capacity {
            self.active.fetch_sub(1, Ordering::SeqCst);
            return Err(PoolError::QuotaExhausted(host_type.to_string()));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let inner: Arc<dyn Buildlet> =
            Arc::new(FakeBuildlet::new(format!("dev-{host_type}-{n}"), host_type));
        let active = self.active.clone();
        Ok(Arc::new(CleanupBuildlet::new(inner, move || async move {
            active.fetch_sub(1, Ordering::SeqCst);
        })))
    }

    fn has_capacity(&self, host_type: &str) -> bool {
        self.serves(host_type) && self.active.load(Ordering::SeqCst) < self.capacity
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            name: "dev pool".to_string(),
            detail: vec![format!(
                "{} active, {} max",
                self.active.load(Ordering::SeqCst),
                self.capacity
            )],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capacity_is_enforced_and_recovered() {
        let pool = DevPool::new(vec!["host-linux".to_string()], 1);
        let token = CancellationToken::new();

        let b = pool.get(&token, "host-linux").await.unwrap();
        assert!(!pool.has_capacity("host-linux"));
        assert!(matches!(
            pool.get(&token, "host-linux").await,
            Err(PoolError::QuotaExhausted(_))
        ));

        b.close().await;
        assert!(pool.has_capacity("host-linux"));
        assert!(pool.get(&token, "host-linux").await.is_ok());
    }

    #[tokio::test]
    async fn names_are_unique() {
        let pool = DevPool::new(vec!["host-linux".to_string()], 4);
        let token = CancellationToken::new();
        let a = pool.get(&token, "host-linux").await.unwrap();
        let b = pool.get(&token, "host-linux").await.unwrap();
        assert_ne!(a.name(), b.name());
    }
}
