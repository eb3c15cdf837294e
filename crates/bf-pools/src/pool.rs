use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bf_buildlet::Buildlet;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Resources older than this that a pool does not recognize are reaped.
/// After a coordinator restart, everything the previous process created
/// falls into this bucket.
pub const REAPER_TTL: Duration = Duration::from_secs(45 * 60);

/// How often reapers sweep.
pub const REAPER_INTERVAL: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("no pool serves host type {0:?}")]
    UnknownHostType(String),
    #[error("quota exhausted for host type {0:?}")]
    QuotaExhausted(String),
    #[error("timed out acquiring buildlet")]
    TimedOut,
    #[error("acquisition canceled")]
    Canceled,
    /// Retryable infrastructure hiccup. Retry policy belongs to the caller.
    #[error("transient pool error: {0}")]
    Transient(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;

// ---------------------------------------------------------------------------
// BuildletPool
// ---------------------------------------------------------------------------

/// A source of ready-to-use buildlets for some set of host types.
#[async_trait]
pub trait BuildletPool: Send + Sync {
    /// Whether this pool is the one that serves `host_type`.
    fn serves(&self, host_type: &str) -> bool;

    /// Produce a ready buildlet. May block on resource creation; must
    /// return `Canceled` promptly when the token fires.
    async fn get(
        &self,
        token: &CancellationToken,
        host_type: &str,
    ) -> Result<Arc<dyn Buildlet>>;

    /// Fast, conservative capacity probe. `false` under uncertainty.
    fn has_capacity(&self, host_type: &str) -> bool;

    /// Operational description for the status page.
    fn status(&self) -> PoolStatus;
}

/// Status-page view of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub name: String,
    pub detail: Vec<String>,
}

// ---------------------------------------------------------------------------
// CleanupBuildlet
// ---------------------------------------------------------------------------

type CleanupFn = Box<dyn FnOnce() -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> + Send>;

/// Wrapper that runs a pool-supplied cleanup exactly once when the handle is
/// closed. The VM and container pools use it to terminate the underlying
/// resource and return capacity; the reverse pool uses the detached variant,
/// whose cleanup returns the still-live connection to the idle set. Repeated
/// closes are no-ops.
pub struct CleanupBuildlet {
    inner: Arc<dyn Buildlet>,
    close_inner: bool,
    cleanup: std::sync::Mutex<Option<CleanupFn>>,
}

impl CleanupBuildlet {
    /// Cleanup plus closing the wrapped handle.
    pub fn new<F, Fut>(inner: Arc<dyn Buildlet>, cleanup: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            inner,
            close_inner: true,
            cleanup: std::sync::Mutex::new(Some(Box::new(move || Box::pin(cleanup())))),
        }
    }

    /// Cleanup only; the wrapped handle outlives the lease.
    pub fn detached<F, Fut>(inner: Arc<dyn Buildlet>, cleanup: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            inner,
            close_inner: false,
            cleanup: std::sync::Mutex::new(Some(Box::new(move || Box::pin(cleanup())))),
        }
    }
}

#[async_trait]
impl Buildlet for CleanupBuildlet {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn host_type(&self) -> &str {
        self.inner.host_type()
    }

    fn ip_port(&self) -> String {
        self.inner.ip_port()
    }

    async fn work_dir(
        &self,
        token: &CancellationToken,
    ) -> std::result::Result<String, bf_buildlet::CommError> {
        self.inner.work_dir(token).await
    }

    async fn put_tar(
        &self,
        token: &CancellationToken,
        tar_gz: Vec<u8>,
        dest: &str,
    ) -> std::result::Result<(), bf_buildlet::CommError> {
        self.inner.put_tar(token, tar_gz, dest).await
    }

    async fn put_tar_from_url(
        &self,
        token: &CancellationToken,
        url: &str,
        dest: &str,
    ) -> std::result::Result<(), bf_buildlet::CommError> {
        self.inner.put_tar_from_url(token, url, dest).await
    }

    async fn get_tar(
        &self,
        token: &CancellationToken,
        dir: &str,
    ) -> std::result::Result<Vec<u8>, bf_buildlet::CommError> {
        self.inner.get_tar(token, dir).await
    }

    async fn exec(
        &self,
        token: &CancellationToken,
        cmd: &str,
        opts: bf_buildlet::ExecOpts,
        output: flume::Sender<Vec<u8>>,
    ) -> std::result::Result<bf_buildlet::ExecOutcome, bf_buildlet::CommError> {
        self.inner.exec(token, cmd, opts, output).await
    }

    async fn list_dir(
        &self,
        token: &CancellationToken,
        dir: &str,
    ) -> std::result::Result<Vec<bf_buildlet::DirEntry>, bf_buildlet::CommError> {
        self.inner.list_dir(token, dir).await
    }

    async fn remove_all(
        &self,
        token: &CancellationToken,
        paths: &[String],
    ) -> std::result::Result<(), bf_buildlet::CommError> {
        self.inner.remove_all(token, paths).await
    }

    fn mark_broken(&self) {
        self.inner.mark_broken();
    }

    fn is_broken(&self) -> bool {
        self.inner.is_broken()
    }

    async fn close(&self) {
        let cleanup = self.cleanup.lock().expect("cleanup lock poisoned").take();
        if cleanup.is_none() {
            return;
        }
        if self.close_inner {
            self.inner.close().await;
        }
        if let Some(cleanup) = cleanup {
            cleanup().await;
        }
    }
}

// ---------------------------------------------------------------------------
// PoolSet
// ---------------------------------------------------------------------------

/// The pluggable set of pools, itself a [`BuildletPool`] that routes each
/// host type to the first member pool serving it.
pub struct PoolSet {
    pools: Vec<Arc<dyn BuildletPool>>,
}

impl PoolSet {
    pub fn new(pools: Vec<Arc<dyn BuildletPool>>) -> Self {
        Self { pools }
    }

    fn route(&self, host_type: &str) -> Option<&Arc<dyn BuildletPool>> {
        self.pools.iter().find(|p| p.serves(host_type))
    }

    /// Statuses of every member pool, for the status page.
    pub fn statuses(&self) -> Vec<PoolStatus> {
        self.pools.iter().map(|p| p.status()).collect()
    }
}

#[async_trait]
impl BuildletPool for PoolSet {
    fn serves(&self, host_type: &str) -> bool {
        self.route(host_type).is_some()
    }

    async fn get(
        &self,
        token: &CancellationToken,
        host_type: &str,
    ) -> Result<Arc<dyn Buildlet>> {
        match self.route(host_type) {
            Some(pool) => pool.get(token, host_type).await,
            None => Err(PoolError::UnknownHostType(host_type.to_string())),
        }
    }

    fn has_capacity(&self, host_type: &str) -> bool {
        self.route(host_type)
            .map(|p| p.has_capacity(host_type))
            .unwrap_or(false)
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            name: "all pools".to_string(),
            detail: self
                .statuses()
                .into_iter()
                .flat_map(|s| {
                    std::iter::once(s.name).chain(s.detail.into_iter().map(|d| format!("  {d}")))
                })
                .collect(),
        }
    }
}
