use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{IntegrationError, Result};

/// Largest source tarball the coordinator will accept. A response beyond
/// this is treated as corrupt rather than buffered.
pub const MAX_TARBALL_BYTES: usize = 25 << 20;

const MIRROR_ATTEMPTS: usize = 10;
const MIRROR_RETRY_DELAY: Duration = Duration::from_secs(6);
const MIRROR_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// SourceClient
// ---------------------------------------------------------------------------

/// Source hosting: revision archives plus history queries.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Fetch `repo` at `rev` as a gzipped tarball.
    async fn fetch_tarball(&self, repo: &str, rev: &str) -> Result<Vec<u8>>;

    /// Whether `ancestor` is in the history of `rev` in `repo`.
    async fn has_ancestor(&self, repo: &str, rev: &str, ancestor: &str) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Fetches from the in-cluster mirror first (several short attempts, since
/// the mirror may still be syncing a young revision), then falls back to
/// the upstream archive endpoint.
pub struct HttpSourceClient {
    mirror_base: String,
    upstream_base: String,
    http: reqwest::Client,
}

impl HttpSourceClient {
    pub fn new(mirror_base: impl Into<String>, upstream_base: impl Into<String>) -> Self {
        Self {
            mirror_base: mirror_base.into(),
            upstream_base: upstream_base.into(),
            http: reqwest::Client::new(),
        }
    }

    async fn fetch_checked(&self, url: &str, timeout: Option<Duration>) -> Result<Vec<u8>> {
        let mut req = self.http.get(url);
        if let Some(t) = timeout {
            req = req.timeout(t);
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(IntegrationError::Status(resp.status().as_u16(), url.to_string()));
        }
        if let Some(len) = resp.content_length() {
            if len as usize > MAX_TARBALL_BYTES {
                return Err(IntegrationError::TooLarge(len as usize, MAX_TARBALL_BYTES));
            }
        }
        let body = resp.bytes().await?.to_vec();
        if body.len() > MAX_TARBALL_BYTES {
            return Err(IntegrationError::TooLarge(body.len(), MAX_TARBALL_BYTES));
        }
        Ok(body)
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn fetch_tarball(&self, repo: &str, rev: &str) -> Result<Vec<u8>> {
        let mirror_url = format!("{}/{}.tar.gz?rev={}", self.mirror_base, repo, rev);
        for attempt in 1..=MIRROR_ATTEMPTS {
            match self.fetch_checked(&mirror_url, Some(MIRROR_ATTEMPT_TIMEOUT)).await {
                Ok(body) => {
                    debug!(repo, rev, attempt, "source fetched from mirror");
                    return Ok(body);
                }
                Err(IntegrationError::TooLarge(got, max)) => {
                    return Err(IntegrationError::TooLarge(got, max));
                }
                Err(e) => {
                    debug!(repo, rev, attempt, error = %e, "mirror fetch attempt failed");
                }
            }
            if attempt < MIRROR_ATTEMPTS {
                tokio::time::sleep(MIRROR_RETRY_DELAY).await;
            }
        }

        warn!(repo, rev, "mirror exhausted, falling back to upstream archive");
        let upstream_url = format!("{}/{}/+archive/{}.tar.gz", self.upstream_base, repo, rev);
        self.fetch_checked(&upstream_url, None).await
    }

    async fn has_ancestor(&self, repo: &str, rev: &str, ancestor: &str) -> Result<bool> {
        let url = format!(
            "{}/{}/ancestor?rev={}&ancestor={}",
            self.upstream_base, repo, rev, ancestor
        );
        let resp = self.http.get(&url).send().await?;
        match resp.status().as_u16() {
            200 => Ok(true),
            404 => Ok(false),
            code => Err(IntegrationError::Status(code, url)),
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemorySource {
    tarballs: Mutex<HashMap<(String, String), Vec<u8>>>,
    ancestries: Mutex<HashMap<(String, String), Vec<String>>>,
    fetch_count: Mutex<HashMap<(String, String), usize>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tarball(&self, repo: &str, rev: &str, data: Vec<u8>) {
        self.tarballs
            .lock()
            .unwrap()
            .insert((repo.to_string(), rev.to_string()), data);
    }

    pub fn set_ancestors(&self, repo: &str, rev: &str, ancestors: Vec<String>) {
        self.ancestries
            .lock()
            .unwrap()
            .insert((repo.to_string(), rev.to_string()), ancestors);
    }

    /// How many times a tarball was fetched, for cache-behavior assertions.
    pub fn fetches(&self, repo: &str, rev: &str) -> usize {
        self.fetch_count
            .lock()
            .unwrap()
            .get(&(repo.to_string(), rev.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl SourceClient for MemorySource {
    async fn fetch_tarball(&self, repo: &str, rev: &str) -> Result<Vec<u8>> {
        let key = (repo.to_string(), rev.to_string());
        *self.fetch_count.lock().unwrap().entry(key.clone()).or_insert(0) += 1;
        self.tarballs
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| IntegrationError::NotFound(format!("{repo}@{rev}")))
    }

    async fn has_ancestor(&self, repo: &str, rev: &str, ancestor: &str) -> Result<bool> {
        Ok(self
            .ancestries
            .lock()
            .unwrap()
            .get(&(repo.to_string(), rev.to_string()))
            .map(|a| a.iter().any(|x| x == ancestor))
            .unwrap_or(false))
    }
}
