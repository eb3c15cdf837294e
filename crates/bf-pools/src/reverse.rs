use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bf_buildlet::Buildlet;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::pool::{BuildletPool, CleanupBuildlet, PoolError, PoolStatus, Result};

// ---------------------------------------------------------------------------
// ReversePool
// ---------------------------------------------------------------------------

/// Registry of worker-initiated connections.
///
/// The pool never creates anything: capacity equals connected idle workers.
/// The reverse-dial listener registers each worker after its handshake;
/// `get` claims one atomically and the lease returns it to the idle set on
/// close, unless the worker was marked broken mid-build, in which case the
/// connection is dropped for real.
pub struct ReversePool {
    /// Host types routed here even before any worker has dialed in.
    static_hosts: Vec<String>,
    state: Arc<Mutex<ReverseState>>,
    /// One permit per registration/release, pairing a freed worker with one
    /// waiter.
    notify: Arc<Notify>,
}

#[derive(Default)]
struct ReverseState {
    idle: HashMap<String, Vec<RegisteredWorker>>,
    busy: HashMap<String, usize>,
}

struct RegisteredWorker {
    buildlet: Arc<dyn Buildlet>,
    registered: DateTime<Utc>,
}

/// `/status/reverse.json` payload.
#[derive(Debug, Clone, Serialize)]
pub struct ReverseReport {
    pub host_types: Vec<ReverseHostReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReverseHostReport {
    pub host_type: String,
    pub idle: Vec<String>,
    pub busy: usize,
}

impl ReversePool {
    pub fn new() -> Self {
        Self::with_host_types(Vec::new())
    }

    pub fn with_host_types(static_hosts: Vec<String>) -> Self {
        Self {
            static_hosts,
            state: Arc::new(Mutex::new(ReverseState::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Add a freshly handshaken worker connection to the idle set.
    pub fn register(&self, buildlet: Arc<dyn Buildlet>) {
        let host_type = buildlet.host_type().to_string();
        info!(worker = %buildlet.name(), host_type = %host_type, "reverse worker registered");
        self.state
            .lock()
            .unwrap()
            .idle
            .entry(host_type)
            .or_default()
            .push(RegisteredWorker {
                buildlet,
                registered: Utc::now(),
            });
        self.notify.notify_one();
    }

    fn try_claim(&self, host_type: &str) -> Option<Arc<dyn Buildlet>> {
        let mut state = self.state.lock().unwrap();
        let workers = state.idle.get_mut(host_type)?;
        let worker = workers.pop()?;
        *state.busy.entry(host_type.to_string()).or_insert(0) += 1;
        Some(worker.buildlet)
    }

    pub fn report(&self) -> ReverseReport {
        let state = self.state.lock().unwrap();
        let mut hosts: Vec<String> = state
            .idle
            .keys()
            .chain(state.busy.keys())
            .cloned()
            .collect();
        hosts.sort();
        hosts.dedup();
        ReverseReport {
            host_types: hosts
                .into_iter()
                .map(|h| ReverseHostReport {
                    idle: state
                        .idle
                        .get(&h)
                        .map(|v| v.iter().map(|w| w.buildlet.name().to_string()).collect())
                        .unwrap_or_default(),
                    busy: state.busy.get(&h).copied().unwrap_or(0),
                    host_type: h,
                })
                .collect(),
        }
    }

    /// Longest-registered idle worker age, for health checks.
    pub fn oldest_idle_age(&self) -> Option<chrono::Duration> {
        let state = self.state.lock().unwrap();
        state
            .idle
            .values()
            .flatten()
            .map(|w| Utc::now().signed_duration_since(w.registered))
            .max()
    }
}

impl Default for ReversePool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BuildletPool for ReversePool {
    fn serves(&self, host_type: &str) -> bool {
        if self.static_hosts.iter().any(|h| h == host_type) {
            return true;
        }
        // Beyond the static set, serve whatever workers have dialed in as.
        let state = self.state.lock().unwrap();
        state.idle.contains_key(host_type) || state.busy.contains_key(host_type)
    }

    async fn get(
        &self,
        token: &CancellationToken,
        host_type: &str,
    ) -> Result<Arc<dyn Buildlet>> {
        loop {
            if let Some(buildlet) = self.try_claim(host_type) {
                let state = self.state.clone();
                let notify = self.notify.clone();
                let lease_inner = buildlet.clone();
                let pool = ReleaseHandle { state, notify };
                return Ok(Arc::new(CleanupBuildlet::detached(
                    buildlet,
                    move || async move {
                        pool.release(lease_inner);
                    },
                )));
            }
            tokio::select! {
                _ = token.cancelled() => return Err(PoolError::Canceled),
                _ = self.notify.notified() => {}
            }
        }
    }

    fn has_capacity(&self, host_type: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .idle
            .get(host_type)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    fn status(&self) -> PoolStatus {
        let report = self.report();
        PoolStatus {
            name: "reverse pool".to_string(),
            detail: report
                .host_types
                .iter()
                .map(|h| format!("{}: {} idle, {} busy", h.host_type, h.idle.len(), h.busy))
                .collect(),
        }
    }
}

/// Release path shared with the lease closure; mirrors [`ReversePool::release`]
/// without holding the whole pool.
struct ReleaseHandle {
    state: Arc<Mutex<ReverseState>>,
    notify: Arc<Notify>,
}

impl ReleaseHandle {
    fn release(&self, buildlet: Arc<dyn Buildlet>) {
        let broken = buildlet.is_broken();
        let host_type = buildlet.host_type().to_string();
        let mut state = self.state.lock().unwrap();
        if let Some(busy) = state.busy.get_mut(&host_type) {
            *busy = busy.saturating_sub(1);
        }
        if broken {
            warn!(worker = %buildlet.name(), "dropping broken reverse worker");
            return;
        }
        state.idle.entry(host_type).or_default().push(RegisteredWorker {
            buildlet,
            registered: Utc::now(),
        });
        drop(state);
        self.notify.notify_one();
    }
}
