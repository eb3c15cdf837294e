use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bf_buildlet::Buildlet;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::pool::{
    BuildletPool, CleanupBuildlet, PoolError, PoolStatus, Result, REAPER_INTERVAL, REAPER_TTL,
};

/// Cluster pod name limit. Names are truncated to fit before the random
/// suffix is appended.
const MAX_POD_NAME: usize = 61;

// ---------------------------------------------------------------------------
// ContainerLauncher — the cluster API, an external collaborator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PodInfo {
    pub name: String,
    pub created: DateTime<Utc>,
    /// Interactive gomote session pods are exempt from TTL deletion.
    pub gomote: bool,
}

#[async_trait]
pub trait ContainerLauncher: Send + Sync {
    async fn create_pod(
        &self,
        token: &CancellationToken,
        name: &str,
        host_type: &str,
    ) -> Result<Arc<dyn Buildlet>>;

    async fn delete_pod(&self, name: &str) -> Result<()>;

    async fn list_pods(&self) -> Result<Vec<PodInfo>>;
}

// ---------------------------------------------------------------------------
// ContainerPool
// ---------------------------------------------------------------------------

/// Pool of cluster-launched container buildlets.
pub struct ContainerPool {
    host_types: Vec<String>,
    launcher: Arc<dyn ContainerLauncher>,
    max_pods: usize,
    state: Arc<Mutex<ContainerPoolState>>,
}

#[derive(Default)]
struct ContainerPoolState {
    owned: HashSet<String>,
    creating: usize,
}

impl ContainerPool {
    pub fn new(
        host_types: Vec<String>,
        launcher: Arc<dyn ContainerLauncher>,
        max_pods: usize,
    ) -> Self {
        Self {
            host_types,
            launcher,
            max_pods,
            state: Arc::new(Mutex::new(ContainerPoolState::default())),
        }
    }

    /// Pod name: `buildlet-<host>-rnd<hex>`, truncated to the cluster's
    /// 61-character limit with the suffix kept intact.
    fn pod_name(host_type: &str) -> String {
        let suffix: u32 = rand::thread_rng().gen();
        let tail = format!("-rnd{suffix:08x}");
        let mut base = format!("buildlet-{host_type}");
        base.truncate(MAX_POD_NAME - tail.len());
        format!("{base}{tail}")
    }

    fn active_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.owned.len() + state.creating
    }

    /// Background reaper: deletes farm pods past the TTL that this process
    /// does not own, skipping gomote session pods.
    pub async fn run_reaper(self: Arc<Self>, token: CancellationToken) {
        let mut tick = tokio::time::interval(REAPER_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tick.tick() => {}
            }
            let pods = match self.launcher.list_pods().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "container reaper: listing pods failed");
                    continue;
                }
            };
            for pod in pods {
                if !pod.name.starts_with("buildlet-") || pod.gomote {
                    continue;
                }
                let age = Utc::now().signed_duration_since(pod.created);
                let expired = age.to_std().map(|d| d > REAPER_TTL).unwrap_or(false);
                let owned = self.state.lock().unwrap().owned.contains(&pod.name);
                if expired && !owned {
                    info!(pod = %pod.name, age_secs = age.num_seconds(), "reaping orphaned pod");
                    if let Err(e) = self.launcher.delete_pod(&pod.name).await {
                        warn!(pod = %pod.name, error = %e, "pod reap failed");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl BuildletPool for ContainerPool {
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
        {
            let mut state = self.state.lock().unwrap();
            if state.owned.len() + state.creating >= self.max_pods {
                return Err(PoolError::QuotaExhausted(host_type.to_string()));
            }
            state.creating += 1;
        }

        let name = Self::pod_name(host_type);
        info!(pod = %name, host_type, "creating container buildlet");
        let created = tokio::select! {
            _ = token.cancelled() => Err(PoolError::Canceled),
            res = self.launcher.create_pod(token, &name, host_type) => res,
        };

        {
            let mut state = self.state.lock().unwrap();
            state.creating -= 1;
            if created.is_ok() {
                state.owned.insert(name.clone());
            }
        }
        match created {
            Ok(buildlet) => {
                let launcher = self.launcher.clone();
                let pool_state = self.state.clone();
                Ok(Arc::new(CleanupBuildlet::new(buildlet, move || async move {
                    let newly_released = pool_state.lock().unwrap().owned.remove(&name);
                    if newly_released {
                        if let Err(e) = launcher.delete_pod(&name).await {
                            warn!(pod = %name, error = %e, "pod delete on close failed");
                        }
                    }
                })))
            }
            Err(e) => {
                if let Err(de) = self.launcher.delete_pod(&name).await {
                    warn!(pod = %name, error = %de, "cleanup after failed pod create");
                }
                Err(e)
            }
        }
    }

    fn has_capacity(&self, host_type: &str) -> bool {
        self.serves(host_type) && self.active_count() < self.max_pods
    }

    fn status(&self) -> PoolStatus {
        let state = self.state.lock().unwrap();
        PoolStatus {
            name: "container pool".to_string(),
            detail: vec![format!(
                "{} active, {} creating, {} max",
                state.owned.len(),
                state.creating,
                self.max_pods
            )],
        }
    }
}
