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

// ---------------------------------------------------------------------------
// VmLauncher — the cloud API, an external collaborator
// ---------------------------------------------------------------------------

/// One instance as reported by the cloud API.
#[derive(Debug, Clone)]
pub struct VmInstance {
    pub name: String,
    pub created: DateTime<Utc>,
}

/// Cloud instance CRUD. Real implementations talk to a provider API;
/// tests and dev mode plug in fakes.
#[async_trait]
pub trait VmLauncher: Send + Sync {
    /// Create an instance booting the pre-warmed buildlet image for
    /// `host_type` and wait until its agent answers.
    async fn create_instance(
        &self,
        token: &CancellationToken,
        name: &str,
        host_type: &str,
    ) -> Result<Arc<dyn Buildlet>>;

    async fn destroy_instance(&self, name: &str) -> Result<()>;

    async fn list_instances(&self) -> Result<Vec<VmInstance>>;
}

// ---------------------------------------------------------------------------
// VmPool
// ---------------------------------------------------------------------------

/// Pool of ephemeral cloud VMs.
///
/// Instance names are deterministic (`buildlet-<host>-rnd<suffix>`) so the
/// reaper can recognize farm instances, and each creation is recorded so it
/// can tell this coordinator's instances from orphans left by a previous
/// process. Closing a handle terminates the instance.
pub struct VmPool {
    host_types: Vec<String>,
    launcher: Arc<dyn VmLauncher>,
    max_instances: usize,
    state: Arc<Mutex<VmPoolState>>,
}

#[derive(Default)]
struct VmPoolState {
    /// Names this process created and has not yet destroyed.
    owned: HashSet<String>,
    /// Creations in flight, counted toward capacity before a name exists.
    creating: usize,
}

const VM_NAME_PREFIX: &str = "buildlet";

impl VmPool {
    pub fn new(
        host_types: Vec<String>,
        launcher: Arc<dyn VmLauncher>,
        max_instances: usize,
    ) -> Self {
        Self {
            host_types,
            launcher,
            max_instances,
            state: Arc::new(Mutex::new(VmPoolState::default())),
        }
    }

    fn instance_name(host_type: &str) -> String {
        let suffix: u64 = rand::thread_rng().gen();
        format!("{VM_NAME_PREFIX}-{host_type}-rnd{suffix:08x}")
    }

    fn active_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.owned.len() + state.creating
    }

    /// Whether an instance name looks like a farm buildlet at all.
    fn is_farm_instance(name: &str) -> bool {
        name.starts_with(VM_NAME_PREFIX)
    }

    /// Background reaper: destroys farm instances this process does not own
    /// once they exceed the TTL. Runs until the token fires.
    pub async fn run_reaper(self: Arc<Self>, token: CancellationToken) {
        let mut tick = tokio::time::interval(REAPER_INTERVAL);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tick.tick() => {}
            }
            let instances = match self.launcher.list_instances().await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "vm reaper: listing instances failed");
                    continue;
                }
            };
            for inst in instances {
                if !Self::is_farm_instance(&inst.name) {
                    continue;
                }
                let age = Utc::now().signed_duration_since(inst.created);
                let expired = age.to_std().map(|d| d > REAPER_TTL).unwrap_or(false);
                let owned = self.state.lock().unwrap().owned.contains(&inst.name);
                if expired && !owned {
                    info!(instance = %inst.name, age_secs = age.num_seconds(), "reaping orphaned vm");
                    if let Err(e) = self.launcher.destroy_instance(&inst.name).await {
                        warn!(instance = %inst.name, error = %e, "vm reap failed");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl BuildletPool for VmPool {
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
            if state.owned.len() + state.creating >= self.max_instances {
                return Err(PoolError::QuotaExhausted(host_type.to_string()));
            }
            state.creating += 1;
        }

        let name = Self::instance_name(host_type);
        info!(instance = %name, host_type, "creating vm buildlet");
        let created = tokio::select! {
            _ = token.cancelled() => Err(PoolError::Canceled),
            res = self.launcher.create_instance(token, &name, host_type) => res,
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
                        if let Err(e) = launcher.destroy_instance(&name).await {
                            warn!(instance = %name, error = %e, "instance destroy on close failed");
                        }
                    }
                })))
            }
            Err(e) => {
                // The instance may half-exist; destroy best-effort.
                if let Err(de) = self.launcher.destroy_instance(&name).await {
                    warn!(instance = %name, error = %de, "cleanup after failed create");
                }
                Err(e)
            }
        }
    }

    fn has_capacity(&self, host_type: &str) -> bool {
        self.serves(host_type) && self.active_count() < self.max_instances
    }

    fn status(&self) -> PoolStatus {
        let state = self.state.lock().unwrap();
        PoolStatus {
            name: "vm pool".to_string(),
            detail: vec![format!(
                "{} active, {} creating, {} max",
                state.owned.len(),
                state.creating,
                self.max_instances
            )],
        }
    }
}
