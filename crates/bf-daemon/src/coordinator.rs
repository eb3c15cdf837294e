use std::sync::Arc;

use anyhow::{Context, Result};
use bf_build::registry::BuildRegistry;
use bf_build::runner::RunnerDeps;
use bf_build::shard::DurationTable;
use bf_build::snapshot::SnapshotStore;
use bf_build::sourcecache::SourceCache;
use bf_build::TrySetManager;
use bf_core::builders::BuilderCatalog;
use bf_core::config::{EnvConfig, Flags, Mode};
use bf_pools::container::{ContainerLauncher, ContainerPool};
use bf_pools::dev::DevPool;
use bf_pools::reverse::ReversePool;
use bf_pools::vm::{VmInstance, VmLauncher, VmPool};
use bf_pools::{BuildletPool, PoolSet};
use bf_sched::Scheduler;
use bf_status::server::{GomoteState, StatusState};
use bf_status::{status_router, FnChecker, GomoteAuth, HealthRegistry};
use bf_status::health::CheckResult;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::discovery::Discovery;

/// Host types served by worker-initiated (reverse) connections; everything
/// else in the catalog is pool-created.
const REVERSE_HOST_TYPES: &[&str] = &[
    "host-darwin",
    "host-plan9",
    "host-plan9-arm",
    "host-linux-arm",
];

/// Host types that run as cluster pods rather than whole VMs.
const CONTAINER_HOST_TYPES: &[&str] = &["host-js-wasm"];

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// The external-service clients the coordinator consumes. Dev mode wires
/// in-memory fakes; prod mode wires the HTTP clients from the environment
/// config. Cloud VM/container launchers are deployment-specific and are
/// injected here too.
#[derive(Clone)]
pub struct Collaborators {
    pub dashboard: Arc<dyn bf_integrations::DashboardClient>,
    pub review: Arc<dyn bf_integrations::ReviewClient>,
    pub storage: Arc<dyn bf_integrations::ObjectStore>,
    pub source: Arc<dyn bf_integrations::SourceClient>,
    pub vm_launcher: Option<Arc<dyn VmLauncher>>,
    pub container_launcher: Option<Arc<dyn ContainerLauncher>>,
}

impl Collaborators {
    /// Everything in memory: a coordinator that runs on a laptop.
    pub fn dev() -> Self {
        Self {
            dashboard: Arc::new(bf_integrations::MemoryDashboard::new()),
            review: Arc::new(bf_integrations::MemoryReview::new()),
            storage: Arc::new(bf_integrations::MemoryObjectStore::new()),
            source: Arc::new(bf_integrations::MemorySource::new()),
            vm_launcher: Some(Arc::new(DevVmLauncher::default())),
            container_launcher: None,
        }
    }

    /// HTTP clients against the configured endpoints. The VM launcher is
    /// deployment-specific and must be supplied by the operator's build.
    pub fn prod(env: &EnvConfig) -> Self {
        Self {
            dashboard: Arc::new(bf_integrations::HttpDashboardClient::new(&env.dashboard_url)),
            review: Arc::new(bf_integrations::HttpReviewClient::new(&env.review_url)),
            storage: Arc::new(bf_integrations::HttpObjectStore::new(&env.upstream_url)),
            source: Arc::new(bf_integrations::HttpSourceClient::new(
                &env.mirror_url,
                &env.upstream_url,
            )),
            vm_launcher: None,
            container_launcher: None,
        }
    }
}

/// Dev VM launcher: "instances" are in-memory fake buildlets, so the VM
/// pool's naming, capacity, and reaper plumbing can be exercised locally.
#[derive(Default)]
struct DevVmLauncher {
    instances: std::sync::Mutex<Vec<VmInstance>>,
}

#[async_trait::async_trait]
impl VmLauncher for DevVmLauncher {
    async fn create_instance(
        &self,
        _token: &CancellationToken,
        name: &str,
        host_type: &str,
    ) -> std::result::Result<Arc<dyn bf_buildlet::Buildlet>, bf_pools::PoolError> {
        self.instances.lock().unwrap().push(VmInstance {
            name: name.to_string(),
            created: Utc::now(),
        });
        Ok(Arc::new(bf_buildlet::FakeBuildlet::new(name, host_type)))
    }

    async fn destroy_instance(&self, name: &str) -> std::result::Result<(), bf_pools::PoolError> {
        self.instances.lock().unwrap().retain(|i| i.name != name);
        Ok(())
    }

    async fn list_instances(
        &self,
    ) -> std::result::Result<Vec<VmInstance>, bf_pools::PoolError> {
        Ok(self.instances.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// The whole control plane as one explicit value: registry, scheduler,
/// pools, caches, try map, clients, start time. Built once at startup and
/// handed to every subsystem; tests construct fresh ones.
pub struct Coordinator {
    pub catalog: Arc<BuilderCatalog>,
    pub registry: Arc<BuildRegistry>,
    pub scheduler: Arc<Scheduler>,
    pub pools: Arc<PoolSet>,
    pub reverse: Arc<ReversePool>,
    pub deps: Arc<RunnerDeps>,
    pub tries: Arc<TrySetManager>,
    pub shutdown: CancellationToken,
    pub status: Arc<StatusState>,
    vm_pool: Option<Arc<VmPool>>,
    container_pool: Option<Arc<ContainerPool>>,
    environment: String,
}

impl Coordinator {
    pub fn new(flags: &Flags, env: EnvConfig, collab: Collaborators) -> Result<Self> {
        flags.validate()?;

        let catalog = Arc::new(BuilderCatalog::default());
        let shutdown = CancellationToken::new();

        // Pool wiring: reverse hosts always; VM-backed hosts when a
        // launcher exists; dev mode covers the remainder with fakes.
        let reverse = Arc::new(ReversePool::with_host_types(
            REVERSE_HOST_TYPES.iter().map(|s| s.to_string()).collect(),
        ));
        let mut pools: Vec<Arc<dyn BuildletPool>> = vec![reverse.clone()];

        let created_hosts: Vec<String> = catalog
            .all()
            .iter()
            .map(|b| b.host_type.clone())
            .filter(|h| !REVERSE_HOST_TYPES.contains(&h.as_str()))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        let container_hosts: Vec<String> = created_hosts
            .iter()
            .filter(|h| CONTAINER_HOST_TYPES.contains(&h.as_str()))
            .cloned()
            .collect();
        let vm_hosts: Vec<String> = created_hosts
            .iter()
            .filter(|h| !CONTAINER_HOST_TYPES.contains(&h.as_str()))
            .cloned()
            .collect();

        let mut container_pool = None;
        if let Some(launcher) = collab.container_launcher.clone() {
            let pool = Arc::new(ContainerPool::new(container_hosts, launcher, 20));
            pools.push(pool.clone());
            container_pool = Some(pool);
        }

        let mut vm_pool = None;
        let vm_enabled = flags.mode == Mode::Prod || flags.dev_enable_vm_pool;
        if vm_enabled {
            if let Some(launcher) = collab.vm_launcher.clone() {
                let pool = Arc::new(VmPool::new(vm_hosts, launcher, 20));
                pools.push(pool.clone());
                vm_pool = Some(pool);
            }
        }
        if flags.mode == Mode::Dev {
            // Whatever no other pool serves, the dev pool picks up.
            pools.push(Arc::new(DevPool::new(created_hosts, 16)));
        }
        let pools = Arc::new(PoolSet::new(pools));

        let scheduler = Scheduler::new(pools.clone(), shutdown.clone());
        let registry = Arc::new(BuildRegistry::new());
        let snapshots = Arc::new(SnapshotStore::new(
            collab.storage.clone(),
            env.snapshot_bucket.clone(),
        ));

        let deps = Arc::new(RunnerDeps {
            scheduler: scheduler.clone(),
            registry: registry.clone(),
            sources: Arc::new(SourceCache::new(collab.source.clone())),
            source_client: collab.source.clone(),
            snapshots,
            dashboard: collab.dashboard.clone(),
            logs: collab.storage.clone(),
            durations: Arc::new(DurationTable::new()),
            env: env.clone(),
        });

        let tries = TrySetManager::new(deps.clone(), collab.review.clone(), catalog.clone());

        let gomote = match flags.mode {
            Mode::Prod => {
                let path = flags
                    .master_key_file
                    .as_ref()
                    .expect("validated: prod has a master key");
                let key = std::fs::read(path)
                    .with_context(|| format!("reading master key {}", path.display()))?;
                Some(GomoteState::new(GomoteAuth::new(&key)))
            }
            Mode::Dev => Some(GomoteState::new(GomoteAuth::new(b"dev-master-key"))),
        };

        let mut health = HealthRegistry::new();
        {
            let reverse = reverse.clone();
            health.register(FnChecker::new("reverse", "Reverse fleet", move || {
                let report = reverse.report();
                let lines: Vec<String> = report
                    .host_types
                    .iter()
                    .map(|h| format!("{}: {} idle, {} busy", h.host_type, h.idle.len(), h.busy))
                    .collect();
                CheckResult::ok(lines)
            }));
        }
        {
            let scheduler = scheduler.clone();
            health.register(FnChecker::new("scheduler", "Scheduler queues", move || {
                let snap = scheduler.snapshot();
                let stuck: Vec<String> = snap
                    .host_types
                    .iter()
                    .filter(|h| h.oldest_wait_secs > 3600)
                    .map(|h| format!("{}: waiter stuck {}s", h.host_type, h.oldest_wait_secs))
                    .collect();
                if stuck.is_empty() {
                    CheckResult::ok(vec![format!("{} host types queued", snap.host_types.len())])
                } else {
                    CheckResult::failing(stuck)
                }
            }));
        }

        let status = Arc::new(StatusState {
            registry: registry.clone(),
            scheduler: scheduler.clone(),
            pools: pools.clone(),
            reverse: reverse.clone(),
            tries: tries.clone(),
            health,
            catalog: catalog.clone(),
            gomote,
            environment: flags.environment.clone(),
            started: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        });

        Ok(Self {
            catalog,
            registry,
            scheduler,
            pools,
            reverse,
            deps,
            tries,
            shutdown,
            status,
            vm_pool,
            container_pool,
            environment: flags.environment.clone(),
        })
    }

    /// Serve HTTP and run every background loop until shutdown.
    pub async fn run(
        self: Arc<Self>,
        listener: tokio::net::TcpListener,
        collab: &Collaborators,
    ) -> Result<()> {
        info!(environment = %self.environment, "coordinator starting");

        if let Some(vm_pool) = &self.vm_pool {
            tokio::spawn(vm_pool.clone().run_reaper(self.shutdown.clone()));
        }
        if let Some(container_pool) = &self.container_pool {
            tokio::spawn(container_pool.clone().run_reaper(self.shutdown.clone()));
        }

        let discovery = Discovery {
            deps: self.deps.clone(),
            catalog: self.catalog.clone(),
            pools: self.pools.clone(),
            tries: self.tries.clone(),
            review: collab.review.clone(),
        };
        tokio::spawn(discovery.clone().post_submit_loop(self.shutdown.clone()));
        tokio::spawn(discovery.try_loop(self.shutdown.clone()));

        let app = status_router(self.status.clone());
        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("status server failed")?;

        info!("coordinator stopped");
        Ok(())
    }
}
