use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bf_build::runner::{BuildRunner, RunnerDeps};
use bf_build::status::BuildStatus;
use bf_build::TrySetManager;
use bf_core::builders::BuilderCatalog;
use bf_core::types::BuilderRev;
use bf_integrations::{DashboardStatus, ReviewClient};
use bf_pools::{BuildletPool, PoolSet};
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Post-submit work is re-polled at this cadence.
const POST_SUBMIT_INTERVAL: Duration = Duration::from_secs(15);

/// Try-bot work is re-polled at this cadence.
const TRY_INTERVAL: Duration = Duration::from_secs(1);

/// The two polling loops that feed the coordinator work.
#[derive(Clone)]
pub struct Discovery {
    pub deps: Arc<RunnerDeps>,
    pub catalog: Arc<BuilderCatalog>,
    pub pools: Arc<PoolSet>,
    pub tries: Arc<TrySetManager>,
    pub review: Arc<dyn ReviewClient>,
}

impl Discovery {
    /// Every 15 s: fetch the dashboard feed and start builds for empty
    /// result cells. Fetch errors skip the tick, never kill the loop.
    pub async fn post_submit_loop(self, shutdown: CancellationToken) {
        let warned_unknown = Arc::new(Mutex::new(HashSet::new()));
        let mut tick = tokio::time::interval(POST_SUBMIT_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tick.tick() => {}
            }
            match self.deps.dashboard.fetch_status().await {
                Ok(status) => self.post_submit_tick(status, &warned_unknown).await,
                Err(e) => warn!(error = %e, "dashboard fetch failed, skipping tick"),
            }
        }
    }

    /// Every 1 s: reconcile the try-set map against the review service.
    pub async fn try_loop(self, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(TRY_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tick.tick() => {}
            }
            match self.review.pending_try_work().await {
                Ok(work) => self.tries.reconcile(work).await,
                Err(e) => warn!(error = %e, "try work fetch failed, skipping tick"),
            }
        }
    }

    /// One tick of post-submit discovery: at most one new build per builder
    /// name, preferring the newest revision, so fresh work surfaces even
    /// when the farm is saturated.
    pub async fn post_submit_tick(
        &self,
        status: DashboardStatus,
        warned_unknown: &Arc<Mutex<HashSet<String>>>,
    ) {
        let mut chosen: HashMap<String, (BuilderRev, Option<DateTime<Utc>>)> = HashMap::new();

        for slot in &status.revisions {
            for (i, builder) in status.builders.iter().enumerate() {
                if !slot.needs_build(i) {
                    continue;
                }
                let Some(conf) = self.catalog.get(builder) else {
                    // Unknown builders are logged once, then dropped.
                    if warned_unknown.lock().unwrap().insert(builder.clone()) {
                        warn!(builder = %builder, "dashboard names unknown builder");
                    }
                    continue;
                };
                if !conf.builds_repo(&slot.repo, &slot.branch) {
                    continue;
                }

                let rev = if slot.repo == "go" {
                    BuilderRev::new(builder, &slot.revision)
                } else {
                    let Some(go_rev) = &slot.go_revision else {
                        continue;
                    };
                    BuilderRev::with_sub_repo(builder, go_rev, &slot.repo, &slot.revision)
                };

                // Sub-repo builds ride an existing toolchain snapshot.
                if rev.is_sub_repo() && !conf.skip_snapshot {
                    let snapshot_ok = self
                        .deps
                        .snapshots
                        .exists_valid(builder, &rev.rev)
                        .await;
                    if !snapshot_ok {
                        debug!(build = %rev, "skipping sub-repo build, no snapshot yet");
                        continue;
                    }
                }

                match chosen.get(builder) {
                    Some((_, existing_date)) if *existing_date >= slot.date => {}
                    _ => {
                        chosen.insert(builder.clone(), (rev, slot.date));
                    }
                }
            }
        }

        for (builder, (rev, date)) in chosen {
            self.admit_and_start(&builder, rev, date);
        }
    }

    /// Admission filter: duplicate work, per-builder concurrency, and pool
    /// capacity. Accepted work runs in its own task.
    fn admit_and_start(
        &self,
        builder: &str,
        rev: BuilderRev,
        commit_time: Option<DateTime<Utc>>,
    ) {
        let Some(conf) = self.catalog.get(builder) else {
            return;
        };
        if self.deps.registry.is_building(&rev) {
            return;
        }
        if self.deps.registry.active_count_for(builder) >= conf.max_active {
            debug!(builder, "at max concurrent builds, deferring");
            return;
        }
        if !self.pools.has_capacity(&conf.host_type) {
            debug!(builder, host_type = %conf.host_type, "no pool capacity, deferring");
            return;
        }

        let bs = BuildStatus::new(rev, conf, false);
        if !self.deps.registry.register(bs.clone()) {
            return;
        }
        info!(build = %bs.rev, "starting post-submit build");
        let deps = self.deps.clone();
        tokio::spawn(async move {
            let runner = BuildRunner::new(deps, bs, commit_time);
            let _ = runner.run().await;
        });
    }
}
