use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bf_core::builders::{BuilderCatalog, BuilderConfig};
use bf_core::types::{BuilderRev, TryKey};
use bf_integrations::{ReviewClient, TryWorkItem, Vote};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::runner::{BuildRunner, RunnerDeps};
use crate::status::{BuildError, BuildStatus};

/// Delay before a stalled try build's slot is refilled with a fresh build.
const STALL_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Infra-stall retries per slot. Remote failures are never retried.
const MAX_SLOT_RETRIES: u32 = 2;

// ---------------------------------------------------------------------------
// TrySet
// ---------------------------------------------------------------------------

/// The builds for one change under pre-submit test, aggregated into a
/// single verdict.
pub struct TrySet {
    pub key: TryKey,
    pub try_id: Uuid,
    pub slow_bot_terms: Vec<String>,
    pub extra_repos: Vec<String>,
    state: Mutex<TrySetState>,
}

struct TrySetState {
    remaining: usize,
    failed: Vec<String>,
    builds: Vec<Arc<BuildStatus>>,
    error_buf: String,
    wanted_as_of: DateTime<Utc>,
    canceled: bool,
    posted_first_failure: bool,
    posted_messages: HashSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrySetSnapshot {
    pub change_id: String,
    pub commit: String,
    pub project: String,
    pub branch: String,
    pub remaining: usize,
    pub total: usize,
    pub failed: Vec<String>,
    pub canceled: bool,
}

impl TrySet {
    fn new(key: TryKey, slow_bot_terms: Vec<String>, extra_repos: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            key,
            try_id: Uuid::new_v4(),
            slow_bot_terms,
            extra_repos,
            state: Mutex::new(TrySetState {
                remaining: 0,
                failed: Vec::new(),
                builds: Vec::new(),
                error_buf: String::new(),
                wanted_as_of: Utc::now(),
                canceled: false,
                posted_first_failure: false,
                posted_messages: HashSet::new(),
            }),
        })
    }

    pub fn refresh_wanted(&self) {
        let mut state = self.state.lock().expect("try set lock poisoned");
        state.wanted_as_of = Utc::now();
    }

    pub fn wanted_as_of(&self) -> DateTime<Utc> {
        self.state.lock().expect("try set lock poisoned").wanted_as_of
    }

    pub fn is_canceled(&self) -> bool {
        self.state.lock().expect("try set lock poisoned").canceled
    }

    pub fn is_wanted(&self) -> bool {
        !self.is_canceled()
    }

    pub fn builds(&self) -> Vec<Arc<BuildStatus>> {
        self.state.lock().expect("try set lock poisoned").builds.clone()
    }

    pub fn snapshot(&self) -> TrySetSnapshot {
        let state = self.state.lock().expect("try set lock poisoned");
        TrySetSnapshot {
            change_id: self.key.change_id.clone(),
            commit: self.key.commit.clone(),
            project: self.key.project.clone(),
            branch: self.key.branch.clone(),
            remaining: state.remaining,
            total: state.builds.len(),
            failed: state.failed.clone(),
            canceled: state.canceled,
        }
    }

    /// Cancel once: flips the bit, cancels every constituent build, and
    /// suppresses all further upstream messages.
    fn cancel(&self) {
        let builds = {
            let mut state = self.state.lock().expect("try set lock poisoned");
            if state.canceled {
                return;
            }
            state.canceled = true;
            state.builds.clone()
        };
        info!(change = %self.key, "canceling try set");
        for b in builds {
            b.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// TrySetManager
// ---------------------------------------------------------------------------

/// Owns the live try-set map and reconciles it against each tick of the
/// try-work feed.
pub struct TrySetManager {
    deps: Arc<RunnerDeps>,
    review: Arc<dyn ReviewClient>,
    catalog: Arc<BuilderCatalog>,
    sets: Mutex<HashMap<TryKey, Arc<TrySet>>>,
}

impl TrySetManager {
    pub fn new(
        deps: Arc<RunnerDeps>,
        review: Arc<dyn ReviewClient>,
        catalog: Arc<BuilderCatalog>,
    ) -> Arc<Self> {
        Arc::new(Self {
            deps,
            review,
            catalog,
            sets: Mutex::new(HashMap::new()),
        })
    }

    /// One tick of the try-work feed: refresh known sets, create new ones,
    /// cancel any whose key did not appear (the change merged, was
    /// abandoned, or lost its try label).
    pub async fn reconcile(self: &Arc<Self>, work: Vec<TryWorkItem>) {
        let tick_start = Utc::now();
        for item in work {
            let key = item.key();
            let existing = self.sets.lock().expect("try map lock poisoned").get(&key).cloned();
            match existing {
                Some(ts) => ts.refresh_wanted(),
                None => self.create_set(item).await,
            }
        }

        let stale: Vec<Arc<TrySet>> = {
            let mut sets = self.sets.lock().expect("try map lock poisoned");
            let stale_keys: Vec<TryKey> = sets
                .iter()
                .filter(|(_, ts)| ts.wanted_as_of() < tick_start)
                .map(|(k, _)| k.clone())
                .collect();
            stale_keys
                .into_iter()
                .filter_map(|k| sets.remove(&k))
                .collect()
        };
        for ts in stale {
            ts.cancel();
        }
    }

    pub fn active(&self) -> Vec<Arc<TrySet>> {
        let mut v: Vec<_> = self
            .sets
            .lock()
            .expect("try map lock poisoned")
            .values()
            .cloned()
            .collect();
        v.sort_by(|a, b| a.key.change_id.cmp(&b.key.change_id));
        v
    }

    /// Lookup by commit-hash prefix, for the try status endpoints.
    pub fn find_by_commit_prefix(&self, prefix: &str) -> Option<Arc<TrySet>> {
        self.sets
            .lock()
            .expect("try map lock poisoned")
            .values()
            .find(|ts| ts.key.commit.starts_with(prefix))
            .cloned()
    }

    /// The builder fan-out for a change: default try-bots for its project
    /// and branch, slow-bots named in `TRY=` terms, and (for main-repo
    /// main-branch changes) requested cross-repo builds.
    fn plan_builds(&self, key: &TryKey, item: &TryWorkItem) -> Vec<BuilderRev> {
        let mut revs = Vec::new();
        let mut bots: Vec<Arc<BuilderConfig>> = self.catalog.try_builders(&key.project, &key.branch);
        bots.extend(self.catalog.slow_bots(&item.slow_bot_terms));
        for conf in bots {
            if key.project == "go" {
                revs.push(BuilderRev::new(&conf.name, &key.commit));
            } else {
                // Sub-repo change: test it against the main repo's tip.
                revs.push(BuilderRev::with_sub_repo(
                    &conf.name,
                    "master",
                    &key.project,
                    &key.commit,
                ));
            }
        }
        if key.is_main_repo_main_branch() {
            for repo in &item.extra_repos {
                revs.push(BuilderRev::with_sub_repo(
                    "linux-amd64",
                    &key.commit,
                    repo,
                    "master",
                ));
            }
        }
        revs
    }

    async fn create_set(self: &Arc<Self>, item: TryWorkItem) {
        let key = item.key();
        let ts = TrySet::new(
            key.clone(),
            item.slow_bot_terms.clone(),
            item.extra_repos.clone(),
        );
        let revs = self.plan_builds(&key, &item);
        if revs.is_empty() {
            warn!(change = %key, "no try builders configured, ignoring change");
            return;
        }
        info!(change = %key, builds = revs.len(), "starting try set");

        let mut started = Vec::new();
        for rev in revs {
            let Some(conf) = self.catalog.get(&rev.name) else {
                continue;
            };
            let bs = BuildStatus::new(rev, conf, true);
            if !self.deps.registry.register(bs.clone()) {
                continue;
            }
            started.push(bs);
        }
        {
            let mut state = ts.state.lock().expect("try set lock poisoned");
            state.remaining = started.len();
            state.builds = started.clone();
        }
        self.sets
            .lock()
            .expect("try map lock poisoned")
            .insert(key.clone(), ts.clone());

        let names: Vec<&str> = started.iter().map(|b| b.rev.name.as_str()).collect();
        self.post_once(
            &ts,
            format!(
                "TryBots beginning. Builders: {}.\nStatus: try.json?commit={}",
                names.join(", "),
                &key.commit[..key.commit.len().min(8)]
            ),
            None,
        )
        .await;

        for bs in started {
            let manager = self.clone();
            let ts = ts.clone();
            tokio::spawn(async move {
                manager.supervise_slot(ts, bs).await;
            });
        }
    }

    /// Run one builder slot, refilling it after infra stalls while the set
    /// is still wanted. Remote failures and cancellation are terminal.
    async fn supervise_slot(self: Arc<Self>, ts: Arc<TrySet>, mut bs: Arc<BuildStatus>) {
        let mut retries = 0;
        loop {
            let runner = BuildRunner::new(self.deps.clone(), bs.clone(), None);
            let res = runner.run().await;

            let infra_stall = matches!(
                res,
                Err(BuildError::BuildletsGone)
                    | Err(BuildError::Comm(_))
                    | Err(BuildError::Infra(_))
            );
            if infra_stall && ts.is_wanted() && retries < MAX_SLOT_RETRIES {
                retries += 1;
                warn!(build = %bs.rev, retries, "try build stalled, refilling slot");
                tokio::time::sleep(STALL_RETRY_DELAY).await;
                if !ts.is_wanted() {
                    self.on_build_done(&ts, &bs, &res).await;
                    return;
                }
                // Replace the slot: the old status is discarded.
                let fresh = BuildStatus::new(bs.rev.clone(), bs.conf.clone(), true);
                if !self.deps.registry.register(fresh.clone()) {
                    self.on_build_done(&ts, &bs, &res).await;
                    return;
                }
                {
                    let mut state = ts.state.lock().expect("try set lock poisoned");
                    if let Some(slot) = state.builds.iter_mut().find(|b| Arc::ptr_eq(b, &bs)) {
                        *slot = fresh.clone();
                    }
                }
                bs = fresh;
                continue;
            }

            self.on_build_done(&ts, &bs, &res).await;
            return;
        }
    }

    async fn on_build_done(&self, ts: &Arc<TrySet>, bs: &Arc<BuildStatus>, res: &Result<(), BuildError>) {
        let failed = matches!(res, Err(e) if e.counts_as_failure());

        enum Report {
            None,
            Interim(String),
            Final(String, Vote),
        }

        let report = {
            let mut state = ts.state.lock().expect("try set lock poisoned");
            if state.canceled {
                return;
            }
            state.remaining = state.remaining.saturating_sub(1);
            if failed {
                state.failed.push(bs.rev.name.clone());
                let line = match bs.log_url() {
                    Some(url) => format!("Failed on {}: {}\n", bs.rev.name, url),
                    None => format!("Failed on {}\n", bs.rev.name),
                };
                state.error_buf.push_str(&line);
            }

            if state.remaining == 0 {
                if state.failed.is_empty() {
                    Report::Final(
                        "TryBots are happy.".to_string(),
                        Vote::Approve,
                    )
                } else {
                    Report::Final(
                        format!(
                            "{} of {} TryBots failed:\n{}",
                            state.failed.len(),
                            state.builds.len(),
                            state.error_buf
                        ),
                        Vote::Reject,
                    )
                }
            } else if failed && !state.posted_first_failure {
                state.posted_first_failure = true;
                Report::Interim(format!(
                    "Build is still in progress... {} failed so far.\n{}",
                    bs.rev.name, state.error_buf
                ))
            } else {
                Report::None
            }
        };

        match report {
            Report::None => {}
            Report::Interim(msg) => self.post_once(ts, msg, None).await,
            Report::Final(msg, vote) => self.post_once(ts, msg, Some(vote)).await,
        }
    }

    /// Post a comment at most once per distinct message content, and never
    /// after cancellation.
    async fn post_once(&self, ts: &Arc<TrySet>, message: String, vote: Option<Vote>) {
        {
            let mut state = ts.state.lock().expect("try set lock poisoned");
            if state.canceled || !state.posted_messages.insert(message.clone()) {
                return;
            }
        }
        if let Err(e) = self.review.post_comment(&ts.key, &message, vote).await {
            warn!(change = %ts.key, error = %e, "review comment post failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BuildRegistry;
    use crate::shard::DurationTable;
    use crate::snapshot::SnapshotStore;
    use crate::sourcecache::SourceCache;
    use bf_core::config::EnvConfig;
    use bf_integrations::{MemoryDashboard, MemoryObjectStore, MemoryReview, MemorySource};
    use bf_pools::dev::DevPool;
    use bf_pools::BuildletPool;
    use bf_sched::Scheduler;
    use tokio_util::sync::CancellationToken;

    fn deps() -> (Arc<RunnerDeps>, Arc<MemoryReview>) {
        let pool: Arc<dyn BuildletPool> = Arc::new(DevPool::new(
            vec![
                "host-linux".to_string(),
                "host-windows-2016".to_string(),
                "host-js-wasm".to_string(),
            ],
            64,
        ));
        let scheduler = Scheduler::new(pool, CancellationToken::new());
        let source = Arc::new(MemorySource::new());
        source.add_tarball("go", "commit1234", b"tar".to_vec());
        let store = Arc::new(MemoryObjectStore::new());
        let deps = Arc::new(RunnerDeps {
            scheduler,
            registry: Arc::new(BuildRegistry::new()),
            sources: Arc::new(SourceCache::new(source.clone())),
            source_client: source,
            snapshots: Arc::new(SnapshotStore::new(store.clone(), "farm-snapshots")),
            dashboard: Arc::new(MemoryDashboard::new()),
            logs: store,
            durations: Arc::new(DurationTable::new()),
            env: EnvConfig::default(),
        });
        (deps, Arc::new(MemoryReview::new()))
    }

    fn work_item(commit: &str) -> TryWorkItem {
        TryWorkItem {
            project: "go".to_string(),
            branch: "master".to_string(),
            change_id: "I123".to_string(),
            commit: commit.to_string(),
            slow_bot_terms: vec![],
            extra_repos: vec![],
        }
    }

    async fn wait_until_done(manager: &Arc<TrySetManager>, commit: &str) -> Arc<TrySet> {
        let ts = manager.find_by_commit_prefix(commit).unwrap();
        for _ in 0..200 {
            if ts.snapshot().remaining == 0 {
                return ts;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("try set did not finish: {:?}", ts.snapshot());
    }

    #[tokio::test]
    async fn try_set_runs_to_happy_verdict() {
        let (deps, review) = deps();
        let catalog = Arc::new(BuilderCatalog::default());
        let manager = TrySetManager::new(deps, review.clone(), catalog);

        manager.reconcile(vec![work_item("commit1234")]).await;
        let ts = wait_until_done(&manager, "commit1234").await;

        assert!(ts.snapshot().failed.is_empty());
        let comments = review.comments();
        assert!(comments[0].1.contains("TryBots beginning"));
        let last = comments.last().unwrap();
        assert!(last.1.contains("TryBots are happy"));
        assert_eq!(last.2, Some(Vote::Approve));
    }

    #[tokio::test]
    async fn reconcile_refreshes_not_duplicates() {
        let (deps, review) = deps();
        let catalog = Arc::new(BuilderCatalog::default());
        let manager = TrySetManager::new(deps, review.clone(), catalog);

        manager.reconcile(vec![work_item("commit1234")]).await;
        let first = manager.find_by_commit_prefix("commit1234").unwrap();
        manager.reconcile(vec![work_item("commit1234")]).await;
        let second = manager.find_by_commit_prefix("commit1234").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.active().len(), 1);
    }

    #[tokio::test]
    async fn abandoned_change_cancels_set_and_suppresses_comments() {
        let (deps, review) = deps();
        let catalog = Arc::new(BuilderCatalog::default());
        let manager = TrySetManager::new(deps, review.clone(), catalog);

        manager.reconcile(vec![work_item("commit1234")]).await;
        let ts = manager.find_by_commit_prefix("commit1234").unwrap();

        // Next tick returns no work: the set is canceled and removed.
        manager.reconcile(vec![]).await;
        assert!(ts.is_canceled());
        assert!(manager.find_by_commit_prefix("commit1234").is_none());
        for b in ts.builds() {
            assert!(b.token.is_cancelled());
        }

        let before = review.comments().len();
        // Late completions post nothing.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(review.comments().len(), before);
    }

    #[tokio::test]
    async fn slow_bots_extend_the_fan_out() {
        let (deps, review) = deps();
        let catalog = Arc::new(BuilderCatalog::default());
        let manager = TrySetManager::new(deps.clone(), review, catalog.clone());

        let mut item = work_item("commit1234");
        item.slow_bot_terms = vec!["js".to_string()];
        manager.reconcile(vec![item]).await;

        let ts = manager.find_by_commit_prefix("commit1234").unwrap();
        let names: Vec<String> = ts.builds().iter().map(|b| b.rev.name.clone()).collect();
        assert!(names.contains(&"js-wasm".to_string()));
        let default_count = catalog.try_builders("go", "master").len();
        assert_eq!(names.len(), default_count + 1);
    }
}
