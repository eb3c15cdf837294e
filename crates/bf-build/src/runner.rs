use std::sync::Arc;
use std::time::Duration;

use bf_buildlet::{Buildlet, ExecOpts, ExecOutcome};
use bf_core::config::EnvConfig;
use bf_core::types::{log_object_name, EVENT_MAKE_AND_TEST, EVENT_SKIPPED_MISSING_DEP};
use bf_integrations::{BuildRecord, DashboardClient, ObjectStore, SourceClient};
use bf_sched::{SchedItem, Scheduler};
use chrono::{DateTime, Utc};
use rand::Rng;
use tracing::warn;

use crate::exec::ShardedExecutor;
use crate::registry::BuildRegistry;
use crate::shard::{DurationTable, TestSet};
use crate::snapshot::{version_tarball, SnapshotStore};
use crate::sourcecache::SourceCache;
use crate::status::{BuildError, BuildStatus};

/// Ancestry probes retry this many times before failing the check.
const ANCESTOR_CHECK_ATTEMPTS: usize = 3;

/// Paths stripped from the tree before a snapshot is taken.
const SNAPSHOT_CLEAN_PATHS: &[&str] = &["go/doc/gopher", "go/pkg/bootstrap"];

// ---------------------------------------------------------------------------
// RunnerDeps
// ---------------------------------------------------------------------------

/// Everything a build needs from the rest of the coordinator. One bundle is
/// built at wiring time and shared by every runner.
pub struct RunnerDeps {
    pub scheduler: Arc<Scheduler>,
    pub registry: Arc<BuildRegistry>,
    pub sources: Arc<SourceCache>,
    pub source_client: Arc<dyn SourceClient>,
    pub snapshots: Arc<SnapshotStore>,
    pub dashboard: Arc<dyn DashboardClient>,
    pub logs: Arc<dyn ObjectStore>,
    pub durations: Arc<DurationTable>,
    pub env: EnvConfig,
}

// ---------------------------------------------------------------------------
// BuildRunner
// ---------------------------------------------------------------------------

/// Drives one build from admission to its terminal state.
pub struct BuildRunner {
    deps: Arc<RunnerDeps>,
    bs: Arc<BuildStatus>,
    commit_time: Option<DateTime<Utc>>,
}

impl BuildRunner {
    pub fn new(
        deps: Arc<RunnerDeps>,
        bs: Arc<BuildStatus>,
        commit_time: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            deps,
            bs,
            commit_time,
        }
    }

    pub fn status(&self) -> Arc<BuildStatus> {
        self.bs.clone()
    }

    /// Run the build to completion: state machine, terminal classification,
    /// registry retirement, and post-submit reporting. The returned error is
    /// the classified terminal error, for try-set aggregation.
    pub async fn run(&self) -> Result<(), BuildError> {
        self.bs.set_started();
        let res = self.run_inner().await;

        // Lost-buildlet promotion: on platforms whose connectivity flakes
        // chronically, retrying infra errors never converges, so the loss is
        // reported as an ordinary test failure instead.
        let res = match res {
            Err(BuildError::BuildletsGone) if self.bs.conf.lost_buildlets_terminal => Err(
                BuildError::Remote("buildlets lost; platform reports this as failure".to_string()),
            ),
            other => other,
        };

        match &res {
            Ok(()) => {
                self.bs.mark_done(true);
            }
            Err(BuildError::MissingDependency) => {
                // Skipped, not failed.
                self.bs.mark_done(true);
            }
            Err(BuildError::Canceled) => {
                self.bs.mark_done(false);
            }
            Err(e) => {
                self.bs.event("error", Some(e.to_string()));
                self.upload_log().await;
                self.bs.mark_done(false);
            }
        }
        // Nothing should keep working this build: stop helper ramp-up and
        // any other task still holding the token.
        self.bs.token.cancel();
        self.deps.registry.mark_done(&self.bs.rev);

        if self.should_report(&res) {
            self.report_to_dashboard(&res).await;
        }
        res
    }

    fn should_report(&self, res: &Result<(), BuildError>) -> bool {
        if self.bs.is_try || self.bs.is_canceled() {
            return false;
        }
        !matches!(res, Err(BuildError::MissingDependency) | Err(BuildError::Canceled))
    }

    async fn report_to_dashboard(&self, res: &Result<(), BuildError>) {
        let record = BuildRecord {
            builder: self.bs.rev.name.clone(),
            repo: self.bs.rev.repo_or_main().to_string(),
            rev: self.bs.rev.test_rev().to_string(),
            go_rev: self.bs.rev.sub_rev.as_ref().map(|_| self.bs.rev.rev.clone()),
            ok: res.is_ok(),
            log_url: self.bs.log_url(),
            run_time_secs: self.bs.run_time().num_seconds(),
        };
        if let Err(e) = self.deps.dashboard.record_result(&record).await {
            warn!(build = %self.bs.rev, error = %e, "dashboard result post failed");
        }
    }

    /// Upload the live log so far as a public object and remember its URL.
    async fn upload_log(&self) {
        let nonce: u32 = rand::thread_rng().gen();
        let name = log_object_name(
            &self.bs.rev.name,
            self.bs.rev.test_rev(),
            &format!("{nonce:08x}"),
        );
        match self
            .deps
            .logs
            .put(
                &self.deps.env.log_bucket,
                &name,
                "text/plain; charset=utf-8",
                true,
                self.bs.log.snapshot(),
            )
            .await
        {
            Ok(url) => self.bs.set_log_url(&url),
            Err(e) => warn!(build = %self.bs.rev, error = %e, "log upload failed"),
        }
    }

    // -- the state machine ---------------------------------------------------

    async fn run_inner(&self) -> Result<(), BuildError> {
        let bs = &self.bs;
        let conf = &bs.conf;

        // 1. Dependency ancestry.
        if !self.check_required_ancestors().await? {
            bs.event(EVENT_SKIPPED_MISSING_DEP, None);
            return Err(BuildError::MissingDependency);
        }

        // 2. Snapshot decision.
        let use_snapshot = conf.split_make_run
            && !conf.skip_snapshot
            && self
                .deps
                .snapshots
                .exists_valid(&conf.name, &bs.rev.rev)
                .await;
        bs.set_use_snapshot(use_snapshot);

        // 3. Buildlet acquisition.
        bs.event("get_buildlet", None);
        bs.set_waiting_on_scheduler(true);
        let mut item = SchedItem::for_build(bs.rev.clone(), conf.host_type.clone(), bs.is_try);
        item.commit_time = self.commit_time;
        let buildlet = self
            .deps
            .scheduler
            .get_buildlet(&bs.token, item)
            .await
            .map_err(|e| match e {
                bf_pools::PoolError::Canceled => BuildError::Canceled,
                other => BuildError::Infra(other.to_string()),
            })?;
        bs.set_waiting_on_scheduler(false);
        bs.set_buildlet(buildlet.name());

        let res = self.run_on_buildlet(&buildlet, use_snapshot).await;
        buildlet.close().await;
        res
    }

    async fn run_on_buildlet(
        &self,
        buildlet: &Arc<dyn Buildlet>,
        use_snapshot: bool,
    ) -> Result<(), BuildError> {
        let bs = &self.bs;

        if bs.rev.is_sub_repo() {
            self.stage_go_tree(buildlet, use_snapshot).await?;
            return self.run_subrepo(buildlet).await;
        }

        if !bs.conf.split_make_run {
            self.stage_full_source(buildlet).await?;
            return self.run_whole_script(buildlet).await;
        }

        // Helper acquisition ramps up while make runs so the helpers are
        // ready as tests begin; with a snapshot there is no make to overlap.
        let helpers_rx = self.start_helper_acquisition(if use_snapshot {
            Duration::ZERO
        } else {
            bs.conf.helper_ramp_up_delay()
        });

        if use_snapshot {
            bs.event("using_snapshot", Some(self.snapshot_url()));
            buildlet
                .put_tar_from_url(&bs.token, &self.snapshot_url(), "go")
                .await?;
        } else {
            self.stage_full_source(buildlet).await?;
            self.run_make(buildlet).await?;
            self.write_snapshot(buildlet).await?;
        }

        // 6. Enumerate and filter dist tests.
        let names = self.list_dist_tests(buildlet).await?;
        bs.event("list_tests", Some(format!("{} tests", names.len())));

        // 7–8. Shard and run.
        let set = Arc::new(TestSet::plan(&bs.conf.name, &names, &self.deps.durations));
        bs.event("run_tests", Some(format!("{} chunks", set.in_order.len())));
        let executor = Arc::new(ShardedExecutor {
            bs: bs.clone(),
            set,
            env: bs.conf.make_env(),
            timeout: bs.conf.test_timeout,
            helper_snapshot_url: Some(self.snapshot_url()),
            race: bs.conf.race,
        });
        executor.run(buildlet.clone(), helpers_rx).await?;
        bs.event("tests_passed", None);
        Ok(())
    }

    async fn check_required_ancestors(&self) -> Result<bool, BuildError> {
        for ancestor in &self.bs.conf.required_ancestors {
            let mut last_err = None;
            let mut present = false;
            for _ in 0..ANCESTOR_CHECK_ATTEMPTS {
                match self
                    .deps
                    .source_client
                    .has_ancestor("go", &self.bs.rev.rev, ancestor)
                    .await
                {
                    Ok(ok) => {
                        present = ok;
                        last_err = None;
                        break;
                    }
                    Err(e) => last_err = Some(e),
                }
            }
            if let Some(e) = last_err {
                return Err(BuildError::Infra(format!("ancestry check failed: {e}")));
            }
            if !present {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Populate a fresh workspace: VERSION marker, main-repo source, and the
    /// bootstrap toolchain, in parallel.
    async fn stage_full_source(&self, buildlet: &Arc<dyn Buildlet>) -> Result<(), BuildError> {
        let bs = &self.bs;
        bs.event("get_source", None);

        let source = self
            .deps
            .sources
            .get("go", &bs.rev.rev)
            .await
            .map_err(|e| BuildError::Infra(format!("source fetch: {e}")))?;

        let bootstrap_url = self
            .deps
            .env
            .bootstrap_url_for(&bs.conf.goos, &bs.conf.goarch);

        let version = buildlet.put_tar(&bs.token, version_tarball(&bs.rev.rev), "go");
        let src = buildlet.put_tar(&bs.token, source.as_ref().clone(), "go");
        let bootstrap = buildlet.put_tar_from_url(&bs.token, &bootstrap_url, "go1.4");
        let (version, src, bootstrap) = tokio::join!(version, src, bootstrap);
        version?;
        src?;
        bootstrap?;
        Ok(())
    }

    /// Stage only the built `go/` tree, for sub-repo builds: from snapshot
    /// when available, else by building it in place.
    async fn stage_go_tree(
        &self,
        buildlet: &Arc<dyn Buildlet>,
        use_snapshot: bool,
    ) -> Result<(), BuildError> {
        if use_snapshot {
            self.bs.event("using_snapshot", Some(self.snapshot_url()));
            buildlet
                .put_tar_from_url(&self.bs.token, &self.snapshot_url(), "go")
                .await?;
            return Ok(());
        }
        self.stage_full_source(buildlet).await?;
        self.run_make(buildlet).await
    }

    async fn run_make(&self, buildlet: &Arc<dyn Buildlet>) -> Result<(), BuildError> {
        let bs = &self.bs;
        let script = make_script(&bs.conf.goos);
        bs.event("make", Some(script.to_string()));

        let outcome = self
            .exec_streaming(buildlet, script, bs.conf.make_env())
            .await?;
        match outcome {
            ExecOutcome::Ok => Ok(()),
            ExecOutcome::Remote(detail) => Err(BuildError::Remote(format!("{script}: {detail}"))),
        }
    }

    /// Strip ephemeral paths and upload the built tree as a public snapshot.
    async fn write_snapshot(&self, buildlet: &Arc<dyn Buildlet>) -> Result<(), BuildError> {
        let bs = &self.bs;
        if bs.conf.skip_snapshot {
            return Ok(());
        }
        bs.event("write_snapshot", None);
        let paths: Vec<String> = SNAPSHOT_CLEAN_PATHS.iter().map(|s| s.to_string()).collect();
        buildlet.remove_all(&bs.token, &paths).await?;
        let tar_gz = buildlet.get_tar(&bs.token, "go").await?;
        self.deps
            .snapshots
            .upload(&bs.conf.name, &bs.rev.rev, tar_gz)
            .await
            .map_err(|e| BuildError::Infra(format!("snapshot upload: {e}")))?;
        Ok(())
    }

    async fn list_dist_tests(&self, buildlet: &Arc<dyn Buildlet>) -> Result<Vec<String>, BuildError> {
        let bs = &self.bs;
        let mut args = vec![
            "tool".to_string(),
            "dist".to_string(),
            "test".to_string(),
            "--list".to_string(),
        ];
        if bs.conf.race {
            args.push("--race".to_string());
        }

        let (out_tx, out_rx) = flume::unbounded::<Vec<u8>>();
        let collector = tokio::spawn(async move {
            let mut buf = Vec::new();
            while let Ok(chunk) = out_rx.recv_async().await {
                buf.extend_from_slice(&chunk);
            }
            buf
        });
        let outcome = buildlet
            .exec(
                &bs.token,
                "go/bin/go",
                ExecOpts {
                    args,
                    env: bs.conf.make_env(),
                    dir: Some("go".to_string()),
                    timeout: Some(Duration::from_secs(60)),
                    ..Default::default()
                },
                out_tx,
            )
            .await?;
        let output = collector.await.unwrap_or_default();
        if let ExecOutcome::Remote(detail) = outcome {
            return Err(BuildError::Remote(format!("dist test --list: {detail}")));
        }

        let names: Vec<String> = String::from_utf8_lossy(&output)
            .split_whitespace()
            .filter(|name| bs.conf.should_run_dist_test(name, bs.is_try))
            .map(|s| s.to_string())
            .collect();
        Ok(names)
    }

    /// Helper buildlets begin acquisition after `delay`; each one lands in
    /// the returned channel. The sender closes once every acquisition has
    /// resolved, which the executor uses to learn no more are coming.
    fn start_helper_acquisition(&self, delay: Duration) -> flume::Receiver<Arc<dyn Buildlet>> {
        let count = self.bs.conf.helpers_for(self.bs.is_try);
        let (tx, rx) = flume::unbounded::<Arc<dyn Buildlet>>();
        if count == 0 {
            return rx;
        }
        let bs = self.bs.clone();
        let scheduler = self.deps.scheduler.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = bs.token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            bs.event("get_helpers", Some(format!("{count} helpers")));
            let mut acquisitions = tokio::task::JoinSet::new();
            for _ in 0..count {
                let bs = bs.clone();
                let scheduler = scheduler.clone();
                let tx = tx.clone();
                acquisitions.spawn(async move {
                    let mut item =
                        SchedItem::for_build(bs.rev.clone(), bs.conf.host_type.clone(), bs.is_try);
                    item.is_helper = true;
                    match scheduler.get_buildlet(&bs.token, item).await {
                        Ok(helper) => {
                            if let Err(undelivered) = tx.send_async(helper).await {
                                // Executor already finished; release it.
                                undelivered.into_inner().close().await;
                            }
                        }
                        Err(e) => {
                            warn!(build = %bs.rev, error = %e, "helper acquisition failed");
                        }
                    }
                });
            }
            while acquisitions.join_next().await.is_some() {}
            // tx drops here, closing the channel.
        });
        rx
    }

    /// Non-split builders run the whole build-and-test script as one exec.
    async fn run_whole_script(&self, buildlet: &Arc<dyn Buildlet>) -> Result<(), BuildError> {
        let bs = &self.bs;
        let script = all_script(&bs.conf.goos);
        bs.event(EVENT_MAKE_AND_TEST, Some(script.to_string()));
        let outcome = self
            .exec_streaming(buildlet, script, bs.conf.make_env())
            .await?;
        match outcome {
            ExecOutcome::Ok => Ok(()),
            ExecOutcome::Remote(detail) => Err(BuildError::Remote(format!("{script}: {detail}"))),
        }
    }

    // -- sub-repo builds -----------------------------------------------------

    async fn run_subrepo(&self, buildlet: &Arc<dyn Buildlet>) -> Result<(), BuildError> {
        let bs = &self.bs;
        let sub = bs.rev.sub_name.as_deref().expect("sub-repo build");
        let sub_rev = bs.rev.sub_rev.as_deref().expect("sub-repo build");
        let import_path = format!("golang.org/x/{sub}");
        let dest = format!("gopath/src/{import_path}");

        bs.event("fetch_subrepo", Some(import_path.clone()));
        let tarball = self
            .deps
            .sources
            .get(sub, sub_rev)
            .await
            .map_err(|e| BuildError::Infra(format!("subrepo fetch: {e}")))?;
        buildlet
            .put_tar(&bs.token, tarball.as_ref().clone(), &dest)
            .await?;

        let module_mode = buildlet
            .list_dir(&bs.token, &dest)
            .await?
            .iter()
            .any(|e| !e.is_dir && e.name == "go.mod");

        if module_mode {
            self.run_subrepo_modules(buildlet, &dest).await
        } else {
            self.fetch_gopath_deps(buildlet, &import_path).await?;
            self.go_test(buildlet, &format!("{import_path}/..."), &dest).await
        }
    }

    /// Module mode: the root module plus any inner modules found one level
    /// down each get their own `go test`.
    async fn run_subrepo_modules(
        &self,
        buildlet: &Arc<dyn Buildlet>,
        root: &str,
    ) -> Result<(), BuildError> {
        let bs = &self.bs;
        let mut module_dirs = vec![root.to_string()];
        for entry in buildlet.list_dir(&bs.token, root).await? {
            if !entry.is_dir {
                continue;
            }
            let child = format!("{root}/{}", entry.name);
            let has_mod = buildlet
                .list_dir(&bs.token, &child)
                .await?
                .iter()
                .any(|e| !e.is_dir && e.name == "go.mod");
            if has_mod {
                module_dirs.push(child);
            }
        }
        for dir in module_dirs {
            self.go_test(buildlet, "./...", &dir).await?;
        }
        Ok(())
    }

    /// GOPATH mode: discover project-internal dependencies via `go list`
    /// and fetch any missing ones at their latest revision, to closure.
    async fn fetch_gopath_deps(
        &self,
        buildlet: &Arc<dyn Buildlet>,
        import_path: &str,
    ) -> Result<(), BuildError> {
        let bs = &self.bs;
        let mut fetched: Vec<String> = vec![import_path
            .trim_start_matches("golang.org/x/")
            .to_string()];

        // Each pass can surface new transitive deps; bounded to keep a
        // malformed listing from looping forever.
        for _ in 0..10 {
            let deps = self.list_go_deps(buildlet, import_path).await?;
            let missing: Vec<String> = deps
                .into_iter()
                .filter_map(|d| {
                    d.strip_prefix("golang.org/x/")
                        .map(|rest| rest.split('/').next().unwrap_or(rest).to_string())
                })
                .filter(|repo| !fetched.contains(repo))
                .collect();
            if missing.is_empty() {
                return Ok(());
            }
            for repo in missing {
                bs.event("fetch_dep", Some(repo.clone()));
                // No specific rev is known for bare GOPATH deps; latest is
                // the accepted approximation.
                let tarball = self
                    .deps
                    .sources
                    .get(&repo, "master")
                    .await
                    .map_err(|e| BuildError::Infra(format!("dep fetch {repo}: {e}")))?;
                buildlet
                    .put_tar(
                        &bs.token,
                        tarball.as_ref().clone(),
                        &format!("gopath/src/golang.org/x/{repo}"),
                    )
                    .await?;
                fetched.push(repo);
            }
        }
        Ok(())
    }

    async fn list_go_deps(
        &self,
        buildlet: &Arc<dyn Buildlet>,
        import_path: &str,
    ) -> Result<Vec<String>, BuildError> {
        let bs = &self.bs;
        let (out_tx, out_rx) = flume::unbounded::<Vec<u8>>();
        let collector = tokio::spawn(async move {
            let mut buf = Vec::new();
            while let Ok(chunk) = out_rx.recv_async().await {
                buf.extend_from_slice(&chunk);
            }
            buf
        });
        let outcome = buildlet
            .exec(
                &bs.token,
                "go/bin/go",
                ExecOpts {
                    args: vec![
                        "list".to_string(),
                        "-deps".to_string(),
                        format!("{import_path}/..."),
                    ],
                    env: self.subrepo_env(),
                    timeout: Some(Duration::from_secs(120)),
                    ..Default::default()
                },
                out_tx,
            )
            .await?;
        let output = collector.await.unwrap_or_default();
        if let ExecOutcome::Remote(_) = outcome {
            // Listing fails until dependencies exist; treat its output as
            // the best available dependency hint.
        }
        Ok(String::from_utf8_lossy(&output)
            .split_whitespace()
            .map(|s| s.to_string())
            .collect())
    }

    async fn go_test(
        &self,
        buildlet: &Arc<dyn Buildlet>,
        target: &str,
        dir: &str,
    ) -> Result<(), BuildError> {
        let bs = &self.bs;
        bs.event("go_test", Some(format!("{dir}: go test {target}")));
        let (out_tx, out_rx) = flume::unbounded::<Vec<u8>>();
        let log = bs.log.clone();
        let streamer = tokio::spawn(async move {
            while let Ok(chunk) = out_rx.recv_async().await {
                log.write(&chunk);
            }
        });
        let outcome = buildlet
            .exec(
                &bs.token,
                "go/bin/go",
                ExecOpts {
                    args: vec!["test".to_string(), target.to_string()],
                    env: self.subrepo_env(),
                    dir: Some(dir.to_string()),
                    timeout: Some(bs.conf.test_timeout),
                    ..Default::default()
                },
                out_tx,
            )
            .await?;
        let _ = streamer.await;
        match outcome {
            ExecOutcome::Ok => Ok(()),
            ExecOutcome::Remote(detail) => {
                Err(BuildError::Remote(format!("go test {target}: {detail}")))
            }
        }
    }

    fn subrepo_env(&self) -> Vec<(String, String)> {
        let mut env = self.bs.conf.make_env();
        env.push(("GOPATH".to_string(), "$WORKDIR/gopath".to_string()));
        env
    }

    // -- shared plumbing -----------------------------------------------------

    /// Exec a script with its output streamed straight into the live log.
    async fn exec_streaming(
        &self,
        buildlet: &Arc<dyn Buildlet>,
        cmd: &str,
        env: Vec<(String, String)>,
    ) -> Result<ExecOutcome, BuildError> {
        let bs = &self.bs;
        let (out_tx, out_rx) = flume::unbounded::<Vec<u8>>();
        let log = bs.log.clone();
        let streamer = tokio::spawn(async move {
            while let Ok(chunk) = out_rx.recv_async().await {
                log.write(&chunk);
            }
        });
        let outcome = buildlet
            .exec(
                &bs.token,
                cmd,
                ExecOpts {
                    env,
                    dir: Some("go/src".to_string()),
                    timeout: Some(bs.conf.test_timeout),
                    ..Default::default()
                },
                out_tx,
            )
            .await?;
        let _ = streamer.await;
        Ok(outcome)
    }

    fn snapshot_url(&self) -> String {
        self.deps.snapshots.url(&self.bs.conf.name, &self.bs.rev.rev)
    }
}

fn make_script(goos: &str) -> &'static str {
    match goos {
        "windows" => "go/src/make.bat",
        "plan9" => "go/src/make.rc",
        _ => "go/src/make.bash",
    }
}

fn all_script(goos: &str) -> &'static str {
    match goos {
        "windows" => "go/src/all.bat",
        "plan9" => "go/src/all.rc",
        _ => "go/src/all.bash",
    }
}

impl From<bf_buildlet::CommError> for BuildError {
    fn from(e: bf_buildlet::CommError) -> Self {
        match e {
            bf_buildlet::CommError::Canceled => BuildError::Canceled,
            other => BuildError::Comm(other),
        }
    }
}
