use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bf_buildlet::{Buildlet, CommError, ExecOpts, ExecOutcome};
use bf_core::types::EVENT_STILL_WAITING;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::shard::{ItemResult, TestItem, TestSet};
use crate::status::{BuildError, BuildStatus};

/// Sentinel the dist tool prints before each test's output so the parser
/// can attribute lines to the right test.
pub const TEST_BANNER: &str = "XXXBANNER=";

/// Heartbeat interval while the consumer waits on one test.
const STILL_WAITING_INTERVAL: Duration = Duration::from_secs(30);

/// Which chunking view a worker consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum View {
    /// Primary: readable streaming order.
    InOrder,
    /// Helpers: largest estimates first.
    BiggestFirst,
}

// ---------------------------------------------------------------------------
// ShardedExecutor
// ---------------------------------------------------------------------------

/// Drives one build's test set across the primary buildlet and any helpers.
///
/// Workers claim chunks through the items' take tokens and complete them
/// through the done signals; the consumer streams results in order into the
/// live log. When the primary and every helper have exited with tests still
/// remaining, the all-gone signal fails the build.
pub struct ShardedExecutor {
    pub bs: Arc<BuildStatus>,
    pub set: Arc<TestSet>,
    /// Environment for dist test execs.
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    /// Snapshot URL each helper extracts before claiming work.
    pub helper_snapshot_url: Option<String>,
    /// Pass `--race` to the dist tool.
    pub race: bool,
}

impl ShardedExecutor {
    /// Run the whole set. `helpers` delivers helper buildlets as the
    /// scheduler produces them; the sender side must be dropped once no
    /// more will arrive.
    pub async fn run(
        self: Arc<Self>,
        primary: Arc<dyn Buildlet>,
        helpers: flume::Receiver<Arc<dyn Buildlet>>,
    ) -> Result<(), BuildError> {
        let (gone_tx, gone_rx) = watch::channel(false);

        let supervisor = tokio::spawn({
            let this = self.clone();
            async move {
                let mut workers = tokio::task::JoinSet::new();
                {
                    let this = this.clone();
                    let primary = primary.clone();
                    workers.spawn(async move { this.worker_loop(primary, View::InOrder).await });
                }
                // Spawn a worker per helper until the sender closes.
                while let Ok(helper) = helpers.recv_async().await {
                    let this = this.clone();
                    workers.spawn(async move {
                        this.helper_setup_and_loop(helper).await;
                    });
                }
                while workers.join_next().await.is_some() {}
                let _ = gone_tx.send(true);
            }
        });

        let res = self.consume(gone_rx).await;
        // The supervisor is left to finish on its own: workers observe the
        // canceled set (or token) and exit, closing their helpers. Aborting
        // it here would strand helper handles unclosed.
        drop(supervisor);
        res
    }

    // -- worker side --------------------------------------------------------

    async fn helper_setup_and_loop(&self, helper: Arc<dyn Buildlet>) {
        if let Some(url) = &self.helper_snapshot_url {
            if let Err(e) = helper.put_tar_from_url(&self.bs.token, url, "go").await {
                warn!(helper = %helper.name(), error = %e, "helper snapshot extraction failed");
                helper.close().await;
                return;
            }
        }
        self.worker_loop(helper.clone(), View::BiggestFirst).await;
        // The executor owns helper handles once they arrive; the runner only
        // ever closes the primary.
        helper.close().await;
    }

    /// Claim chunks from the view and execute them until the set drains,
    /// the build cancels, or the buildlet dies.
    async fn worker_loop(&self, buildlet: Arc<dyn Buildlet>, view: View) {
        let chunks = match view {
            View::InOrder => &self.set.in_order,
            View::BiggestFirst => &self.set.biggest_first,
        };
        loop {
            if self.bs.token.is_cancelled() {
                break;
            }
            let chunk = chunks
                .iter()
                .find(|chunk| TestSet::try_take_chunk(chunk))
                .cloned();
            let Some(chunk) = chunk else { break };

            match self.exec_chunk(&buildlet, &chunk).await {
                Ok(()) => {}
                Err(e) => {
                    self.fail_or_requeue_chunk(&chunk, &e);
                    buildlet.mark_broken();
                    debug!(worker = %buildlet.name(), error = %e, "worker lost, exiting loop");
                    break;
                }
            }
        }
    }

    /// Execute one claimed chunk, attributing output and completing items.
    async fn exec_chunk(
        &self,
        buildlet: &Arc<dyn Buildlet>,
        chunk: &[Arc<TestItem>],
    ) -> Result<(), CommError> {
        let mut args = vec![
            "tool".to_string(),
            "dist".to_string(),
            "test".to_string(),
            "--no-rebuild".to_string(),
            format!("--banner={}", &TEST_BANNER[..TEST_BANNER.len() - 1]),
        ];
        if self.race {
            args.push("--race".to_string());
        }
        args.extend(chunk.iter().map(|i| i.name.clone()));

        let opts = ExecOpts {
            args,
            env: self.env.clone(),
            dir: Some("go".to_string()),
            path: Vec::new(),
            timeout: Some(self.timeout),
            system_level: false,
            debug: false,
        };

        let (out_tx, out_rx) = flume::unbounded::<Vec<u8>>();
        let collector = tokio::spawn(async move {
            let mut buf = Vec::new();
            while let Ok(chunk) = out_rx.recv_async().await {
                buf.extend_from_slice(&chunk);
            }
            buf
        });

        let started = Instant::now();
        let exec_res = buildlet
            .exec(&self.bs.token, "go/bin/go", opts, out_tx)
            .await;
        let output = collector.await.unwrap_or_default();
        let elapsed = started.elapsed();

        match exec_res {
            Ok(outcome) => {
                let remote_err = match outcome {
                    ExecOutcome::Ok => None,
                    ExecOutcome::Remote(detail) => Some(detail),
                };
                let sections = split_banner_output(&output);
                let per_item = elapsed / chunk.len().max(1) as u32;
                for item in chunk {
                    let section = sections
                        .get(item.name.as_str())
                        .cloned()
                        .unwrap_or_default();
                    item.mark_done(ItemResult {
                        output: section,
                        remote_err: remote_err.clone(),
                        actual_duration: Some(per_item),
                        shard_worker: Some(buildlet.name().to_string()),
                        group_size: chunk.len(),
                    });
                }
                Ok(())
            }
            Err(CommError::Timeout(d)) => {
                // A timeout is a test failure, not a retry: the command was
                // running and never finished.
                for item in chunk {
                    item.mark_done(ItemResult {
                        output: output.clone(),
                        remote_err: Some(format!("test timed out after {d:?}")),
                        actual_duration: Some(elapsed),
                        shard_worker: Some(buildlet.name().to_string()),
                        group_size: chunk.len(),
                    });
                }
                Err(CommError::Timeout(d))
            }
            Err(e) => Err(e),
        }
    }

    /// After a communication failure: requeue items with attempts left,
    /// permanently fail the rest.
    fn fail_or_requeue_chunk(&self, chunk: &[Arc<TestItem>], err: &CommError) {
        if matches!(err, CommError::Timeout(_)) {
            // Items were already completed by exec_chunk.
            return;
        }
        for item in chunk {
            if item.is_done() {
                continue;
            }
            if item.retryable() {
                item.untake();
            } else {
                item.mark_done(ItemResult {
                    output: Vec::new(),
                    remote_err: Some(format!(
                        "communication failure after {} attempts: {err}",
                        item.attempts()
                    )),
                    actual_duration: None,
                    shard_worker: None,
                    group_size: chunk.len(),
                });
            }
        }
    }

    // -- consumer side ------------------------------------------------------

    /// Stream results in plan order into the live log. Fails the whole set
    /// on the first remote error; fails with `BuildletsGone` when every
    /// worker has exited with tests remaining.
    async fn consume(&self, mut gone_rx: watch::Receiver<bool>) -> Result<(), BuildError> {
        for chunk in &self.set.in_order {
            for item in chunk {
                loop {
                    if item.is_done() {
                        break;
                    }
                    let heartbeat = tokio::time::sleep(STILL_WAITING_INTERVAL);
                    tokio::select! {
                        biased;
                        _ = item.done() => break,
                        _ = self.bs.token.cancelled() => return Err(BuildError::Canceled),
                        res = gone_rx.changed() => {
                            let all_gone = res.is_err() || *gone_rx.borrow();
                            if all_gone && !item.is_done() {
                                self.set.cancel_remaining("all buildlets lost");
                                return Err(BuildError::BuildletsGone);
                            }
                        }
                        _ = heartbeat => {
                            self.bs.event(EVENT_STILL_WAITING, Some(item.name.clone()));
                        }
                    }
                }

                let result = item.result().expect("done item has a result");
                if !result.output.is_empty() {
                    self.bs.log.write(&result.output);
                }
                if let Some(err) = result.remote_err {
                    self.set.cancel_remaining("peer test failed");
                    return Err(BuildError::Remote(format!("{}: {err}", item.name)));
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Banner parsing
// ---------------------------------------------------------------------------

/// Split combined dist output into per-test sections keyed by test name.
/// Lines before the first banner belong to no test and are dropped from
/// attribution (the raw stream already went to the log on failure paths).
pub fn split_banner_output(raw: &[u8]) -> HashMap<String, Vec<u8>> {
    let mut sections: HashMap<String, Vec<u8>> = HashMap::new();
    let mut current: Option<String> = None;
    for line in raw.split_inclusive(|&b| b == b'\n') {
        let trimmed = std::str::from_utf8(line).ok().map(str::trim_end);
        if let Some(name) = trimmed.and_then(|l| l.strip_prefix(TEST_BANNER)) {
            current = Some(name.to_string());
            continue;
        }
        if let Some(name) = &current {
            sections.entry(name.clone()).or_default().extend_from_slice(line);
        }
    }
    sections
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::DurationTable;
    use bf_buildlet::{FakeBuildlet, ScriptedExec};
    use bf_core::builders::BuilderCatalog;
    use bf_core::types::BuilderRev;

    fn build_status() -> Arc<BuildStatus> {
        let conf = BuilderCatalog::default().get("linux-amd64").unwrap();
        BuildStatus::new(BuilderRev::new("linux-amd64", "abc123def456"), conf, false)
    }

    fn executor(bs: Arc<BuildStatus>, names: &[&str]) -> Arc<ShardedExecutor> {
        let durations = DurationTable::new();
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let set = Arc::new(TestSet::plan("linux-amd64", &names, &durations));
        Arc::new(ShardedExecutor {
            bs,
            set,
            env: vec![("GOOS".to_string(), "linux".to_string())],
            timeout: Duration::from_secs(60),
            helper_snapshot_url: None,
            race: false,
        })
    }

    fn closed_helpers() -> flume::Receiver<Arc<dyn Buildlet>> {
        let (_tx, rx) = flume::bounded(0);
        rx
    }

    #[test]
    fn banner_output_is_attributed() {
        let raw = b"preamble\nXXXBANNER=go_test:fmt\nfmt ok\nXXXBANNER=race\nrace line 1\nrace line 2\n";
        let sections = split_banner_output(raw);
        assert_eq!(sections["go_test:fmt"], b"fmt ok\n");
        assert_eq!(sections["race"], b"race line 1\nrace line 2\n");
        assert!(!sections.contains_key("preamble"));
    }

    #[tokio::test]
    async fn all_tests_pass_on_primary_alone() {
        let bs = build_status();
        let exec = executor(bs.clone(), &["go_test:fmt", "go_test:sort", "race"]);

        let primary = Arc::new(FakeBuildlet::new("primary", "host-linux"));
        primary.script(
            "go/bin/go",
            ScriptedExec::ok_with_output(
                b"XXXBANNER=go_test:fmt\nok fmt\nXXXBANNER=go_test:sort\nok sort\nXXXBANNER=race\nok race\n"
                    .to_vec(),
            ),
        );

        exec.clone().run(primary, closed_helpers()).await.unwrap();
        assert_eq!(exec.set.remaining(), 0);
        let log = String::from_utf8(bs.log.snapshot()).unwrap();
        assert!(log.contains("ok fmt"));
        assert!(log.contains("ok race"));
    }

    #[tokio::test]
    async fn remote_failure_fails_build_and_cancels_set() {
        let bs = build_status();
        let exec = executor(bs.clone(), &["go_test:fmt", "race"]);

        let primary = Arc::new(FakeBuildlet::new("primary", "host-linux"));
        primary.script(
            "go/bin/go",
            ScriptedExec::remote_failure("exit status 1"),
        );

        let err = exec
            .clone()
            .run(primary, closed_helpers())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Remote(_)));
        assert_eq!(exec.set.remaining(), 0);
    }

    #[tokio::test]
    async fn lost_buildlets_fail_with_buildlets_gone() {
        let bs = build_status();
        let exec = executor(bs.clone(), &["go_test:fmt"]);

        let primary = Arc::new(FakeBuildlet::new("primary", "host-linux"));
        // Connection dies on every attempt; after the retry budget the
        // worker exits and the all-gone path must fire.
        primary.script(
            "go/bin/go",
            ScriptedExec::comm_failure(CommError::Connection("reset".to_string())),
        );

        let err = exec
            .clone()
            .run(primary.clone(), closed_helpers())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::BuildletsGone | BuildError::Remote(_)));
        assert!(primary.is_broken());
    }

    #[tokio::test]
    async fn timeout_marks_tests_failed_and_buildlet_broken() {
        let bs = build_status();
        let exec = executor(bs.clone(), &["go_test:fmt"]);

        let primary = Arc::new(FakeBuildlet::new("primary", "host-linux"));
        primary.script(
            "go/bin/go",
            ScriptedExec::comm_failure(CommError::Timeout(Duration::from_secs(60))),
        );

        let err = exec
            .clone()
            .run(primary.clone(), closed_helpers())
            .await
            .unwrap_err();
        // The timed-out item carries a remote error, so the consumer
        // reports a test failure rather than lost buildlets.
        assert!(matches!(err, BuildError::Remote(_)));
        assert!(primary.is_broken());
        assert_eq!(exec.set.items[0].attempts(), 1);
    }

    #[tokio::test]
    async fn helpers_share_the_work() {
        let bs = build_status();
        let exec = executor(bs.clone(), &["go_test:fmt", "go_test:cmd/go", "race", "api"]);

        let script_all = |b: &FakeBuildlet| {
            b.on_exec(|_cmd, opts| {
                // Echo a banner for every requested test so attribution works.
                let mut out = Vec::new();
                for name in opts.args.iter().filter(|a| !a.starts_with("--")).skip(3) {
                    out.extend_from_slice(format!("{TEST_BANNER}{name}\nok {name}\n").as_bytes());
                }
                ScriptedExec::ok_with_output(out)
            });
        };

        let primary = Arc::new(FakeBuildlet::new("primary", "host-linux"));
        script_all(&primary);
        let helper = Arc::new(FakeBuildlet::new("helper-1", "host-linux"));
        script_all(&helper);

        let (tx, rx) = flume::unbounded::<Arc<dyn Buildlet>>();
        tx.send(helper.clone()).unwrap();
        drop(tx);

        exec.clone().run(primary.clone(), rx).await.unwrap();
        assert_eq!(exec.set.remaining(), 0);

        // Every item records which worker ran it.
        for item in &exec.set.items {
            let worker = item.result().unwrap().shard_worker.unwrap();
            assert!(worker == "primary" || worker == "helper-1");
        }
    }

    #[tokio::test]
    async fn helper_extracts_snapshot_before_claiming() {
        let bs = build_status();
        let mut exec = executor(bs.clone(), &["go_test:fmt"]);
        Arc::get_mut(&mut exec).unwrap().helper_snapshot_url =
            Some("https://objects/farm-snapshots/go/linux-amd64/abc.tar.gz".to_string());

        let primary = Arc::new(FakeBuildlet::new("primary", "host-linux"));
        primary.script(
            "go/bin/go",
            ScriptedExec::ok_with_output(b"XXXBANNER=go_test:fmt\nok\n".to_vec()),
        );
        let helper = Arc::new(FakeBuildlet::new("helper-1", "host-linux"));

        let (tx, rx) = flume::unbounded::<Arc<dyn Buildlet>>();
        tx.send(helper.clone()).unwrap();
        drop(tx);

        exec.clone().run(primary, rx).await.unwrap();
        let urls = helper.recorded_put_urls();
        assert_eq!(urls.len(), 1);
        assert!(urls[0].0.contains("abc.tar.gz"));
        assert_eq!(urls[0].1, "go");
    }
}
