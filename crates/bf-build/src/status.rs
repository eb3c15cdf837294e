use std::sync::{Arc, Mutex};

use bf_buildlet::CommError;
use bf_core::builders::BuilderConfig;
use bf_core::livelog::LiveLog;
use bf_core::types::{BuilderRev, Event, EVENT_DONE};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// BuildError
// ---------------------------------------------------------------------------

/// Terminal failure classification for one build.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BuildError {
    /// Required ancestor commit absent; the build is skipped, not failed.
    #[error("required dependency commit not in history")]
    MissingDependency,
    /// A remote tool ran and exited non-zero.
    #[error("remote failure: {0}")]
    Remote(String),
    /// Every buildlet working this build was lost with tests remaining.
    #[error("all buildlets lost mid-build")]
    BuildletsGone,
    /// Transport-level failure that exhausted its retries.
    #[error("communication failure: {0}")]
    Comm(CommError),
    /// Supporting infrastructure (storage, scheduler) failed the build.
    #[error("infrastructure error: {0}")]
    Infra(String),
    #[error("build canceled")]
    Canceled,
}

impl BuildError {
    /// Skipped builds report done-without-failure.
    pub fn counts_as_failure(&self) -> bool {
        !matches!(self, BuildError::MissingDependency | BuildError::Canceled)
    }
}

// ---------------------------------------------------------------------------
// BuildStatus
// ---------------------------------------------------------------------------

/// Runtime record of one build. The immutable head identifies the work;
/// everything that changes lives behind one short-held lock. The live log
/// and the cancellation token are owned alongside and are internally
/// synchronized.
pub struct BuildStatus {
    pub id: Uuid,
    pub rev: BuilderRev,
    pub conf: Arc<BuilderConfig>,
    pub created_at: DateTime<Utc>,
    pub is_try: bool,
    pub token: CancellationToken,
    pub log: LiveLog,
    state: Mutex<BuildState>,
}

#[derive(Default)]
struct BuildState {
    buildlet_name: Option<String>,
    started_at: Option<DateTime<Utc>>,
    done_at: Option<DateTime<Utc>>,
    succeeded: Option<bool>,
    events: Vec<Event>,
    canceled: bool,
    log_url: Option<String>,
    use_snapshot: Option<bool>,
    waiting_on_scheduler: bool,
}

/// Serializable view for status pages and operational JSON.
#[derive(Debug, Clone, Serialize)]
pub struct BuildSnapshot {
    pub id: Uuid,
    pub builder: String,
    pub rev: String,
    pub sub_name: Option<String>,
    pub sub_rev: Option<String>,
    pub is_try: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub done_at: Option<DateTime<Utc>>,
    pub succeeded: Option<bool>,
    pub canceled: bool,
    pub buildlet: Option<String>,
    pub waiting_on_scheduler: bool,
    pub last_event: Option<String>,
    pub log_url: Option<String>,
}

impl BuildStatus {
    pub fn new(rev: BuilderRev, conf: Arc<BuilderConfig>, is_try: bool) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            rev,
            conf,
            created_at: Utc::now(),
            is_try,
            token: CancellationToken::new(),
            log: LiveLog::new(),
            state: Mutex::new(BuildState::default()),
        })
    }

    /// Append an event under the status lock and mirror it into the live
    /// log. Append order is total per build.
    pub fn event(&self, name: &str, detail: Option<String>) {
        let ev = Event::new(name, detail);
        let line = ev.render();
        {
            let mut state = self.state.lock().expect("build status lock poisoned");
            state.events.push(ev);
        }
        self.log.write_line(&line);
    }

    pub fn set_buildlet(&self, name: &str) {
        let mut state = self.state.lock().expect("build status lock poisoned");
        state.buildlet_name = Some(name.to_string());
    }

    pub fn set_started(&self) {
        let mut state = self.state.lock().expect("build status lock poisoned");
        state.started_at = Some(Utc::now());
    }

    pub fn set_waiting_on_scheduler(&self, waiting: bool) {
        let mut state = self.state.lock().expect("build status lock poisoned");
        state.waiting_on_scheduler = waiting;
    }

    pub fn set_log_url(&self, url: &str) {
        let mut state = self.state.lock().expect("build status lock poisoned");
        state.log_url = Some(url.to_string());
    }

    pub fn log_url(&self) -> Option<String> {
        self.state
            .lock()
            .expect("build status lock poisoned")
            .log_url
            .clone()
    }

    /// Memoized snapshot decision for this build.
    pub fn set_use_snapshot(&self, use_snapshot: bool) {
        let mut state = self.state.lock().expect("build status lock poisoned");
        state.use_snapshot = Some(use_snapshot);
    }

    pub fn use_snapshot(&self) -> Option<bool> {
        self.state
            .lock()
            .expect("build status lock poisoned")
            .use_snapshot
    }

    /// Transition to done. Returns `false` when the build was already done
    /// (the transition happens exactly once). Closes the live log.
    pub fn mark_done(&self, succeeded: bool) -> bool {
        {
            let mut state = self.state.lock().expect("build status lock poisoned");
            if state.done_at.is_some() {
                return false;
            }
            state.done_at = Some(Utc::now());
            state.succeeded = Some(succeeded);
        }
        self.event(EVENT_DONE, Some(if succeeded { "ok".to_string() } else { "failed".to_string() }));
        self.log.close();
        info!(build = %self.rev, succeeded, "build done");
        true
    }

    /// Cancel the build: set the canceled bit and fire the token. The
    /// running tasks observe the token, finish in-flight I/O, and exit;
    /// reporting is suppressed.
    pub fn cancel(&self) {
        {
            let mut state = self.state.lock().expect("build status lock poisoned");
            if state.canceled {
                return;
            }
            state.canceled = true;
        }
        self.token.cancel();
    }

    pub fn is_done(&self) -> bool {
        self.state
            .lock()
            .expect("build status lock poisoned")
            .done_at
            .is_some()
    }

    pub fn is_canceled(&self) -> bool {
        self.state
            .lock()
            .expect("build status lock poisoned")
            .canceled
    }

    pub fn succeeded(&self) -> Option<bool> {
        self.state
            .lock()
            .expect("build status lock poisoned")
            .succeeded
    }

    pub fn events(&self) -> Vec<Event> {
        self.state
            .lock()
            .expect("build status lock poisoned")
            .events
            .clone()
    }

    /// Whether a named event has been appended.
    pub fn has_event(&self, name: &str) -> bool {
        self.state
            .lock()
            .expect("build status lock poisoned")
            .events
            .iter()
            .any(|e| e.name == name)
    }

    /// Wall time the build has run, ending at done when finished.
    pub fn run_time(&self) -> chrono::Duration {
        let state = self.state.lock().expect("build status lock poisoned");
        let start = state.started_at.unwrap_or(self.created_at);
        state
            .done_at
            .unwrap_or_else(Utc::now)
            .signed_duration_since(start)
    }

    pub fn snapshot(&self) -> BuildSnapshot {
        let state = self.state.lock().expect("build status lock poisoned");
        BuildSnapshot {
            id: self.id,
            builder: self.rev.name.clone(),
            rev: self.rev.rev.clone(),
            sub_name: self.rev.sub_name.clone(),
            sub_rev: self.rev.sub_rev.clone(),
            is_try: self.is_try,
            created_at: self.created_at,
            started_at: state.started_at,
            done_at: state.done_at,
            succeeded: state.succeeded,
            canceled: state.canceled,
            buildlet: state.buildlet_name.clone(),
            waiting_on_scheduler: state.waiting_on_scheduler,
            last_event: state.events.last().map(|e| e.name.clone()),
            log_url: state.log_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bf_core::builders::BuilderCatalog;

    fn status() -> Arc<BuildStatus> {
        let conf = BuilderCatalog::default().get("linux-amd64").unwrap();
        BuildStatus::new(BuilderRev::new("linux-amd64", "abc123def"), conf, false)
    }

    #[test]
    fn done_transition_happens_once() {
        let bs = status();
        assert!(!bs.is_done());
        assert!(bs.mark_done(true));
        assert!(!bs.mark_done(false));
        assert_eq!(bs.succeeded(), Some(true));
        assert!(bs.log.is_closed());
        assert!(bs.has_event(EVENT_DONE));
    }

    #[test]
    fn events_mirror_into_live_log_in_order() {
        let bs = status();
        bs.event("stage_one", None);
        bs.event("stage_two", Some("detail".to_string()));

        let events = bs.events();
        assert_eq!(events[0].name, "stage_one");
        assert_eq!(events[1].name, "stage_two");

        let log = String::from_utf8(bs.log.snapshot()).unwrap();
        let one = log.find("stage_one").unwrap();
        let two = log.find("stage_two").unwrap();
        assert!(one < two);
    }

    #[test]
    fn cancel_fires_token_once() {
        let bs = status();
        assert!(!bs.token.is_cancelled());
        bs.cancel();
        bs.cancel();
        assert!(bs.is_canceled());
        assert!(bs.token.is_cancelled());
    }

    #[test]
    fn missing_dependency_is_not_a_failure() {
        assert!(!BuildError::MissingDependency.counts_as_failure());
        assert!(!BuildError::Canceled.counts_as_failure());
        assert!(BuildError::Remote("tests failed".to_string()).counts_as_failure());
        assert!(BuildError::BuildletsGone.counts_as_failure());
    }

    #[test]
    fn snapshot_reflects_state() {
        let bs = status();
        bs.set_buildlet("buildlet-host-linux-rnd01");
        bs.set_started();
        let snap = bs.snapshot();
        assert_eq!(snap.builder, "linux-amd64");
        assert_eq!(snap.buildlet.as_deref(), Some("buildlet-host-linux-rnd01"));
        assert!(snap.started_at.is_some());
        assert!(snap.done_at.is_none());
    }
}
