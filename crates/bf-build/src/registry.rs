use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bf_core::types::BuilderRev;
use tracing::debug;

use crate::status::BuildStatus;

/// Completed builds kept for the status page.
const RECENT_CAPACITY: usize = 30;

/// Process-wide index of in-flight and recently completed builds.
///
/// The registry owns `BuildStatus` handles for their whole life: admission
/// inserts them, completion moves them to the bounded recent ring, and the
/// status page reads both. Nothing else mutates it.
pub struct BuildRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<BuilderRev, Arc<BuildStatus>>,
    recent: VecDeque<Arc<BuildStatus>>,
}

impl BuildRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Admission: register a build unless one is already active for the
    /// same rev. Returns `false` (dropping the duplicate) in that case.
    pub fn register(&self, status: Arc<BuildStatus>) -> bool {
        let mut state = self.state.lock().expect("registry lock poisoned");
        if state.active.contains_key(&status.rev) {
            debug!(build = %status.rev, "duplicate build dropped at admission");
            return false;
        }
        state.active.insert(status.rev.clone(), status);
        true
    }

    pub fn is_building(&self, rev: &BuilderRev) -> bool {
        self.state
            .lock()
            .expect("registry lock poisoned")
            .active
            .contains_key(rev)
    }

    /// Active builds for one builder name, for per-builder concurrency caps.
    pub fn active_count_for(&self, builder: &str) -> usize {
        self.state
            .lock()
            .expect("registry lock poisoned")
            .active
            .keys()
            .filter(|rev| rev.name == builder)
            .count()
    }

    /// Move a finished build from active to the recent ring, evicting the
    /// oldest entry past capacity.
    pub fn mark_done(&self, rev: &BuilderRev) {
        let mut state = self.state.lock().expect("registry lock poisoned");
        if let Some(status) = state.active.remove(rev) {
            state.recent.push_back(status);
            while state.recent.len() > RECENT_CAPACITY {
                state.recent.pop_front();
            }
        }
    }

    pub fn find_active(&self, rev: &BuilderRev) -> Option<Arc<BuildStatus>> {
        self.state
            .lock()
            .expect("registry lock poisoned")
            .active
            .get(rev)
            .cloned()
    }

    /// Locate a live build by its identifying fields, for the log endpoint.
    pub fn find(
        &self,
        name: &str,
        rev: &str,
        sub_name: Option<&str>,
        sub_rev: Option<&str>,
    ) -> Option<Arc<BuildStatus>> {
        let state = self.state.lock().expect("registry lock poisoned");
        let matches = |s: &Arc<BuildStatus>| {
            s.rev.name == name
                && s.rev.rev == rev
                && s.rev.sub_name.as_deref() == sub_name
                && s.rev.sub_rev.as_deref() == sub_rev
        };
        state
            .active
            .values()
            .find(|s| matches(s))
            .or_else(|| state.recent.iter().rev().find(|s| matches(s)))
            .cloned()
    }

    /// All in-flight builds, newest first.
    pub fn active(&self) -> Vec<Arc<BuildStatus>> {
        let state = self.state.lock().expect("registry lock poisoned");
        let mut v: Vec<_> = state.active.values().cloned().collect();
        v.sort_by_key(|s| std::cmp::Reverse(s.created_at));
        v
    }

    /// Recently completed builds, newest first.
    pub fn recent(&self) -> Vec<Arc<BuildStatus>> {
        let state = self.state.lock().expect("registry lock poisoned");
        state.recent.iter().rev().cloned().collect()
    }
}

impl Default for BuildRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bf_core::builders::BuilderCatalog;

    fn status(rev: &str) -> Arc<BuildStatus> {
        let conf = BuilderCatalog::default().get("linux-amd64").unwrap();
        BuildStatus::new(BuilderRev::new("linux-amd64", rev), conf, false)
    }

    #[test]
    fn duplicate_registration_is_dropped() {
        let reg = BuildRegistry::new();
        assert!(reg.register(status("aaa")));
        assert!(!reg.register(status("aaa")));
        assert!(reg.is_building(&BuilderRev::new("linux-amd64", "aaa")));
        assert_eq!(reg.active().len(), 1);
    }

    #[test]
    fn done_build_moves_to_recent() {
        let reg = BuildRegistry::new();
        let rev = BuilderRev::new("linux-amd64", "aaa");
        reg.register(status("aaa"));
        reg.mark_done(&rev);

        assert!(!reg.is_building(&rev));
        assert_eq!(reg.recent().len(), 1);
        // The rev is free for a new build now.
        assert!(reg.register(status("aaa")));
    }

    #[test]
    fn recent_ring_caps_at_thirty() {
        let reg = BuildRegistry::new();
        for i in 0..31 {
            let rev = format!("rev{i:02}");
            reg.register(status(&rev));
            reg.mark_done(&BuilderRev::new("linux-amd64", &rev));
        }
        let recent = reg.recent();
        assert_eq!(recent.len(), RECENT_CAPACITY);
        // The oldest (rev00) was evicted; newest first.
        assert_eq!(recent[0].rev.rev, "rev30");
        assert!(recent.iter().all(|s| s.rev.rev != "rev00"));
    }

    #[test]
    fn active_count_for_counts_per_builder() {
        let reg = BuildRegistry::new();
        reg.register(status("aaa"));
        reg.register(status("bbb"));
        assert_eq!(reg.active_count_for("linux-amd64"), 2);
        assert_eq!(reg.active_count_for("linux-386"), 0);
    }

    #[test]
    fn find_matches_sub_repo_fields() {
        let reg = BuildRegistry::new();
        let conf = BuilderCatalog::default().get("linux-amd64").unwrap();
        let sub = BuildStatus::new(
            BuilderRev::with_sub_repo("linux-amd64", "gorev", "net", "netrev"),
            conf,
            false,
        );
        reg.register(sub);

        assert!(reg
            .find("linux-amd64", "gorev", Some("net"), Some("netrev"))
            .is_some());
        assert!(reg.find("linux-amd64", "gorev", None, None).is_none());
    }
}
