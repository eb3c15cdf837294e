use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

// ---------------------------------------------------------------------------
// BuilderConfig
// ---------------------------------------------------------------------------

/// Compiled-in definition of one builder: which host type it runs on, how it
/// builds, and how its tests are sharded.
#[derive(Debug, Clone, Serialize)]
pub struct BuilderConfig {
    /// Builder name, e.g. `linux-amd64`. Unique within the catalog.
    pub name: String,
    /// Host type the scheduler requests from the pools, e.g. `host-linux`.
    pub host_type: String,
    pub goos: String,
    pub goarch: String,
    /// Extra environment for make and test execs.
    pub env: Vec<(String, String)>,
    /// Whether make and test run as separate phases, enabling toolchain
    /// snapshot reuse between builds of the same revision.
    pub split_make_run: bool,
    /// Helper buildlets acquired for post-submit test sharding.
    pub num_test_helpers: usize,
    /// Helper buildlets acquired for try-bot test sharding.
    pub num_try_test_helpers: usize,
    /// Whether this builder is in the default try-bot set for the main repo.
    pub default_try_bot: bool,
    /// Run the race detector variant of the test list.
    pub race: bool,
    /// Per-exec test timeout.
    pub test_timeout: Duration,
    /// Builders that never produce or consume toolchain snapshots.
    pub skip_snapshot: bool,
    /// When every buildlet is lost mid-run, report a terminal test failure
    /// instead of an infrastructure retry. Set for platforms whose
    /// connectivity flakes too often for retries to converge.
    pub lost_buildlets_terminal: bool,
    /// Commits that must be in the build's ancestry, or the build is skipped.
    pub required_ancestors: Vec<String>,
    /// Cap on concurrently active builds for this builder.
    pub max_active: usize,
    /// Typical wall time of the make phase, used to time helper ramp-up.
    pub expected_make_duration: Duration,
    /// Typical time for a fresh buildlet of this host type to become ready.
    pub expected_buildlet_start: Duration,
    /// Dist tests this builder never runs.
    pub skip_tests: Vec<String>,
    /// Sub-repositories this builder does not build. Empty means all.
    pub skip_repos: Vec<String>,
    /// Branches this builder builds. Empty means all branches.
    pub only_branches: Vec<String>,
}

impl BuilderConfig {
    fn new(name: &str, host_type: &str, goos: &str, goarch: &str) -> Self {
        Self {
            name: name.to_string(),
            host_type: host_type.to_string(),
            goos: goos.to_string(),
            goarch: goarch.to_string(),
            env: Vec::new(),
            split_make_run: true,
            num_test_helpers: 0,
            num_try_test_helpers: 0,
            default_try_bot: false,
            race: false,
            test_timeout: Duration::from_secs(20 * 60),
            skip_snapshot: false,
            lost_buildlets_terminal: false,
            required_ancestors: Vec::new(),
            max_active: 3,
            expected_make_duration: Duration::from_secs(5 * 60),
            expected_buildlet_start: Duration::from_secs(60),
            skip_tests: Vec::new(),
            skip_repos: Vec::new(),
            only_branches: Vec::new(),
        }
    }

    /// Whether this builder builds the given repo at the given branch.
    pub fn builds_repo(&self, repo: &str, branch: &str) -> bool {
        if self.skip_repos.iter().any(|r| r == repo) {
            return false;
        }
        self.only_branches.is_empty() || self.only_branches.iter().any(|b| b == branch)
    }

    /// Whether a dist test should run on this builder. Try builds skip a
    /// handful of long tests that post-submit coverage already exercises.
    pub fn should_run_dist_test(&self, test: &str, is_try: bool) -> bool {
        if self.skip_tests.iter().any(|t| t == test) {
            return false;
        }
        if is_try && matches!(test, "api" | "reboot" | "doc_progs") {
            return false;
        }
        true
    }

    /// Environment for the make phase: builder env plus GOOS/GOARCH.
    pub fn make_env(&self) -> Vec<(String, String)> {
        let mut env = self.env.clone();
        env.push(("GOOS".to_string(), self.goos.clone()));
        env.push(("GOARCH".to_string(), self.goarch.clone()));
        env
    }

    /// Helper count for the given build kind.
    pub fn helpers_for(&self, is_try: bool) -> usize {
        if is_try {
            self.num_try_test_helpers
        } else {
            self.num_test_helpers
        }
    }

    /// When, relative to make-phase start, helper acquisition should begin so
    /// helpers are ready as tests start.
    pub fn helper_ramp_up_delay(&self) -> Duration {
        self.expected_make_duration
            .saturating_sub(self.expected_buildlet_start)
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

/// The compiled-in builder catalog, keyed by builder name.
#[derive(Debug, Clone)]
pub struct BuilderCatalog {
    builders: HashMap<String, Arc<BuilderConfig>>,
}

impl BuilderCatalog {
    pub fn get(&self, name: &str) -> Option<Arc<BuilderConfig>> {
        self.builders.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// All builders, sorted by name for stable display.
    pub fn all(&self) -> Vec<Arc<BuilderConfig>> {
        let mut v: Vec<_> = self.builders.values().cloned().collect();
        v.sort_by(|a, b| a.name.cmp(&b.name));
        v
    }

    /// Builders in the default try-bot set for the given project/branch.
    pub fn try_builders(&self, project: &str, branch: &str) -> Vec<Arc<BuilderConfig>> {
        let mut v: Vec<_> = self
            .builders
            .values()
            .filter(|b| b.default_try_bot && b.builds_repo(project, branch))
            .cloned()
            .collect();
        v.sort_by(|a, b| a.name.cmp(&b.name));
        v
    }

    /// Resolve `TRY=` comment terms to slow-bot builders. A term matches a
    /// builder when it equals the builder name or its GOOS or GOARCH.
    pub fn slow_bots(&self, terms: &[String]) -> Vec<Arc<BuilderConfig>> {
        let mut v: Vec<_> = self
            .builders
            .values()
            .filter(|b| {
                !b.default_try_bot
                    && terms
                        .iter()
                        .any(|t| *t == b.name || *t == b.goos || *t == b.goarch)
            })
            .cloned()
            .collect();
        v.sort_by(|a, b| a.name.cmp(&b.name));
        v
    }

    fn insert(&mut self, b: BuilderConfig) {
        self.builders.insert(b.name.clone(), Arc::new(b));
    }
}

impl Default for BuilderCatalog {
    fn default() -> Self {
        let mut cat = Self {
            builders: HashMap::new(),
        };

        let mut b = BuilderConfig::new("linux-amd64", "host-linux", "linux", "amd64");
        b.num_test_helpers = 4;
        b.num_try_test_helpers = 4;
        b.default_try_bot = true;
        b.expected_make_duration = Duration::from_secs(150);
        b.expected_buildlet_start = Duration::from_secs(30);
        cat.insert(b);

        let mut b = BuilderConfig::new("linux-386", "host-linux", "linux", "386");
        b.env.push(("GOHOSTARCH".to_string(), "386".to_string()));
        b.num_test_helpers = 2;
        b.num_try_test_helpers = 2;
        b.default_try_bot = true;
        cat.insert(b);

        let mut b = BuilderConfig::new("linux-amd64-race", "host-linux", "linux", "amd64");
        b.race = true;
        b.num_try_test_helpers = 2;
        b.test_timeout = Duration::from_secs(40 * 60);
        cat.insert(b);

        let mut b = BuilderConfig::new("linux-arm", "host-linux-arm", "linux", "arm");
        b.num_test_helpers = 2;
        b.max_active = 2;
        b.expected_buildlet_start = Duration::from_secs(120);
        cat.insert(b);

        let mut b = BuilderConfig::new("windows-amd64-2016", "host-windows-2016", "windows", "amd64");
        b.num_test_helpers = 2;
        b.num_try_test_helpers = 2;
        b.default_try_bot = true;
        b.expected_make_duration = Duration::from_secs(8 * 60);
        cat.insert(b);

        let mut b = BuilderConfig::new("windows-386-2016", "host-windows-2016", "windows", "386");
        b.env.push(("GOHOSTARCH".to_string(), "386".to_string()));
        cat.insert(b);

        let mut b = BuilderConfig::new("darwin-amd64", "host-darwin", "darwin", "amd64");
        b.max_active = 2;
        b.skip_snapshot = true;
        b.split_make_run = false;
        cat.insert(b);

        let mut b = BuilderConfig::new("freebsd-amd64", "host-freebsd", "freebsd", "amd64");
        b.num_test_helpers = 2;
        cat.insert(b);

        let mut b = BuilderConfig::new("plan9-386", "host-plan9", "plan9", "386");
        b.lost_buildlets_terminal = true;
        b.max_active = 1;
        b.skip_repos = vec!["mobile".to_string()];
        cat.insert(b);

        let mut b = BuilderConfig::new("plan9-arm", "host-plan9-arm", "plan9", "arm");
        b.lost_buildlets_terminal = true;
        b.max_active = 1;
        cat.insert(b);

        let mut b = BuilderConfig::new("js-wasm", "host-js-wasm", "js", "wasm");
        b.skip_snapshot = true;
        b.skip_tests = vec!["nolibgcc:crypto/x509".to_string()];
        b.skip_repos = vec!["mobile".to_string(), "exp".to_string()];
        cat.insert(b);

        cat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_lookup() {
        let cat = BuilderCatalog::default();
        assert!(cat.contains("linux-amd64"));
        assert!(!cat.contains("solaris-sparc"));
        let b = cat.get("linux-amd64").unwrap();
        assert_eq!(b.host_type, "host-linux");
        assert!(b.split_make_run);
    }

    #[test]
    fn try_builders_are_sorted_and_filtered() {
        let cat = BuilderCatalog::default();
        let bots = cat.try_builders("go", "master");
        assert!(bots.iter().all(|b| b.default_try_bot));
        let names: Vec<_> = bots.iter().map(|b| b.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"linux-amd64"));
    }

    #[test]
    fn slow_bots_resolve_terms() {
        let cat = BuilderCatalog::default();
        let bots = cat.slow_bots(&["js".to_string()]);
        assert!(bots.iter().any(|b| b.name == "js-wasm"));
        // Default try-bots never appear as slow-bots.
        assert!(bots.iter().all(|b| !b.default_try_bot));
    }

    #[test]
    fn should_run_dist_test_filters() {
        let cat = BuilderCatalog::default();
        let b = cat.get("linux-amd64").unwrap();
        assert!(b.should_run_dist_test("go_test:fmt", false));
        assert!(b.should_run_dist_test("api", false));
        assert!(!b.should_run_dist_test("api", true));

        let wasm = cat.get("js-wasm").unwrap();
        assert!(!wasm.should_run_dist_test("nolibgcc:crypto/x509", false));
    }

    #[test]
    fn builds_repo_honors_skip_lists() {
        let cat = BuilderCatalog::default();
        let plan9 = cat.get("plan9-386").unwrap();
        assert!(plan9.builds_repo("go", "master"));
        assert!(!plan9.builds_repo("mobile", "master"));
    }

    #[test]
    fn helper_ramp_up_delay_subtracts_start_time() {
        let cat = BuilderCatalog::default();
        let b = cat.get("linux-amd64").unwrap();
        assert_eq!(b.helper_ramp_up_delay(), Duration::from_secs(120));
    }

    #[test]
    fn lost_buildlets_terminal_flag() {
        let cat = BuilderCatalog::default();
        assert!(cat.get("plan9-386").unwrap().lost_buildlets_terminal);
        assert!(!cat.get("linux-amd64").unwrap().lost_buildlets_terminal);
    }
}
