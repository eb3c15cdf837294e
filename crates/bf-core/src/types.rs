use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// BuilderRev
// ---------------------------------------------------------------------------

/// Identity of one unit of build work: a builder name plus the main-repo
/// revision it builds, optionally extended with a sub-repository and its
/// revision.
///
/// This is the key for all scheduling, status tracking, and caching. Two
/// builds with equal `BuilderRev`s are the same work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuilderRev {
    /// Builder name, e.g. `linux-amd64`.
    pub name: String,
    /// Main-repo revision (full hash).
    pub rev: String,
    /// Sub-repository name (e.g. `net`, `tools`) when this is a sub-repo build.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_name: Option<String>,
    /// Sub-repository revision. Set exactly when `sub_name` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_rev: Option<String>,
}

impl BuilderRev {
    pub fn new(name: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rev: rev.into(),
            sub_name: None,
            sub_rev: None,
        }
    }

    pub fn with_sub_repo(
        name: impl Into<String>,
        rev: impl Into<String>,
        sub_name: impl Into<String>,
        sub_rev: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            rev: rev.into(),
            sub_name: Some(sub_name.into()),
            sub_rev: Some(sub_rev.into()),
        }
    }

    pub fn is_sub_repo(&self) -> bool {
        self.sub_name.is_some()
    }

    /// The repository this build actually tests: the sub-repo when present,
    /// otherwise the main repo.
    pub fn repo_or_main(&self) -> &str {
        self.sub_name.as_deref().unwrap_or("go")
    }

    /// The revision of the repository under test.
    pub fn test_rev(&self) -> &str {
        self.sub_rev.as_deref().unwrap_or(&self.rev)
    }

    /// First 8 hex characters of the revision under test, for display and
    /// object names.
    pub fn short_rev(&self) -> &str {
        let rev = self.test_rev();
        &rev[..rev.len().min(8)]
    }

    /// Returns an error string when the rev is structurally invalid.
    pub fn validate(&self) -> Result<(), InvalidBuilderRev> {
        if self.rev.is_empty() {
            return Err(InvalidBuilderRev::EmptyRev);
        }
        if self.sub_name.is_some() != self.sub_rev.is_some() {
            return Err(InvalidBuilderRev::PartialSubRepo);
        }
        Ok(())
    }
}

impl std::fmt::Display for BuilderRev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.sub_name, &self.sub_rev) {
            (Some(sub), Some(sub_rev)) => write!(
                f,
                "{}@{} ({}@{})",
                self.name,
                &self.rev[..self.rev.len().min(8)],
                sub,
                &sub_rev[..sub_rev.len().min(8)]
            ),
            _ => write!(f, "{}@{}", self.name, &self.rev[..self.rev.len().min(8)]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidBuilderRev {
    #[error("builder rev has an empty revision")]
    EmptyRev,
    #[error("sub_name and sub_rev must be set together")]
    PartialSubRepo,
}

// ---------------------------------------------------------------------------
// TryKey
// ---------------------------------------------------------------------------

/// Identity of one review-system change under pre-submit test.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TryKey {
    /// Project (repository) the change targets, e.g. `go` or `net`.
    pub project: String,
    /// Target branch, e.g. `master`.
    pub branch: String,
    /// Review-system change identifier (`I…`).
    pub change_id: String,
    /// Commit hash of the patch set under test.
    pub commit: String,
}

impl TryKey {
    pub fn new(
        project: impl Into<String>,
        branch: impl Into<String>,
        change_id: impl Into<String>,
        commit: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            branch: branch.into(),
            change_id: change_id.into(),
            commit: commit.into(),
        }
    }

    /// Changes against the main repository's main branch get the widest
    /// builder fan-out (cross-repo builders may be requested for them).
    pub fn is_main_repo_main_branch(&self) -> bool {
        self.project == "go" && self.branch == "master"
    }
}

impl std::fmt::Display for TryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} {} {}",
            self.project,
            self.branch,
            self.change_id,
            &self.commit[..self.commit.len().min(8)]
        )
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// Magic event names that other subsystems key off. These are contract:
/// the try-set aggregator and the log handlers match on them literally.
pub const EVENT_DONE: &str = "done";
pub const EVENT_SKIPPED_MISSING_DEP: &str = "skipped_build_missing_dep";
pub const EVENT_MAKE_AND_TEST: &str = "make_and_test";
pub const EVENT_STILL_WAITING: &str = "still_waiting_on_test";

/// One timestamped entry in a build's event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub at: DateTime<Utc>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Event {
    pub fn new(name: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            at: Utc::now(),
            name: name.into(),
            detail,
        }
    }

    /// Render as one plain-text log line, the format the temporary-log
    /// endpoint streams.
    pub fn render(&self) -> String {
        match &self.detail {
            Some(d) => format!("{} {} {}", self.at.format("%H:%M:%S%.3f"), self.name, d),
            None => format!("{} {}", self.at.format("%H:%M:%S%.3f"), self.name),
        }
    }
}

// ---------------------------------------------------------------------------
// Object naming
// ---------------------------------------------------------------------------

/// Object name for a toolchain snapshot: `go/<builder>/<rev>.tar.gz`.
pub fn snapshot_object_name(builder: &str, rev: &str) -> String {
    format!("go/{builder}/{rev}.tar.gz")
}

/// Object name for an uploaded build log:
/// `<hex-prefix>/<builder>_<short-rev>_<nonce>.log`.
///
/// The two-character hex prefix spreads objects across storage shards; it is
/// derived from the revision so related logs stay adjacent.
pub fn log_object_name(builder: &str, rev: &str, nonce: &str) -> String {
    let prefix = &rev[..rev.len().min(2)];
    let short = &rev[..rev.len().min(8)];
    format!("{prefix}/{builder}_{short}_{nonce}.log")
}
