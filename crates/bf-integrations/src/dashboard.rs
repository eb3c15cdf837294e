use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{IntegrationError, Result};

// ---------------------------------------------------------------------------
// Feed types
// ---------------------------------------------------------------------------

/// The dashboard's build-status feed: the builder column order plus one
/// slot row per tracked revision.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DashboardStatus {
    #[serde(rename = "Builders", default)]
    pub builders: Vec<String>,
    #[serde(rename = "Revisions", default)]
    pub revisions: Vec<RevisionSlot>,
}

/// One revision row. `results[i]` pairs with `builders[i]` in the
/// surrounding feed; an empty string means that cell has no result yet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RevisionSlot {
    #[serde(rename = "Repo", default)]
    pub repo: String,
    #[serde(rename = "Revision", default)]
    pub revision: String,
    /// For sub-repo rows, the main-repo revision to build against.
    #[serde(rename = "GoRevision", default, skip_serializing_if = "Option::is_none")]
    pub go_revision: Option<String>,
    #[serde(rename = "Branch", default)]
    pub branch: String,
    #[serde(rename = "Date", default, skip_serializing_if = "Option::is_none")]
    pub date: Option<DateTime<Utc>>,
    #[serde(rename = "Results", default)]
    pub results: Vec<String>,
}

impl RevisionSlot {
    /// Whether the cell for builder index `i` still needs a build.
    pub fn needs_build(&self, i: usize) -> bool {
        self.results.get(i).map(|r| r.is_empty()).unwrap_or(true)
    }
}

/// Result record posted back to the dashboard when a post-submit build
/// finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    #[serde(rename = "Builder")]
    pub builder: String,
    #[serde(rename = "Repo")]
    pub repo: String,
    #[serde(rename = "Rev")]
    pub rev: String,
    #[serde(rename = "GoRev", default, skip_serializing_if = "Option::is_none")]
    pub go_rev: Option<String>,
    #[serde(rename = "OK")]
    pub ok: bool,
    #[serde(rename = "LogURL", default, skip_serializing_if = "Option::is_none")]
    pub log_url: Option<String>,
    #[serde(rename = "RunTimeSecs")]
    pub run_time_secs: i64,
}

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait DashboardClient: Send + Sync {
    /// Fetch the current build-status feed.
    async fn fetch_status(&self) -> Result<DashboardStatus>;

    /// Record one finished post-submit build.
    async fn record_result(&self, record: &BuildRecord) -> Result<()>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpDashboardClient {
    base: String,
    http: reqwest::Client,
}

impl HttpDashboardClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DashboardClient for HttpDashboardClient {
    async fn fetch_status(&self) -> Result<DashboardStatus> {
        let url = format!("{}/status.json", self.base);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(IntegrationError::Status(resp.status().as_u16(), url));
        }
        resp.json::<DashboardStatus>()
            .await
            .map_err(|e| IntegrationError::Decode(e.to_string()))
    }

    async fn record_result(&self, record: &BuildRecord) -> Result<()> {
        let url = format!("{}/result", self.base);
        let resp = self.http.post(&url).json(record).send().await?;
        if !resp.status().is_success() {
            return Err(IntegrationError::Status(resp.status().as_u16(), url));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Dev-mode and test dashboard: a settable feed plus a record of results.
#[derive(Default)]
pub struct MemoryDashboard {
    status: Mutex<DashboardStatus>,
    recorded: Mutex<Vec<BuildRecord>>,
}

impl MemoryDashboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, status: DashboardStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn recorded(&self) -> Vec<BuildRecord> {
        self.recorded.lock().unwrap().clone()
    }
}

#[async_trait]
impl DashboardClient for MemoryDashboard {
    async fn fetch_status(&self) -> Result<DashboardStatus> {
        Ok(self.status.lock().unwrap().clone())
    }

    async fn record_result(&self, record: &BuildRecord) -> Result<()> {
        self.recorded.lock().unwrap().push(record.clone());
        Ok(())
    }
}
