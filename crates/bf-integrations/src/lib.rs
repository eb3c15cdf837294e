//! Clients for the coordinator's external collaborators: the dashboard
//! (work feed and result sink), the review service (try-work feed and
//! comment sink), object storage (snapshots and logs), and source hosting
//! (tarball archives and ancestry queries).
//!
//! Each collaborator is a trait with an HTTP implementation for production
//! and an in-memory implementation for dev mode and tests. The core crates
//! only ever see the traits.

pub mod dashboard;
pub mod review;
pub mod source;
pub mod storage;

pub use dashboard::{BuildRecord, DashboardClient, DashboardStatus, HttpDashboardClient, MemoryDashboard, RevisionSlot};
pub use review::{HttpReviewClient, MemoryReview, ReviewClient, TryWorkItem, Vote};
pub use source::{HttpSourceClient, MemorySource, SourceClient};
pub use storage::{HttpObjectStore, MemoryObjectStore, ObjectStore};

/// Errors from any collaborator client.
#[derive(Debug, Clone, thiserror::Error)]
pub enum IntegrationError {
    #[error("http request failed: {0}")]
    Http(String),
    #[error("unexpected status {0} from {1}")]
    Status(u16, String),
    #[error("response too large: {0} bytes (limit {1})")]
    TooLarge(usize, usize),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("{0} not found")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, IntegrationError>;

impl From<reqwest::Error> for IntegrationError {
    fn from(e: reqwest::Error) -> Self {
        IntegrationError::Http(e.to_string())
    }
}
