use std::sync::Mutex;

use async_trait::async_trait;
use bf_core::types::TryKey;
use serde::{Deserialize, Serialize};

use crate::{IntegrationError, Result};

// ---------------------------------------------------------------------------
// Try work
// ---------------------------------------------------------------------------

/// One change the review service wants try-tested, as returned by its
/// maintenance RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryWorkItem {
    pub project: String,
    pub branch: String,
    pub change_id: String,
    pub commit: String,
    /// Extra builder terms from a `TRY=` comment on the change.
    #[serde(default)]
    pub slow_bot_terms: Vec<String>,
    /// Sub-repos explicitly requested to be tested against this change.
    #[serde(default)]
    pub extra_repos: Vec<String>,
}

impl TryWorkItem {
    pub fn key(&self) -> TryKey {
        TryKey::new(
            self.project.clone(),
            self.branch.clone(),
            self.change_id.clone(),
            self.commit.clone(),
        )
    }
}

/// A verdict label posted with the final try-set comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    /// TryBots passed: +1.
    Approve,
    /// TryBots failed: -1.
    Reject,
}

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ReviewClient: Send + Sync {
    /// Changes currently wanting try-bot runs.
    async fn pending_try_work(&self) -> Result<Vec<TryWorkItem>>;

    /// Post a comment on the change, optionally with a TryBot vote.
    async fn post_comment(&self, key: &TryKey, message: &str, vote: Option<Vote>) -> Result<()>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpReviewClient {
    base: String,
    http: reqwest::Client,
}

impl HttpReviewClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
struct CommentRequest<'a> {
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    vote: Option<Vote>,
}

#[async_trait]
impl ReviewClient for HttpReviewClient {
    async fn pending_try_work(&self) -> Result<Vec<TryWorkItem>> {
        let url = format!("{}/try-work", self.base);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(IntegrationError::Status(resp.status().as_u16(), url));
        }
        resp.json::<Vec<TryWorkItem>>()
            .await
            .map_err(|e| IntegrationError::Decode(e.to_string()))
    }

    async fn post_comment(&self, key: &TryKey, message: &str, vote: Option<Vote>) -> Result<()> {
        let url = format!(
            "{}/changes/{}/revisions/{}/review",
            self.base, key.change_id, key.commit
        );
        let resp = self
            .http
            .post(&url)
            .json(&CommentRequest { message, vote })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(IntegrationError::Status(resp.status().as_u16(), url));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// Test and dev review service: a settable work list plus a transcript of
/// posted comments.
#[derive(Default)]
pub struct MemoryReview {
    work: Mutex<Vec<TryWorkItem>>,
    comments: Mutex<Vec<(TryKey, String, Option<Vote>)>>,
}

impl MemoryReview {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_work(&self, work: Vec<TryWorkItem>) {
        *self.work.lock().unwrap() = work;
    }

    pub fn comments(&self) -> Vec<(TryKey, String, Option<Vote>)> {
        self.comments.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReviewClient for MemoryReview {
    async fn pending_try_work(&self) -> Result<Vec<TryWorkItem>> {
        Ok(self.work.lock().unwrap().clone())
    }

    async fn post_comment(&self, key: &TryKey, message: &str, vote: Option<Vote>) -> Result<()> {
        self.comments
            .lock()
            .unwrap()
            .push((key.clone(), message.to_string(), vote));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_work_item_builds_key() {
        let item = TryWorkItem {
            project: "go".to_string(),
            branch: "master".to_string(),
            change_id: "I123".to_string(),
            commit: "def456".to_string(),
            slow_bot_terms: vec![],
            extra_repos: vec![],
        };
        let key = item.key();
        assert_eq!(key.change_id, "I123");
        assert!(key.is_main_repo_main_branch());
    }

    #[tokio::test]
    async fn memory_review_records_comments() {
        let review = MemoryReview::new();
        let key = TryKey::new("go", "master", "I1", "c1");
        review
            .post_comment(&key, "TryBots beginning", None)
            .await
            .unwrap();
        review
            .post_comment(&key, "failed", Some(Vote::Reject))
            .await
            .unwrap();

        let comments = review.comments();
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[1].2, Some(Vote::Reject));
    }
}
