use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{IntegrationError, Result};

// ---------------------------------------------------------------------------
// ObjectStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write an object. `public` requests a world-readable ACL (build logs
    /// and snapshots are linked from public pages). Returns the object URL.
    async fn put(
        &self,
        bucket: &str,
        name: &str,
        content_type: &str,
        public: bool,
        data: Vec<u8>,
    ) -> Result<String>;

    /// Read an object in full. `Ok(None)` when it does not exist.
    async fn get(&self, bucket: &str, name: &str) -> Result<Option<Vec<u8>>>;

    /// The URL an object would have, without touching the store.
    fn object_url(&self, bucket: &str, name: &str) -> String;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// Storage service speaking plain bucket/object REST.
pub struct HttpObjectStore {
    base: String,
    http: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn put(
        &self,
        bucket: &str,
        name: &str,
        content_type: &str,
        public: bool,
        data: Vec<u8>,
    ) -> Result<String> {
        let url = format!("{}/{}/{}", self.base, bucket, name);
        let mut req = self
            .http
            .put(&url)
            .header("Content-Type", content_type)
            .body(data);
        if public {
            req = req.header("x-acl", "public-read");
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            return Err(IntegrationError::Status(resp.status().as_u16(), url));
        }
        Ok(self.object_url(bucket, name))
    }

    async fn get(&self, bucket: &str, name: &str) -> Result<Option<Vec<u8>>> {
        let url = format!("{}/{}/{}", self.base, bucket, name);
        let resp = self.http.get(&url).send().await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(IntegrationError::Status(resp.status().as_u16(), url));
        }
        Ok(Some(resp.bytes().await?.to_vec()))
    }

    fn object_url(&self, bucket: &str, name: &str) -> String {
        format!("{}/{}/{}", self.base, bucket, name)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
}

#[derive(Clone)]
struct StoredObject {
    content_type: String,
    public: bool,
    data: Vec<u8>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an object exists and was stored with a public ACL.
    pub fn is_public(&self, bucket: &str, name: &str) -> bool {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), name.to_string()))
            .map(|o| o.public)
            .unwrap_or(false)
    }

    pub fn content_type(&self, bucket: &str, name: &str) -> Option<String> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), name.to_string()))
            .map(|o| o.content_type.clone())
    }

    pub fn names(&self, bucket: &str) -> Vec<String> {
        let mut v: Vec<String> = self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, n)| n.clone())
            .collect();
        v.sort();
        v
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        bucket: &str,
        name: &str,
        content_type: &str,
        public: bool,
        data: Vec<u8>,
    ) -> Result<String> {
        self.objects.lock().unwrap().insert(
            (bucket.to_string(), name.to_string()),
            StoredObject {
                content_type: content_type.to_string(),
                public,
                data,
            },
        );
        Ok(self.object_url(bucket, name))
    }

    async fn get(&self, bucket: &str, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&(bucket.to_string(), name.to_string()))
            .map(|o| o.data.clone()))
    }

    fn object_url(&self, bucket: &str, name: &str) -> String {
        format!("memory://{bucket}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_round_trip() {
        let store = MemoryObjectStore::new();
        let url = store
            .put("logs", "ab/x.log", "text/plain", true, b"hello".to_vec())
            .await
            .unwrap();
        assert_eq!(url, "memory://logs/ab/x.log");
        assert_eq!(store.get("logs", "ab/x.log").await.unwrap().unwrap(), b"hello");
        assert!(store.is_public("logs", "ab/x.log"));
        assert_eq!(
            store.content_type("logs", "ab/x.log").as_deref(),
            Some("text/plain")
        );
    }

    #[tokio::test]
    async fn missing_object_is_none() {
        let store = MemoryObjectStore::new();
        assert!(store.get("logs", "nope").await.unwrap().is_none());
    }
}
