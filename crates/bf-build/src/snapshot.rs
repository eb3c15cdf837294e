use std::io::{Read, Write};
use std::sync::Arc;

use bf_core::types::snapshot_object_name;
use bf_integrations::{ObjectStore, Result as IntegrationResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::debug;

/// Toolchain snapshot handling: a built `go/` tree tarred up after the make
/// phase, keyed by `(builder, rev)`, letting later builds of the same key
/// skip make entirely.
pub struct SnapshotStore {
    store: Arc<dyn ObjectStore>,
    bucket: String,
}

impl SnapshotStore {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
        }
    }

    /// Public URL the buildlet fetches the snapshot from.
    pub fn url(&self, builder: &str, rev: &str) -> String {
        self.store
            .object_url(&self.bucket, &snapshot_object_name(builder, rev))
    }

    /// Whether a usable snapshot exists: present, and streams as a
    /// well-formed gzip of a well-formed tar. A torn upload fails the check
    /// and the build falls back to make.
    pub async fn exists_valid(&self, builder: &str, rev: &str) -> bool {
        let name = snapshot_object_name(builder, rev);
        match self.store.get(&self.bucket, &name).await {
            Ok(Some(data)) => {
                let ok = is_well_formed_tgz(&data);
                if !ok {
                    debug!(builder, rev, "snapshot exists but is malformed");
                }
                ok
            }
            Ok(None) => false,
            Err(e) => {
                debug!(builder, rev, error = %e, "snapshot probe failed");
                false
            }
        }
    }

    /// Upload a fresh snapshot, world-readable.
    pub async fn upload(&self, builder: &str, rev: &str, tar_gz: Vec<u8>) -> IntegrationResult<String> {
        let name = snapshot_object_name(builder, rev);
        self.store
            .put(&self.bucket, &name, "application/gzip", true, tar_gz)
            .await
    }

    pub async fn fetch(&self, builder: &str, rev: &str) -> IntegrationResult<Option<Vec<u8>>> {
        self.store
            .get(&self.bucket, &snapshot_object_name(builder, rev))
            .await
    }
}

/// Validate that `data` is a gzip stream containing a readable tar archive.
pub fn is_well_formed_tgz(data: &[u8]) -> bool {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    if decoder.read_to_end(&mut decompressed).is_err() {
        return false;
    }
    let mut archive = tar::Archive::new(&decompressed[..]);
    match archive.entries() {
        Ok(entries) => {
            for entry in entries {
                if entry.is_err() {
                    return false;
                }
            }
            true
        }
        Err(_) => false,
    }
}

/// Build a small gzipped tarball with a single `VERSION` file, written into
/// the workspace before make so the toolchain stamps itself with the
/// revision being built.
pub fn version_tarball(rev: &str) -> Vec<u8> {
    let contents = format!("devel {rev}");
    let mut tar_bytes = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tar_bytes);
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "VERSION", contents.as_bytes())
            .expect("in-memory tar write cannot fail");
        builder.finish().expect("in-memory tar write cannot fail");
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&tar_bytes)
        .expect("in-memory gzip write cannot fail");
    encoder.finish().expect("in-memory gzip write cannot fail")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bf_integrations::MemoryObjectStore;

    fn tiny_tgz() -> Vec<u8> {
        version_tarball("abc123")
    }

    #[test]
    fn version_tarball_is_well_formed() {
        let data = tiny_tgz();
        assert!(is_well_formed_tgz(&data));

        // And contains the VERSION file with the rev.
        let mut decoder = GzDecoder::new(&data[..]);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        let mut archive = tar::Archive::new(&decompressed[..]);
        let mut entries = archive.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str().unwrap(), "VERSION");
        let mut contents = String::new();
        entry.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "devel abc123");
    }

    #[test]
    fn garbage_is_not_well_formed() {
        assert!(!is_well_formed_tgz(b"not a gzip at all"));
        // Valid gzip of garbage is still not a tar.
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"garbage").unwrap();
        let data = encoder.finish().unwrap();
        assert!(!is_well_formed_tgz(&data));
    }

    #[tokio::test]
    async fn upload_then_probe_round_trips() {
        let store = Arc::new(MemoryObjectStore::new());
        let snapshots = SnapshotStore::new(store.clone(), "farm-snapshots");

        assert!(!snapshots.exists_valid("linux-amd64", "abc123").await);

        let data = tiny_tgz();
        snapshots
            .upload("linux-amd64", "abc123", data.clone())
            .await
            .unwrap();

        assert!(snapshots.exists_valid("linux-amd64", "abc123").await);
        // Byte-identical on fetch.
        assert_eq!(
            snapshots.fetch("linux-amd64", "abc123").await.unwrap().unwrap(),
            data
        );
        // Public object under the expected name.
        assert!(store.is_public("farm-snapshots", "go/linux-amd64/abc123.tar.gz"));
    }

    #[tokio::test]
    async fn torn_upload_fails_validation() {
        let store = Arc::new(MemoryObjectStore::new());
        let snapshots = SnapshotStore::new(store.clone(), "farm-snapshots");

        let mut data = tiny_tgz();
        data.truncate(data.len() / 2);
        store
            .put(
                "farm-snapshots",
                "go/linux-amd64/abc123.tar.gz",
                "application/gzip",
                true,
                data,
            )
            .await
            .unwrap();

        assert!(!snapshots.exists_valid("linux-amd64", "abc123").await);
    }
}
