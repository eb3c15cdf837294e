use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Communication failure: the coordinator could not start or complete an
/// operation against the worker. Distinct from [`ExecOutcome::Remote`],
/// which means the remote command ran and exited non-zero.
///
/// Communication failures are the retryable class; remote failures are not.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CommError {
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("buildlet connection failed: {0}")]
    Connection(String),
    #[error("buildlet is marked broken")]
    Broken,
    #[error("operation canceled")]
    Canceled,
}

/// Result of an exec that reached the worker: the command either exited
/// zero or it ran and failed. The string carries the remote tool's own
/// description of the failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Ok,
    Remote(String),
}

impl ExecOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ExecOutcome::Ok)
    }
}

// ---------------------------------------------------------------------------
// Exec options
// ---------------------------------------------------------------------------

/// Options for one remote command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecOpts {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Working directory, relative to the buildlet work dir when relative.
    pub dir: Option<String>,
    /// $PATH entries; `$WORKDIR` is expanded by the worker.
    pub path: Vec<String>,
    /// Per-exec budget. `None` means the worker's default.
    pub timeout: Option<Duration>,
    /// Run outside the workspace sandbox (make.bash needs this on some hosts).
    pub system_level: bool,
    pub debug: bool,
}

impl ExecOpts {
    pub fn with_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }
}

/// One entry from a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

// ---------------------------------------------------------------------------
// Buildlet trait
// ---------------------------------------------------------------------------

/// The worker-machine agent, as the coordinator sees it.
///
/// All remote calls take a cancellation token and return promptly when it
/// fires. `close` is idempotent. A handle has exactly one owning task at a
/// time; sharing requires handing the whole handle off.
#[async_trait]
pub trait Buildlet: Send + Sync {
    /// Worker name, unique within the farm (e.g. the VM instance name).
    fn name(&self) -> &str;

    fn host_type(&self) -> &str;

    /// Address the gomote proxy dials, `ip:port`.
    fn ip_port(&self) -> String;

    /// Absolute path of the buildlet's workspace directory.
    async fn work_dir(&self, token: &CancellationToken) -> Result<String, CommError>;

    /// Extract a gzipped tarball into `dest` (relative to the work dir).
    async fn put_tar(
        &self,
        token: &CancellationToken,
        tar_gz: Vec<u8>,
        dest: &str,
    ) -> Result<(), CommError>;

    /// Have the worker fetch a tarball URL itself and extract it into `dest`.
    /// Saves a round-trip through the coordinator for large snapshots.
    async fn put_tar_from_url(
        &self,
        token: &CancellationToken,
        url: &str,
        dest: &str,
    ) -> Result<(), CommError>;

    /// Stream `dir` back as a gzipped tarball.
    async fn get_tar(&self, token: &CancellationToken, dir: &str) -> Result<Vec<u8>, CommError>;

    /// Run a command on the worker, streaming combined output into `output`.
    ///
    /// Returns `Ok(ExecOutcome)` whenever the command was started and its
    /// exit observed; `Err(CommError)` when it could not be started or the
    /// connection died mid-run.
    async fn exec(
        &self,
        token: &CancellationToken,
        cmd: &str,
        opts: ExecOpts,
        output: flume::Sender<Vec<u8>>,
    ) -> Result<ExecOutcome, CommError>;

    async fn list_dir(
        &self,
        token: &CancellationToken,
        dir: &str,
    ) -> Result<Vec<DirEntry>, CommError>;

    async fn remove_all(
        &self,
        token: &CancellationToken,
        paths: &[String],
    ) -> Result<(), CommError>;

    /// Mark the worker unusable; the pool will not reissue it.
    fn mark_broken(&self);

    fn is_broken(&self) -> bool;

    /// Release the worker. Idempotent.
    async fn close(&self);
}
