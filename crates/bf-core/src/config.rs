use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Process flags
// ---------------------------------------------------------------------------

/// Coordinator run mode, selected once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Local development: in-memory collaborators, no TLS, no master key.
    Dev,
    /// Production: real pools and clients, master key required.
    Prod,
}

/// Process-wide flags. These never change after startup.
#[derive(Debug, Clone, Parser)]
#[command(name = "buildfarmd", about = "build-farm coordinator daemon")]
pub struct Flags {
    /// Run mode.
    #[arg(long, value_enum, default_value = "dev")]
    pub mode: Mode,

    /// Path to the gomote master key file. Required in prod mode.
    #[arg(long)]
    pub master_key_file: Option<PathBuf>,

    /// Environment config file (TOML). Defaults are used when absent.
    #[arg(long)]
    pub env_config: Option<PathBuf>,

    /// Name of the environment this coordinator serves, for display.
    #[arg(long, default_value = "production")]
    pub environment: String,

    /// Enable the VM pool in dev mode (it is always on in prod).
    #[arg(long)]
    pub dev_enable_vm_pool: bool,

    /// Run benchmarks after tests on builders that support them.
    #[arg(long)]
    pub run_benchmarks: bool,

    /// Benchmark results server to report to, when benchmarks run.
    #[arg(long)]
    pub perf_server: Option<String>,
}

impl Flags {
    /// Validate flag combinations that cannot be expressed in clap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == Mode::Prod && self.master_key_file.is_none() {
            return Err(ConfigError::MissingMasterKey);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Environment config
// ---------------------------------------------------------------------------

/// Endpoints and bucket names for the external collaborators, loaded from a
/// TOML file. Every field has a default so a dev-mode coordinator starts
/// with no file at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvConfig {
    /// Dashboard base URL (build status feed and result sink).
    #[serde(default = "default_dashboard_url")]
    pub dashboard_url: String,
    /// Review service base URL (try-work feed and comment sink).
    #[serde(default = "default_review_url")]
    pub review_url: String,
    /// In-cluster source mirror base URL, tried before upstream.
    #[serde(default = "default_mirror_url")]
    pub mirror_url: String,
    /// Upstream gitiles-style archive base URL.
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,
    /// Bucket for toolchain snapshots.
    #[serde(default = "default_snapshot_bucket")]
    pub snapshot_bucket: String,
    /// Bucket for uploaded build logs.
    #[serde(default = "default_log_bucket")]
    pub log_bucket: String,
    /// URL of the bootstrap toolchain tarball, per GOOS-GOARCH substitution.
    #[serde(default = "default_bootstrap_url")]
    pub bootstrap_url: String,
    /// HTTP listen address for the status surface.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_dashboard_url() -> String {
    "https://build.example.org".to_string()
}
fn default_review_url() -> String {
    "https://review.example.org".to_string()
}
fn default_mirror_url() -> String {
    "http://source-mirror.internal".to_string()
}
fn default_upstream_url() -> String {
    "https://source.example.org".to_string()
}
fn default_snapshot_bucket() -> String {
    "farm-snapshots".to_string()
}
fn default_log_bucket() -> String {
    "farm-logs".to_string()
}
fn default_bootstrap_url() -> String {
    "https://storage.example.org/bootstrap/go-bootstrap-$GOOS-$GOARCH.tar.gz".to_string()
}
fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

impl Default for EnvConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty EnvConfig deserializes from defaults")
    }
}

impl EnvConfig {
    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;
        let cfg: EnvConfig = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Bootstrap toolchain URL for a concrete GOOS/GOARCH pair.
    pub fn bootstrap_url_for(&self, goos: &str, goarch: &str) -> String {
        self.bootstrap_url
            .replace("$GOOS", goos)
            .replace("$GOARCH", goarch)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Io(String, String),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("prod mode requires --master-key-file")]
    MissingMasterKey,
}
