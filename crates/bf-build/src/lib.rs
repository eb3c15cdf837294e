//! Build orchestration: the per-build state machine, the process-wide
//! registry of in-flight work, source and snapshot handling, sharded test
//! execution, and try-set aggregation.

pub mod exec;
pub mod registry;
pub mod runner;
pub mod shard;
pub mod snapshot;
pub mod sourcecache;
pub mod status;
pub mod tryset;

pub use registry::BuildRegistry;
pub use runner::{BuildRunner, RunnerDeps};
pub use status::{BuildError, BuildStatus};
pub use tryset::{TrySet, TrySetManager};
