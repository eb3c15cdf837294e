//! Buildlet pools — the three ways the coordinator obtains workers.
//!
//! - [`vm::VmPool`] creates ephemeral virtual machines through a cloud
//!   launcher.
//! - [`container::ContainerPool`] launches pods in a cluster.
//! - [`reverse::ReversePool`] hands out long-lived worker-initiated
//!   connections.
//!
//! All three implement [`pool::BuildletPool`]; [`pool::PoolSet`] routes a
//! host type to the pool that serves it. Every pool runs a background
//! reaper that deletes resources it does not recognize once they outlive
//! the TTL, which is the primary recovery mechanism after a coordinator
//! restart.

pub mod container;
pub mod dev;
pub mod pool;
pub mod reverse;
pub mod vm;

pub use pool::{BuildletPool, PoolError, PoolSet, PoolStatus};
