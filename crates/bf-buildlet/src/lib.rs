//! Client-side view of the buildlet protocol.
//!
//! The coordinator never implements the worker agent itself; it consumes
//! this trait. Pools hand out `Arc<dyn Buildlet>` handles, the build runner
//! drives them, and exactly one task owns a handle at a time between
//! acquisition and close.

pub mod client;
pub mod fake;

pub use client::{Buildlet, CommError, DirEntry, ExecOpts, ExecOutcome};
pub use fake::{FakeBuildlet, ScriptedExec};
