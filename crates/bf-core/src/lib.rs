//! Core library for the buildfarm coordinator — foundational types shared by
//! every other crate in the workspace.
//!
//! This crate provides:
//! - The `BuilderRev` / `TryKey` identity types that key all scheduling,
//!   status tracking, and caching
//! - The compiled-in builder catalog (host types, env, test-helper counts)
//! - Process and environment configuration
//! - The live-log streaming buffer served by the status pages

pub mod builders;
pub mod config;
pub mod livelog;
pub mod types;
