//! Tracing initialization for the coordinator binary and its tests: the
//! run mode selects output format and default filter directives.

pub mod logging;

pub use logging::init;
