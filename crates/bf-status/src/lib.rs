//! The coordinator's read-mostly HTTP surface: status pages, live log
//! streaming, try-set status JSON, health-checker endpoints, operational
//! JSON, and the gomote control plane.

pub mod auth;
pub mod health;
pub mod server;

pub use auth::GomoteAuth;
pub use health::{FnChecker, HealthChecker, HealthRegistry};
pub use server::{status_router, StatusState};
