use bf_core::config::Mode;
use tracing_subscriber::{fmt, EnvFilter};

/// Default filter directives per run mode. Dev runs the farm's own crates
/// chatty; prod keeps them at info. Both quiet the HTTP stack, whose
/// per-request chatter would drown build events at the coordinator's
/// request volume.
fn default_directives(mode: Mode) -> &'static str {
    match mode {
        Mode::Dev => "debug,hyper=info,reqwest=info,tower_http=info",
        Mode::Prod => "info,hyper=warn,reqwest=warn,tower_http=warn",
    }
}

/// Initialize tracing for the coordinator.
///
/// The run mode picks everything: dev gets human-readable output for a
/// terminal, prod gets JSON for the log pipeline, each with the mode's
/// default directives. `RUST_LOG` overrides the directives in either mode.
///
/// Safe to call multiple times (tests share a process) -- later calls are
/// no-ops.
pub fn init(service_name: &str, mode: Mode) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(mode)));

    let builder = fmt().with_env_filter(filter).with_target(true);
    match mode {
        Mode::Dev => builder.try_init().ok(),
        Mode::Prod => builder.json().try_init().ok(),
    };

    tracing::info!(service = service_name, mode = ?mode, "logging initialised");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_differ_by_mode() {
        let dev = default_directives(Mode::Dev);
        let prod = default_directives(Mode::Prod);
        assert!(dev.starts_with("debug"));
        assert!(prod.starts_with("info"));
        // Both keep the HTTP stack below the farm's own level.
        assert!(dev.contains("hyper=info"));
        assert!(prod.contains("hyper=warn"));
    }

    #[test]
    fn init_is_idempotent() {
        init("bf-telemetry-test", Mode::Dev);
        init("bf-telemetry-test", Mode::Prod);
    }
}
