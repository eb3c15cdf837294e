//! buildfarmd — the build-farm coordinator daemon.
//!
//! Discovers post-submit and try-bot work, schedules it onto buildlet
//! pools, shepherds builds through their lifecycle, and serves the status
//! surface.

use std::sync::Arc;

use anyhow::{Context, Result};
use bf_core::config::{EnvConfig, Flags, Mode};
use bf_daemon::{Collaborators, Coordinator};
use clap::Parser;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let flags = Flags::parse();

    bf_telemetry::init("buildfarmd", flags.mode);

    // Unrecoverable init failures exit non-zero before any loop starts.
    flags
        .validate()
        .context("invalid flag combination")?;

    let env = match &flags.env_config {
        Some(path) => EnvConfig::load_from(path)
            .with_context(|| format!("loading environment config {}", path.display()))?,
        None => EnvConfig::default(),
    };

    let collab = match flags.mode {
        Mode::Dev => Collaborators::dev(),
        Mode::Prod => Collaborators::prod(&env),
    };

    let listener = tokio::net::TcpListener::bind(&env.listen_addr)
        .await
        .with_context(|| format!("binding status listener on {}", env.listen_addr))?;
    info!(addr = %env.listen_addr, mode = ?flags.mode, "status listener bound");

    let coordinator = Arc::new(
        Coordinator::new(&flags, env, collab.clone()).context("building coordinator")?,
    );

    // Ctrl-c triggers graceful shutdown: loops drain, the status server
    // stops, in-flight builds are abandoned for the reapers to sweep.
    let shutdown = coordinator.shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            shutdown.cancel();
        }
    });

    coordinator.run(listener, &collab).await
}
