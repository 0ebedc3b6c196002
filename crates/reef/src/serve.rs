// SPDX-FileCopyrightText: 2026 Reef Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `reef serve` command implementation.
//!
//! Loads builtin plugins, restores uploads, announces `SystemReady`, then
//! forwards domain events from host services to plugins until a shutdown
//! signal arrives. On shutdown plugins see `SystemShutdown` and are
//! unloaded newest first.

use reef_config::ReefConfig;
use reef_core::{DomainEvent, ReefError};
use reef_registry::LoadSummary;
use tracing::{debug, info, warn};

use crate::host::{build_host, expand_path};

fn log_summary(what: &str, summary: &LoadSummary) {
    info!(
        what,
        loaded = summary.loaded.len(),
        failed = summary.failed.len(),
        "plugins loaded"
    );
    for (id, reason) in &summary.failed {
        warn!(plugin = %id, error = %reason, "{what} plugin skipped");
    }
}

/// Resolves when SIGINT or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("received SIGINT (Ctrl+C), initiating shutdown"),
                    _ = sigterm.recv() => info!("received SIGTERM, initiating shutdown"),
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = ctrl_c.await;
                info!("received SIGINT (Ctrl+C), initiating shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received Ctrl+C, initiating shutdown");
    }
}

/// Runs the `reef serve` command.
pub async fn run_serve(config: ReefConfig) -> Result<(), ReefError> {
    info!(host = %config.host.name, "starting reef serve");
    let mut host = build_host(&config).await?;
    let registry = host.registry.clone();

    let builtin_dir = expand_path(&config.plugins.builtin_dir);
    log_summary("builtin", &registry.load_builtin_dir(&builtin_dir).await?);
    log_summary("uploaded", &registry.restore_uploaded().await?);

    registry.dispatch(DomainEvent::Ready).await;
    info!(plugins = registry.list().await.len(), "reef is ready");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            Some(event) = host.events.recv() => {
                let report = registry.dispatch(event).await;
                debug!(delivered = report.delivered.len(), failed = report.failed.len(), "domain event dispatched");
            }
        }
    }

    registry.dispatch(DomainEvent::ShuttingDown).await;
    registry.unload_all().await;
    info!("reef stopped");
    Ok(())
}
