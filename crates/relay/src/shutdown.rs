use std::time::Duration;

use tracing::{info, warn};

/// Listen for SIGTERM (Kubernetes pod termination) or ctrl-c.
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to listen for SIGTERM, ctrl-c only");
            ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = ctrl_c() => {}
    }
}

#[cfg(not(unix))]
pub async fn shutdown_signal() {
    ctrl_c().await;
}

async fn ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("ctrl-c received"),
        Err(e) => {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    }
}

/// Resolve on a signal, or after `run_for` when given.
pub async fn wait_for_stop(run_for: Option<Duration>) {
    match run_for {
        Some(limit) => {
            tokio::select! {
                _ = shutdown_signal() => {}
                _ = tokio::time::sleep(limit) => info!(secs = limit.as_secs(), "run time elapsed"),
            }
        }
        None => shutdown_signal().await,
    }
}
