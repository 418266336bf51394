//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for SIGINT (Ctrl-C) and, on unix, SIGTERM
//! - First signal starts a graceful shutdown
//! - Second signal, or the grace period running out, forces it
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Signals map onto two cancellation tokens; the library never exits
//!   the process itself

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Cancel `stop` on the first signal and `force` on the second signal or
/// `grace` after the first, whichever comes first.
pub async fn shutdown_signals(stop: CancellationToken, force: CancellationToken, grace: Duration) {
    tokio::select! {
        _ = wait_for_signal() => {}
        _ = stop.cancelled() => {}
    }
    tracing::info!(grace_secs = grace.as_secs(), "Shutdown requested, draining connections");
    stop.cancel();

    tokio::select! {
        _ = wait_for_signal() => {
            tracing::warn!("Second signal received, forcing shutdown");
        }
        _ = tokio::time::sleep(grace) => {
            tracing::warn!("Grace period elapsed, forcing shutdown");
        }
        _ = force.cancelled() => {}
    }
    force.cancel();
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
