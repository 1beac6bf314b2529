//! Process signal handling.

use tracing::{info, warn};

/// Resolves on SIGINT or SIGTERM (Ctrl+C off unix).
///
/// If the handlers cannot be installed the future never resolves and the
/// process has to be killed.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::interrupt()),
            signal(SignalKind::terminate()),
        ) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => info!("Received SIGINT, initiating shutdown..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown..."),
                }
                return;
            }
            (Err(err), _) | (_, Err(err)) => {
                warn!(error = %err, "Failed to install signal handlers, falling back to Ctrl+C");
            }
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, initiating shutdown..."),
        Err(err) => {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}
