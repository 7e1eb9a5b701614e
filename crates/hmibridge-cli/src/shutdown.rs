//! Termination signal handling.

use hmibridge_core::Lifecycle;

/// Wait for Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(category = "lifecycle", error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(category = "lifecycle", error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!(category = "lifecycle", "Received Ctrl+C, draining");
        }
        _ = terminate => {
            tracing::info!(category = "lifecycle", "Received SIGTERM, draining");
        }
    }
}

/// Move `lifecycle` to draining on the first termination signal.
pub fn spawn_signal_handler(lifecycle: Lifecycle) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_signal() => {
                lifecycle.begin_drain();
            }
            _ = lifecycle.cancelled() => {}
        }
    })
}
