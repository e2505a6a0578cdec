use tokio::signal;
use tokio::sync::mpsc;
use tracing::debug;

use super::StopReason;

/// Resolves on the next SIGINT or SIGTERM.
pub async fn shutdown_signal() -> StopReason {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => StopReason::Interrupt,
        _ = terminate => StopReason::Terminate,
    }
}

/// Forwards every shutdown signal to the supervisor until it stops listening.
pub async fn forward_signals(stop: mpsc::Sender<StopReason>) {
    loop {
        let reason = shutdown_signal().await;
        debug!(?reason, "shutdown signal received");
        if stop.send(reason).await.is_err() {
            return;
        }
    }
}
