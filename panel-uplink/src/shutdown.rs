//! Signal handling for SIGINT and SIGTERM.
//!
//! A signal cancels the shared token; the poller and the upload observe it and
//! release the archive and storage handles before returning.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Cancel `cancel` on the first SIGINT or SIGTERM.
pub async fn cancel_on_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), cancelling..."),
        _ = terminate => info!("Received SIGTERM, cancelling..."),
        _ = cancel.cancelled() => return,
    }
    cancel.cancel();
}

/// Spawn [`cancel_on_signal`] and return the token it cancels.
pub fn install() -> CancellationToken {
    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));
    cancel
}
