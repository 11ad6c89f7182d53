//! Shutdown on SIGTERM and SIGINT.
//!
//! When a signal arrives every open session is cancelled, so staged data is
//! discarded and nothing half-written is committed.

use std::io;

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx }
    }

    /// Get a shutdown receiver
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Trigger shutdown without a signal (end of input, fatal transport error).
    pub fn trigger(&self) {
        if self.shutdown_tx.send(()).is_err() {
            warn!("Shutdown requested with no listeners");
        }
    }

    /// Wait for SIGTERM or SIGINT, then notify subscribers. If no handler
    /// can be installed this never returns.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        let terminate = async {
            if let Err(e) = wait_for_terminate().await {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, cancelling sessions"),
            _ = terminate => info!("Received SIGTERM, cancelling sessions"),
        }

        self.trigger();
    }
}

#[cfg(unix)]
async fn wait_for_terminate() -> io::Result<()> {
    signal::unix::signal(signal::unix::SignalKind::terminate())?
        .recv()
        .await;
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_terminate() -> io::Result<()> {
    std::future::pending::<io::Result<()>>().await
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
