//! Graceful shutdown coordination.
//!
//! [`ShutdownSignal`] turns SIGINT/SIGTERM into a flag every component can
//! observe. The worker checks it between batches so a batch that is being
//! routed always runs to completion before the process exits.
//!
//! # Example
//!
//! ```rust,ignore
//! use events_router::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! tokio::spawn(shutdown.clone().listen());
//!
//! while !shutdown.is_shutdown() {
//!     tokio::select! {
//!         _ = shutdown.wait() => break,
//!         batch = read_batch() => route(batch).await,
//!     }
//! }
//! ```

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

/// A signal for coordinating graceful shutdown across components.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Wait for SIGINT or SIGTERM, then trigger shutdown.
    ///
    /// Meant to be spawned once per process.
    pub async fn listen(self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install Ctrl+C handler");
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
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
            _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
        }

        self.sender.send_replace(true);
    }

    /// Trigger shutdown manually (for testing or programmatic shutdown).
    pub fn trigger(&self) {
        info!("Shutdown triggered programmatically");
        self.sender.send_replace(true);
    }

    /// Whether shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// Resolve once shutdown has been triggered. Returns immediately if it
    /// already was.
    pub async fn wait(&self) {
        let mut receiver = self.sender.subscribe();
        // The sender lives in `self`, so this cannot fail while we wait.
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_shutdown_signal_creation() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_manual_trigger() {
        let signal = ShutdownSignal::new();

        let trigger_signal = signal.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger_signal.trigger();
        });

        assert!(timeout(Duration::from_secs(1), signal.wait()).await.is_ok());
        assert!(signal.is_shutdown());
    }

    #[tokio::test]
    async fn test_wait_after_trigger_returns_immediately() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        let clone = signal.clone();
        assert!(clone.is_shutdown());
        assert!(timeout(Duration::from_millis(50), clone.wait()).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_blocks_until_triggered() {
        let signal = ShutdownSignal::new();
        assert!(timeout(Duration::from_millis(20), signal.wait()).await.is_err());
    }
}
