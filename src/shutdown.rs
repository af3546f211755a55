//! Graceful shutdown coordination.
//!
//! A [`ShutdownSignal`] is cloned into every long-running component (HTTP
//! server, queue consumers, stream joiner, dead-letter sweeper). Once it is
//! triggered, by SIGINT/SIGTERM or programmatically, every clone observes it,
//! including clones that only start listening afterwards.
//!
//! # Example
//!
//! ```rust,ignore
//! use shutterbus::shutdown::ShutdownSignal;
//!
//! let shutdown = ShutdownSignal::new();
//! let worker_shutdown = shutdown.clone();
//!
//! tokio::spawn(async move {
//!     loop {
//!         tokio::select! {
//!             _ = worker_shutdown.cancelled() => break,
//!             // ... process messages
//!         }
//!     }
//! });
//!
//! shutdown.wait().await;
//! ```

use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Default shutdown timeout in seconds.
const DEFAULT_SHUTDOWN_TIMEOUT: u64 = 30;

/// A signal for coordinating graceful shutdown across components.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: watch::Sender<bool>,
    timeout: Duration,
}

impl ShutdownSignal {
    /// Create a new shutdown signal with default timeout (30 seconds).
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        let (sender, _) = watch::channel(false);
        Self { sender, timeout }
    }

    /// How long components get to drain after shutdown was triggered.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGTERM or SIGINT, then trigger shutdown.
    ///
    /// If a signal handler cannot be installed the failure is logged and
    /// that signal is ignored; programmatic triggers still work.
    pub async fn wait(&self) {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to install Ctrl+C handler");
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
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received Ctrl+C, initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
            _ = self.cancelled() => return,
        }

        self.sender.send_replace(true);
    }

    /// Resolve once shutdown has been triggered. Returns immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        let mut receiver = self.sender.subscribe();
        // the sender lives in self, so this only errors if it was dropped
        let _ = receiver.wait_for(|triggered| *triggered).await;
    }

    pub fn is_shutdown(&self) -> bool {
        *self.sender.borrow()
    }

    /// Trigger shutdown manually (for testing or programmatic shutdown).
    pub fn trigger(&self) {
        if !self.sender.send_replace(true) {
            info!("Shutdown triggered programmatically");
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
