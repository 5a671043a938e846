//! Graceful shutdown coordination via `CancellationToken`.
//!
//! Cancelling the token stops the HTTP listener and background tasks. The
//! drain then ends every live session so environments are torn down before
//! the process exits.

use std::sync::Arc;
use std::time::Duration;

use dojo_runtime::SessionManager;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Outcome of a graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Everything drained; this many sessions were ended.
    Drained {
        /// Sessions ended by the drain.
        sessions_ended: usize,
    },
    /// The timeout elapsed first.
    TimedOut,
}

/// Coordinates graceful shutdown across server tasks.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel, wait for `handles`, then end every live session.
    ///
    /// Everything after cancellation shares one `timeout`.
    pub async fn graceful_shutdown(
        &self,
        manager: Arc<SessionManager>,
        handles: Vec<JoinHandle<()>>,
        timeout: Duration,
    ) -> ShutdownOutcome {
        self.shutdown();
        info!(
            task_count = handles.len(),
            live_sessions = manager.live_count(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "draining"
        );

        let drain = async {
            let _ = futures::future::join_all(handles).await;
            manager.shutdown().await
        };
        if let Ok(sessions_ended) = tokio::time::timeout(timeout, drain).await {
            ShutdownOutcome::Drained { sessions_ended }
        } else {
            warn!("shutdown timed out after {timeout:?}, some environments may outlive the process");
            ShutdownOutcome::TimedOut
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
