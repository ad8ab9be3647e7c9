//! Graceful shutdown for the daemon.
//!
//! Long-running tasks (accept loop, keep-alive sweep, admission sweep) get a
//! child of the manager's token and register their handle. On ctrl+c, or when
//! the token is cancelled from inside, every task is given a bounded grace
//! period before the stragglers are aborted.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct ShutdownManager {
    cancel_token: CancellationToken,
    task_handles: Vec<(&'static str, JoinHandle<()>)>,
    grace: Duration,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self::with_grace(SHUTDOWN_GRACE)
    }

    pub fn with_grace(grace: Duration) -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            task_handles: Vec::new(),
            grace,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn register_task(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.task_handles.push((name, handle));
    }

    pub fn task_count(&self) -> usize {
        self.task_handles.len()
    }

    /// Wait for ctrl+c (or an internal cancel), then stop every task.
    pub async fn wait_for_shutdown(self) {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => match signal {
                Ok(()) => tracing::info!("🛑 Shutdown signal received"),
                Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
            },
            _ = self.cancel_token.cancelled() => {
                tracing::info!("🛑 Shutdown requested");
            }
        }
        self.shutdown().await;
    }

    /// Cancel the token and join every task. Returns the names of tasks that
    /// had to be aborted.
    pub async fn shutdown(mut self) -> Vec<&'static str> {
        self.cancel_token.cancel();

        let now = tokio::time::Instant::now();
        let deadline = now
            .checked_add(self.grace)
            .unwrap_or_else(|| now + Duration::from_secs(86400 * 365));
        let mut aborted = Vec::new();
        for (name, mut handle) in self.task_handles.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => tracing::debug!("✓ {} stopped", name),
                Ok(Err(e)) => tracing::warn!("⚠️  {} ended abnormally: {}", name, e),
                Err(_) => {
                    handle.abort();
                    aborted.push(name);
                }
            }
        }

        if aborted.is_empty() {
            tracing::info!("✓ All tasks shut down gracefully");
        } else {
            tracing::warn!(
                "⏱️  Shutdown timeout: aborted {} task(s): {}",
                aborted.len(),
                aborted.join(", ")
            );
        }
        aborted
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}
