//! Lifecycle Controller
//!
//! Coordinates teardown of background loops (queue drain, cache sweep,
//! reconnect handling) and tracks in-flight processing passes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::Notify;

/// Shutdown coordinator for the sync engine.
///
/// Every background loop subscribes and exits on the signal; every
/// processing pass holds a guard so teardown can wait for it to finish.
#[derive(Clone)]
pub struct ShutdownController {
    /// Whether shutdown has been initiated
    shutdown_initiated: Arc<AtomicBool>,
    /// Number of passes currently running
    active_passes: Arc<AtomicUsize>,
    /// Broadcast channel for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Notify when the last pass finishes
    idle: Arc<Notify>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            shutdown_initiated: Arc::new(AtomicBool::new(false)),
            active_passes: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            idle: Arc::new(Notify::new()),
        }
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Signal every loop to stop. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown_initiated.swap(true, Ordering::SeqCst) {
            tracing::info!("sync engine shutting down");
            let _ = self.shutdown_tx.send(());
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// Number of passes currently running.
    pub fn active_passes(&self) -> usize {
        self.active_passes.load(Ordering::SeqCst)
    }

    /// Track a pass; the count drops when the guard does.
    pub fn pass_guard(&self) -> PassGuard {
        self.active_passes.fetch_add(1, Ordering::SeqCst);
        PassGuard {
            controller: self.clone(),
        }
    }

    fn pass_ended(&self) {
        let prev = self.active_passes.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait until no pass is running (with timeout).
    pub async fn wait_for_idle(&self, timeout: Duration) -> bool {
        let notified = self.idle.notified();
        if self.active_passes() == 0 {
            return true;
        }

        tokio::select! {
            _ = notified => true,
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    "idle timeout: {} passes still running",
                    self.active_passes()
                );
                false
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard for a running pass.
pub struct PassGuard {
    controller: ShutdownController,
}

impl Drop for PassGuard {
    fn drop(&mut self) {
        self.controller.pass_ended();
    }
}
