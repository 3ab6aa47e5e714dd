//! Shutdown signalling for Farol components
//!
//! A single merged cancellation token is constructed once upstream and handed
//! to every background task. The token races an OS-level termination
//! notification against caller-supplied cancellation; whichever fires first
//! releases every waiter, and the first trigger wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

/// Clonable cancellation token backed by a broadcast channel.
///
/// Repeated triggers are no-ops: an atomic flag guarantees only the first
/// one sends, so near-simultaneous cancellation sources cannot cause
/// double-fire effects downstream.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self {
            sender,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Fire the signal. Only the first call has any effect.
    pub fn trigger(&self) {
        if !self.triggered.swap(true, Ordering::SeqCst) {
            let _ = self.sender.send(());
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Resolve once the signal fires. Returns immediately if it already has.
    pub async fn wait(&self) {
        let mut rx = self.sender.subscribe();
        if self.is_triggered() {
            return;
        }
        let _ = rx.recv().await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Merges OS termination (Ctrl+C / SIGTERM) and a caller-held token into one
/// [`ShutdownSignal`] that the renewal task, the resolver, and the serve loop
/// all observe.
pub struct ShutdownCoordinator {
    merged: ShutdownSignal,
    watcher: tokio::task::JoinHandle<()>,
}

impl ShutdownCoordinator {
    pub fn new(caller: ShutdownSignal) -> Self {
        let merged = ShutdownSignal::new();
        let inner = merged.clone();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                _ = os_terminate() => info!("termination signal received, shutting down"),
                _ = caller.wait() => info!("caller cancellation received, shutting down"),
            }
            inner.trigger();
        });
        Self { merged, watcher }
    }

    /// The merged token, for handing to components.
    pub fn signal(&self) -> ShutdownSignal {
        self.merged.clone()
    }

    /// Stop watching the cancellation sources without triggering shutdown.
    pub fn abort(&self) {
        self.watcher.abort();
    }
}

impl Drop for ShutdownCoordinator {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

async fn os_terminate() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_releases_waiters() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());

        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.wait().await });

        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("waiter not released")
            .unwrap();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_repeat_trigger_is_noop() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        signal.trigger();
        assert!(signal.is_triggered());
        // wait after the fact still returns immediately
        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .expect("wait should resolve on an already-triggered signal");
    }

    #[tokio::test]
    async fn test_coordinator_merges_caller_cancellation() {
        let caller = ShutdownSignal::new();
        let coordinator = ShutdownCoordinator::new(caller.clone());
        let merged = coordinator.signal();
        assert!(!merged.is_triggered());

        caller.trigger();
        tokio::time::timeout(Duration::from_secs(1), merged.wait())
            .await
            .expect("merged signal did not fire");
    }
}
