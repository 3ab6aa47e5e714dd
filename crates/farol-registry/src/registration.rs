//! Registration manager
//!
//! [`Registrar::register`] creates a lease, writes the `service/address`
//! entry bound to it, and starts exactly one renewal task per handle. The task renews on a
//! fixed cadence below the TTL, retries transient failures at the next tick,
//! and on the merged shutdown token performs the one-and-only deregistration
//! before exiting. The task is supervised: its handle exposes a completion
//! channel so callers and tests can await termination instead of sleeping.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use farol_common::{Result, ShutdownSignal, DEFAULT_RENEW_INTERVAL, SHUTDOWN_OP_TIMEOUT};
use farol_directory::{entry_key, DirectoryStore, LeaseId};

use crate::lease::LeaseKeeper;

struct RegistrationState {
    store: Arc<dyn DirectoryStore>,
    key: String,
    lease_id: LeaseId,
    deregistered: AtomicBool,
}

impl RegistrationState {
    /// Best-effort entry delete plus lease revoke, bounded so shutdown
    /// cannot hang on a wedged store. The first caller wins; repeats are
    /// no-ops. Never raises: the caller is already shutting down.
    async fn deregister(&self) {
        if self.deregistered.swap(true, Ordering::SeqCst) {
            return;
        }
        let cleanup = async {
            match self.store.delete(&self.key).await {
                Ok(true) => info!(key = %self.key, "deregistered"),
                Ok(false) => debug!(key = %self.key, "entry already gone"),
                Err(e) => warn!(key = %self.key, "entry delete failed: {e}"),
            }
            if let Err(e) = self.store.revoke(self.lease_id).await {
                debug!(lease = %self.lease_id, "lease revoke failed: {e}");
            }
        };
        if tokio::time::timeout(SHUTDOWN_OP_TIMEOUT, cleanup).await.is_err() {
            warn!(key = %self.key, "deregistration timed out after {SHUTDOWN_OP_TIMEOUT:?}");
        }
    }
}

/// Opaque token for one active registration, required for deregistration.
pub struct RegistrationHandle {
    state: Arc<RegistrationState>,
    stop: ShutdownSignal,
    done: Mutex<Option<oneshot::Receiver<()>>>,
}

impl RegistrationHandle {
    pub fn key(&self) -> &str {
        &self.state.key
    }

    pub fn lease_id(&self) -> LeaseId {
        self.state.lease_id
    }

    pub fn is_deregistered(&self) -> bool {
        self.state.deregistered.load(Ordering::SeqCst)
    }

    /// Await the renewal task's exit. Returns `false` on timeout, or if the
    /// completion channel was already consumed by an earlier call.
    pub async fn await_stopped(&self, timeout: Duration) -> bool {
        let Some(done) = self.done.lock().take() else {
            return false;
        };
        matches!(tokio::time::timeout(timeout, done).await, Ok(Ok(())))
    }
}

/// Creates registrations and owns their renewal tasks.
pub struct Registrar {
    store: Arc<dyn DirectoryStore>,
    lease_ttl: Option<Duration>,
    renew_interval: Duration,
}

impl Registrar {
    pub fn new(store: Arc<dyn DirectoryStore>) -> Self {
        Self {
            store,
            lease_ttl: None,
            renew_interval: DEFAULT_RENEW_INTERVAL,
        }
    }

    /// Override the defaults (10s TTL, 5s cadence). The cadence must stay
    /// strictly below the TTL so one missed cycle cannot expire the lease.
    pub fn with_timing(mut self, lease_ttl: Duration, renew_interval: Duration) -> Self {
        self.lease_ttl = Some(lease_ttl);
        self.renew_interval = renew_interval;
        self
    }

    /// Create a lease, write the entry bound to it, and start the renewal
    /// task. `shutdown` is the merged cancellation token; when it fires the
    /// task deregisters once and exits.
    pub async fn register(
        &self,
        service: &str,
        address: &str,
        shutdown: &ShutdownSignal,
    ) -> Result<RegistrationHandle> {
        info!(%service, %address, "registering");
        let keeper = LeaseKeeper::create(self.store.clone(), self.lease_ttl).await?;
        let key = entry_key(service, address);
        self.store.put(&key, address, keeper.lease_id()).await?;
        debug!(%key, lease = %keeper.lease_id(), "registered endpoint");

        let state = Arc::new(RegistrationState {
            store: self.store.clone(),
            key,
            lease_id: keeper.lease_id(),
            deregistered: AtomicBool::new(false),
        });

        let stop = ShutdownSignal::new();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(renewal_loop(
            keeper,
            state.clone(),
            shutdown.clone(),
            stop.clone(),
            self.renew_interval,
            done_tx,
        ));

        Ok(RegistrationHandle {
            state,
            stop,
            done: Mutex::new(Some(done_rx)),
        })
    }

    /// Deregister and stop the renewal task. Idempotent: a repeat call on
    /// the same handle is a no-op, not an error.
    pub async fn deregister(&self, handle: &RegistrationHandle) {
        handle.state.deregister().await;
        handle.stop.trigger();
    }
}

async fn renewal_loop(
    mut keeper: LeaseKeeper,
    state: Arc<RegistrationState>,
    shutdown: ShutdownSignal,
    stop: ShutdownSignal,
    renew_interval: Duration,
    done: oneshot::Sender<()>,
) {
    let mut ticker = tokio::time::interval(renew_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick completes immediately
    loop {
        tokio::select! {
            _ = ticker.tick() => match keeper.renew_once().await {
                Ok(remaining) => {
                    metrics::counter!("farol_lease_renewals_total").increment(1);
                    debug!(key = %state.key, ?remaining, "lease renewed");
                }
                // Transient: keep the entry, retry at the next tick.
                Err(e) => {
                    metrics::counter!("farol_lease_renewal_failures_total").increment(1);
                    warn!(key = %state.key, "lease renewal failed: {e}");
                }
            },
            _ = shutdown.wait() => {
                info!(key = %state.key, "shutdown received, deregistering");
                state.deregister().await;
                break;
            }
            _ = stop.wait() => break,
        }
    }
    let _ = done.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use farol_directory::MemoryStore;

    fn registrar(store: &Arc<MemoryStore>) -> Registrar {
        Registrar::new(store.clone())
    }

    #[tokio::test]
    async fn test_register_writes_exactly_one_entry() {
        let store = Arc::new(MemoryStore::new());
        let shutdown = ShutdownSignal::new();
        let handle = registrar(&store)
            .register("user-srv", "10.0.0.7:9100", &shutdown)
            .await
            .unwrap();

        assert_eq!(handle.key(), "user-srv/10.0.0.7:9100");
        let entries = store.list("user-srv/").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, "10.0.0.7:9100");
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let shutdown = ShutdownSignal::new();
        let registrar = registrar(&store);
        let handle = registrar
            .register("user-srv", "10.0.0.7:9100", &shutdown)
            .await
            .unwrap();

        registrar.deregister(&handle).await;
        registrar.deregister(&handle).await;

        assert!(handle.is_deregistered());
        assert_eq!(store.delete_calls("user-srv/10.0.0.7:9100"), 1);
        assert!(store.list("user-srv/").await.unwrap().is_empty());
        assert!(handle.await_stopped(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_entry_alive_past_ttl() {
        let store = Arc::new(MemoryStore::new());
        let shutdown = ShutdownSignal::new();
        let registrar = registrar(&store);
        let handle = registrar
            .register("user-srv", "10.0.0.7:9100", &shutdown)
            .await
            .unwrap();

        // three full TTL windows with the renewal task running
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(store.contains("user-srv/10.0.0.7:9100"));

        registrar.deregister(&handle).await;
        assert!(handle.await_stopped(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_shutdown_deregisters_once() {
        let store = Arc::new(MemoryStore::new());
        let shutdown = ShutdownSignal::new();
        let handle = registrar(&store)
            .register("user-srv", "10.0.0.7:9100", &shutdown)
            .await
            .unwrap();

        shutdown.trigger();
        assert!(handle.await_stopped(Duration::from_secs(1)).await);
        assert!(handle.is_deregistered());
        assert_eq!(store.delete_calls("user-srv/10.0.0.7:9100"), 1);
        assert!(store.list("user-srv/").await.unwrap().is_empty());
    }
}
