//! Discovery resolver
//!
//! Watches `service/` entries in the directory and maintains a live,
//! sorted address set. The watch task is supervised; on stream disconnection
//! it resynchronizes with a full re-list plus re-watch, and if that fails it
//! latches a resolver fault that every later read surfaces instead of a
//! silently stale set.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use farol_common::{FarolError, Result, ShutdownSignal};
use farol_directory::{service_prefix, DirectoryEvent, DirectoryStore, EventStream};

use crate::balancer::RoundRobin;

struct ResolverShared {
    /// Sorted, for a deterministic round-robin rotation.
    addresses: RwLock<Vec<String>>,
    fault: RwLock<Option<String>>,
    balancer: RoundRobin,
}

impl ResolverShared {
    fn replace(&self, entries: Vec<(String, String)>) {
        let mut addresses: Vec<String> =
            entries.into_iter().map(|(_, address)| address).collect();
        addresses.sort();
        addresses.dedup();
        *self.addresses.write() = addresses;
    }

    fn apply(&self, event: DirectoryEvent, prefix: &str) {
        match event {
            DirectoryEvent::Put { address, .. } => {
                let mut addresses = self.addresses.write();
                if let Err(slot) = addresses.binary_search(&address) {
                    addresses.insert(slot, address);
                }
            }
            DirectoryEvent::Delete { key } => {
                let address = key.strip_prefix(prefix).unwrap_or(&key).to_string();
                let mut addresses = self.addresses.write();
                if let Ok(slot) = addresses.binary_search(&address) {
                    addresses.remove(slot);
                }
            }
        }
    }

    fn set_fault(&self, message: String) {
        *self.fault.write() = Some(message);
    }
}

/// Live view of one service's registered addresses.
pub struct Resolver {
    service: String,
    shared: Arc<ResolverShared>,
    stop: ShutdownSignal,
    done: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Resolver {
    /// Open a prefix watch over `service/` and build the initial set.
    /// Construction-time failures surface synchronously.
    pub async fn watch(
        store: Arc<dyn DirectoryStore>,
        service: impl Into<String>,
    ) -> Result<Self> {
        let service = service.into();
        let prefix = service_prefix(&service);
        let shared = Arc::new(ResolverShared {
            addresses: RwLock::new(Vec::new()),
            fault: RwLock::new(None),
            balancer: RoundRobin::new(),
        });

        // Watch before list, so nothing slips between snapshot and stream.
        let events = store.watch(&prefix).await?;
        shared.replace(store.list(&prefix).await?);

        let stop = ShutdownSignal::new();
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(watch_loop(
            store,
            prefix,
            Arc::clone(&shared),
            events,
            stop.clone(),
            done_tx,
        ));

        Ok(Self {
            service,
            shared,
            stop,
            done: Mutex::new(Some(done_rx)),
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current live address set, sorted.
    pub fn addresses(&self) -> Result<Vec<String>> {
        self.check_fault()?;
        Ok(self.shared.addresses.read().clone())
    }

    /// Next address under round robin.
    pub fn next(&self) -> Result<String> {
        self.check_fault()?;
        let addresses = self.shared.addresses.read();
        self.shared
            .balancer
            .pick(&addresses)
            .map(str::to_string)
            .ok_or_else(|| {
                FarolError::Resolver(format!(
                    "no live addresses for service '{}'",
                    self.service
                ))
            })
    }

    fn check_fault(&self) -> Result<()> {
        if let Some(message) = self.shared.fault.read().as_ref() {
            return Err(FarolError::Resolver(message.clone()));
        }
        Ok(())
    }

    /// Stop the watch task.
    pub fn stop(&self) {
        self.stop.trigger();
    }

    /// Await the watch task's exit after [`Resolver::stop`].
    pub async fn await_stopped(&self, timeout: Duration) -> bool {
        let Some(done) = self.done.lock().take() else {
            return false;
        };
        matches!(tokio::time::timeout(timeout, done).await, Ok(Ok(())))
    }
}

async fn watch_loop(
    store: Arc<dyn DirectoryStore>,
    prefix: String,
    shared: Arc<ResolverShared>,
    mut events: EventStream,
    stop: ShutdownSignal,
    done: oneshot::Sender<()>,
) {
    loop {
        tokio::select! {
            _ = stop.wait() => break,
            received = events.recv() => match received {
                Some(event) => {
                    debug!(%prefix, ?event, "watch event");
                    shared.apply(event, &prefix);
                }
                None => {
                    warn!(%prefix, "watch stream lost, resynchronizing");
                    match resync(store.as_ref(), &prefix, &shared).await {
                        Ok(stream) => events = stream,
                        Err(e) => {
                            warn!(%prefix, "resynchronization failed: {e}");
                            shared.set_fault(format!("watch on '{prefix}' unrecoverable: {e}"));
                            break;
                        }
                    }
                }
            },
        }
    }
    let _ = done.send(());
}

/// Full re-list plus re-watch after a stream disconnect.
async fn resync(
    store: &dyn DirectoryStore,
    prefix: &str,
    shared: &ResolverShared,
) -> Result<EventStream> {
    let events = store.watch(prefix).await?;
    shared.replace(store.list(prefix).await?);
    Ok(events)
}
