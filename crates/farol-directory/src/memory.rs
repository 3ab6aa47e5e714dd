//! In-process directory store
//!
//! Implements the full [`DirectoryStore`] contract, including store-side TTL
//! eviction, against `tokio` time, so it behaves correctly under paused-time
//! tests. Used by the scenario tests and usable as an embedded backend where
//! no external coordination store is deployed.
//!
//! Test hooks: [`MemoryStore::fail_renewals`] simulates an unreachable store
//! for keep-alives, [`MemoryStore::drop_watch_streams`] simulates a watch
//! disconnect, and [`MemoryStore::delete_calls`] counts explicit deletes per
//! key.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::debug;

use farol_common::{FarolError, Result};

use crate::store::{DirectoryEvent, DirectoryStore, EventStream, LeaseId};

const SWEEP_INTERVAL: Duration = Duration::from_millis(100);
const EVENT_BUFFER: usize = 64;

struct LeaseRecord {
    ttl: Duration,
    expires_at: Mutex<Instant>,
}

struct EntryRecord {
    address: String,
    lease: LeaseId,
}

/// In-memory [`DirectoryStore`] with TTL eviction and watch fan-out.
pub struct MemoryStore {
    entries: Arc<DashMap<String, EntryRecord>>,
    leases: Arc<DashMap<i64, LeaseRecord>>,
    next_lease_id: AtomicI64,
    events: broadcast::Sender<DirectoryEvent>,
    resets: broadcast::Sender<()>,
    fail_renewals: AtomicBool,
    fail_lists: AtomicBool,
    delete_calls: DashMap<String, u64>,
    sweeper_started: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (resets, _) = broadcast::channel(1);
        Self {
            entries: Arc::new(DashMap::new()),
            leases: Arc::new(DashMap::new()),
            next_lease_id: AtomicI64::new(1),
            events,
            resets,
            fail_renewals: AtomicBool::new(false),
            fail_lists: AtomicBool::new(false),
            delete_calls: DashMap::new(),
            sweeper_started: AtomicBool::new(false),
        }
    }

    /// Make every subsequent `keep_alive_once` fail with a connectivity
    /// error, as a partitioned store would.
    pub fn fail_renewals(&self, fail: bool) {
        self.fail_renewals.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `list` fail, so resynchronization attempts
    /// can be made unrecoverable.
    pub fn fail_lists(&self, fail: bool) {
        self.fail_lists.store(fail, Ordering::SeqCst);
    }

    /// Close every open watch stream, as a store-side disconnect would.
    pub fn drop_watch_streams(&self) {
        let _ = self.resets.send(());
    }

    /// Number of explicit `delete` calls observed for `key`.
    pub fn delete_calls(&self, key: &str) -> u64 {
        self.delete_calls.get(key).map(|c| *c).unwrap_or(0)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Lazily start the expiry sweeper; it stops once the store is dropped.
    fn ensure_sweeper(&self) {
        if self.sweeper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let entries = Arc::downgrade(&self.entries);
        let leases = Arc::downgrade(&self.leases);
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let (Some(entries), Some(leases)) = (entries.upgrade(), leases.upgrade()) else {
                    break;
                };
                sweep_expired(&entries, &leases, &events);
            }
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn sweep_expired(
    entries: &DashMap<String, EntryRecord>,
    leases: &DashMap<i64, LeaseRecord>,
    events: &broadcast::Sender<DirectoryEvent>,
) {
    let now = Instant::now();
    let expired: Vec<i64> = leases
        .iter()
        .filter(|record| *record.value().expires_at.lock() <= now)
        .map(|record| *record.key())
        .collect();
    for id in expired {
        leases.remove(&id);
        evict_lease_keys(entries, events, LeaseId(id));
    }
}

fn evict_lease_keys(
    entries: &DashMap<String, EntryRecord>,
    events: &broadcast::Sender<DirectoryEvent>,
    lease: LeaseId,
) {
    let keys: Vec<String> = entries
        .iter()
        .filter(|entry| entry.value().lease == lease)
        .map(|entry| entry.key().clone())
        .collect();
    for key in keys {
        entries.remove(&key);
        debug!(%key, %lease, "evicted entry after lease expiry");
        let _ = events.send(DirectoryEvent::Delete { key });
    }
}

#[async_trait]
impl DirectoryStore for MemoryStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId> {
        self.ensure_sweeper();
        let id = self.next_lease_id.fetch_add(1, Ordering::SeqCst);
        self.leases.insert(
            id,
            LeaseRecord {
                ttl,
                expires_at: Mutex::new(Instant::now() + ttl),
            },
        );
        Ok(LeaseId(id))
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<Duration> {
        if self.fail_renewals.load(Ordering::SeqCst) {
            return Err(FarolError::Connectivity(
                "memory store is refusing renewals".to_string(),
            ));
        }
        let (expired, ttl) = match self.leases.get(&lease.0) {
            None => return Ok(Duration::ZERO),
            Some(record) => {
                let now = Instant::now();
                let mut expires_at = record.expires_at.lock();
                if *expires_at <= now {
                    (true, record.ttl)
                } else {
                    *expires_at = now + record.ttl;
                    (false, record.ttl)
                }
            }
        };
        if expired {
            self.leases.remove(&lease.0);
            evict_lease_keys(&self.entries, &self.events, lease);
            return Ok(Duration::ZERO);
        }
        Ok(ttl)
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        if self.leases.remove(&lease.0).is_none() {
            return Err(FarolError::Lease(format!("lease {lease} not found")));
        }
        evict_lease_keys(&self.entries, &self.events, lease);
        Ok(())
    }

    async fn put(&self, key: &str, address: &str, lease: LeaseId) -> Result<()> {
        if !self.leases.contains_key(&lease.0) {
            return Err(FarolError::Lease(format!("lease {lease} not found")));
        }
        self.entries.insert(
            key.to_string(),
            EntryRecord {
                address: address.to_string(),
                lease,
            },
        );
        let _ = self.events.send(DirectoryEvent::Put {
            key: key.to_string(),
            address: address.to_string(),
        });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        *self.delete_calls.entry(key.to_string()).or_insert(0) += 1;
        let existed = self.entries.remove(key).is_some();
        if existed {
            let _ = self.events.send(DirectoryEvent::Delete {
                key: key.to_string(),
            });
        }
        Ok(existed)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(FarolError::Connectivity(
                "memory store is refusing lists".to_string(),
            ));
        }
        let mut matches: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| (entry.key().clone(), entry.value().address.clone()))
            .collect();
        matches.sort();
        Ok(matches)
    }

    async fn watch(&self, prefix: &str) -> Result<EventStream> {
        self.ensure_sweeper();
        let mut events = self.events.subscribe();
        let mut resets = self.resets.subscribe();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let prefix = prefix.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = resets.recv() => break,
                    received = events.recv() => match received {
                        Ok(event) if event.key().starts_with(&prefix) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        // Lagging means missed events; close so the consumer resyncs.
                        Err(broadcast::error::RecvError::Lagged(_)) => break,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_list_delete() {
        let store = MemoryStore::new();
        let lease = store.grant(Duration::from_secs(10)).await.unwrap();
        store.put("svc/a:1", "a:1", lease).await.unwrap();
        store.put("svc/b:2", "b:2", lease).await.unwrap();
        store.put("other/c:3", "c:3", lease).await.unwrap();

        let listed = store.list("svc/").await.unwrap();
        assert_eq!(
            listed,
            vec![
                ("svc/a:1".to_string(), "a:1".to_string()),
                ("svc/b:2".to_string(), "b:2".to_string()),
            ]
        );

        assert!(store.delete("svc/a:1").await.unwrap());
        assert!(!store.delete("svc/a:1").await.unwrap());
        assert_eq!(store.delete_calls("svc/a:1"), 2);
        assert_eq!(store.list("svc/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_put_requires_live_lease() {
        let store = MemoryStore::new();
        let err = store
            .put("svc/a:1", "a:1", LeaseId(404))
            .await
            .unwrap_err();
        assert!(matches!(err, FarolError::Lease(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_evicts_keys() {
        let store = MemoryStore::new();
        let lease = store.grant(Duration::from_secs(2)).await.unwrap();
        store.put("svc/a:1", "a:1", lease).await.unwrap();
        let mut watch = store.watch("svc/").await.unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(!store.contains("svc/a:1"));
        let event = tokio::time::timeout(Duration::from_secs(1), watch.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            DirectoryEvent::Delete {
                key: "svc/a:1".to_string()
            }
        );
        // expiry is store-side eviction, not an explicit delete
        assert_eq!(store.delete_calls("svc/a:1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_extends_lease() {
        let store = MemoryStore::new();
        let lease = store.grant(Duration::from_secs(2)).await.unwrap();
        store.put("svc/a:1", "a:1", lease).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let remaining = store.keep_alive_once(lease).await.unwrap();
            assert_eq!(remaining, Duration::from_secs(2));
        }
        assert!(store.contains("svc/a:1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_after_expiry_reports_gone() {
        let store = MemoryStore::new();
        let lease = store.grant(Duration::from_secs(1)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        let remaining = store.keep_alive_once(lease).await.unwrap();
        assert_eq!(remaining, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_failed_renewals_are_connectivity_errors() {
        let store = MemoryStore::new();
        let lease = store.grant(Duration::from_secs(10)).await.unwrap();
        store.fail_renewals(true);
        let err = store.keep_alive_once(lease).await.unwrap_err();
        assert!(matches!(err, FarolError::Connectivity(_)));
        store.fail_renewals(false);
        assert!(store.keep_alive_once(lease).await.is_ok());
    }

    #[tokio::test]
    async fn test_watch_sees_puts_and_deletes() {
        let store = MemoryStore::new();
        let mut watch = store.watch("svc/").await.unwrap();
        let lease = store.grant(Duration::from_secs(10)).await.unwrap();

        store.put("svc/a:1", "a:1", lease).await.unwrap();
        store.put("other/x:9", "x:9", lease).await.unwrap();
        store.delete("svc/a:1").await.unwrap();

        let first = watch.recv().await.unwrap();
        let second = watch.recv().await.unwrap();
        assert_eq!(
            first,
            DirectoryEvent::Put {
                key: "svc/a:1".to_string(),
                address: "a:1".to_string()
            }
        );
        // the other/ event is filtered out by the prefix
        assert_eq!(
            second,
            DirectoryEvent::Delete {
                key: "svc/a:1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_drop_watch_streams_closes_watches() {
        let store = MemoryStore::new();
        let mut watch = store.watch("svc/").await.unwrap();
        store.drop_watch_streams();
        assert!(watch.recv().await.is_none());
    }
}
