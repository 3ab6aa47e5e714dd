//! The `DirectoryStore` trait and its wire-level types
//!
//! Directory keys follow the `serviceName/address` convention (ASCII,
//! `/`-delimited); the value carries the advertised address. Lease binding is
//! store-native: when a lease expires or is revoked, the store evicts every
//! key bound to it.

use std::time::Duration;

use async_trait::async_trait;

use farol_common::Result;

/// Identifier of a store-side TTL lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LeaseId(pub i64);

impl std::fmt::Display for LeaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Incremental change to a watched key range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    Put { key: String, address: String },
    Delete { key: String },
}

impl DirectoryEvent {
    pub fn key(&self) -> &str {
        match self {
            DirectoryEvent::Put { key, .. } | DirectoryEvent::Delete { key } => key,
        }
    }
}

/// Stream of watch events. The stream closing (`recv` returning `None`)
/// signals watch disconnection; consumers are expected to resynchronize.
pub type EventStream = tokio::sync::mpsc::Receiver<DirectoryEvent>;

/// Directory key for one `(service, address)` pair.
pub fn entry_key(service: &str, address: &str) -> String {
    format!("{service}/{address}")
}

/// Watch/list prefix covering every entry of a service.
pub fn service_prefix(service: &str) -> String {
    format!("{service}/")
}

/// Abstraction over the external coordination store.
///
/// Implementations must tolerate concurrent calls from independent
/// background tasks (lease renewal, prefix watches) without caller-side
/// locking; one handle is shared by everything in the process.
#[async_trait]
pub trait DirectoryStore: Send + Sync + 'static {
    /// Create a TTL lease.
    async fn grant(&self, ttl: Duration) -> Result<LeaseId>;

    /// Single renewal attempt. Returns the remaining TTL; `Duration::ZERO`
    /// means the lease no longer exists store-side. Failure here is
    /// transient and must never delete the entry.
    async fn keep_alive_once(&self, lease: LeaseId) -> Result<Duration>;

    /// Revoke a lease, evicting every key bound to it.
    async fn revoke(&self, lease: LeaseId) -> Result<()>;

    /// Write `key -> address` bound to `lease`.
    async fn put(&self, key: &str, address: &str, lease: LeaseId) -> Result<()>;

    /// Delete a key. Returns `false` when the key was already absent, which
    /// keeps deregistration idempotent without error juggling.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// List every `(key, address)` under a prefix, sorted by key.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>>;

    /// Open a watch over a prefix, reporting puts and deletes.
    async fn watch(&self, prefix: &str) -> Result<EventStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_format() {
        assert_eq!(entry_key("user-srv", "10.0.0.7:9100"), "user-srv/10.0.0.7:9100");
        assert_eq!(service_prefix("user-srv"), "user-srv/");
        assert!(entry_key("user-srv", "10.0.0.7:9100").starts_with(&service_prefix("user-srv")));
    }

    #[test]
    fn test_event_key() {
        let put = DirectoryEvent::Put {
            key: "svc/a:1".to_string(),
            address: "a:1".to_string(),
        };
        let delete = DirectoryEvent::Delete {
            key: "svc/a:1".to_string(),
        };
        assert_eq!(put.key(), "svc/a:1");
        assert_eq!(delete.key(), "svc/a:1");
    }
}
