//! Farol Directory - the coordination-store seam
//!
//! Every other Farol component talks to the external coordination store
//! through the [`DirectoryStore`] trait: TTL leases, key writes and deletes,
//! and prefix watches. Two implementations ship here:
//! - [`EtcdStore`], backed by the `etcd-client` crate, for deployments
//! - [`MemoryStore`], an in-process store with real TTL eviction, for tests
//!   and embedded setups

pub mod etcd;
pub mod memory;
pub mod store;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;
pub use store::{entry_key, service_prefix, DirectoryEvent, DirectoryStore, EventStream, LeaseId};
