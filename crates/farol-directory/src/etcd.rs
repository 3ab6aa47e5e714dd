//! etcd-backed directory store
//!
//! Wraps `etcd-client` behind [`DirectoryStore`]. The underlying client
//! multiplexes one channel, and the per-call sub-clients are cheap clones, so
//! a single [`EtcdStore`] handle serves the renewal task and the watch task
//! concurrently without external locking.

use std::time::Duration;

use etcd_client::{Client, ConnectOptions, EventType, GetOptions, PutOptions, WatchOptions};
use tokio::sync::mpsc;
use tracing::debug;

use farol_common::{DirectoryConfig, FarolError, Result};

use crate::store::{DirectoryEvent, DirectoryStore, EventStream, LeaseId};

const WATCH_BUFFER: usize = 64;

/// [`DirectoryStore`] over an etcd cluster.
pub struct EtcdStore {
    client: Client,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore").finish_non_exhaustive()
    }
}

impl EtcdStore {
    /// Connect to the configured endpoints and health-probe each one within
    /// the configured timeout. An empty endpoint list is a `Config` error; a
    /// failed or slow probe is a `Connectivity` error.
    pub async fn connect(config: &DirectoryConfig) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(FarolError::Config(
                "no directory endpoints configured".to_string(),
            ));
        }
        let timeout = config.connect_timeout();
        let options = ConnectOptions::new().with_connect_timeout(timeout);

        let client = Client::connect(config.endpoints.clone(), Some(options.clone()))
            .await
            .map_err(|e| FarolError::Connectivity(format!("directory connect failed: {e}")))?;

        for endpoint in &config.endpoints {
            let probe = async {
                let mut probe_client =
                    Client::connect([endpoint.as_str()], Some(options.clone())).await?;
                let mut maintenance = probe_client.maintenance_client();
                maintenance.status().await
            };
            match tokio::time::timeout(timeout, probe).await {
                Ok(Ok(_)) => debug!(%endpoint, "directory endpoint healthy"),
                Ok(Err(e)) => {
                    return Err(FarolError::Connectivity(format!(
                        "health probe of {endpoint} failed: {e}"
                    )));
                }
                Err(_) => {
                    return Err(FarolError::Connectivity(format!(
                        "health probe of {endpoint} timed out after {timeout:?}"
                    )));
                }
            }
        }

        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl DirectoryStore for EtcdStore {
    async fn grant(&self, ttl: Duration) -> Result<LeaseId> {
        let mut lease = self.client.lease_client();
        let resp = lease
            .grant(ttl.as_secs() as i64, None)
            .await
            .map_err(lease_error)?;
        Ok(LeaseId(resp.id()))
    }

    async fn keep_alive_once(&self, lease: LeaseId) -> Result<Duration> {
        let mut lease_client = self.client.lease_client();
        let (mut keeper, mut responses) = lease_client
            .keep_alive(lease.0)
            .await
            .map_err(lease_error)?;
        keeper.keep_alive().await.map_err(lease_error)?;
        // A keep-alive response with TTL 0 means the lease is gone.
        match responses.message().await.map_err(lease_error)? {
            Some(resp) if resp.ttl() > 0 => Ok(Duration::from_secs(resp.ttl() as u64)),
            _ => Ok(Duration::ZERO),
        }
    }

    async fn revoke(&self, lease: LeaseId) -> Result<()> {
        let mut lease_client = self.client.lease_client();
        lease_client.revoke(lease.0).await.map_err(lease_error)?;
        Ok(())
    }

    async fn put(&self, key: &str, address: &str, lease: LeaseId) -> Result<()> {
        let mut kv = self.client.kv_client();
        kv.put(key, address, Some(PutOptions::new().with_lease(lease.0)))
            .await
            .map_err(registration_error)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut kv = self.client.kv_client();
        let resp = kv.delete(key, None).await.map_err(registration_error)?;
        Ok(resp.deleted() > 0)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let mut kv = self.client.kv_client();
        let resp = kv
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(resolver_error)?;
        let mut entries = Vec::with_capacity(resp.kvs().len());
        for kv in resp.kvs() {
            let key = kv.key_str().map_err(resolver_error)?.to_string();
            let address = kv.value_str().map_err(resolver_error)?.to_string();
            entries.push((key, address));
        }
        entries.sort();
        Ok(entries)
    }

    async fn watch(&self, prefix: &str) -> Result<EventStream> {
        let mut watch_client = self.client.watch_client();
        let (watcher, mut stream) = watch_client
            .watch(prefix, Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(resolver_error)?;
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        tokio::spawn(async move {
            // Dropping the watcher cancels the server-side watch, so it
            // lives as long as the forwarding loop.
            let _watcher = watcher;
            while let Ok(Some(resp)) = stream.message().await {
                for event in resp.events() {
                    let Some(mapped) = map_event(event) else { continue };
                    if tx.send(mapped).await.is_err() {
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

fn map_event(event: &etcd_client::Event) -> Option<DirectoryEvent> {
    let kv = event.kv()?;
    let key = kv.key_str().ok()?.to_string();
    match event.event_type() {
        EventType::Put => {
            let address = kv.value_str().ok()?.to_string();
            Some(DirectoryEvent::Put { key, address })
        }
        EventType::Delete => Some(DirectoryEvent::Delete { key }),
    }
}

fn lease_error(e: etcd_client::Error) -> FarolError {
    FarolError::Lease(e.to_string())
}

fn registration_error(e: etcd_client::Error) -> FarolError {
    FarolError::Registration(e.to_string())
}

fn resolver_error(e: etcd_client::Error) -> FarolError {
    FarolError::Resolver(e.to_string())
}
