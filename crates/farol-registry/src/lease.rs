//! Lease lifecycle for one registration session

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use farol_common::{FarolError, Result, DEFAULT_LEASE_TTL};
use farol_directory::{DirectoryStore, LeaseId};

/// Lease lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// Granted, no successful renewal yet.
    Created,
    /// At least one successful renewal.
    Active,
    /// Explicitly revoked.
    Revoked,
    /// Evicted store-side before a renewal arrived.
    Expired,
}

/// Owns one TTL lease: grant, renew-once, revoke.
///
/// A keeper is 1:1 with one registration session and is owned by the
/// renewal task of the `RegistrationHandle` that created it.
pub struct LeaseKeeper {
    store: Arc<dyn DirectoryStore>,
    lease_id: LeaseId,
    ttl: Duration,
    state: LeaseState,
}

impl LeaseKeeper {
    /// Grant a lease with the given TTL, defaulting to 10 seconds.
    pub async fn create(store: Arc<dyn DirectoryStore>, ttl: Option<Duration>) -> Result<Self> {
        let ttl = ttl.unwrap_or(DEFAULT_LEASE_TTL);
        let lease_id = store.grant(ttl).await?;
        debug!(%lease_id, ?ttl, "lease granted");
        Ok(Self {
            store,
            lease_id,
            ttl,
            state: LeaseState::Created,
        })
    }

    /// One renewal attempt. A transient failure leaves the state unchanged
    /// and must be retried at the next cadence tick; a store-side eviction
    /// moves the lease to `Expired`.
    pub async fn renew_once(&mut self) -> Result<Duration> {
        let remaining = self.store.keep_alive_once(self.lease_id).await?;
        if remaining.is_zero() {
            self.state = LeaseState::Expired;
            return Err(FarolError::Lease(format!(
                "lease {} expired before renewal",
                self.lease_id
            )));
        }
        if self.state == LeaseState::Created {
            self.state = LeaseState::Active;
        }
        Ok(remaining)
    }

    /// Revoke the lease, releasing every key bound to it.
    pub async fn revoke(&mut self) -> Result<()> {
        self.store.revoke(self.lease_id).await?;
        self.state = LeaseState::Revoked;
        Ok(())
    }

    pub fn lease_id(&self) -> LeaseId {
        self.lease_id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn state(&self) -> LeaseState {
        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use farol_directory::MemoryStore;

    #[tokio::test]
    async fn test_create_uses_default_ttl() {
        let store = Arc::new(MemoryStore::new());
        let keeper = LeaseKeeper::create(store, None).await.unwrap();
        assert_eq!(keeper.ttl(), DEFAULT_LEASE_TTL);
        assert_eq!(keeper.state(), LeaseState::Created);
    }

    #[tokio::test]
    async fn test_first_renewal_activates() {
        let store = Arc::new(MemoryStore::new());
        let mut keeper = LeaseKeeper::create(store, Some(Duration::from_secs(10)))
            .await
            .unwrap();
        keeper.renew_once().await.unwrap();
        assert_eq!(keeper.state(), LeaseState::Active);
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_state() {
        let store = Arc::new(MemoryStore::new());
        let mut keeper = LeaseKeeper::create(store.clone(), None).await.unwrap();
        keeper.renew_once().await.unwrap();

        store.fail_renewals(true);
        assert!(keeper.renew_once().await.is_err());
        assert_eq!(keeper.state(), LeaseState::Active);

        store.fail_renewals(false);
        assert!(keeper.renew_once().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_is_detected() {
        let store = Arc::new(MemoryStore::new());
        let mut keeper = LeaseKeeper::create(store, Some(Duration::from_secs(2)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        let err = keeper.renew_once().await.unwrap_err();
        assert!(matches!(err, FarolError::Lease(_)));
        assert_eq!(keeper.state(), LeaseState::Expired);
    }

    #[tokio::test]
    async fn test_revoke() {
        let store = Arc::new(MemoryStore::new());
        let mut keeper = LeaseKeeper::create(store.clone(), None).await.unwrap();
        store
            .put("svc/a:1", "a:1", keeper.lease_id())
            .await
            .unwrap();
        keeper.revoke().await.unwrap();
        assert_eq!(keeper.state(), LeaseState::Revoked);
        assert!(!store.contains("svc/a:1"));
    }
}
