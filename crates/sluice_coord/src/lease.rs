//! Time-bounded leases over the metadata store.
//!
//! A lease is a record at `leases/<resource>` naming its holder and an
//! expiry. It is taken with an insert-if-absent, extended and stolen with
//! compare-and-swap, so two holders can never both succeed.

use crate::metadata::{MetadataStore, Versioned};
use serde::{Deserialize, Serialize};
use sluice_core::{CoreError, CoreResult, Timestamp};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Key prefix of lease records
pub const LEASE_PREFIX: &str = "leases/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct LeaseRecord {
    holder: String,
    expires_ms: u64,
    /// Incremented whenever the lease changes hands
    epoch: u64,
}

/// A held lease
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    /// Leased resource
    pub resource: String,
    /// Holder identity
    pub holder: String,
    /// Fencing epoch; bumps on every change of holder
    pub epoch: u64,
    /// Expiry, as last written
    pub expires: Timestamp,
    /// Time-to-live used for renewals
    pub ttl: Duration,
    version: u64,
}

impl Lease {
    /// Whether the expiry has passed by the local clock
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Timestamp::now() >= self.expires
    }
}

/// Acquires, renews, releases and validates leases
#[derive(Debug, Clone)]
pub struct LeaseManager {
    store: MetadataStore,
}

impl LeaseManager {
    /// Create a lease manager
    #[must_use]
    pub fn new(store: MetadataStore) -> Self {
        Self { store }
    }

    fn key(resource: &str) -> String {
        format!("{}{}", LEASE_PREFIX, resource)
    }

    fn lease_from(resource: &str, ttl: Duration, record: &Versioned<LeaseRecord>) -> Lease {
        Lease {
            resource: resource.to_string(),
            holder: record.value.holder.clone(),
            epoch: record.value.epoch,
            expires: Timestamp::from_millis(record.value.expires_ms),
            ttl,
            version: record.version,
        }
    }

    fn not_leader(resource: &str) -> CoreError {
        CoreError::NotLeader {
            resource: resource.to_string(),
        }
    }

    /// Current holder of a resource, if the lease is live
    ///
    /// # Errors
    ///
    /// Returns error if the store fails
    pub async fn holder(&self, resource: &str) -> CoreResult<Option<String>> {
        let current = self
            .store
            .get_json::<LeaseRecord>(&Self::key(resource))
            .await?;
        Ok(current
            .filter(|r| Timestamp::now().as_millis() < r.value.expires_ms)
            .map(|r| r.value.holder))
    }

    /// Try to take the lease. Succeeds if the resource is free, expired,
    /// or already held by `holder`.
    ///
    /// # Errors
    ///
    /// Returns `NotLeader` if someone else holds a live lease
    pub async fn acquire(&self, resource: &str, holder: &str, ttl: Duration) -> CoreResult<Lease> {
        let key = Self::key(resource);
        let now = Timestamp::now();
        let expires_ms = now.add(ttl).as_millis();

        match self.store.get_json::<LeaseRecord>(&key).await? {
            None => {
                let record = LeaseRecord {
                    holder: holder.to_string(),
                    expires_ms,
                    epoch: 1,
                };
                let version = match self.store.create_json(&key, &record).await {
                    Ok(v) => v,
                    Err(err) if err.is_already_exists() => return Err(Self::not_leader(resource)),
                    Err(err) => return Err(err),
                };
                info!(resource = %resource, holder = %holder, epoch = 1, "lease acquired");
                Ok(Self::lease_from(resource, ttl, &Versioned { value: record, version }))
            }
            Some(current) if current.value.holder == holder || now.as_millis() >= current.value.expires_ms => {
                let taking_over = current.value.holder != holder;
                let record = LeaseRecord {
                    holder: holder.to_string(),
                    expires_ms,
                    epoch: if taking_over {
                        current.value.epoch + 1
                    } else {
                        current.value.epoch
                    },
                };
                let version = match self.store.cas_json(&key, current.version, &record).await {
                    Ok(v) => v,
                    Err(CoreError::Conflict { .. }) | Err(CoreError::NotFound { .. }) => {
                        return Err(Self::not_leader(resource));
                    }
                    Err(err) => return Err(err),
                };
                if taking_over {
                    warn!(
                        resource = %resource,
                        holder = %holder,
                        previous = %current.value.holder,
                        epoch = record.epoch,
                        "took over expired lease"
                    );
                } else {
                    info!(resource = %resource, holder = %holder, epoch = record.epoch, "lease re-acquired");
                }
                Ok(Self::lease_from(resource, ttl, &Versioned { value: record, version }))
            }
            Some(_) => Err(Self::not_leader(resource)),
        }
    }

    /// Extend a held lease by its TTL.
    ///
    /// A lease that expired but was not taken by anyone else can still be
    /// renewed.
    ///
    /// # Errors
    ///
    /// Returns `NotLeader` if the lease changed hands or was released
    pub async fn renew(&self, lease: &Lease) -> CoreResult<Lease> {
        let key = Self::key(&lease.resource);
        let record = LeaseRecord {
            holder: lease.holder.clone(),
            expires_ms: Timestamp::now().add(lease.ttl).as_millis(),
            epoch: lease.epoch,
        };
        match self.store.cas_json(&key, lease.version, &record).await {
            Ok(version) => {
                debug!(resource = %lease.resource, holder = %lease.holder, "lease renewed");
                Ok(Self::lease_from(
                    &lease.resource,
                    lease.ttl,
                    &Versioned { value: record, version },
                ))
            }
            Err(CoreError::Conflict { .. }) | Err(CoreError::NotFound { .. }) => {
                Err(Self::not_leader(&lease.resource))
            }
            Err(err) => Err(err),
        }
    }

    /// Give the lease up. The record is kept with an expiry in the past
    /// so the next holder still advances the epoch. Releasing a lease
    /// that is no longer held is a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails
    pub async fn release(&self, lease: &Lease) -> CoreResult<()> {
        let key = Self::key(&lease.resource);
        let record = LeaseRecord {
            holder: lease.holder.clone(),
            expires_ms: 0,
            epoch: lease.epoch,
        };
        match self.store.cas_json(&key, lease.version, &record).await {
            Ok(_) => {
                info!(resource = %lease.resource, holder = %lease.holder, "lease released");
                Ok(())
            }
            Err(CoreError::Conflict { .. }) | Err(CoreError::NotFound { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Check that `lease` is still held and live. Called before every
    /// state-mutating action taken under the lease.
    ///
    /// # Errors
    ///
    /// Returns `NotLeader` if the lease expired or changed hands
    pub async fn validate(&self, lease: &Lease) -> CoreResult<()> {
        let current = self
            .store
            .get_json::<LeaseRecord>(&Self::key(&lease.resource))
            .await?;
        match current {
            Some(record)
                if record.value.holder == lease.holder
                    && record.value.epoch == lease.epoch
                    && Timestamp::now().as_millis() < record.value.expires_ms =>
            {
                Ok(())
            }
            _ => Err(Self::not_leader(&lease.resource)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKv;
    use std::sync::Arc;

    fn manager() -> LeaseManager {
        LeaseManager::new(MetadataStore::new(Arc::new(MemoryKv::new())))
    }

    #[tokio::test]
    async fn test_exclusive_acquire() {
        let leases = manager();
        let lease = leases
            .acquire("pipeline/p", "a", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(lease.epoch, 1);

        let err = leases
            .acquire("pipeline/p", "b", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotLeader { .. }));
        assert_eq!(leases.holder("pipeline/p").await.unwrap().as_deref(), Some("a"));
        leases.validate(&lease).await.unwrap();
    }

    #[tokio::test]
    async fn test_takeover_after_expiry() {
        let leases = manager();
        let old = leases
            .acquire("pipeline/p", "a", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(leases.validate(&old).await.is_err());
        let new = leases
            .acquire("pipeline/p", "b", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(new.epoch, 2);

        // The old holder can no longer renew.
        assert!(matches!(
            leases.renew(&old).await.unwrap_err(),
            CoreError::NotLeader { .. }
        ));
        leases.validate(&new).await.unwrap();
    }

    #[tokio::test]
    async fn test_renew_extends() {
        let leases = manager();
        let lease = leases
            .acquire("r", "a", Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let renewed = leases.renew(&lease).await.unwrap();
        assert!(renewed.expires > lease.expires);
        assert!(leases.renew(&lease).await.is_err(), "stale lease must not renew");
        leases.renew(&renewed).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_frees_resource() {
        let leases = manager();
        let lease = leases.acquire("r", "a", Duration::from_secs(10)).await.unwrap();
        leases.release(&lease).await.unwrap();
        assert!(leases.holder("r").await.unwrap().is_none());
        assert!(leases.validate(&lease).await.is_err());

        leases.acquire("r", "b", Duration::from_secs(10)).await.unwrap();
        // Releasing the stale lease does not remove b's.
        leases.release(&lease).await.unwrap();
        assert_eq!(leases.holder("r").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let leases = manager();
        let mut handles = Vec::new();
        for i in 0..8 {
            let leases = leases.clone();
            handles.push(tokio::spawn(async move {
                leases
                    .acquire("r", &format!("h{}", i), Duration::from_secs(10))
                    .await
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
