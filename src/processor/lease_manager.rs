//! Lease acquisition, renewal, checkpointing and release for one host.
//!
//! The manager keeps the latest version of every lease this host owns. All
//! writes are conditional on that version, so a host that lost a lease finds
//! out on its next write instead of silently overwriting the new owner.
//!
//! | Operation | Condition | On version conflict |
//! |-----------|-----------|---------------------|
//! | `acquire` | unowned, expired, or already ours | not acquired |
//! | `renew` | still ours | re-read: ours → retry, else `LeaseLost` |
//! | `checkpoint` | still ours | re-read: ours → retry, else `LeaseLost` |
//! | `release` | still ours | re-read: ours → retry, else skip |
//!
//! Renew and checkpoint of one partition take the same per-partition lock,
//! so they never race each other's version.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::ProcessorConfig;
use crate::constants::MAX_LEASE_UPDATE_ATTEMPTS;
use crate::error::{Error, Result};
use crate::metrics;
use crate::retry::with_store_policy;
use crate::store::LeaseStore;
use crate::types::{ContinuationToken, Lease, PartitionId};

const LEASE_POLICY: &str = "lease_store";

pub struct LeaseManager {
    store: Arc<dyn LeaseStore>,
    config: Arc<ProcessorConfig>,
    /// Leases this host owns, at the version it last wrote.
    owned: DashMap<PartitionId, Arc<Mutex<Lease>>>,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn LeaseStore>, config: Arc<ProcessorConfig>) -> Self {
        Self {
            store,
            config,
            owned: DashMap::new(),
        }
    }

    pub fn host_name(&self) -> &str {
        &self.config.host_name
    }

    fn next_expiry(&self) -> DateTime<Utc> {
        let ttl = ChronoDuration::from_std(self.config.lease_expiration_interval)
            .unwrap_or_else(|_| ChronoDuration::seconds(60));
        Utc::now() + ttl
    }

    fn is_ours(&self, lease: &Lease) -> bool {
        lease.owner.as_deref() == Some(self.host_name())
    }

    // ========================================================================
    // Local ownership view
    // ========================================================================

    pub fn owns(&self, partition: &PartitionId) -> bool {
        self.owned.contains_key(partition)
    }

    pub fn owned_partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> =
            self.owned.iter().map(|entry| entry.key().clone()).collect();
        partitions.sort();
        partitions
    }

    pub fn owned_count(&self) -> usize {
        self.owned.len()
    }

    /// Snapshot of an owned lease.
    pub async fn lease(&self, partition: &PartitionId) -> Option<Lease> {
        let entry = self.owned.get(partition).map(|e| e.value().clone())?;
        let lease = entry.lock().await.clone();
        Some(lease)
    }

    /// Last checkpointed token of an owned lease.
    pub async fn continuation(&self, partition: &PartitionId) -> Option<ContinuationToken> {
        self.lease(partition).await.map(|l| l.continuation)
    }

    /// Expiry of an owned lease as last written by this host.
    pub async fn local_expiry(&self, partition: &PartitionId) -> Option<DateTime<Utc>> {
        self.lease(partition).await.and_then(|l| l.expires_at)
    }

    /// Drop a partition from the local view without writing to the store.
    pub fn forget(&self, partition: &PartitionId) {
        if self.owned.remove(partition).is_some() {
            metrics::set_owned_partitions(self.owned.len());
            debug!(partition = %partition, "Forgot partition");
        }
    }

    // ========================================================================
    // Store operations
    // ========================================================================

    /// Try to take ownership of `lease`.
    ///
    /// `lease` is the version the caller last read. Returns the stored lease
    /// when acquired, `None` when it is owned by another live host or another
    /// host won the race.
    pub async fn acquire(&self, lease: &Lease) -> Result<Option<Lease>> {
        let partition = lease.partition_id.clone();
        let now = Utc::now();
        match lease.live_owner_at(now) {
            Some(owner) if owner != self.host_name() => {
                debug!(partition = %partition, owner, "Lease held by another host");
                return Ok(None);
            }
            _ => {}
        }

        let mut claim = lease.clone();
        claim.owner = Some(self.host_name().to_string());
        claim.expires_at = Some(self.next_expiry());

        match with_store_policy(LEASE_POLICY, || self.store.replace(&claim)).await {
            Ok(stored) => {
                info!(
                    partition = %partition,
                    owner = self.host_name(),
                    continuation = %stored.continuation,
                    previous_owner = lease.owner.as_deref().unwrap_or("<none>"),
                    "Acquired lease"
                );
                metrics::record_lease_operation("acquire", "success");
                self.owned
                    .insert(partition, Arc::new(Mutex::new(stored.clone())));
                metrics::set_owned_partitions(self.owned.len());
                Ok(Some(stored))
            }
            Err(e) if e.is_conflict() => {
                debug!(partition = %partition, "Lost acquire race");
                metrics::record_lease_operation("acquire", "conflict");
                Ok(None)
            }
            Err(e) => {
                metrics::record_lease_operation("acquire", "error");
                Err(e)
            }
        }
    }

    /// Extend the expiry of an owned lease.
    pub async fn renew(&self, partition: &PartitionId) -> Result<Lease> {
        self.update_owned(partition, "renew", |_| {}).await
    }

    /// Persist `token` as the new checkpoint of an owned lease.
    ///
    /// Also extends the expiry: a checkpoint proves the owner is alive.
    pub async fn checkpoint(&self, partition: &PartitionId, token: ContinuationToken) -> Result<Lease> {
        let result = self
            .update_owned(partition, "checkpoint", |lease| lease.continuation = token)
            .await;
        metrics::record_checkpoint(
            partition.as_str(),
            match &result {
                Ok(_) => "success",
                Err(e) if e.is_lease_lost() => "lost",
                Err(_) => "error",
            },
        );
        if result.is_ok() {
            debug!(partition = %partition, continuation = %token, "Checkpointed");
        }
        result
    }

    /// Conditional update of an owned lease, re-reading on version conflicts.
    async fn update_owned<F>(
        &self,
        partition: &PartitionId,
        operation: &'static str,
        apply: F,
    ) -> Result<Lease>
    where
        F: Fn(&mut Lease) + Send + Sync,
    {
        let entry = self
            .owned
            .get(partition)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::LeaseLost {
                partition: partition.clone(),
            })?;
        let mut cached = entry.lock().await;

        for _ in 0..MAX_LEASE_UPDATE_ATTEMPTS {
            let mut next = cached.clone();
            apply(&mut next);
            next.expires_at = Some(self.next_expiry());

            match with_store_policy(LEASE_POLICY, || self.store.replace(&next)).await {
                Ok(stored) => {
                    metrics::record_lease_operation(operation, "success");
                    *cached = stored.clone();
                    return Ok(stored);
                }
                Err(e) if e.is_conflict() => {
                    let key = cached.key();
                    let current = with_store_policy(LEASE_POLICY, || self.store.get(&key)).await?;
                    match current {
                        Some(current) if self.is_ours(&current) => {
                            // Written by something other than this manager, e.g. an
                            // expiry bump. Still ours, so retry on top of it.
                            debug!(partition = %partition, version = current.version, "Lease moved, retrying");
                            *cached = current;
                        }
                        current => {
                            drop(cached);
                            self.forget(partition);
                            metrics::record_lease_operation(operation, "lost");
                            warn!(
                                partition = %partition,
                                operation,
                                new_owner = current.as_ref().and_then(|l| l.owner.as_deref()).unwrap_or("<none>"),
                                "Lease lost"
                            );
                            return Err(Error::LeaseLost {
                                partition: partition.clone(),
                            });
                        }
                    }
                }
                Err(e) => {
                    metrics::record_lease_operation(operation, "error");
                    return Err(e);
                }
            }
        }

        Err(Error::Unavailable(format!(
            "lease for partition {} kept changing during {}",
            partition, operation
        )))
    }

    /// Clear ownership of a lease on graceful shutdown.
    ///
    /// A lease that was lost in the meantime is left alone.
    pub async fn release(&self, partition: &PartitionId) -> Result<()> {
        let Some((_, entry)) = self.owned.remove(partition) else {
            return Ok(());
        };
        metrics::set_owned_partitions(self.owned.len());
        let mut lease = entry.lock().await.clone();

        for _ in 0..MAX_LEASE_UPDATE_ATTEMPTS {
            let mut next = lease.clone();
            next.owner = None;
            next.expires_at = None;

            match with_store_policy(LEASE_POLICY, || self.store.replace(&next)).await {
                Ok(_) => {
                    info!(partition = %partition, continuation = %next.continuation, "Released lease");
                    metrics::record_lease_operation("release", "success");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    let key = lease.key();
                    match with_store_policy(LEASE_POLICY, || self.store.get(&key)).await? {
                        Some(current) if self.is_ours(&current) => lease = current,
                        _ => {
                            debug!(partition = %partition, "Lease already taken over, skipping release");
                            metrics::record_lease_operation("release", "lost");
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    metrics::record_lease_operation("release", "error");
                    return Err(e);
                }
            }
        }

        Err(Error::Unavailable(format!(
            "lease for partition {} kept changing during release",
            partition
        )))
    }

    /// Release every owned lease, logging failures.
    ///
    /// Returns the number of leases that could not be released.
    pub async fn release_all(&self) -> usize {
        let mut failures = 0;
        for partition in self.owned_partitions() {
            if let Err(e) = self.release(&partition).await {
                warn!(partition = %partition, error = %e, "Failed to release lease");
                failures += 1;
            }
        }
        failures
    }
}
