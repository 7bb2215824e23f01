//! In-memory store for tests and single-process demos.
//!
//! Implements [`LeaseStore`], [`FeedSource`] and [`FeedWriter`] over shared
//! maps. Clones share state, so two processors built from clones of one store
//! behave like two hosts talking to the same database.
//!
//! Besides the store traits it offers helpers that tests use to simulate
//! outages and host failures:
//!
//! - [`InMemoryStore::set_unreachable`]: every call fails with `Unavailable`
//! - [`InMemoryStore::fail_next_reads`]: the next `n` feed reads fail
//! - [`InMemoryStore::expire_lease`]: push a lease's expiry into the past
//!   without touching the owner
//! - [`InMemoryStore::force_lease`]: overwrite a lease as another host would

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::{RwLock, watch};

use super::{
    FeedSource, FeedWriter, LeaseStore, numbered_partitions, partition_index, partition_key_of,
};
use crate::constants::DEFAULT_PARTITION_KEY_PATH;
use crate::error::{Error, Result};
use crate::types::{ChangeRecord, ContinuationToken, Lease, PartitionId};

/// Change log of one partition.
#[derive(Debug)]
struct PartitionLog {
    records: Vec<ChangeRecord>,
    /// Latest lsn, watched by long-polling readers.
    latest: watch::Sender<u64>,
}

impl PartitionLog {
    fn new() -> Self {
        let (latest, _) = watch::channel(0);
        Self {
            records: Vec::new(),
            latest,
        }
    }

    fn last_lsn(&self) -> u64 {
        self.records.last().map(|r| r.lsn).unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct InMemoryStore {
    /// Lease key -> current lease
    leases: Arc<RwLock<HashMap<String, Lease>>>,
    /// Partition -> change log
    partitions: Arc<RwLock<BTreeMap<PartitionId, PartitionLog>>>,
    partition_key_path: Arc<str>,
    unreachable: Arc<AtomicBool>,
    failing_reads: Arc<AtomicU32>,
    lease_writes: Arc<AtomicU64>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(1)
    }
}

impl InMemoryStore {
    /// Create a store whose feed has partitions `0..partition_count`.
    pub fn new(partition_count: u32) -> Self {
        Self::with_partitions(numbered_partitions(partition_count))
    }

    /// Create a store with the given partition ids.
    pub fn with_partitions(partitions: impl IntoIterator<Item = PartitionId>) -> Self {
        let logs = partitions
            .into_iter()
            .map(|p| (p, PartitionLog::new()))
            .collect();
        Self {
            leases: Arc::new(RwLock::new(HashMap::new())),
            partitions: Arc::new(RwLock::new(logs)),
            partition_key_path: Arc::from(DEFAULT_PARTITION_KEY_PATH),
            unreachable: Arc::new(AtomicBool::new(false)),
            failing_reads: Arc::new(AtomicU32::new(0)),
            lease_writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Add a partition, as a split would. No-op if it exists.
    pub async fn add_partition(&self, partition: PartitionId) {
        self.partitions
            .write()
            .await
            .entry(partition)
            .or_insert_with(PartitionLog::new);
    }

    /// Append a record to a specific partition, bypassing key hashing.
    pub async fn append_to(&self, partition: &PartitionId, id: &str, body: Value) -> Result<ChangeRecord> {
        self.check_reachable()?;
        let mut partitions = self.partitions.write().await;
        let log = partitions
            .get_mut(partition)
            .ok_or_else(|| Error::NotFound(format!("partition {}", partition)))?;
        let record = ChangeRecord {
            lsn: log.last_lsn() + 1,
            id: id.to_string(),
            body,
            timestamp: Utc::now(),
        };
        log.records.push(record.clone());
        log.latest.send_replace(record.lsn);
        Ok(record)
    }

    /// Number of records stored in `partition`.
    pub async fn record_count(&self, partition: &PartitionId) -> usize {
        self.partitions
            .read()
            .await
            .get(partition)
            .map(|log| log.records.len())
            .unwrap_or(0)
    }

    /// Make every store call fail with `Unavailable` until reset.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail the next `count` feed reads with `Unavailable`.
    pub fn fail_next_reads(&self, count: u32) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    /// Total successful lease writes, for asserting that nothing was written.
    pub fn lease_write_count(&self) -> u64 {
        self.lease_writes.load(Ordering::SeqCst)
    }

    /// Move the expiry of one lease into the past, keeping its owner.
    ///
    /// Simulates a host that stopped renewing. The version is bumped as it
    /// would be for any write.
    pub async fn expire_lease(&self, key: &str) {
        let mut leases = self.leases.write().await;
        if let Some(lease) = leases.get_mut(key) {
            lease.expires_at = Some(Utc::now() - ChronoDuration::seconds(1));
            lease.version += 1;
            lease.timestamp = Utc::now();
        }
    }

    /// Overwrite a lease unconditionally, e.g. to simulate another host.
    pub async fn force_lease(&self, mut lease: Lease) {
        let mut leases = self.leases.write().await;
        lease.version = leases.get(&lease.key()).map(|l| l.version + 1).unwrap_or(1);
        lease.timestamp = Utc::now();
        leases.insert(lease.key(), lease);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable("in-memory store marked unreachable".to_string()));
        }
        Ok(())
    }

    fn take_read_failure(&self) -> bool {
        self.failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LeaseStore for InMemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn get(&self, key: &str) -> Result<Option<Lease>> {
        self.check_reachable()?;
        Ok(self.leases.read().await.get(key).cloned())
    }

    async fn list(&self, lease_prefix: &str) -> Result<Vec<Lease>> {
        self.check_reachable()?;
        let leases = self.leases.read().await;
        let mut found: Vec<Lease> = leases
            .values()
            .filter(|l| l.lease_prefix == lease_prefix)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(found)
    }

    async fn create(&self, lease: &Lease) -> Result<Option<Lease>> {
        self.check_reachable()?;
        let mut leases = self.leases.write().await;
        let key = lease.key();
        if leases.contains_key(&key) {
            return Ok(None);
        }
        let mut stored = lease.clone();
        stored.version = 1;
        stored.timestamp = Utc::now();
        leases.insert(key, stored.clone());
        self.lease_writes.fetch_add(1, Ordering::SeqCst);
        Ok(Some(stored))
    }

    async fn replace(&self, lease: &Lease) -> Result<Lease> {
        self.check_reachable()?;
        let mut leases = self.leases.write().await;
        let key = lease.key();
        let current = leases
            .get(&key)
            .ok_or_else(|| Error::NotFound(format!("lease {}", key)))?;
        if current.version != lease.version {
            return Err(Error::VersionConflict {
                key,
                expected: lease.version,
            });
        }
        let mut stored = lease.clone();
        stored.version = current.version + 1;
        stored.timestamp = Utc::now();
        leases.insert(key, stored.clone());
        self.lease_writes.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }
}

#[async_trait]
impl FeedSource for InMemoryStore {
    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn partitions(&self) -> Result<Vec<PartitionId>> {
        self.check_reachable()?;
        Ok(self.partitions.read().await.keys().cloned().collect())
    }

    async fn read(
        &self,
        partition: &PartitionId,
        after: ContinuationToken,
        max_items: usize,
    ) -> Result<Vec<ChangeRecord>> {
        self.check_reachable()?;
        if self.take_read_failure() {
            return Err(Error::Unavailable(format!(
                "injected read failure on partition {}",
                partition
            )));
        }
        let partitions = self.partitions.read().await;
        let log = partitions
            .get(partition)
            .ok_or_else(|| Error::NotFound(format!("partition {}", partition)))?;
        // lsn n lives at index n - 1
        let start = (after.last_lsn() as usize).min(log.records.len());
        Ok(log.records[start..]
            .iter()
            .take(max_items)
            .cloned()
            .collect())
    }

    async fn latest_token(&self, partition: &PartitionId) -> Result<ContinuationToken> {
        self.check_reachable()?;
        let partitions = self.partitions.read().await;
        let log = partitions
            .get(partition)
            .ok_or_else(|| Error::NotFound(format!("partition {}", partition)))?;
        Ok(ContinuationToken::after(log.last_lsn()))
    }

    async fn wait_for_changes(
        &self,
        partition: &PartitionId,
        after: ContinuationToken,
        timeout: Duration,
    ) {
        let receiver = self
            .partitions
            .read()
            .await
            .get(partition)
            .map(|log| log.latest.subscribe());

        match receiver {
            Some(mut rx) => {
                let _ = tokio::time::timeout(
                    timeout,
                    rx.wait_for(|lsn| *lsn > after.last_lsn()),
                )
                .await;
            }
            None => tokio::time::sleep(timeout).await,
        }
    }
}

#[async_trait]
impl FeedWriter for InMemoryStore {
    async fn append(&self, body: Value) -> Result<ChangeRecord> {
        let id = partition_key_of(&body, &self.partition_key_path).ok_or_else(|| {
            Error::InvalidDocument(format!("missing partition key {}", self.partition_key_path))
        })?;
        let partition = {
            let partitions = self.partitions.read().await;
            let ids: Vec<&PartitionId> = partitions.keys().collect();
            if ids.is_empty() {
                return Err(Error::NotFound("no partitions".to_string()));
            }
            ids[partition_index(&id, ids.len() as u32) as usize].clone()
        };
        self.append_to(&partition, &id, body).await
    }
}
