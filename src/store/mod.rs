//! Store abstractions used by the processor.
//!
//! The processor never talks to a database directly. It reads changes through
//! [`FeedSource`] and keeps ownership records through [`LeaseStore`]. Seeding
//! tools write through [`FeedWriter`].
//!
//! # Available Implementations
//!
//! - [`InMemoryStore`]: everything in process memory, with change
//!   notifications and failure injection for tests.
//! - [`ObjectStoreBackend`]: database/container layout on top of an
//!   `object_store` backend (local filesystem or in-memory).
//!
//! # Conditional writes
//!
//! Every lease write is conditional. `create` only succeeds when no lease
//! exists for the key; `replace` only succeeds when the stored version equals
//! the version of the lease passed in. The store assigns the new version
//! (previous + 1) and returns the stored lease.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::{ChangeRecord, ContinuationToken, Lease, PartitionId};

pub mod memory;
pub mod object;

pub use memory::InMemoryStore;
pub use object::{ContainerProperties, ObjectStoreBackend, create_object_store};

/// Durable keyed store for lease records.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Cheap reachability check.
    async fn ping(&self) -> Result<()>;

    /// Get the current lease for `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Lease>>;

    /// List all leases created under `lease_prefix`.
    async fn list(&self, lease_prefix: &str) -> Result<Vec<Lease>>;

    /// Create a lease if none exists for its key.
    ///
    /// Returns `Ok(None)` when a lease already exists. The returned lease
    /// carries version 1.
    async fn create(&self, lease: &Lease) -> Result<Option<Lease>>;

    /// Replace the stored lease if its version still equals `lease.version`.
    ///
    /// # Errors
    /// - [`Error::VersionConflict`](crate::error::Error::VersionConflict) if
    ///   another writer got there first
    /// - [`Error::NotFound`](crate::error::Error::NotFound) if the lease was
    ///   deleted
    async fn replace(&self, lease: &Lease) -> Result<Lease>;
}

/// Source of per-partition change streams.
#[async_trait]
pub trait FeedSource: Send + Sync {
    /// Cheap reachability check.
    async fn ping(&self) -> Result<()>;

    /// Current set of partitions of the monitored container.
    async fn partitions(&self) -> Result<Vec<PartitionId>>;

    /// Up to `max_items` records after `after`, in ascending `lsn` order.
    async fn read(
        &self,
        partition: &PartitionId,
        after: ContinuationToken,
        max_items: usize,
    ) -> Result<Vec<ChangeRecord>>;

    /// Token positioned after the newest record of `partition`.
    async fn latest_token(&self, partition: &PartitionId) -> Result<ContinuationToken>;

    /// Suspend until `partition` may have records after `after`, or `timeout`
    /// elapses.
    ///
    /// Backends without change notifications just sleep; a spurious wakeup
    /// only costs one empty read.
    async fn wait_for_changes(
        &self,
        _partition: &PartitionId,
        _after: ContinuationToken,
        timeout: Duration,
    ) {
        tokio::time::sleep(timeout).await;
    }
}

/// Appends documents to the monitored container.
#[async_trait]
pub trait FeedWriter: Send + Sync {
    /// Append one document. Its partition is derived from the partition key.
    async fn append(&self, body: Value) -> Result<ChangeRecord>;
}

/// Extract the partition key value from `body` at a JSON pointer path like `/id`.
pub(crate) fn partition_key_of(body: &Value, partition_key_path: &str) -> Option<String> {
    match body.pointer(partition_key_path)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Stable partition index for a partition key value.
pub(crate) fn partition_index(key: &str, partition_count: u32) -> u32 {
    crc32fast::hash(key.as_bytes()) % partition_count.max(1)
}

/// Stable partition assignment among numbered partitions.
pub(crate) fn partition_for_key(key: &str, partition_count: u32) -> PartitionId {
    PartitionId::new(partition_index(key, partition_count).to_string())
}

/// Partition ids `0..count` as used by both backends.
pub(crate) fn numbered_partitions(count: u32) -> Vec<PartitionId> {
    (0..count).map(|i| PartitionId::new(i.to_string())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partition_key_of() {
        let body = json!({ "id": "COSMO-001-0001", "n": 7 });
        assert_eq!(
            partition_key_of(&body, "/id").as_deref(),
            Some("COSMO-001-0001")
        );
        assert_eq!(partition_key_of(&body, "/n").as_deref(), Some("7"));
        assert!(partition_key_of(&body, "/missing").is_none());
    }

    #[test]
    fn test_partition_for_key_is_stable_and_bounded() {
        for i in 0..100 {
            let key = format!("COSMO-001-{:04}", i);
            let p = partition_for_key(&key, 4);
            assert_eq!(p, partition_for_key(&key, 4));
            assert!(p.as_str().parse::<u32>().unwrap() < 4);
        }
        assert_eq!(partition_for_key("anything", 1), PartitionId::from("0"));
    }

    #[test]
    fn test_numbered_partitions() {
        let ids = numbered_partitions(3);
        assert_eq!(
            ids,
            vec![
                PartitionId::from("0"),
                PartitionId::from("1"),
                PartitionId::from("2")
            ]
        );
    }
}
