//! Partition discovery: reconcile feed partitions with lease records.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::ProcessorConfig;
use crate::error::Result;
use crate::retry::with_store_policy;
use crate::store::{FeedSource, LeaseStore};
use crate::types::{ContinuationToken, Lease, PartitionId, lease_key};

const DISCOVERY_POLICY: &str = "discovery";

pub struct PartitionDiscoverer {
    feed: Arc<dyn FeedSource>,
    leases: Arc<dyn LeaseStore>,
    config: Arc<ProcessorConfig>,
}

impl PartitionDiscoverer {
    pub fn new(
        feed: Arc<dyn FeedSource>,
        leases: Arc<dyn LeaseStore>,
        config: Arc<ProcessorConfig>,
    ) -> Self {
        Self {
            feed,
            leases,
            config,
        }
    }

    /// Enumerate feed partitions, create leases for new ones and return the
    /// current lease of every partition.
    ///
    /// A new lease starts at the beginning of its partition, or at its current
    /// end when `start_from_beginning` is off. Leases of partitions the feed
    /// no longer reports are kept in the store but not returned.
    pub async fn discover(&self) -> Result<Vec<Lease>> {
        let prefix = self.config.lease_prefix.as_str();
        let partitions =
            with_store_policy(DISCOVERY_POLICY, || self.feed.partitions()).await?;
        let existing = with_store_policy(DISCOVERY_POLICY, || self.leases.list(prefix)).await?;

        let known: HashSet<&PartitionId> = existing.iter().map(|l| &l.partition_id).collect();
        let live: HashSet<&PartitionId> = partitions.iter().collect();

        for stale in existing.iter().filter(|l| !live.contains(&l.partition_id)) {
            debug!(partition = %stale.partition_id, "Lease for partition no longer in feed");
        }

        let mut created = Vec::new();
        for partition in partitions.iter().filter(|p| !known.contains(p)) {
            created.push(self.create_lease(partition).await?);
        }

        let mut leases: Vec<Lease> = existing
            .into_iter()
            .filter(|l| live.contains(&l.partition_id))
            .chain(created)
            .collect();
        leases.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(leases)
    }

    /// Create the lease of a newly seen partition, or read the one a
    /// competing host created first.
    async fn create_lease(&self, partition: &PartitionId) -> Result<Lease> {
        let start = if self.config.start_from_beginning {
            ContinuationToken::BEGINNING
        } else {
            with_store_policy(DISCOVERY_POLICY, || self.feed.latest_token(partition)).await?
        };
        let lease = Lease::new(&self.config.lease_prefix, partition.clone(), start);

        if let Some(stored) =
            with_store_policy(DISCOVERY_POLICY, || self.leases.create(&lease)).await?
        {
            info!(partition = %partition, continuation = %start, "Created lease for new partition");
            return Ok(stored);
        }

        let key = lease_key(&self.config.lease_prefix, partition);
        with_store_policy(DISCOVERY_POLICY, || self.leases.get(&key))
            .await?
            .ok_or_else(|| crate::error::Error::NotFound(format!("lease {}", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    fn discoverer(store: &InMemoryStore, config: ProcessorConfig) -> PartitionDiscoverer {
        PartitionDiscoverer::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(config),
        )
    }

    #[tokio::test]
    async fn test_creates_one_lease_per_partition() {
        let store = InMemoryStore::new(4);
        let d = discoverer(&store, ProcessorConfig::default());

        let leases = d.discover().await.unwrap();
        assert_eq!(leases.len(), 4);
        assert!(leases.iter().all(|l| l.owner.is_none()));
        assert!(leases.iter().all(|l| l.continuation.is_beginning()));
        assert!(leases.iter().all(|l| l.lease_prefix == "reproducer"));

        // Second pass creates nothing new
        let again = d.discover().await.unwrap();
        assert_eq!(again, leases);
    }

    #[tokio::test]
    async fn test_new_partition_is_picked_up() {
        let store = InMemoryStore::new(1);
        let d = discoverer(&store, ProcessorConfig::default());
        assert_eq!(d.discover().await.unwrap().len(), 1);

        store.add_partition(PartitionId::from("1")).await;
        let leases = d.discover().await.unwrap();
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[1].partition_id, PartitionId::from("1"));
    }

    #[tokio::test]
    async fn test_start_from_now_uses_latest_token() {
        let store = InMemoryStore::new(1);
        for i in 0..5 {
            store
                .append_to(&PartitionId::from("0"), &i.to_string(), json!({}))
                .await
                .unwrap();
        }
        let d = discoverer(&store, ProcessorConfig::default().with_start_from_beginning(false));
        let leases = d.discover().await.unwrap();
        assert_eq!(leases[0].continuation, ContinuationToken::after(5));
    }

    #[tokio::test]
    async fn test_competing_discoverers_share_leases() {
        let store = InMemoryStore::new(2);
        let a = discoverer(&store, ProcessorConfig::default().with_host_name("a"));
        let b = discoverer(&store, ProcessorConfig::default().with_host_name("b"));

        let (la, lb) = tokio::join!(a.discover(), b.discover());
        assert_eq!(la.unwrap().len(), 2);
        assert_eq!(lb.unwrap().len(), 2);
        assert_eq!(store.list("reproducer").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_prefixes_are_independent() {
        let store = InMemoryStore::new(1);
        discoverer(&store, ProcessorConfig::default().with_lease_prefix("one"))
            .discover()
            .await
            .unwrap();
        discoverer(&store, ProcessorConfig::default().with_lease_prefix("two"))
            .discover()
            .await
            .unwrap();
        assert_eq!(store.list("one").await.unwrap().len(), 1);
        assert_eq!(store.list("two").await.unwrap().len(), 1);
    }
}
