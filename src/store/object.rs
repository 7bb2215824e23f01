//! Database/container layout on top of an [`ObjectStore`].
//!
//! # Layout
//!
//! ```text
//! {database}/database.json
//! {database}/{container}/container.json
//! {database}/{events}/partitions/{partition}/{lsn:020}.json      one ChangeRecord each
//! {database}/{leases}/items/{prefix}/{partition}/{version:020}.json one Lease version each
//! ```
//!
//! Objects are never overwritten. Every write is a create-only put, so the
//! backend gets its compare-and-swap from `PutMode::Create`:
//!
//! - Appending a record claims the next lsn; losing the race means another
//!   writer took that lsn and the append moves on to the next one.
//! - Replacing a lease writes version `n + 1` after checking the latest
//!   version is `n`; two writers racing from `n` collide on the same object
//!   and exactly one wins. The winner re-reads the head afterwards, since a
//!   pruned version can be recreated by a writer that stalled long enough.
//!
//! The current lease is the highest version present. Version 1 is kept as a
//! creation marker; versions older than the previous one are pruned after
//! each successful replace.
//!
//! Reads list the partition directory and filter by lsn, so cost grows with
//! the partition size. Fine for the local filesystem and test workloads.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{FeedSource, FeedWriter, LeaseStore, numbered_partitions, partition_for_key, partition_key_of};
use crate::config::{ObjectStoreType, StoreConfig};
use crate::constants::SEQUENCE_KEY_WIDTH;
use crate::error::{Error, Result};
use crate::types::{ChangeRecord, ContinuationToken, Lease, PartitionId, lease_key};

/// Attempts to claim an lsn before an append gives up.
const MAX_APPEND_ATTEMPTS: usize = 16;

/// Concurrent object fetches per feed read.
const READ_CONCURRENCY: usize = 8;

/// Create an object store from configuration.
///
/// # Errors
///
/// Returns an error if the data directory cannot be created (local filesystem).
pub fn create_object_store(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>> {
    match &config.object_store {
        ObjectStoreType::Local { path } => {
            std::fs::create_dir_all(path)
                .map_err(|e| Error::Config(format!("Failed to create data directory: {}", e)))?;

            let store = LocalFileSystem::new_with_prefix(path)?;
            info!(path = %path, "Using local object store");
            Ok(Arc::new(store))
        }
        ObjectStoreType::Memory => {
            info!("Using in-memory object store");
            Ok(Arc::new(InMemory::new()))
        }
    }
}

/// Metadata document of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerProperties {
    pub id: String,
    pub partition_key_path: String,
    pub partition_count: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DatabaseProperties {
    id: String,
    created_at: DateTime<Utc>,
}

/// Feed, lease and admin operations over one database in an object store.
#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
    database: String,
    events_container: String,
    leases_container: String,
    partition_key_path: String,
    feed_partitions: u32,
    /// Next lsn to try per partition. A hint only; conflicts re-list.
    next_lsn: Arc<DashMap<PartitionId, u64>>,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>, config: &StoreConfig) -> Self {
        Self {
            store,
            database: config.database.clone(),
            events_container: config.events_container.clone(),
            leases_container: config.leases_container.clone(),
            partition_key_path: config.partition_key_path.clone(),
            feed_partitions: config.feed_partitions,
            next_lsn: Arc::new(DashMap::new()),
        }
    }

    /// Validate `config`, build the object store it describes and wrap it.
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        config.ensure_valid()?;
        let store = create_object_store(config)?;
        Ok(Self::new(store, config))
    }

    // ========================================================================
    // Admin operations
    // ========================================================================

    /// Create the database if it does not exist.
    ///
    /// Returns true if this call created it.
    pub async fn create_database_if_not_exists(&self) -> Result<bool> {
        let props = DatabaseProperties {
            id: self.database.clone(),
            created_at: Utc::now(),
        };
        let created = self
            .put_if_absent(&self.database_path(), serde_json::to_vec(&props)?)
            .await?;
        if created {
            info!(database = %self.database, "Created database");
        }
        Ok(created)
    }

    /// Create a container if it does not exist, returning its properties.
    ///
    /// The events container gets the configured number of feed partitions,
    /// any other container a single one. An existing container keeps its
    /// original properties.
    pub async fn create_container_if_not_exists(
        &self,
        name: &str,
        partition_key_path: &str,
    ) -> Result<ContainerProperties> {
        if !self.database_exists().await? {
            return Err(Error::NotFound(format!("database {}", self.database)));
        }

        let partition_count = if name == self.events_container {
            self.feed_partitions
        } else {
            1
        };
        let props = ContainerProperties {
            id: name.to_string(),
            partition_key_path: partition_key_path.to_string(),
            partition_count,
            created_at: Utc::now(),
        };

        let path = self.container_path(name);
        if self.put_if_absent(&path, serde_json::to_vec(&props)?).await? {
            info!(
                database = %self.database,
                container = name,
                partition_key_path,
                partition_count,
                "Created container"
            );
            return Ok(props);
        }

        let existing: ContainerProperties = self.get_json(&path).await?;
        debug!(container = name, "Container already exists");
        Ok(existing)
    }

    /// Create the database plus the events and leases containers.
    pub async fn ensure_containers(&self) -> Result<()> {
        self.create_database_if_not_exists().await?;
        let key_path = self.partition_key_path.clone();
        self.create_container_if_not_exists(&self.events_container.clone(), &key_path)
            .await?;
        self.create_container_if_not_exists(&self.leases_container.clone(), &key_path)
            .await?;
        Ok(())
    }

    pub async fn container_properties(&self, name: &str) -> Result<ContainerProperties> {
        self.get_json(&self.container_path(name)).await
    }

    async fn database_exists(&self) -> Result<bool> {
        match self.store.head(&self.database_path()).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // ========================================================================
    // Paths
    // ========================================================================

    fn database_path(&self) -> Path {
        Path::from(format!("{}/database.json", self.database))
    }

    fn container_path(&self, name: &str) -> Path {
        Path::from(format!("{}/{}/container.json", self.database, name))
    }

    fn partition_dir(&self, partition: &PartitionId) -> Path {
        Path::from(format!(
            "{}/{}/partitions/{}",
            self.database, self.events_container, partition
        ))
    }

    fn record_path(&self, partition: &PartitionId, lsn: u64) -> Path {
        Path::from(format!(
            "{}/{}/partitions/{}/{:0width$}.json",
            self.database,
            self.events_container,
            partition,
            lsn,
            width = SEQUENCE_KEY_WIDTH
        ))
    }

    fn lease_prefix_dir(&self, lease_prefix: &str) -> Path {
        Path::from(format!(
            "{}/{}/items/{}",
            self.database, self.leases_container, lease_prefix
        ))
    }

    fn lease_dir(&self, lease_prefix: &str, partition: &PartitionId) -> Path {
        Path::from(format!(
            "{}/{}/items/{}/{}",
            self.database, self.leases_container, lease_prefix, partition
        ))
    }

    fn lease_version_path(&self, lease_prefix: &str, partition: &PartitionId, version: u64) -> Path {
        Path::from(format!(
            "{}/{}/items/{}/{}/{:0width$}.json",
            self.database,
            self.leases_container,
            lease_prefix,
            partition,
            version,
            width = SEQUENCE_KEY_WIDTH
        ))
    }

    // ========================================================================
    // Object helpers
    // ========================================================================

    /// Create-only put. Returns false if the object already exists.
    async fn put_if_absent(&self, path: &Path, body: Vec<u8>) -> Result<bool> {
        let opts = PutOptions {
            mode: PutMode::Create,
            ..Default::default()
        };
        match self
            .store
            .put_opts(path, PutPayload::from(Bytes::from(body)), opts)
            .await
        {
            Ok(_) => Ok(true),
            Err(object_store::Error::AlreadyExists { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &Path) -> Result<T> {
        let bytes = match self.store.get(path).await {
            Ok(result) => result.bytes().await?,
            Err(object_store::Error::NotFound { .. }) => {
                return Err(Error::NotFound(path.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Sequence numbers of all `{seq:020}.json` objects directly under `dir`.
    async fn list_sequences(&self, dir: &Path) -> Result<Vec<u64>> {
        let listing = self.store.list_with_delimiter(Some(dir)).await?;
        let mut sequences: Vec<u64> = listing
            .objects
            .iter()
            .filter_map(|meta| parse_sequence(meta.location.filename()?))
            .collect();
        sequences.sort_unstable();
        Ok(sequences)
    }

    async fn last_lsn(&self, partition: &PartitionId) -> Result<u64> {
        Ok(self
            .list_sequences(&self.partition_dir(partition))
            .await?
            .last()
            .copied()
            .unwrap_or(0))
    }

    async fn feed_partition_count(&self) -> Result<u32> {
        let props = self.container_properties(&self.events_container).await?;
        Ok(props.partition_count)
    }

    /// Read the newest version of one lease.
    ///
    /// A concurrent prune can delete a listed version before it is fetched;
    /// re-listing finds the newer one.
    async fn latest_lease(&self, lease_prefix: &str, partition: &PartitionId) -> Result<Option<Lease>> {
        for _ in 0..3 {
            let versions = self.list_sequences(&self.lease_dir(lease_prefix, partition)).await?;
            let Some(&latest) = versions.last() else {
                return Ok(None);
            };
            match self
                .get_json::<Lease>(&self.lease_version_path(lease_prefix, partition, latest))
                .await
            {
                Ok(lease) => return Ok(Some(lease)),
                Err(Error::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::Unavailable(format!(
            "lease {} kept changing while being read",
            lease_key(lease_prefix, partition)
        )))
    }

    /// Delete lease versions strictly between the creation marker and `keep_from`.
    async fn prune_lease_versions(&self, lease_prefix: &str, partition: &PartitionId, keep_from: u64) {
        let versions = match self.list_sequences(&self.lease_dir(lease_prefix, partition)).await {
            Ok(v) => v,
            Err(e) => {
                debug!(partition = %partition, error = %e, "Skipping lease prune");
                return;
            }
        };
        for version in versions.into_iter().filter(|v| *v > 1 && *v < keep_from) {
            let path = self.lease_version_path(lease_prefix, partition, version);
            if let Err(e) = self.store.delete(&path).await {
                debug!(path = %path, error = %e, "Failed to prune lease version");
            }
        }
    }
}

/// Parse `00000000000000000042.json` into 42.
fn parse_sequence(filename: &str) -> Option<u64> {
    filename.strip_suffix(".json")?.parse().ok()
}

/// Split a lease key `{prefix}..{partition}` into its parts.
fn split_lease_key(key: &str) -> Result<(&str, PartitionId)> {
    key.split_once("..")
        .map(|(prefix, partition)| (prefix, PartitionId::new(partition)))
        .ok_or_else(|| Error::NotFound(format!("malformed lease key {}", key)))
}

#[async_trait]
impl LeaseStore for ObjectStoreBackend {
    async fn ping(&self) -> Result<()> {
        self.container_properties(&self.leases_container)
            .await
            .map(|_| ())
    }

    async fn get(&self, key: &str) -> Result<Option<Lease>> {
        let (prefix, partition) = split_lease_key(key)?;
        self.latest_lease(prefix, &partition).await
    }

    async fn list(&self, lease_prefix: &str) -> Result<Vec<Lease>> {
        let listing = self
            .store
            .list_with_delimiter(Some(&self.lease_prefix_dir(lease_prefix)))
            .await?;

        let mut leases = Vec::new();
        for dir in listing.common_prefixes {
            let Some(partition) = dir.filename() else {
                continue;
            };
            if let Some(lease) = self
                .latest_lease(lease_prefix, &PartitionId::new(partition))
                .await?
            {
                leases.push(lease);
            }
        }
        leases.sort_by(|a, b| a.partition_id.cmp(&b.partition_id));
        Ok(leases)
    }

    async fn create(&self, lease: &Lease) -> Result<Option<Lease>> {
        let dir = self.lease_dir(&lease.lease_prefix, &lease.partition_id);
        if !self.list_sequences(&dir).await?.is_empty() {
            return Ok(None);
        }

        let mut stored = lease.clone();
        stored.version = 1;
        stored.timestamp = Utc::now();
        let path = self.lease_version_path(&lease.lease_prefix, &lease.partition_id, 1);
        if self.put_if_absent(&path, serde_json::to_vec(&stored)?).await? {
            Ok(Some(stored))
        } else {
            Ok(None)
        }
    }

    async fn replace(&self, lease: &Lease) -> Result<Lease> {
        let key = lease.key();
        let current = self
            .latest_lease(&lease.lease_prefix, &lease.partition_id)
            .await?
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
        let path = self.lease_version_path(&lease.lease_prefix, &lease.partition_id, stored.version);
        if !self.put_if_absent(&path, serde_json::to_vec(&stored)?).await? {
            return Err(Error::VersionConflict {
                key,
                expected: lease.version,
            });
        }

        // A writer stalled between the read and the put can recreate a
        // version that was already written and pruned. Its object then sits
        // below the real head and must not count as a win.
        let head = self
            .latest_lease(&lease.lease_prefix, &lease.partition_id)
            .await?
            .map(|l| l.version);
        if head != Some(stored.version) {
            if head.is_some_and(|v| v > stored.version)
                && let Err(e) = self.store.delete(&path).await
            {
                warn!(path = %path, error = %e, "Failed to delete stale lease version");
            }
            debug!(key = %key, written = stored.version, head = ?head, "Lease write landed below head");
            return Err(Error::VersionConflict {
                key,
                expected: lease.version,
            });
        }

        self.prune_lease_versions(&lease.lease_prefix, &lease.partition_id, current.version)
            .await;
        Ok(stored)
    }
}

#[async_trait]
impl FeedSource for ObjectStoreBackend {
    async fn ping(&self) -> Result<()> {
        self.container_properties(&self.events_container)
            .await
            .map(|_| ())
    }

    async fn partitions(&self) -> Result<Vec<PartitionId>> {
        Ok(numbered_partitions(self.feed_partition_count().await?))
    }

    async fn read(
        &self,
        partition: &PartitionId,
        after: ContinuationToken,
        max_items: usize,
    ) -> Result<Vec<ChangeRecord>> {
        let lsns: Vec<u64> = self
            .list_sequences(&self.partition_dir(partition))
            .await?
            .into_iter()
            .filter(|lsn| *lsn > after.last_lsn())
            .take(max_items)
            .collect();

        futures::stream::iter(lsns)
            .map(|lsn| {
                let path = self.record_path(partition, lsn);
                async move { self.get_json::<ChangeRecord>(&path).await }
            })
            .buffered(READ_CONCURRENCY)
            .try_collect()
            .await
    }

    async fn latest_token(&self, partition: &PartitionId) -> Result<ContinuationToken> {
        Ok(ContinuationToken::after(self.last_lsn(partition).await?))
    }
}

#[async_trait]
impl FeedWriter for ObjectStoreBackend {
    async fn append(&self, body: Value) -> Result<ChangeRecord> {
        let id = partition_key_of(&body, &self.partition_key_path).ok_or_else(|| {
            Error::InvalidDocument(format!("missing partition key {}", self.partition_key_path))
        })?;
        let partition = partition_for_key(&id, self.feed_partition_count().await?);

        let mut lsn = match self.next_lsn.get(&partition) {
            Some(next) => *next,
            None => self.last_lsn(&partition).await? + 1,
        };

        for _ in 0..MAX_APPEND_ATTEMPTS {
            let record = ChangeRecord {
                lsn,
                id: id.clone(),
                body: body.clone(),
                timestamp: Utc::now(),
            };
            let path = self.record_path(&partition, lsn);
            if self.put_if_absent(&path, serde_json::to_vec(&record)?).await? {
                self.next_lsn.insert(partition.clone(), lsn + 1);
                return Ok(record);
            }
            // Another writer took this lsn
            lsn = self.last_lsn(&partition).await? + 1;
        }

        warn!(partition = %partition, "Gave up claiming a sequence number");
        Err(Error::Unavailable(format!(
            "could not claim a sequence number on partition {} after {} attempts",
            partition, MAX_APPEND_ATTEMPTS
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn memory_backend(partitions: u32) -> ObjectStoreBackend {
        let config = StoreConfig {
            object_store: ObjectStoreType::Memory,
            feed_partitions: partitions,
            ..Default::default()
        };
        ObjectStoreBackend::from_config(&config).unwrap()
    }

    // ========================================================================
    // Object Store Creation Tests
    // ========================================================================

    #[test]
    fn test_create_local_object_store_nested_dirs() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("a").join("b").join("data");
        let config = StoreConfig {
            object_store: ObjectStoreType::Local {
                path: path.to_string_lossy().to_string(),
            },
            ..Default::default()
        };
        assert!(create_object_store(&config).is_ok());
        assert!(path.exists());
    }

    #[test]
    fn test_parse_sequence() {
        assert_eq!(parse_sequence("00000000000000000042.json"), Some(42));
        assert_eq!(parse_sequence("container.json"), None);
        assert_eq!(parse_sequence("42.txt"), None);
    }

    // ========================================================================
    // Admin Tests
    // ========================================================================

    #[tokio::test]
    async fn test_create_if_not_exists_is_idempotent() {
        let backend = memory_backend(4);
        assert!(backend.create_database_if_not_exists().await.unwrap());
        assert!(!backend.create_database_if_not_exists().await.unwrap());

        let first = backend
            .create_container_if_not_exists("events", "/id")
            .await
            .unwrap();
        assert_eq!(first.partition_count, 4);
        let second = backend
            .create_container_if_not_exists("events", "/other")
            .await
            .unwrap();
        assert_eq!(second, first);

        let leases = backend
            .create_container_if_not_exists("leases", "/id")
            .await
            .unwrap();
        assert_eq!(leases.partition_count, 1);
    }

    #[tokio::test]
    async fn test_container_requires_database() {
        let backend = memory_backend(1);
        let err = backend
            .create_container_if_not_exists("events", "/id")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_ping_fails_before_containers_exist() {
        let backend = memory_backend(1);
        assert!(FeedSource::ping(&backend).await.is_err());
        backend.ensure_containers().await.unwrap();
        assert!(FeedSource::ping(&backend).await.is_ok());
        assert!(LeaseStore::ping(&backend).await.is_ok());
    }

    // ========================================================================
    // Feed Tests
    // ========================================================================

    #[tokio::test]
    async fn test_append_and_read_in_order() {
        let backend = memory_backend(1);
        backend.ensure_containers().await.unwrap();
        for i in 1..=10 {
            let record = backend
                .append(json!({ "id": format!("COSMO-001-{:04}", i) }))
                .await
                .unwrap();
            assert_eq!(record.lsn, i);
        }

        let partition = PartitionId::from("0");
        let first = backend
            .read(&partition, ContinuationToken::BEGINNING, 4)
            .await
            .unwrap();
        assert_eq!(first.iter().map(|r| r.lsn).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert_eq!(first[0].id, "COSMO-001-0001");

        let rest = backend
            .read(&partition, ContinuationToken::after(4), 100)
            .await
            .unwrap();
        assert_eq!(rest.len(), 6);
        assert_eq!(
            backend.latest_token(&partition).await.unwrap(),
            ContinuationToken::after(10)
        );
    }

    #[tokio::test]
    async fn test_concurrent_writers_never_share_an_lsn() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let config = StoreConfig {
            object_store: ObjectStoreType::Memory,
            feed_partitions: 1,
            ..Default::default()
        };
        let a = ObjectStoreBackend::new(store.clone(), &config);
        let b = ObjectStoreBackend::new(store, &config);
        a.ensure_containers().await.unwrap();

        for i in 0..5 {
            a.append(json!({ "id": format!("a-{}", i) })).await.unwrap();
            b.append(json!({ "id": format!("b-{}", i) })).await.unwrap();
        }

        let records = a
            .read(&PartitionId::from("0"), ContinuationToken::BEGINNING, 100)
            .await
            .unwrap();
        let lsns: Vec<u64> = records.iter().map(|r| r.lsn).collect();
        assert_eq!(lsns, (1..=10).collect::<Vec<_>>());
    }

    // ========================================================================
    // Lease Tests
    // ========================================================================

    #[tokio::test]
    async fn test_lease_create_replace_and_conflict() {
        let backend = memory_backend(1);
        backend.ensure_containers().await.unwrap();

        let lease = Lease::new("reproducer", PartitionId::from("0"), ContinuationToken::BEGINNING);
        let v1 = backend.create(&lease).await.unwrap().unwrap();
        assert_eq!(v1.version, 1);
        assert!(backend.create(&lease).await.unwrap().is_none());

        let mut owned = v1.clone();
        owned.owner = Some("local".to_string());
        let v2 = backend.replace(&owned).await.unwrap();
        assert_eq!(v2.version, 2);

        let err = backend.replace(&owned).await.unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));

        let current = backend.get(&lease.key()).await.unwrap().unwrap();
        assert_eq!(current, v2);
    }

    #[tokio::test]
    async fn test_lease_versions_are_pruned() {
        let backend = memory_backend(1);
        backend.ensure_containers().await.unwrap();
        let partition = PartitionId::from("0");

        let mut lease = backend
            .create(&Lease::new("p", partition.clone(), ContinuationToken::BEGINNING))
            .await
            .unwrap()
            .unwrap();
        for i in 1..=5 {
            lease.continuation = ContinuationToken::after(i);
            lease = backend.replace(&lease).await.unwrap();
        }
        assert_eq!(lease.version, 6);

        let versions = backend
            .list_sequences(&backend.lease_dir("p", &partition))
            .await
            .unwrap();
        assert_eq!(versions, vec![1, 5, 6]);
    }

    /// Object store that parks the first put of `gated` until released.
    #[derive(Debug)]
    struct GatedStore {
        inner: Arc<dyn ObjectStore>,
        gated: Path,
        tripped: std::sync::atomic::AtomicBool,
        arrived: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    impl std::fmt::Display for GatedStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "GatedStore({})", self.inner)
        }
    }

    #[async_trait]
    impl ObjectStore for GatedStore {
        async fn put_opts(
            &self,
            location: &Path,
            payload: PutPayload,
            opts: PutOptions,
        ) -> object_store::Result<object_store::PutResult> {
            if *location == self.gated
                && !self.tripped.swap(true, std::sync::atomic::Ordering::SeqCst)
            {
                self.arrived.notify_one();
                self.release.notified().await;
            }
            self.inner.put_opts(location, payload, opts).await
        }

        async fn put_multipart_opts(
            &self,
            location: &Path,
            opts: object_store::PutMultipartOpts,
        ) -> object_store::Result<Box<dyn object_store::MultipartUpload>> {
            self.inner.put_multipart_opts(location, opts).await
        }

        async fn get_opts(
            &self,
            location: &Path,
            options: object_store::GetOptions,
        ) -> object_store::Result<object_store::GetResult> {
            self.inner.get_opts(location, options).await
        }

        async fn delete(&self, location: &Path) -> object_store::Result<()> {
            self.inner.delete(location).await
        }

        fn list(
            &self,
            prefix: Option<&Path>,
        ) -> futures::stream::BoxStream<'_, object_store::Result<object_store::ObjectMeta>> {
            self.inner.list(prefix)
        }

        async fn list_with_delimiter(
            &self,
            prefix: Option<&Path>,
        ) -> object_store::Result<object_store::ListResult> {
            self.inner.list_with_delimiter(prefix).await
        }

        async fn copy(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.inner.copy(from, to).await
        }

        async fn copy_if_not_exists(&self, from: &Path, to: &Path) -> object_store::Result<()> {
            self.inner.copy_if_not_exists(from, to).await
        }
    }

    #[tokio::test]
    async fn test_stalled_replace_cannot_resurrect_pruned_version() {
        let config = StoreConfig {
            object_store: ObjectStoreType::Memory,
            feed_partitions: 1,
            ..Default::default()
        };
        let shared: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let a = ObjectStoreBackend::new(shared.clone(), &config);
        a.ensure_containers().await.unwrap();
        let partition = PartitionId::from("0");

        let v1 = a
            .create(&Lease::new("p", partition.clone(), ContinuationToken::BEGINNING))
            .await
            .unwrap()
            .unwrap();
        let mut owned = v1.clone();
        owned.owner = Some("a".to_string());
        let mut current = a.replace(&owned).await.unwrap();
        assert_eq!(current.version, 2);

        let gate = Arc::new(GatedStore {
            inner: shared.clone(),
            gated: a.lease_version_path("p", &partition, 3),
            tripped: std::sync::atomic::AtomicBool::new(false),
            arrived: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let b = ObjectStoreBackend::new(gate.clone(), &config);

        // b read version 2 and claims it, then stalls before writing version 3
        let mut claim = current.clone();
        claim.owner = Some("b".to_string());
        let stalled = tokio::spawn(async move { b.replace(&claim).await });
        gate.arrived.notified().await;

        // Meanwhile a keeps renewing; reaching version 5 prunes version 3
        for _ in 0..3 {
            current = a.replace(&current).await.unwrap();
        }
        assert_eq!(current.version, 5);
        assert!(
            !a.list_sequences(&a.lease_dir("p", &partition))
                .await
                .unwrap()
                .contains(&3)
        );

        gate.release.notify_one();
        let err = stalled.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));

        let head = a.get(&v1.key()).await.unwrap().unwrap();
        assert_eq!(head.owner.as_deref(), Some("a"));
        assert_eq!(head.version, 5);
        let versions = a
            .list_sequences(&a.lease_dir("p", &partition))
            .await
            .unwrap();
        assert!(!versions.contains(&3));
    }

    #[test]
    fn test_from_config_rejects_zero_partitions() {
        let config = StoreConfig {
            object_store: ObjectStoreType::Memory,
            feed_partitions: 0,
            ..Default::default()
        };
        let err = ObjectStoreBackend::from_config(&config).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_list_leases_by_prefix() {
        let backend = memory_backend(2);
        backend.ensure_containers().await.unwrap();
        for pid in ["0", "1"] {
            backend
                .create(&Lease::new("a", PartitionId::from(pid), ContinuationToken::BEGINNING))
                .await
                .unwrap();
        }
        backend
            .create(&Lease::new("b", PartitionId::from("0"), ContinuationToken::BEGINNING))
            .await
            .unwrap();

        let leases = backend.list("a").await.unwrap();
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].partition_id, PartitionId::from("0"));
        assert!(backend.list("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_local_backend_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig {
            object_store: ObjectStoreType::Local {
                path: temp_dir.path().to_string_lossy().to_string(),
            },
            feed_partitions: 1,
            ..Default::default()
        };

        {
            let backend = ObjectStoreBackend::from_config(&config).unwrap();
            backend.ensure_containers().await.unwrap();
            backend.append(json!({ "id": "x" })).await.unwrap();
        }

        let reopened = ObjectStoreBackend::from_config(&config).unwrap();
        let appended = reopened.append(json!({ "id": "y" })).await.unwrap();
        assert_eq!(appended.lsn, 2);
    }
}
