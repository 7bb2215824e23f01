//! Centralized defaults for the processor and the store layout.
//!
//! # Categories
//!
//! - **Processor Defaults**: polling, batch size, lease timing
//! - **Lifecycle Defaults**: startup, shutdown and restart timeouts
//! - **Store Defaults**: database, container and partition layout

// =============================================================================
// Processor Defaults
// =============================================================================

/// Host name recorded as lease owner when none is configured.
pub const DEFAULT_HOST_NAME: &str = "local";

/// Delay between feed polls when a partition has no new changes.
pub const DEFAULT_FEED_POLL_DELAY_MS: u64 = 2_000;

/// Maximum number of records delivered in one batch.
pub const DEFAULT_MAX_ITEM_COUNT: usize = 64;

/// Prefix that scopes the leases of one logical processor.
pub const DEFAULT_LEASE_PREFIX: &str = "reproducer";

/// How often owned leases are renewed.
///
/// Must be well below [`DEFAULT_LEASE_EXPIRATION_INTERVAL_SECS`] so that a
/// single missed renewal does not lose the lease.
pub const DEFAULT_LEASE_RENEW_INTERVAL_SECS: u64 = 17;

/// How long a lease stays valid without renewal.
pub const DEFAULT_LEASE_EXPIRATION_INTERVAL_SECS: u64 = 60;

/// How often partitions are rediscovered and free leases acquired.
pub const DEFAULT_LEASE_ACQUIRE_INTERVAL_SECS: u64 = 13;

/// Retries of a failing handler before the batch is reported as failed.
pub const DEFAULT_HANDLER_MAX_RETRIES: usize = 3;

// =============================================================================
// Lifecycle Defaults
// =============================================================================

/// Time allowed for the stores to answer during `start()`.
pub const DEFAULT_STARTUP_TIMEOUT_SECS: u64 = 30;

/// Time allowed for workers to drain during `stop()`.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Delay before restarting a worker after a transient read failure.
pub const DEFAULT_WORKER_RESTART_COOLDOWN_SECS: u64 = 5;

/// Conditional-write attempts for renew/checkpoint before giving up on a
/// lease that keeps changing under us.
pub const MAX_LEASE_UPDATE_ATTEMPTS: usize = 3;

// =============================================================================
// Store Defaults
// =============================================================================

/// Database holding the feed and lease containers.
pub const DEFAULT_DATABASE_NAME: &str = "change-feed-reproducer";

/// Container whose change feed is consumed.
pub const DEFAULT_EVENTS_CONTAINER: &str = "events";

/// Container holding lease records.
pub const DEFAULT_LEASES_CONTAINER: &str = "leases";

/// Partition key path of both containers.
pub const DEFAULT_PARTITION_KEY_PATH: &str = "/id";

/// Number of physical partitions of a new feed container.
pub const DEFAULT_FEED_PARTITIONS: u32 = 4;

/// Root directory of the local object store.
pub const DEFAULT_DATA_PATH: &str = "/tmp/changefeed-data";

/// Zero-padded width of sequence numbers in object keys, so that
/// lexicographic and numeric order agree.
pub const SEQUENCE_KEY_WIDTH: usize = 20;
