//! Processor and store configuration.
//!
//! Both configs have sensible defaults matching the reference reproducer
//! (2 s poll delay, 64 items per batch, lease prefix `reproducer`, reading
//! from the beginning of the feed), can be read from the environment with
//! `from_env()`, and are checked with `validate()` before use.
//!
//! ```rust
//! use std::time::Duration;
//! use changefeed::config::ProcessorConfig;
//!
//! let config = ProcessorConfig::default()
//!     .with_host_name("worker-1")
//!     .with_max_item_count(128)
//!     .with_poll_interval(Duration::from_millis(500));
//! assert!(config.validate().is_ok());
//! ```

use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_DATA_PATH, DEFAULT_DATABASE_NAME, DEFAULT_EVENTS_CONTAINER, DEFAULT_FEED_PARTITIONS,
    DEFAULT_FEED_POLL_DELAY_MS, DEFAULT_HANDLER_MAX_RETRIES, DEFAULT_HOST_NAME,
    DEFAULT_LEASE_ACQUIRE_INTERVAL_SECS, DEFAULT_LEASE_EXPIRATION_INTERVAL_SECS,
    DEFAULT_LEASE_PREFIX, DEFAULT_LEASE_RENEW_INTERVAL_SECS, DEFAULT_LEASES_CONTAINER,
    DEFAULT_MAX_ITEM_COUNT, DEFAULT_PARTITION_KEY_PATH, DEFAULT_SHUTDOWN_TIMEOUT_SECS,
    DEFAULT_STARTUP_TIMEOUT_SECS, DEFAULT_WORKER_RESTART_COOLDOWN_SECS,
};
use crate::error::{Error, Result};

/// Options of one change feed processor.
///
/// Immutable once the processor is built; the processor keeps it behind an
/// `Arc` and hands clones of that to every worker.
///
/// # Clock Synchronization
///
/// Lease expiry is compared against wall-clock time written by other hosts.
/// Hosts sharing a lease container should run NTP; drift close to
/// `lease_expiration_interval - lease_renew_interval` lets a slow clock see a
/// live lease as expired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorConfig {
    /// Name recorded as lease owner. Must be unique among competing hosts.
    pub host_name: String,

    /// How long a read waits for new changes before returning an empty batch.
    pub poll_interval: Duration,

    /// Upper bound on records per delivered batch.
    pub max_item_count: usize,

    /// Prefix scoping the leases of this logical processor.
    pub lease_prefix: String,

    /// Read new partitions from their first record. When false, a new lease
    /// starts at the current end of the partition.
    pub start_from_beginning: bool,

    /// How often owned leases are renewed.
    pub lease_renew_interval: Duration,

    /// How long a lease stays valid without renewal.
    pub lease_expiration_interval: Duration,

    /// How often partitions are rediscovered and free leases acquired.
    pub lease_acquire_interval: Duration,

    /// Retries of a failing handler for the same batch.
    pub handler_max_retries: usize,

    /// Delay before a worker that hit a transient read failure is restarted.
    pub worker_restart_cooldown: Duration,

    /// Upper bound on the worker drain during `stop()`.
    pub shutdown_timeout: Duration,

    /// Upper bound on the store reachability probe during `start()`.
    pub startup_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            host_name: DEFAULT_HOST_NAME.to_string(),
            poll_interval: Duration::from_millis(DEFAULT_FEED_POLL_DELAY_MS),
            max_item_count: DEFAULT_MAX_ITEM_COUNT,
            lease_prefix: DEFAULT_LEASE_PREFIX.to_string(),
            start_from_beginning: true,
            lease_renew_interval: Duration::from_secs(DEFAULT_LEASE_RENEW_INTERVAL_SECS),
            lease_expiration_interval: Duration::from_secs(DEFAULT_LEASE_EXPIRATION_INTERVAL_SECS),
            lease_acquire_interval: Duration::from_secs(DEFAULT_LEASE_ACQUIRE_INTERVAL_SECS),
            handler_max_retries: DEFAULT_HANDLER_MAX_RETRIES,
            worker_restart_cooldown: Duration::from_secs(DEFAULT_WORKER_RESTART_COOLDOWN_SECS),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            startup_timeout: Duration::from_secs(DEFAULT_STARTUP_TIMEOUT_SECS),
        }
    }
}

impl ProcessorConfig {
    pub fn with_host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = host_name.into();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_item_count(mut self, max_item_count: usize) -> Self {
        self.max_item_count = max_item_count;
        self
    }

    pub fn with_lease_prefix(mut self, lease_prefix: impl Into<String>) -> Self {
        self.lease_prefix = lease_prefix.into();
        self
    }

    pub fn with_start_from_beginning(mut self, start_from_beginning: bool) -> Self {
        self.start_from_beginning = start_from_beginning;
        self
    }

    pub fn with_lease_renew_interval(mut self, interval: Duration) -> Self {
        self.lease_renew_interval = interval;
        self
    }

    pub fn with_lease_expiration_interval(mut self, interval: Duration) -> Self {
        self.lease_expiration_interval = interval;
        self
    }

    pub fn with_lease_acquire_interval(mut self, interval: Duration) -> Self {
        self.lease_acquire_interval = interval;
        self
    }

    pub fn with_handler_max_retries(mut self, retries: usize) -> Self {
        self.handler_max_retries = retries;
        self
    }

    pub fn with_worker_restart_cooldown(mut self, cooldown: Duration) -> Self {
        self.worker_restart_cooldown = cooldown;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Validate the configuration for consistency.
    ///
    /// Returns every problem found, not just the first.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.host_name.trim().is_empty() {
            errors.push("host_name must not be empty".to_string());
        }

        if self.lease_prefix.trim().is_empty() {
            errors.push("lease_prefix must not be empty".to_string());
        }

        if self.lease_prefix.contains('/') || self.lease_prefix.contains("..") {
            errors.push(format!(
                "lease_prefix ({}) must not contain '/' or '..'",
                self.lease_prefix
            ));
        }

        if self.max_item_count == 0 {
            errors.push("max_item_count must be at least 1".to_string());
        }

        if self.poll_interval.is_zero() {
            errors.push("poll_interval must be greater than zero".to_string());
        }

        // Renewal must happen before the lease expires
        if self.lease_renew_interval >= self.lease_expiration_interval {
            errors.push(format!(
                "lease_renew_interval ({:?}) must be less than lease_expiration_interval ({:?})",
                self.lease_renew_interval, self.lease_expiration_interval
            ));
        }

        if self.lease_renew_interval.is_zero() {
            errors.push("lease_renew_interval must be greater than zero".to_string());
        }

        if self.lease_acquire_interval.is_zero() {
            errors.push("lease_acquire_interval must be greater than zero".to_string());
        }

        if self.startup_timeout.is_zero() {
            errors.push("startup_timeout must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate and fold all problems into one [`Error::Config`].
    pub fn ensure_valid(&self) -> Result<()> {
        self.validate()
            .map_err(|errors| Error::Config(errors.join("; ")))
    }

    /// Create configuration from environment variables.
    ///
    /// Environment variables (all optional):
    /// - `HOST_NAME`: lease owner name (default: local)
    /// - `FEED_POLL_DELAY_MS`: poll interval in milliseconds (default: 2000)
    /// - `MAX_ITEM_COUNT`: records per batch (default: 64)
    /// - `LEASE_PREFIX`: lease prefix (default: reproducer)
    /// - `START_FROM_BEGINNING`: "true" or "false" (default: true)
    /// - `LEASE_RENEW_INTERVAL_SECS` (default: 17)
    /// - `LEASE_EXPIRATION_INTERVAL_SECS` (default: 60)
    /// - `LEASE_ACQUIRE_INTERVAL_SECS` (default: 13)
    /// - `HANDLER_MAX_RETRIES` (default: 3)
    /// - `WORKER_RESTART_COOLDOWN_SECS` (default: 5)
    /// - `SHUTDOWN_TIMEOUT_SECS` (default: 30)
    /// - `STARTUP_TIMEOUT_SECS` (default: 30)
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        Ok(Self {
            host_name: std::env::var("HOST_NAME").unwrap_or(defaults.host_name),
            poll_interval: Duration::from_millis(env_parse(
                "FEED_POLL_DELAY_MS",
                DEFAULT_FEED_POLL_DELAY_MS,
            )?),
            max_item_count: env_parse("MAX_ITEM_COUNT", defaults.max_item_count)?,
            lease_prefix: std::env::var("LEASE_PREFIX").unwrap_or(defaults.lease_prefix),
            start_from_beginning: env_parse("START_FROM_BEGINNING", defaults.start_from_beginning)?,
            lease_renew_interval: Duration::from_secs(env_parse(
                "LEASE_RENEW_INTERVAL_SECS",
                DEFAULT_LEASE_RENEW_INTERVAL_SECS,
            )?),
            lease_expiration_interval: Duration::from_secs(env_parse(
                "LEASE_EXPIRATION_INTERVAL_SECS",
                DEFAULT_LEASE_EXPIRATION_INTERVAL_SECS,
            )?),
            lease_acquire_interval: Duration::from_secs(env_parse(
                "LEASE_ACQUIRE_INTERVAL_SECS",
                DEFAULT_LEASE_ACQUIRE_INTERVAL_SECS,
            )?),
            handler_max_retries: env_parse("HANDLER_MAX_RETRIES", defaults.handler_max_retries)?,
            worker_restart_cooldown: Duration::from_secs(env_parse(
                "WORKER_RESTART_COOLDOWN_SECS",
                DEFAULT_WORKER_RESTART_COOLDOWN_SECS,
            )?),
            shutdown_timeout: Duration::from_secs(env_parse(
                "SHUTDOWN_TIMEOUT_SECS",
                DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            )?),
            startup_timeout: Duration::from_secs(env_parse(
                "STARTUP_TIMEOUT_SECS",
                DEFAULT_STARTUP_TIMEOUT_SECS,
            )?),
        })
    }
}

/// Type of object store backing the feed and lease containers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectStoreType {
    /// Local filesystem storage rooted at `path`.
    Local { path: String },
    /// Process-local in-memory storage. Nothing survives the process.
    Memory,
}

impl Default for ObjectStoreType {
    fn default() -> Self {
        ObjectStoreType::Local {
            path: DEFAULT_DATA_PATH.to_string(),
        }
    }
}

/// Where the feed and lease containers live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub object_store: ObjectStoreType,

    /// Database holding both containers.
    pub database: String,

    /// Container whose change feed is consumed.
    pub events_container: String,

    /// Container holding lease records.
    pub leases_container: String,

    /// Partition key path of both containers.
    pub partition_key_path: String,

    /// Physical partitions of a newly created events container.
    /// Ignored when the container already exists.
    pub feed_partitions: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            object_store: ObjectStoreType::default(),
            database: DEFAULT_DATABASE_NAME.to_string(),
            events_container: DEFAULT_EVENTS_CONTAINER.to_string(),
            leases_container: DEFAULT_LEASES_CONTAINER.to_string(),
            partition_key_path: DEFAULT_PARTITION_KEY_PATH.to_string(),
            feed_partitions: DEFAULT_FEED_PARTITIONS,
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for (field, value) in [
            ("database", &self.database),
            ("events_container", &self.events_container),
            ("leases_container", &self.leases_container),
        ] {
            if value.trim().is_empty() {
                errors.push(format!("{} must not be empty", field));
            } else if value.contains('/') {
                errors.push(format!("{} ({}) must not contain '/'", field, value));
            }
        }

        if self.events_container == self.leases_container {
            errors.push(format!(
                "events_container and leases_container must differ (both {})",
                self.events_container
            ));
        }

        if !self.partition_key_path.starts_with('/') {
            errors.push(format!(
                "partition_key_path ({}) must start with '/'",
                self.partition_key_path
            ));
        }

        if self.feed_partitions == 0 {
            errors.push("feed_partitions must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn ensure_valid(&self) -> Result<()> {
        self.validate()
            .map_err(|errors| Error::Config(errors.join("; ")))
    }

    /// Create configuration from environment variables.
    ///
    /// - `OBJECT_STORE_TYPE`: "local" or "memory" (default: local)
    /// - `DATA_PATH`: root directory for the local store (default: /tmp/changefeed-data)
    /// - `DATABASE_NAME` (default: change-feed-reproducer)
    /// - `EVENTS_CONTAINER` (default: events)
    /// - `LEASES_CONTAINER` (default: leases)
    /// - `FEED_PARTITIONS` (default: 4)
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let object_store = match std::env::var("OBJECT_STORE_TYPE")
            .unwrap_or_else(|_| "local".to_string())
            .to_lowercase()
            .as_str()
        {
            "local" => ObjectStoreType::Local {
                path: std::env::var("DATA_PATH").unwrap_or_else(|_| DEFAULT_DATA_PATH.to_string()),
            },
            "memory" => ObjectStoreType::Memory,
            other => {
                return Err(Error::Config(format!(
                    "Unknown OBJECT_STORE_TYPE '{}'. Valid types: local, memory",
                    other
                )));
            }
        };

        let config = Self {
            object_store,
            database: std::env::var("DATABASE_NAME").unwrap_or(defaults.database),
            events_container: std::env::var("EVENTS_CONTAINER").unwrap_or(defaults.events_container),
            leases_container: std::env::var("LEASES_CONTAINER").unwrap_or(defaults.leases_container),
            partition_key_path: defaults.partition_key_path,
            feed_partitions: env_parse("FEED_PARTITIONS", defaults.feed_partitions)?,
        };
        config.ensure_valid()?;
        Ok(config)
    }
}

/// Parse an optional environment variable, falling back to `default` when unset.
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("Invalid {}: {}", key, e))),
        Err(_) => Ok(default),
    }
}
