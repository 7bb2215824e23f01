//! Integration tests for `ProcessorConfig::from_env()` and
//! `StoreConfig::from_env()`.

use std::env;
use std::sync::Mutex;
use std::time::Duration;

use changefeed::config::{ObjectStoreType, ProcessorConfig, StoreConfig};
use changefeed::error::Error;
use changefeed::telemetry::LogFormat;
use serial_test::serial;

/// Environment variables are process-global; serialize every test that
/// touches them.
static ENV_MUTEX: Mutex<()> = Mutex::new(());

const ALL_CONFIG_ENV_VARS: &[&str] = &[
    "HOST_NAME",
    "FEED_POLL_DELAY_MS",
    "MAX_ITEM_COUNT",
    "LEASE_PREFIX",
    "START_FROM_BEGINNING",
    "LEASE_RENEW_INTERVAL_SECS",
    "LEASE_EXPIRATION_INTERVAL_SECS",
    "LEASE_ACQUIRE_INTERVAL_SECS",
    "HANDLER_MAX_RETRIES",
    "WORKER_RESTART_COOLDOWN_SECS",
    "SHUTDOWN_TIMEOUT_SECS",
    "STARTUP_TIMEOUT_SECS",
    "OBJECT_STORE_TYPE",
    "DATA_PATH",
    "DATABASE_NAME",
    "EVENTS_CONTAINER",
    "LEASES_CONTAINER",
    "FEED_PARTITIONS",
    "LOG_FORMAT",
];

/// Run `f` with exactly `vars` set among the config variables, restoring
/// the previous environment afterwards.
fn with_env_vars<F, R>(vars: &[(&str, &str)], f: F) -> R
where
    F: FnOnce() -> R,
{
    let _guard = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());

    let originals: Vec<_> = ALL_CONFIG_ENV_VARS
        .iter()
        .map(|k| (*k, env::var(*k).ok()))
        .collect();

    for key in ALL_CONFIG_ENV_VARS {
        unsafe { env::remove_var(key) };
    }
    for (key, value) in vars {
        unsafe { env::set_var(key, value) };
    }

    let result = f();

    for (key, original) in originals {
        match original {
            Some(v) => unsafe { env::set_var(key, v) },
            None => unsafe { env::remove_var(key) },
        }
    }

    result
}

// ============================================================================
// ProcessorConfig
// ============================================================================

#[test]
#[serial]
fn test_processor_defaults_without_env() {
    with_env_vars(&[], || {
        let config = ProcessorConfig::from_env().expect("defaults should parse");
        assert_eq!(config, ProcessorConfig::default());
        assert_eq!(config.host_name, "local");
        assert_eq!(config.poll_interval, Duration::from_millis(2000));
        assert_eq!(config.max_item_count, 64);
        assert_eq!(config.lease_prefix, "reproducer");
        assert!(config.start_from_beginning);
    });
}

#[test]
#[serial]
fn test_processor_overrides() {
    with_env_vars(
        &[
            ("HOST_NAME", "host-b"),
            ("FEED_POLL_DELAY_MS", "250"),
            ("MAX_ITEM_COUNT", "10"),
            ("LEASE_PREFIX", "orders"),
            ("START_FROM_BEGINNING", "false"),
            ("LEASE_RENEW_INTERVAL_SECS", "5"),
            ("LEASE_EXPIRATION_INTERVAL_SECS", "20"),
            ("LEASE_ACQUIRE_INTERVAL_SECS", "4"),
            ("HANDLER_MAX_RETRIES", "7"),
        ],
        || {
            let config = ProcessorConfig::from_env().expect("should parse");
            assert_eq!(config.host_name, "host-b");
            assert_eq!(config.poll_interval, Duration::from_millis(250));
            assert_eq!(config.max_item_count, 10);
            assert_eq!(config.lease_prefix, "orders");
            assert!(!config.start_from_beginning);
            assert_eq!(config.lease_renew_interval, Duration::from_secs(5));
            assert_eq!(config.lease_expiration_interval, Duration::from_secs(20));
            assert_eq!(config.lease_acquire_interval, Duration::from_secs(4));
            assert_eq!(config.handler_max_retries, 7);
            assert!(config.validate().is_ok());
        },
    );
}

#[test]
#[serial]
fn test_processor_rejects_unparsable_number() {
    with_env_vars(&[("MAX_ITEM_COUNT", "lots")], || {
        let err = ProcessorConfig::from_env().unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("MAX_ITEM_COUNT")));
    });
}

#[test]
#[serial]
fn test_processor_rejects_unparsable_bool() {
    with_env_vars(&[("START_FROM_BEGINNING", "maybe")], || {
        assert!(matches!(
            ProcessorConfig::from_env(),
            Err(Error::Config(_))
        ));
    });
}

#[test]
#[serial]
fn test_inconsistent_env_parses_but_fails_validation() {
    with_env_vars(
        &[
            ("LEASE_RENEW_INTERVAL_SECS", "60"),
            ("LEASE_EXPIRATION_INTERVAL_SECS", "30"),
        ],
        || {
            let config = ProcessorConfig::from_env().expect("should parse");
            let errors = config.validate().unwrap_err();
            assert_eq!(errors.len(), 1);
            assert!(errors[0].contains("lease_renew_interval"));
        },
    );
}

// ============================================================================
// StoreConfig
// ============================================================================

#[test]
#[serial]
fn test_store_defaults_without_env() {
    with_env_vars(&[], || {
        let config = StoreConfig::from_env().expect("defaults should parse");
        assert_eq!(config, StoreConfig::default());
        assert_eq!(config.database, "change-feed-reproducer");
        assert_eq!(config.events_container, "events");
        assert_eq!(config.leases_container, "leases");
        assert_eq!(config.partition_key_path, "/id");
    });
}

#[test]
#[serial]
fn test_store_local_path_and_names() {
    with_env_vars(
        &[
            ("OBJECT_STORE_TYPE", "LOCAL"),
            ("DATA_PATH", "/var/lib/changefeed"),
            ("DATABASE_NAME", "shop"),
            ("EVENTS_CONTAINER", "orders"),
            ("LEASES_CONTAINER", "orders-leases"),
            ("FEED_PARTITIONS", "8"),
        ],
        || {
            let config = StoreConfig::from_env().expect("should parse");
            assert_eq!(
                config.object_store,
                ObjectStoreType::Local {
                    path: "/var/lib/changefeed".to_string()
                }
            );
            assert_eq!(config.database, "shop");
            assert_eq!(config.events_container, "orders");
            assert_eq!(config.leases_container, "orders-leases");
            assert_eq!(config.feed_partitions, 8);
        },
    );
}

#[test]
#[serial]
fn test_store_memory_type() {
    with_env_vars(&[("OBJECT_STORE_TYPE", "memory")], || {
        let config = StoreConfig::from_env().expect("should parse");
        assert_eq!(config.object_store, ObjectStoreType::Memory);
    });
}

#[test]
#[serial]
fn test_store_unknown_type_is_rejected() {
    with_env_vars(&[("OBJECT_STORE_TYPE", "s3")], || {
        let err = StoreConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("OBJECT_STORE_TYPE"));
    });
}

#[test]
#[serial]
fn test_store_zero_partitions_is_rejected() {
    with_env_vars(&[("FEED_PARTITIONS", "0")], || {
        let err = StoreConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("feed_partitions"));
    });
}

// ============================================================================
// Logging
// ============================================================================

#[test]
#[serial]
fn test_log_format_from_env() {
    with_env_vars(&[("LOG_FORMAT", "json")], || {
        assert_eq!(LogFormat::from_env(), LogFormat::Json);
    });
    with_env_vars(&[], || {
        assert_eq!(LogFormat::from_env(), LogFormat::Pretty);
    });
}
