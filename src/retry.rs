//! Retry policies for store calls, startup probes and handler invocations.
//!
//! All policies use `backon` exponential backoff with jitter.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `store_policy` | 50ms | 2s | 5 | Feed reads and lease writes |
//! | `startup_policy` | 100ms | 2s | unbounded, cut by the startup timeout | Reachability probe |
//! | `handler_policy` | 100ms | 10s | configured | Redelivering a failed batch |
//!
//! # Example
//!
//! ```rust,no_run
//! use backon::Retryable;
//! use changefeed::retry;
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     (|| async { Ok::<_, std::io::Error>(()) })
//!         .retry(retry::store_policy())
//!         .when(|e| e.kind() == std::io::ErrorKind::TimedOut)
//!         .await?;
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::error::{Error, Result};

/// Policy for store reads and writes.
///
/// Short enough that a partition worker notices an outage within a few
/// seconds and reports `TransientReadFailure` to the supervisor.
pub fn store_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(5)
        .with_jitter()
}

/// Policy for the reachability probe in `start()`.
///
/// Keeps retrying; the caller bounds the total time with the startup timeout.
pub fn startup_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(2))
        .without_max_times()
        .with_jitter()
}

/// Policy for redelivering the same batch to a failing handler.
pub fn handler_policy(max_retries: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(10))
        .with_max_times(max_retries)
        .with_jitter()
}

/// Run a store operation under [`store_policy`], retrying only retriable errors.
pub async fn with_store_policy<F, Fut, T>(policy_name: &'static str, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    let result = operation
        .retry(store_policy())
        .when(|e: &Error| e.is_retriable())
        .notify(|e, delay| {
            attempt += 1;
            record_retry_attempt(policy_name, attempt);
            tracing::debug!(policy = policy_name, error = %e, ?delay, "Retrying store operation");
        })
        .await;

    match &result {
        Ok(_) if attempt > 0 => record_retry_success(policy_name),
        Err(e) if e.is_retriable() => record_retry_exhausted(policy_name),
        _ => {}
    }
    result
}

/// Record a retry attempt for metrics.
pub fn record_retry_attempt(policy_name: &str, attempt: u32) {
    crate::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "attempt"])
        .inc();

    tracing::debug!(policy = policy_name, attempt, "Retry attempt");
}

/// Record a retry exhaustion (all retries failed).
pub fn record_retry_exhausted(policy_name: &str) {
    crate::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "exhausted"])
        .inc();

    tracing::warn!(policy = policy_name, "Retry policy exhausted");
}

/// Record success after at least one retry.
pub fn record_retry_success(policy_name: &str) {
    crate::metrics::RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "success"])
        .inc();
}
