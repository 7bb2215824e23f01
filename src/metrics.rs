//! Prometheus metrics for the change feed processor.
//!
//! Metrics cover:
//! - Delivery (batches and records handed to the handler, handler failures)
//! - Checkpoints written per partition
//! - Lease operations by outcome and the number of owned partitions
//! - Retry attempts per policy
//! - Worker exits by reason
//!
//! All metrics live in a custom registry with the "changefeed" prefix so they
//! never collide with metrics of the embedding application. Registration
//! errors are logged and the metric keeps working unregistered.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder, opts,
};
use tracing::warn;

/// Custom Prometheus registry for processor metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("changefeed".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Delivery metrics
// =============================================================================

define_counter_vec!(
    BATCHES_DELIVERED,
    "batches_delivered_total",
    "Batches successfully handled",
    ["partition"]
);
define_counter_vec!(
    RECORDS_DELIVERED,
    "records_delivered_total",
    "Records successfully handled",
    ["partition"]
);
define_counter_vec!(
    HANDLER_FAILURES,
    "handler_failures_total",
    "Handler invocations that returned an error",
    ["partition"]
);
define_histogram_vec!(
    HANDLER_DURATION,
    "handler_duration_seconds",
    "Time spent in one handler invocation",
    ["status"],
    [0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
);

// =============================================================================
// Lease metrics
// =============================================================================

define_counter_vec!(
    CHECKPOINTS,
    "checkpoints_total",
    "Checkpoint writes by outcome",
    ["partition", "status"]
);
define_counter_vec!(
    LEASE_OPERATIONS,
    "lease_operations_total",
    "Lease operations by kind and outcome",
    ["operation", "status"]
);
define_gauge!(
    OWNED_PARTITIONS,
    "owned_partitions",
    "Partitions currently leased by this host"
);

// =============================================================================
// Retry and worker metrics
// =============================================================================

define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retry attempts by policy and outcome",
    ["policy", "outcome"]
);
define_counter_vec!(
    WORKER_EXITS,
    "worker_exits_total",
    "Partition worker exits by reason",
    ["reason"]
);

// ============================================================================
// Registration
// ============================================================================

/// Register `metric`, keeping it usable even if registration fails (e.g. a
/// duplicate name from a second registry user).
fn register_or_warn<M>(registry: &Registry, name: &str, metric: M) -> M
where
    M: prometheus::core::Collector + Clone + 'static,
{
    if let Err(e) = registry.register(Box::new(metric.clone())) {
        warn!(name, error = %e, "Metric not registered, recording into a detached instance");
    }
    metric
}

fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("static gauge definition");
    register_or_warn(registry, name, gauge)
}

fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter = IntCounterVec::new(opts!(name, help), labels).expect("static counter definition");
    register_or_warn(registry, name, counter)
}

fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let opts = HistogramOpts::new(name, help).buckets(buckets);
    let histogram = HistogramVec::new(opts, labels).expect("static histogram definition");
    register_or_warn(registry, name, histogram)
}

/// Force registration of every metric so they show up before first use.
///
/// Idempotent.
pub fn init_metrics() {
    let _ = &*BATCHES_DELIVERED;
    let _ = &*RECORDS_DELIVERED;
    let _ = &*HANDLER_FAILURES;
    let _ = &*HANDLER_DURATION;
    let _ = &*CHECKPOINTS;
    let _ = &*LEASE_OPERATIONS;
    let _ = &*OWNED_PARTITIONS;
    let _ = &*RETRY_ATTEMPTS;
    let _ = &*WORKER_EXITS;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Gather all metric families from the registry.
pub fn gather_metrics() -> Vec<prometheus::proto::MetricFamily> {
    REGISTRY.gather()
}

/// Record a batch the handler accepted.
pub fn record_delivery(partition: &str, records: usize, duration_secs: f64) {
    BATCHES_DELIVERED.with_label_values(&[partition]).inc();
    RECORDS_DELIVERED
        .with_label_values(&[partition])
        .inc_by(records as u64);
    HANDLER_DURATION
        .with_label_values(&["success"])
        .observe(duration_secs);
}

/// Record a handler invocation that returned an error.
pub fn record_handler_failure(partition: &str, duration_secs: f64) {
    HANDLER_FAILURES.with_label_values(&[partition]).inc();
    HANDLER_DURATION
        .with_label_values(&["error"])
        .observe(duration_secs);
}

pub fn record_checkpoint(partition: &str, status: &str) {
    CHECKPOINTS.with_label_values(&[partition, status]).inc();
}

/// Record a lease operation (`acquire`, `renew`, `checkpoint`, `release`)
/// with its outcome (`success`, `conflict`, `lost`, `error`).
pub fn record_lease_operation(operation: &str, status: &str) {
    LEASE_OPERATIONS.with_label_values(&[operation, status]).inc();
}

pub fn set_owned_partitions(count: usize) {
    OWNED_PARTITIONS.set(count as i64);
}

pub fn record_worker_exit(reason: &str) {
    WORKER_EXITS.with_label_values(&[reason]).inc();
}
