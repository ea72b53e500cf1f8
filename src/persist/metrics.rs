//! Prometheus metrics for the store.
//!
//! Metrics cover:
//! - Store operations (count per operation and status, in-flight operations)
//! - Shutdown drains (time spent waiting for in-flight operations)
//! - HA takeover (lock attempts, completed and failed takeovers)
//! - Partition migration (outcomes, pending arrival notifications)
//! - Change-record replay (applied, skipped, resets)
//! - Journal (appends, bytes, checkpoints)
//!
//! # Safety
//!
//! All metrics are registered to a custom registry with the "mqpersist" prefix
//! to avoid name collisions with other libraries using the default Prometheus
//! registry. Registration errors are logged and the metric keeps working
//! unregistered instead of panicking.

use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder, opts,
};
use tracing::warn;

use crate::error::Status;

/// Custom Prometheus registry for store metrics.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    Registry::new_custom(Some("mqpersist".to_string()), None).unwrap_or_else(|_| Registry::new())
});

// =============================================================================
// Metric Declaration Macros
// =============================================================================

/// Declare an IntGauge metric.
macro_rules! define_gauge {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntGauge> =
            Lazy::new(|| register_int_gauge_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare an IntCounterVec metric with labels.
macro_rules! define_counter_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounterVec> = Lazy::new(|| {
            register_int_counter_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+])
        });
    };
}

/// Declare an IntCounter metric (no labels).
macro_rules! define_counter {
    ($name:ident, $metric_name:expr, $help:expr) => {
        #[doc = $help]
        pub static $name: Lazy<IntCounter> =
            Lazy::new(|| register_int_counter_safe(&REGISTRY, $metric_name, $help));
    };
}

/// Declare a HistogramVec metric with labels and buckets.
macro_rules! define_histogram_vec {
    ($name:ident, $metric_name:expr, $help:expr, [$($label:expr),+ $(,)?], [$($bucket:expr),+ $(,)?]) => {
        #[doc = $help]
        pub static $name: Lazy<HistogramVec> = Lazy::new(|| {
            register_histogram_vec_safe(&REGISTRY, $metric_name, $help, &[$($label),+], vec![$($bucket),+])
        });
    };
}

// =============================================================================
// Store operation metrics
// =============================================================================

define_counter_vec!(
    STORE_OPERATIONS,
    "store_operations_total",
    "Store operations by operation and result status",
    ["operation", "status"]
);
define_gauge!(
    IN_FLIGHT_OPERATIONS,
    "in_flight_operations",
    "Operations currently registered with a drain guard"
);
define_histogram_vec!(
    DRAIN_WAIT,
    "drain_wait_seconds",
    "Time spent waiting for in-flight operations on close",
    ["scope"],
    [0.0001, 0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]
);
define_gauge!(
    LOADED_PARTITIONS,
    "loaded_partitions",
    "Partitions currently attached to a store"
);

// =============================================================================
// HA metrics
// =============================================================================

define_counter_vec!(
    TAKEOVER_LOCK_ATTEMPTS,
    "takeover_lock_attempts_total",
    "Takeover lock attempts by outcome",
    ["outcome"]
);
define_counter_vec!(
    TAKEOVERS,
    "takeovers_total",
    "Store takeovers by outcome",
    ["outcome"]
);
define_counter_vec!(
    PARTITION_MIGRATIONS,
    "partition_migrations_total",
    "Partition migrations by outcome",
    ["outcome"]
);
define_gauge!(
    PENDING_NOTIFICATIONS,
    "pending_notifications",
    "Cluster notifications waiting to be retried"
);
define_counter_vec!(
    RETRY_ATTEMPTS,
    "retry_attempts_total",
    "Retry attempts by policy and result",
    ["policy", "result"]
);

// =============================================================================
// Change log metrics
// =============================================================================

define_counter_vec!(
    CHANGE_RECORDS,
    "change_records_total",
    "Change records seen during replay by result",
    ["result"]
);

// =============================================================================
// Journal metrics
// =============================================================================

define_counter!(
    JOURNAL_APPENDS,
    "journal_appends_total",
    "Records appended to the journal"
);
define_counter!(
    JOURNAL_BYTES,
    "journal_bytes_total",
    "Bytes appended to the journal"
);
define_counter!(
    JOURNAL_CHECKPOINTS,
    "journal_checkpoints_total",
    "Journal checkpoints (snapshot and truncate)"
);

// =============================================================================
// Safe Registration Helpers
// =============================================================================

/// Register an IntGauge safely, returning the unregistered metric on error.
fn register_int_gauge_safe(registry: &Registry, name: &str, help: &str) -> IntGauge {
    let gauge = IntGauge::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(gauge.clone())) {
        Ok(()) => gauge,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntGauge metric, using unregistered fallback");
            gauge
        }
    }
}

/// Register an IntCounterVec safely, returning the unregistered metric on error.
fn register_int_counter_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> IntCounterVec {
    let counter =
        IntCounterVec::new(opts!(name, help), labels).expect("metric opts should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounterVec metric, using unregistered fallback");
            counter
        }
    }
}

/// Register an IntCounter safely, returning the unregistered metric on error.
fn register_int_counter_safe(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("metric name/help should be valid");
    match registry.register(Box::new(counter.clone())) {
        Ok(()) => counter,
        Err(e) => {
            warn!(name, error = %e, "Failed to register IntCounter metric, using unregistered fallback");
            counter
        }
    }
}

/// Register a HistogramVec safely, returning the unregistered metric on error.
fn register_histogram_vec_safe(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
    buckets: Vec<f64>,
) -> HistogramVec {
    let histogram = HistogramVec::new(HistogramOpts::new(name, help).buckets(buckets), labels)
        .expect("metric opts should be valid");
    match registry.register(Box::new(histogram.clone())) {
        Ok(()) => histogram,
        Err(e) => {
            warn!(name, error = %e, "Failed to register HistogramVec metric, using unregistered fallback");
            histogram
        }
    }
}

/// Force registration of every metric so they show up before first use.
///
/// Idempotent.
pub fn init_metrics() {
    let _ = &*STORE_OPERATIONS;
    let _ = &*IN_FLIGHT_OPERATIONS;
    let _ = &*DRAIN_WAIT;
    let _ = &*LOADED_PARTITIONS;
    let _ = &*TAKEOVER_LOCK_ATTEMPTS;
    let _ = &*TAKEOVERS;
    let _ = &*PARTITION_MIGRATIONS;
    let _ = &*PENDING_NOTIFICATIONS;
    let _ = &*RETRY_ATTEMPTS;
    let _ = &*CHANGE_RECORDS;
    let _ = &*JOURNAL_APPENDS;
    let _ = &*JOURNAL_BYTES;
    let _ = &*JOURNAL_CHECKPOINTS;
}

/// Encode all metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, Box<dyn std::error::Error>> {
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

/// Record the outcome of a store operation.
pub fn record_operation(operation: &str, status: Status) {
    STORE_OPERATIONS
        .with_label_values(&[operation, status.as_str()])
        .inc();
}

/// Record how long a close waited for in-flight operations.
pub fn record_drain_wait(scope: &str, duration_secs: f64) {
    DRAIN_WAIT.with_label_values(&[scope]).observe(duration_secs);
}

pub fn set_loaded_partitions(count: usize) {
    LOADED_PARTITIONS.set(count as i64);
}

/// Record a takeover lock attempt (`acquired`, `contested`, `forced`).
pub fn record_takeover_lock(outcome: &str) {
    TAKEOVER_LOCK_ATTEMPTS.with_label_values(&[outcome]).inc();
}

/// Record a store takeover (`completed`, `incomplete`).
pub fn record_takeover(outcome: &str) {
    TAKEOVERS.with_label_values(&[outcome]).inc();
}

/// Record a partition migration (`completed`, `notification_pending`, `failed`).
pub fn record_migration(outcome: &str) {
    PARTITION_MIGRATIONS.with_label_values(&[outcome]).inc();
}

pub fn set_pending_notifications(count: usize) {
    PENDING_NOTIFICATIONS.set(count as i64);
}

/// Record a change record seen during replay (`applied`, `skipped`, `reset`).
pub fn record_change_record(result: &str) {
    CHANGE_RECORDS.with_label_values(&[result]).inc();
}

pub fn record_journal_append(bytes: usize) {
    JOURNAL_APPENDS.inc();
    JOURNAL_BYTES.inc_by(bytes as u64);
}

pub fn record_journal_checkpoint() {
    JOURNAL_CHECKPOINTS.inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_record_helpers_do_not_panic() {
        record_operation("store_message", Status::Ok);
        record_operation("store_message", Status::Conflict);
        record_drain_wait("store", 0.001);
        record_takeover_lock("acquired");
        record_takeover("completed");
        record_migration("failed");
        record_change_record("skipped");
        record_journal_append(128);
        record_journal_checkpoint();
    }

    #[test]
    fn test_operation_counter_increments() {
        let before = STORE_OPERATIONS
            .with_label_values(&["metrics_test_op", "ok"])
            .get();
        record_operation("metrics_test_op", Status::Ok);
        let after = STORE_OPERATIONS
            .with_label_values(&["metrics_test_op", "ok"])
            .get();
        assert_eq!(after, before + 1);
    }

    #[test]
    #[serial]
    fn test_encode_contains_prefix() {
        init_metrics();
        record_takeover_lock("contested");
        let text = encode_metrics().unwrap();
        assert!(text.contains("mqpersist_takeover_lock_attempts_total"));
    }
}
