//! Tests for the metrics module.
//!
//! These tests verify that store activity shows up in the registry.
//!
//! Note: metrics are process-global and the test binary runs tests in
//! parallel. Counter assertions compare before/after values, and gauge
//! assertions run under `#[serial]`.

use std::sync::Arc;

use mqpersist::error::Status;
use mqpersist::persist::metrics;
use mqpersist::persist::{
    DestinationInfo, Message, Store, StoreConfig, StoreDatabase, StoreType, TakeoverLockRequest,
};
use mqpersist::types::DestinationId;
use serial_test::serial;

fn counter(vec: &prometheus::IntCounterVec, labels: &[&str]) -> u64 {
    vec.with_label_values(labels).get()
}

// ============================================================================
// Registry Tests
// ============================================================================

#[test]
fn test_init_metrics_idempotent() {
    metrics::init_metrics();
    metrics::init_metrics();
    assert!(!metrics::gather_metrics().is_empty());
}

#[test]
#[serial]
fn test_encoded_metrics_use_prefix() {
    metrics::init_metrics();
    metrics::record_journal_checkpoint();
    let text = metrics::encode_metrics().unwrap();
    assert!(text.contains("mqpersist_journal_checkpoints_total"));
    assert!(text.contains("mqpersist_in_flight_operations"));
}

// ============================================================================
// Store Operation Tests
// ============================================================================

#[test]
fn test_partition_calls_are_counted_by_status() {
    let store = Store::open(
        StoreConfig::for_broker("metrics-ops"),
        Arc::new(StoreDatabase::in_memory()),
    )
    .unwrap();
    let p = store.primary_partition().unwrap();
    let ok = counter(&metrics::STORE_OPERATIONS, &["store_destination", "ok"]);
    let conflict = counter(
        &metrics::STORE_OPERATIONS,
        &["store_destination", Status::Conflict.as_str()],
    );

    p.store_destination(DestinationInfo::queue("counted"), true)
        .unwrap();
    assert!(p
        .store_destination(DestinationInfo::queue("counted"), true)
        .is_err());

    assert!(counter(&metrics::STORE_OPERATIONS, &["store_destination", "ok"]) > ok);
    assert!(
        counter(
            &metrics::STORE_OPERATIONS,
            &["store_destination", Status::Conflict.as_str()]
        ) > conflict
    );
}

#[test]
fn test_contested_takeover_lock_is_counted() {
    let db = Arc::new(StoreDatabase::in_memory());
    let a = Store::open(StoreConfig::for_broker("metrics-a"), db.clone()).unwrap();
    let b = Store::open(StoreConfig::for_broker("metrics-b"), db.clone()).unwrap();
    let c = Store::open(StoreConfig::for_broker("metrics-c"), db).unwrap();
    let observed = b.broker_info(a.broker_id()).unwrap();

    let acquired = counter(&metrics::TAKEOVER_LOCK_ATTEMPTS, &["acquired"]);
    let contested = counter(&metrics::TAKEOVER_LOCK_ATTEMPTS, &["contested"]);

    b.get_takeover_lock(&TakeoverLockRequest::new(b.broker_id().clone(), &observed))
        .unwrap();
    assert!(c
        .get_takeover_lock(&TakeoverLockRequest::new(c.broker_id().clone(), &observed))
        .is_err());

    assert!(counter(&metrics::TAKEOVER_LOCK_ATTEMPTS, &["acquired"]) > acquired);
    assert!(counter(&metrics::TAKEOVER_LOCK_ATTEMPTS, &["contested"]) > contested);
}

#[test]
fn test_journal_appends_are_counted() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::for_broker("metrics-journal")
        .with_store_type(StoreType::File)
        .with_data_path(dir.path());
    let db = Arc::new(StoreDatabase::open(&config).unwrap());
    let store = Store::open(config, db).unwrap();
    let p = store.primary_partition().unwrap();
    p.store_destination(DestinationInfo::queue("journaled"), true)
        .unwrap();

    let appends = metrics::JOURNAL_APPENDS.get();
    let bytes = metrics::JOURNAL_BYTES.get();
    p.store_message(
        &DestinationId::queue("journaled"),
        Message::new("m1", "payload"),
        None,
        true,
    )
    .unwrap();

    assert!(metrics::JOURNAL_APPENDS.get() > appends);
    assert!(metrics::JOURNAL_BYTES.get() > bytes);
}

// ============================================================================
// Gauge Tests
// ============================================================================

#[test]
#[serial]
fn test_set_pending_notifications() {
    metrics::set_pending_notifications(3);
    assert_eq!(metrics::PENDING_NOTIFICATIONS.get(), 3);
    metrics::set_pending_notifications(0);
    assert_eq!(metrics::PENDING_NOTIFICATIONS.get(), 0);
}
