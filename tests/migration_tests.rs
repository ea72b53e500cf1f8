//! Integration tests for partition migration and cluster notifications.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mqpersist::error::{ErrorKind, StoreError, StoreResult};
use mqpersist::persist::{
    ClusterNotifier, DestinationInfo, Message, MigrationOutcome, NotificationKind,
    PartitionListener, Store, StoreConfig, StoreDatabase,
};
use mqpersist::types::{BrokerId, DestinationId, MessageId, PartitionId};

fn open(db: &Arc<StoreDatabase>, broker: &str) -> Store {
    Store::open(
        StoreConfig::for_broker(broker).with_partitions(true),
        db.clone(),
    )
    .unwrap()
}

/// Create and attach a secondary partition on `store` holding one message.
fn secondary_partition(store: &Store) -> PartitionId {
    let session = store.create_store_session(store.broker_id(), false).unwrap();
    let id = PartitionId::from(session.id);
    assert_eq!(store.partition_arrived(Some(id)).unwrap(), vec![id]);

    let p = store.store_partition(id).unwrap();
    p.store_destination(DestinationInfo::queue("orders"), true)
        .unwrap();
    p.store_message(
        &DestinationId::queue("orders"),
        Message::new("m1", "payload"),
        None,
        true,
    )
    .unwrap();
    id
}

/// Notifier that fails while `down` is set and counts deliveries.
#[derive(Default)]
struct TestNotifier {
    down: AtomicBool,
    flaky_failures: AtomicUsize,
    delivered: Mutex<Vec<String>>,
}

impl TestNotifier {
    fn check(&self) -> StoreResult<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::NotAllowed("transport down".to_string()));
        }
        if self.flaky_failures.load(Ordering::SeqCst) > 0 {
            self.flaky_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("transport busy".to_string()));
        }
        Ok(())
    }
}

impl ClusterNotifier for TestNotifier {
    fn notify_partition_arrival(&self, target: &BrokerId, partition: PartitionId) -> StoreResult<()> {
        self.check()?;
        self.delivered
            .lock()
            .unwrap()
            .push(format!("arrival {} {}", partition, target));
        Ok(())
    }

    fn notify_takeover_complete(&self, taken_over: &BrokerId, by: &BrokerId) -> StoreResult<()> {
        self.check()?;
        self.delivered
            .lock()
            .unwrap()
            .push(format!("takeover {} {}", taken_over, by));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingListener {
    events: Mutex<Vec<String>>,
}

impl PartitionListener for RecordingListener {
    fn partition_added(&self, partition: PartitionId) {
        self.events.lock().unwrap().push(format!("+{}", partition));
    }

    fn partition_removed(&self, partition: PartitionId) {
        self.events.lock().unwrap().push(format!("-{}", partition));
    }
}

// ============================================================================
// Preconditions
// ============================================================================

#[test]
fn test_primary_partition_never_migrates() {
    let db = Arc::new(StoreDatabase::in_memory());
    let a = open(&db, "a");
    let _b = open(&db, "b");
    let primary = a.primary_partition().unwrap().partition_id();

    let err = a.migrate_partition(primary, &BrokerId::new("b")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    assert!(a.store_partition(primary).is_ok());
}

#[test]
fn test_migration_requires_migratable_partitions() {
    let db = Arc::new(StoreDatabase::in_memory());
    let config = StoreConfig::for_broker("a").with_partitions(false);
    let a = Store::open(config, db.clone()).unwrap();
    let _b = open(&db, "b");
    let id = secondary_partition(&a);

    let err = a.migrate_partition(id, &BrokerId::new("b")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
}

#[test]
fn test_migration_target_checks() {
    let db = Arc::new(StoreDatabase::in_memory());
    let a = open(&db, "a");
    let id = secondary_partition(&a);

    let err = a.migrate_partition(id, &BrokerId::new("a")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);

    let err = a.migrate_partition(id, &BrokerId::new("ghost")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let err = a
        .migrate_partition(PartitionId::new(9_999), &BrokerId::new("a"))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadRequest);
    // Still served locally.
    assert!(a.store_partition(id).is_ok());
}

// ============================================================================
// Migration
// ============================================================================

#[test]
fn test_partition_migrates_to_target() {
    let db = Arc::new(StoreDatabase::in_memory());
    let a = open(&db, "a");
    let b = open(&db, "b");
    let id = secondary_partition(&a);
    let old_handle = a.store_partition(id).unwrap();

    let outcome = a.migrate_partition(id, &BrokerId::new("b")).unwrap();
    assert_eq!(outcome, MigrationOutcome::Completed);

    // Source side: gone from the directory, handle unusable, arrival pending.
    assert!(a.store_partition(id).is_err());
    assert!(!a.partition_ids().contains(&id));
    assert!(old_handle.is_closed());
    assert!(
        old_handle
            .store_message(
                &DestinationId::queue("orders"),
                Message::new("late", "x"),
                None,
                true,
            )
            .is_err()
    );
    assert_eq!(
        db.arrival(id).map(|r| r.to),
        Some(BrokerId::new("b"))
    );
    assert_eq!(b.store_session_owner(id.session()).unwrap(), BrokerId::new("b"));

    // The source can no longer claim it.
    let err = a.partition_arrived(Some(id)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAllowed);

    // Target side.
    assert_eq!(b.partition_arrived(Some(id)).unwrap(), vec![id]);
    assert!(db.arrival(id).is_none());
    let moved = b.store_partition(id).unwrap();
    assert!(!moved.is_primary());
    assert!(moved
        .has_message(&DestinationId::queue("orders"), &MessageId::new("m1"))
        .unwrap());

    // A second arrival is a no-op.
    assert!(b.partition_arrived(Some(id)).unwrap().is_empty());
}

#[test]
fn test_partition_arrived_without_id_loads_all_owned() {
    let db = Arc::new(StoreDatabase::in_memory());
    let a = open(&db, "a");
    let b = open(&db, "b");
    let first = secondary_partition(&a);
    let second = {
        let session = a.create_store_session(&BrokerId::new("a"), false).unwrap();
        PartitionId::from(session.id)
    };
    a.partition_arrived(Some(second)).unwrap();

    a.migrate_partition(first, &BrokerId::new("b")).unwrap();
    a.migrate_partition(second, &BrokerId::new("b")).unwrap();

    let mut arrived = b.partition_arrived(None).unwrap();
    arrived.sort();
    assert_eq!(arrived, vec![first, second]);
}

#[test]
fn test_unknown_partition_arrival_not_found() {
    let db = Arc::new(StoreDatabase::in_memory());
    let a = open(&db, "a");
    let err = a.partition_arrived(Some(PartitionId::new(4_242))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_listener_sees_partition_changes() {
    let db = Arc::new(StoreDatabase::in_memory());
    let a = open(&db, "a");
    let _b = open(&db, "b");
    let listener = Arc::new(RecordingListener::default());
    a.add_listener(listener.clone());

    let id = secondary_partition(&a);
    a.migrate_partition(id, &BrokerId::new("b")).unwrap();

    assert_eq!(
        *listener.events.lock().unwrap(),
        vec![format!("+{}", id), format!("-{}", id)]
    );
}

// ============================================================================
// Notifications
// ============================================================================

#[test]
fn test_transient_notification_failure_is_retried() {
    let db = Arc::new(StoreDatabase::in_memory());
    let a = open(&db, "a");
    let _b = open(&db, "b");
    let notifier = Arc::new(TestNotifier::default());
    notifier.flaky_failures.store(2, Ordering::SeqCst);
    a.set_notifier(notifier.clone());

    let id = secondary_partition(&a);
    let outcome = a.migrate_partition(id, &BrokerId::new("b")).unwrap();
    assert_eq!(outcome, MigrationOutcome::Completed);
    assert_eq!(
        *notifier.delivered.lock().unwrap(),
        vec![format!("arrival {} b", id)]
    );
    assert!(a.pending_notifications().unwrap().is_empty());
}

#[test]
fn test_failed_notification_is_persisted_and_retried() {
    let db = Arc::new(StoreDatabase::in_memory());
    let a = open(&db, "a");
    let b = open(&db, "b");
    let notifier = Arc::new(TestNotifier::default());
    notifier.down.store(true, Ordering::SeqCst);
    a.set_notifier(notifier.clone());

    let id = secondary_partition(&a);
    let outcome = a.migrate_partition(id, &BrokerId::new("b")).unwrap();
    assert_eq!(outcome, MigrationOutcome::NotificationPending);

    // The move itself stands.
    assert_eq!(b.store_session_owner(id.session()).unwrap(), BrokerId::new("b"));
    let pending = a.pending_notifications().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(
        pending[0].kind,
        NotificationKind::PartitionArrival {
            partition: id,
            target: BrokerId::new("b"),
        }
    );

    // Still down: nothing delivered, record kept.
    assert_eq!(a.retry_pending_notifications().unwrap(), 0);
    assert_eq!(a.pending_notifications().unwrap().len(), 1);

    // Records of other brokers are left alone.
    assert_eq!(b.retry_pending_notifications().unwrap(), 0);

    notifier.down.store(false, Ordering::SeqCst);
    assert_eq!(a.retry_pending_notifications().unwrap(), 1);
    assert!(a.pending_notifications().unwrap().is_empty());
}
