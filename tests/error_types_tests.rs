//! Tests for StoreError, its classification and display formats.

use std::error::Error as _;
use std::io;

use mqpersist::error::{
    Entity, ErrorKind, LoadErrors, LoadSection, Status, StoreError, TakeoverLockError,
    TakeoverLockReason,
};
use mqpersist::persist::{
    BrokerInfo, BrokerState, ExclusiveRequest, InterestState, TakeoverStage, TransactionState,
};
use mqpersist::types::{BrokerId, ConsumerId, DestinationId, MessageId, PartitionId, TransactionId};

fn lock_error(reason: TakeoverLockReason) -> StoreError {
    let mut current = BrokerInfo::new(BrokerId::new("a"), "mq://a:7676", 500);
    current.state = BrokerState::FailoverStarted;
    current.takeover_broker = Some(BrokerId::new("c"));
    TakeoverLockError {
        target: BrokerId::new("a"),
        requester: BrokerId::new("b"),
        reason,
        current,
    }
    .into()
}

// ============================================================================
// Display Tests
// ============================================================================

#[test]
fn test_not_found_display() {
    let err = StoreError::not_found(Entity::Message, "m1");
    assert_eq!(err.to_string(), "message m1 not found");

    let err = StoreError::not_found(Entity::Session, 42);
    assert_eq!(err.to_string(), "store session 42 not found");
}

#[test]
fn test_already_exists_display() {
    let err = StoreError::already_exists(Entity::Destination, DestinationId::queue("orders"));
    assert_eq!(err.to_string(), "destination Q:orders already exists");
}

#[test]
fn test_interest_transition_display() {
    let err = StoreError::InvalidInterestTransition {
        message: MessageId::new("m1"),
        consumer: ConsumerId::new(7),
        from: InterestState::Acknowledged,
        to: InterestState::Delivered,
    };
    let msg = err.to_string();
    assert!(msg.contains("m1"));
    assert!(msg.contains("consumer 7"));
    assert!(msg.contains("Acknowledged"));
    assert!(msg.contains("Delivered"));
}

#[test]
fn test_transaction_transition_display() {
    let err = StoreError::InvalidTransition {
        txn: TransactionId::new(9),
        from: TransactionState::Committed,
        to: TransactionState::RolledBack,
    };
    assert_eq!(
        err.to_string(),
        "transaction 9 cannot move from COMMITTED to ROLLEDBACK"
    );
}

#[test]
fn test_fenced_display() {
    let err = StoreError::Fenced {
        partition: PartitionId::new(3),
        expected_epoch: 1,
        current_epoch: 2,
    };
    let msg = err.to_string();
    assert!(msg.contains("partition 3 fenced"));
    assert!(msg.contains("epoch 1"));
    assert!(msg.contains("epoch 2"));
}

#[test]
fn test_exclusive_lock_display() {
    let err = StoreError::ExclusiveLockHeld(ExclusiveRequest::MigrateStore);
    assert_eq!(err.to_string(), "migrate store is already in progress");
}

#[test]
fn test_takeover_lock_display() {
    let err = lock_error(TakeoverLockReason::AlreadyTakenOver(BrokerId::new("c")));
    assert_eq!(
        err.to_string(),
        "broker b failed to take the takeover lock on a: already being taken over by c"
    );

    let err = lock_error(TakeoverLockReason::HeartbeatChanged);
    assert!(err.to_string().ends_with("broker heartbeat changed"));
}

#[test]
fn test_takeover_incomplete_display_and_source() {
    let err = StoreError::TakeoverIncomplete {
        target: BrokerId::new("a"),
        stage: TakeoverStage::BeforeSwitchOwner,
        source: Box::new(StoreError::Unavailable("database offline".to_string())),
    };
    assert_eq!(
        err.to_string(),
        "takeover of a stopped at before switch owner: unavailable: database offline"
    );
    assert!(err.source().is_some());
}

// ============================================================================
// Classification Tests
// ============================================================================

#[test]
fn test_kind_and_status_mapping() {
    let cases = [
        (StoreError::not_found(Entity::Broker, "x"), ErrorKind::NotFound, 404),
        (
            StoreError::already_exists(Entity::Transaction, 1),
            ErrorKind::Conflict,
            409,
        ),
        (
            StoreError::Unsupported {
                operation: "store_message",
                backend: "nopersist",
            },
            ErrorKind::Unsupported,
            405,
        ),
        (StoreError::Closed, ErrorKind::NotAllowed, 405),
        (
            StoreError::Precondition("busy".into()),
            ErrorKind::PreconditionFailed,
            412,
        ),
        (StoreError::NotReady, ErrorKind::PreconditionFailed, 412),
        (StoreError::BadRequest("x".into()), ErrorKind::BadRequest, 400),
        (StoreError::Config("x".into()), ErrorKind::BadRequest, 400),
        (StoreError::Unavailable("x".into()), ErrorKind::Unavailable, 503),
        (
            StoreError::DestinationFull {
                destination: DestinationId::queue("q"),
                reason: "max messages".into(),
            },
            ErrorKind::Unavailable,
            503,
        ),
        (
            StoreError::io("reading snapshot", io::Error::other("bad sector")),
            ErrorKind::IoFailure,
            500,
        ),
        (
            lock_error(TakeoverLockReason::StateChanged),
            ErrorKind::Conflict,
            409,
        ),
    ];

    for (err, kind, code) in cases {
        assert_eq!(err.kind(), kind, "{}", err);
        assert_eq!(err.status().code(), code, "{}", err);
        assert_eq!(kind.status(), err.status());
    }
}

#[test]
fn test_serde_errors_are_io_failures() {
    let err: StoreError = serde_json::from_str::<u64>("not json").unwrap_err().into();
    assert!(matches!(err, StoreError::Serde(_)));
    assert_eq!(err.kind(), ErrorKind::IoFailure);
    assert!(!err.is_retriable());
}

#[test]
fn test_io_error_conversion() {
    let err: StoreError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
    assert!(err.to_string().starts_with("I/O error while accessing store files"));
}

#[test]
fn test_retriable_errors() {
    assert!(StoreError::Unavailable("down".into()).is_retriable());
    assert!(StoreError::ExclusiveLockHeld(ExclusiveRequest::ChangeMasterBroker).is_retriable());
    assert!(StoreError::io("x", io::Error::new(io::ErrorKind::Interrupted, "i")).is_retriable());

    assert!(!StoreError::NotAllowed("no".into()).is_retriable());
    assert!(!StoreError::Closed.is_retriable());
    assert!(!lock_error(TakeoverLockReason::StateChanged).is_retriable());
    assert!(
        !StoreError::Fenced {
            partition: PartitionId::new(1),
            expected_epoch: 1,
            current_epoch: 2,
        }
        .is_retriable()
    );
}

#[test]
fn test_takeover_snapshot_carried_through() {
    let err = lock_error(TakeoverLockReason::AlreadyTakenOver(BrokerId::new("c")));
    let snapshot = err.takeover_snapshot().unwrap();
    assert_eq!(snapshot.state, BrokerState::FailoverStarted);
    assert_eq!(snapshot.takeover_broker, Some(BrokerId::new("c")));

    let wrapped = StoreError::TakeoverIncomplete {
        target: BrokerId::new("a"),
        stage: TakeoverStage::AfterGetLock,
        source: Box::new(err),
    };
    assert!(wrapped.takeover_snapshot().is_some());
    assert_eq!(wrapped.kind(), ErrorKind::Conflict);

    assert!(StoreError::Closed.takeover_snapshot().is_none());
}

// ============================================================================
// Status Tests
// ============================================================================

#[test]
fn test_status_display() {
    assert_eq!(Status::Ok.to_string(), "200 ok");
    assert_eq!(Status::PreconditionFailed.to_string(), "412 precondition_failed");
    assert!(Status::Ok.is_ok());
    assert!(!Status::Conflict.is_ok());
}

// ============================================================================
// LoadErrors Tests
// ============================================================================

#[test]
fn test_load_errors_extend_and_iterate() {
    let mut first = LoadErrors::default();
    first.push(
        LoadSection::Snapshot,
        "snapshot.json",
        StoreError::BadRequest("truncated".into()),
    );

    let mut second = LoadErrors::default();
    second.push(
        LoadSection::Transactions,
        "txn 4",
        StoreError::not_found(Entity::Transaction, 4),
    );
    second.push(
        LoadSection::Transactions,
        "txn 5",
        StoreError::not_found(Entity::Transaction, 5),
    );

    first.extend(second);
    assert_eq!(first.len(), 3);
    assert_eq!(first.in_section(LoadSection::Transactions).count(), 2);
    assert_eq!(first.in_section(LoadSection::Brokers).count(), 0);
    let keys: Vec<_> = first.iter().map(|e| e.key.as_str()).collect();
    assert_eq!(keys, vec!["snapshot.json", "txn 4", "txn 5"]);
    assert_eq!(first.to_string(), "3 persisted entries failed to load");
}
