//! Integration tests for the transaction model.
//!
//! Covers the state table (commit only from Prepared, rollback only between
//! Started and Prepared), deferred removal of messages acknowledged under a
//! transaction, and cluster and remote transaction bookkeeping.

use std::sync::Arc;

use mqpersist::error::{ErrorKind, StoreError};
use mqpersist::persist::{
    ConsumerState, DestinationInfo, InterestState, Message, PartitionedStore, Store, StoreConfig,
    StoreDatabase, TransactionAck, TransactionBroker, TransactionState, TransactionType,
};
use mqpersist::types::{BrokerId, ConsumerId, DestinationId, MessageId, TransactionId};

fn primary() -> (Store, Arc<dyn PartitionedStore>) {
    let store = Store::open(
        StoreConfig::for_broker("broker-a"),
        Arc::new(StoreDatabase::in_memory()),
    )
    .unwrap();
    let partition = store.primary_partition().unwrap();
    (store, partition)
}

/// Drive a local transaction from Started to Prepared.
fn prepare(p: &dyn PartitionedStore, id: TransactionId) {
    p.update_transaction_state(id, TransactionState::Complete, true)
        .unwrap();
    p.update_transaction_state(id, TransactionState::Prepared, true)
        .unwrap();
}

fn queue_with_message(p: &dyn PartitionedStore, consumer: ConsumerId) -> DestinationId {
    let dest = DestinationId::queue("orders");
    p.store_destination(DestinationInfo::queue("orders"), true)
        .unwrap();
    p.store_message(
        &dest,
        Message::new("m1", "x"),
        Some(&[ConsumerState::new(consumer, InterestState::Delivered)]),
        true,
    )
    .unwrap();
    dest
}

// ============================================================================
// State table
// ============================================================================

#[test]
fn test_commit_outside_prepared_fails() {
    let (_store, p) = primary();
    let txn = TransactionId::new(1);
    p.store_transaction(txn, TransactionState::Started, true)
        .unwrap();

    let err = p
        .update_transaction_state(txn, TransactionState::Committed, true)
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidTransition { .. }));
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    assert_eq!(p.transaction_state(txn).unwrap(), TransactionState::Started);

    prepare(p.as_ref(), txn);
    p.update_transaction_state(txn, TransactionState::Committed, true)
        .unwrap();
    assert_eq!(
        p.transaction_state(txn).unwrap(),
        TransactionState::Committed
    );
}

#[test]
fn test_rollback_of_committed_fails() {
    let (_store, p) = primary();
    let txn = TransactionId::new(2);
    p.store_transaction(txn, TransactionState::Started, true)
        .unwrap();
    prepare(p.as_ref(), txn);
    p.update_transaction_state(txn, TransactionState::Committed, true)
        .unwrap();

    let err = p
        .update_transaction_state(txn, TransactionState::RolledBack, true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
}

#[test]
fn test_rollback_from_started_and_prepared() {
    let (_store, p) = primary();
    let started = TransactionId::new(3);
    let prepared = TransactionId::new(4);
    p.store_transaction(started, TransactionState::Started, true)
        .unwrap();
    p.store_transaction(prepared, TransactionState::Started, true)
        .unwrap();
    prepare(p.as_ref(), prepared);

    p.update_transaction_state(started, TransactionState::RolledBack, true)
        .unwrap();
    p.update_transaction_state(prepared, TransactionState::RolledBack, true)
        .unwrap();
    assert_eq!(
        p.all_transaction_states().unwrap().get(&prepared),
        Some(&TransactionState::RolledBack)
    );
}

#[test]
fn test_duplicate_transaction_conflicts() {
    let (_store, p) = primary();
    let txn = TransactionId::new(5);
    p.store_transaction(txn, TransactionState::Started, true)
        .unwrap();
    let err = p
        .store_transaction(txn, TransactionState::Started, true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[test]
fn test_unknown_transaction_not_found() {
    let (_store, p) = primary();
    let err = p.transaction_state(TransactionId::new(404)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// ============================================================================
// Acknowledgements under a transaction
// ============================================================================

#[test]
fn test_commit_removes_messages_acked_under_transaction() {
    let (_store, p) = primary();
    let c1 = ConsumerId::new(1);
    let dest = queue_with_message(p.as_ref(), c1);
    let txn = TransactionId::new(10);
    let m1 = MessageId::new("m1");
    p.store_transaction(txn, TransactionState::Started, true)
        .unwrap();

    let removed = p
        .update_interest_state(
            &dest,
            &m1,
            c1,
            InterestState::Acknowledged,
            true,
            Some(txn),
            true,
        )
        .unwrap();
    assert!(!removed);
    assert!(p.has_message(&dest, &m1).unwrap());
    assert_eq!(p.transaction_usage(txn).unwrap().pending_removals, 1);

    prepare(p.as_ref(), txn);
    p.update_transaction_state(txn, TransactionState::Committed, true)
        .unwrap();
    assert!(!p.has_message(&dest, &m1).unwrap());
    assert_eq!(p.message_count(&dest).unwrap(), 0);
}

#[test]
fn test_rollback_returns_acks_to_delivered() {
    let (_store, p) = primary();
    let c1 = ConsumerId::new(1);
    let dest = queue_with_message(p.as_ref(), c1);
    let txn = TransactionId::new(11);
    let m1 = MessageId::new("m1");
    p.store_transaction(txn, TransactionState::Started, true)
        .unwrap();

    p.update_interest_state(
        &dest,
        &m1,
        c1,
        InterestState::Acknowledged,
        true,
        Some(txn),
        true,
    )
    .unwrap();
    p.update_transaction_state(txn, TransactionState::RolledBack, true)
        .unwrap();

    assert!(p.has_message(&dest, &m1).unwrap());
    assert_eq!(
        p.interest_state(&dest, &m1, c1).unwrap(),
        InterestState::Delivered
    );
    assert_eq!(p.transaction_usage(txn).unwrap().pending_removals, 0);
}

#[test]
fn test_ack_under_rolled_back_transaction_fails() {
    let (_store, p) = primary();
    let c1 = ConsumerId::new(1);
    let dest = queue_with_message(p.as_ref(), c1);
    let txn = TransactionId::new(12);
    p.store_transaction(txn, TransactionState::Started, true)
        .unwrap();
    p.update_transaction_state(txn, TransactionState::RolledBack, true)
        .unwrap();

    let err = p
        .update_interest_state(
            &dest,
            &MessageId::new("m1"),
            c1,
            InterestState::Acknowledged,
            true,
            Some(txn),
            true,
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
}

#[test]
fn test_transaction_acks_crud() {
    let (_store, p) = primary();
    let txn = TransactionId::new(20);
    let ack = TransactionAck::new(
        DestinationId::queue("orders"),
        MessageId::new("m1"),
        ConsumerId::new(1),
    );
    p.store_transaction(txn, TransactionState::Started, true)
        .unwrap();
    p.store_transaction_ack(txn, ack.clone(), true).unwrap();

    let err = p.store_transaction_ack(txn, ack.clone(), true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(p.transaction_acks(txn).unwrap(), vec![ack]);
    assert_eq!(p.all_transaction_acks().unwrap().len(), 1);

    // Acks keep the transaction alive unless removed with it.
    let err = p.remove_transaction(txn, false, true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
    p.remove_transaction_acks(txn, true).unwrap();
    p.remove_transaction(txn, false, true).unwrap();
    assert!(p.transaction_state(txn).is_err());
}

// ============================================================================
// Cluster and remote transactions
// ============================================================================

#[test]
fn test_cluster_transaction_resolved_when_all_participants_complete() {
    let (_store, p) = primary();
    let txn = TransactionId::new(30);
    let b1 = BrokerId::new("b1");
    let b2 = BrokerId::new("b2");
    p.store_cluster_transaction(
        txn,
        TransactionState::Prepared,
        vec![TransactionBroker::new(b1.clone()), TransactionBroker::new(b2.clone())],
        true,
    )
    .unwrap();
    p.update_transaction_state(txn, TransactionState::Committed, true)
        .unwrap();

    p.update_cluster_transaction_broker_state(txn, TransactionState::Committed, &b1, true)
        .unwrap();
    // Partial completion stays visible and blocks removal.
    let brokers = p.cluster_transaction_brokers(txn).unwrap();
    assert!(brokers.iter().any(|b| b.broker == b1 && b.completed));
    assert!(brokers.iter().any(|b| b.broker == b2 && !b.completed));
    assert_eq!(
        p.remove_transaction(txn, true, true).unwrap_err().kind(),
        ErrorKind::PreconditionFailed
    );

    p.update_cluster_transaction_broker_state(txn, TransactionState::Committed, &b2, true)
        .unwrap();
    p.remove_transaction(txn, true, true).unwrap();
}

#[test]
fn test_cluster_broker_state_requires_expected_state() {
    let (_store, p) = primary();
    let txn = TransactionId::new(31);
    let b1 = BrokerId::new("b1");
    p.store_cluster_transaction(
        txn,
        TransactionState::Prepared,
        vec![TransactionBroker::new(b1.clone())],
        true,
    )
    .unwrap();
    let err = p
        .update_cluster_transaction_broker_state(txn, TransactionState::Committed, &b1, true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);
}

#[test]
fn test_remote_transaction_is_decided_by_home_broker() {
    let (_store, p) = primary();
    let txn = TransactionId::new(40);
    let home = BrokerId::new("home");
    let ack = TransactionAck::new(
        DestinationId::queue("orders"),
        MessageId::new("m9"),
        ConsumerId::new(3),
    );
    p.store_remote_transaction(txn, TransactionState::Prepared, vec![ack.clone()], home.clone(), true)
        .unwrap();

    let err = p
        .update_transaction_state(txn, TransactionState::Committed, true)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAllowed);

    p.update_remote_transaction(txn, TransactionState::Committed, vec![], home.clone(), true)
        .unwrap();
    assert_eq!(p.remote_transaction_home_broker(txn).unwrap(), Some(home));
    assert_eq!(
        p.all_remote_transaction_states().unwrap().get(&txn),
        Some(&TransactionState::Committed)
    );
    assert!(p.all_transaction_states().unwrap().is_empty());
    assert_eq!(
        p.transaction_info(txn).unwrap().kind,
        TransactionType::Remote
    );
}
