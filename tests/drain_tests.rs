//! Shutdown tests: closing a store while operations are in flight.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use mqpersist::error::{ErrorKind, StoreError};
use mqpersist::persist::{
    DestinationInfo, ExclusiveLocks, ExclusiveRequest, Message, Store, StoreConfig, StoreDatabase,
    StoreManager,
};
use mqpersist::types::{BrokerId, DestinationId};

#[test]
fn test_close_waits_for_writers_and_loses_nothing() {
    let db = Arc::new(StoreDatabase::in_memory());
    let store = Arc::new(Store::open(StoreConfig::for_broker("a"), db.clone()).unwrap());
    let p = store.primary_partition().unwrap();
    let dest = DestinationId::queue("busy");
    p.store_destination(DestinationInfo::queue("busy"), true)
        .unwrap();

    const WRITERS: usize = 4;
    let succeeded = Arc::new(AtomicUsize::new(0));
    let started = Arc::new(Barrier::new(WRITERS + 1));
    let handles: Vec<_> = (0..WRITERS)
        .map(|w| {
            let p = p.clone();
            let dest = dest.clone();
            let succeeded = succeeded.clone();
            let started = started.clone();
            thread::spawn(move || {
                started.wait();
                for i in 0.. {
                    match p.store_message(&dest, Message::new(format!("{}-{}", w, i), "x"), None, false) {
                        Ok(()) => {
                            succeeded.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(e) => {
                            assert!(matches!(e, StoreError::Closed), "unexpected error: {:?}", e);
                            return;
                        }
                    }
                }
            })
        })
        .collect();

    started.wait();
    thread::sleep(Duration::from_millis(20));
    store.close(false).unwrap();
    for h in handles {
        h.join().unwrap();
    }

    // Every acknowledged write is there, nothing else.
    let reopened = Store::open(StoreConfig::for_broker("a"), db).unwrap();
    let count = reopened
        .primary_partition()
        .unwrap()
        .message_count(&dest)
        .unwrap();
    assert_eq!(count, succeeded.load(Ordering::SeqCst) as u64);
}

#[test]
fn test_closed_store_rejects_calls() {
    let store = Store::open(
        StoreConfig::for_broker("a"),
        Arc::new(StoreDatabase::in_memory()),
    )
    .unwrap();
    let p = store.primary_partition().unwrap();
    store.close(false).unwrap();

    assert!(store.is_closed());
    assert!(!store.is_ready());
    assert!(p.is_closed());
    let err = store.primary_partition().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotAllowed);
    assert!(matches!(
        store.property("x"),
        Err(StoreError::Closed)
    ));
    assert!(matches!(
        p.all_destinations(),
        Err(StoreError::Closed)
    ));
    assert!(store.all_broker_infos().is_err());

    // Closing again is harmless.
    store.close(true).unwrap();
}

#[test]
fn test_manager_reopens_released_store() {
    let manager = StoreManager::with_database(
        StoreConfig::for_broker("a"),
        Arc::new(StoreDatabase::in_memory()),
    );
    assert!(!manager.is_loaded());
    let first = manager.get_store().unwrap();
    first
        .update_property("kept", Some("yes"), true)
        .unwrap();
    assert!(Arc::ptr_eq(&first, &manager.get_store().unwrap()));

    manager.release_store(false).unwrap();
    assert!(first.is_closed());
    assert!(!manager.is_loaded());

    let second = manager.get_store().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.property("kept").unwrap().as_deref(), Some("yes"));
}

#[test]
fn test_close_blocks_while_partition_call_runs() {
    let db = Arc::new(StoreDatabase::in_memory());
    let store = Arc::new(Store::open(StoreConfig::for_broker("a"), db).unwrap());
    let in_call = Arc::new(Barrier::new(2));
    let finished = Arc::new(AtomicBool::new(false));

    // A listener runs inside attach_partition, which holds a store permit.
    struct SlowListener {
        in_call: Arc<Barrier>,
        finished: Arc<AtomicBool>,
    }
    impl mqpersist::persist::PartitionListener for SlowListener {
        fn partition_added(&self, _: mqpersist::types::PartitionId) {
            self.in_call.wait();
            thread::sleep(Duration::from_millis(50));
            self.finished.store(true, Ordering::SeqCst);
        }
        fn partition_removed(&self, _: mqpersist::types::PartitionId) {}
    }
    store.add_listener(Arc::new(SlowListener {
        in_call: in_call.clone(),
        finished: finished.clone(),
    }));

    let session = store
        .create_store_session(&BrokerId::new("a"), false)
        .unwrap();
    let worker = {
        let store = store.clone();
        thread::spawn(move || store.partition_arrived(Some(session.id.into())))
    };

    in_call.wait();
    store.close(false).unwrap();
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(worker.join().unwrap().unwrap().len(), 1);
}

#[test]
fn test_exclusive_requests_do_not_overlap() {
    let locks = ExclusiveLocks::new();
    let guard = locks.try_acquire(ExclusiveRequest::MigrateStore).unwrap();
    assert_eq!(guard.request(), ExclusiveRequest::MigrateStore);

    let err = locks
        .try_acquire(ExclusiveRequest::ChangeMasterBroker)
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::ExclusiveLockHeld(ExclusiveRequest::MigrateStore)
    ));
    assert_eq!(err.kind(), ErrorKind::PreconditionFailed);

    drop(guard);
    assert!(locks.current().is_none());
    locks
        .try_acquire(ExclusiveRequest::ChangeMasterBroker)
        .unwrap();
}

#[test]
fn test_master_broker_change() {
    let db = Arc::new(StoreDatabase::in_memory());
    let a = Store::open(StoreConfig::for_broker("a"), db.clone()).unwrap();
    let _b = Store::open(StoreConfig::for_broker("b"), db).unwrap();

    assert_eq!(a.master_broker().unwrap(), None);
    assert_eq!(a.change_master_broker(&BrokerId::new("b")).unwrap(), None);
    assert_eq!(
        a.change_master_broker(&BrokerId::new("a")).unwrap().as_deref(),
        Some("b")
    );
    assert_eq!(a.master_broker().unwrap(), Some(BrokerId::new("a")));

    let err = a.change_master_broker(&BrokerId::new("ghost")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
