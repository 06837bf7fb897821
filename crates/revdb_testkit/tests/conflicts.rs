//! Write conflicts between connections, with and without resolution.

use revdb_core::{CoreError, Oid, PRef, Storage, Tid, TransactionManager};
use revdb_testkit::*;
use std::sync::Arc;

/// Commits `object` as a child of the root and returns its oid.
fn create(db: &revdb_core::Database, object: &PRef) -> Oid {
    let manager = TransactionManager::new();
    let conn = db.open_connection(&manager).unwrap();
    let txn = manager.begin();
    conn.link(&txn, &conn.root().unwrap(), object).unwrap();
    txn.commit().unwrap();
    object.oid().unwrap()
}

#[test]
fn stale_serial_without_resolver_conflicts_at_the_storage() {
    init_test_logging();
    let storage = MemoryFiles::new().open().unwrap();
    let oid = storage.new_oid().unwrap();
    assert_eq!(oid, Oid::new(1));
    commit_at(&storage, 100, &[(oid, 0, b"v1", &[])]).unwrap();
    let (_, read_serial) = storage.load(oid, "").unwrap();
    assert_eq!(read_serial, Tid::new(100));
    commit_at(&storage, 200, &[(oid, 100, b"v2", &[])]).unwrap();

    let txn = TransactionManager::new().begin();
    storage.tpc_begin(&txn).unwrap();
    let err = storage.store(oid, read_serial, b"v3", &[], "", &txn).unwrap_err();
    assert!(matches!(
        err,
        CoreError::WriteConflict { expected, current: Some(current), .. }
            if expected == Tid::new(100) && current == Tid::new(200)
    ));
    assert!(err.is_retryable());
    storage.tpc_abort(&txn).unwrap();
    assert_eq!(storage.load(oid, "").unwrap(), (b"v2".to_vec(), Tid::new(200)));
}

#[test]
fn stale_write_from_a_connection_conflicts() {
    init_test_logging();
    let (db, storage) = memory_database();
    let oid = create(&db, &item("o", 1));

    let slow_manager = TransactionManager::new();
    let slow = db.open_connection(&slow_manager).unwrap();
    let slow_txn = slow_manager.begin();
    let object = slow.get(oid).unwrap();
    assert_eq!(slow.value_of(&object).unwrap(), 1);

    let fast_manager = TransactionManager::new();
    let fast = db.open_connection(&fast_manager).unwrap();
    let fast_txn = fast_manager.begin();
    fast.set_value(&fast_txn, &fast.get(oid).unwrap(), 2).unwrap();
    fast_txn.commit().unwrap();
    let fast_tid = storage.last_transaction();

    slow.set_value(&slow_txn, &object, 3).unwrap();
    let err = slow_txn.commit().unwrap_err();
    assert!(matches!(err, CoreError::WriteConflict { oid: o, .. } if o == oid));
    assert_eq!(storage.load(oid, "").unwrap().1, fast_tid);

    // the failed commit ended the transaction; a retry sees the new state
    let retry = slow_manager.begin();
    assert_eq!(slow.value_of(&object).unwrap(), 2);
    slow.set_value(&retry, &object, 3).unwrap();
    retry.commit().unwrap();
    let (data, serial) = storage.load(oid, "").unwrap();
    assert_eq!(ItemRecord::from_bytes(&data).unwrap().value, 3);
    assert!(serial > fast_tid);
}

#[test]
fn resolver_keeps_the_later_writer() {
    init_test_logging();
    let (db, storage) = memory_database();
    let oid = create(&db, &mergeable_item("o", 1));

    let slow_manager = TransactionManager::new();
    let slow = db.open_connection(&slow_manager).unwrap();
    let slow_txn = slow_manager.begin();
    let object = slow.get(oid).unwrap();
    assert_eq!(slow.value_of(&object).unwrap(), 1);

    let fast_manager = TransactionManager::new();
    let fast = db.open_connection(&fast_manager).unwrap();
    let fast_txn = fast_manager.begin();
    fast.set_value(&fast_txn, &fast.get(oid).unwrap(), 2).unwrap();
    fast_txn.commit().unwrap();
    let fast_tid = storage.last_transaction();

    slow.set_value(&slow_txn, &object, 3).unwrap();
    slow_txn.commit().unwrap();

    let (data, serial) = storage.load(oid, "").unwrap();
    assert_eq!(ItemRecord::from_bytes(&data).unwrap().value, 3);
    assert!(serial > fast_tid);
    // the resolved copy was ghosted and reloads at the new serial
    assert_eq!(slow.value_of(&object).unwrap(), 3);
    assert_eq!(object.serial(), serial);
}

#[test]
fn deferred_outcomes_are_applied_at_vote() {
    init_test_logging();
    let inner = MemoryFiles::new().open().unwrap();
    let storage = Arc::new(DeferredStorage::new(inner.clone()));
    let db = revdb_core::Database::open(
        storage.clone(),
        Arc::new(ItemFactory),
        revdb_core::DatabaseConfig::new(),
    )
    .unwrap();

    let manager = TransactionManager::new();
    let conn = db.open_connection(&manager).unwrap();
    let txn = manager.begin();
    let first = item("first", 1);
    conn.link(&txn, &conn.root().unwrap(), &first).unwrap();
    txn.commit().unwrap();

    let tid = inner.last_transaction();
    assert_eq!(first.serial(), tid);
    assert_eq!(first.state(), revdb_core::ObjectState::Saved);

    let txn = manager.begin();
    conn.set_value(&txn, &first, 2).unwrap();
    txn.commit().unwrap();
    assert!(first.serial() > tid);
    assert_eq!(first.state(), revdb_core::ObjectState::Saved);
    assert_eq!(inner.load(first.oid().unwrap(), "").unwrap().1, first.serial());
}
