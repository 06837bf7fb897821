//! Two-phase commit across several jars.

use proptest::prelude::*;
use revdb_core::{CoreError, Storage, TransactionManager, TransactionStatus};
use revdb_testkit::*;
use std::sync::Barrier;
use std::thread;

#[test]
fn jars_begin_in_the_same_order_for_every_transaction() {
    init_test_logging();
    let log = call_log();
    let alpha = RecordingJar::new("alpha", &log);
    let beta = RecordingJar::new("beta", &log);
    let gamma = RecordingJar::new("gamma", &log);
    let barrier = Barrier::new(2);

    let ids: Vec<u64> = thread::scope(|scope| {
        let joins = [
            [&gamma, &alpha, &beta],
            [&beta, &gamma, &alpha],
        ]
        .map(|order| {
            let barrier = &barrier;
            scope.spawn(move || {
                let txn = TransactionManager::new().begin();
                for jar in order {
                    jar.join(&txn).unwrap();
                }
                barrier.wait();
                txn.commit().unwrap();
                txn.id()
            })
        });
        joins.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for id in ids {
        assert_eq!(jars_at(&log, "tpc_begin", id), ["alpha", "beta", "gamma"]);
        assert_eq!(jars_at(&log, "tpc_vote", id), ["alpha", "beta", "gamma"]);
        assert_eq!(jars_at(&log, "tpc_finish", id), ["alpha", "beta", "gamma"]);
    }
}

proptest! {
    #[test]
    fn begin_order_ignores_join_order(names in jar_names_strategy(), seed in any::<u64>()) {
        let log = call_log();
        let jars: Vec<_> = names.iter().map(|n| RecordingJar::new(n, &log)).collect();
        let mut order: Vec<usize> = (0..jars.len()).collect();
        order.rotate_left((seed % jars.len() as u64) as usize);
        if seed % 2 == 1 {
            order.reverse();
        }

        let txn = TransactionManager::new().begin();
        for index in order {
            jars[index].join(&txn).unwrap();
        }
        txn.commit().unwrap();

        let mut sorted = names.clone();
        sorted.sort();
        prop_assert_eq!(jars_at(&log, "tpc_begin", txn.id()), sorted);
    }
}

#[test]
fn failed_vote_rolls_back_every_jar() {
    init_test_logging();
    let (db, storage) = memory_database();
    let manager = TransactionManager::new();
    let conn = db.open_connection(&manager).unwrap();
    let root = conn.root().unwrap();
    let before = storage.last_transaction();

    let log = call_log();
    let other = RecordingJar::new("zzz", &log);
    other.fail_at("tpc_vote");

    let txn = manager.begin();
    conn.set_value(&txn, &root, 42).unwrap();
    let child = item("child", 1);
    conn.link(&txn, &root, &child).unwrap();
    other.join(&txn).unwrap();
    let err = txn.commit().unwrap_err();
    assert!(matches!(err, CoreError::StorageSystem { .. }));
    assert_eq!(txn.status(), TransactionStatus::Aborted);

    assert_eq!(jars_at(&log, "tpc_abort", txn.id()), ["zzz"]);
    assert_eq!(storage.last_transaction(), before);
    assert!(root.is_ghost());
    assert_eq!(conn.value_of(&root).unwrap(), 0);
    assert!(conn.links_of(&root).unwrap().is_empty());
    assert!(child.oid().is_none());

    // the storage accepts the next commit
    let txn = manager.begin();
    conn.set_value(&txn, &root, 43).unwrap();
    txn.commit().unwrap();
    assert!(storage.last_transaction() > before);
}

#[test]
fn first_finish_failure_does_not_hose() {
    let log = call_log();
    let alpha = RecordingJar::new("alpha", &log);
    let beta = RecordingJar::new("beta", &log);
    alpha.fail_at("tpc_finish");

    let manager = TransactionManager::new();
    let txn = manager.begin();
    alpha.join(&txn).unwrap();
    beta.join(&txn).unwrap();
    assert!(txn.commit().is_err());
    assert!(!manager.is_hosed());
    assert_eq!(jars_at(&log, "tpc_abort", txn.id()), ["alpha", "beta"]);
}

#[test]
fn connections_and_storage_operations_commit_together() {
    init_test_logging();
    let (db, storage) = memory_database();
    let manager = TransactionManager::new();
    let conn = db.open_connection(&manager).unwrap();
    let root = conn.root().unwrap();

    let txn = manager.begin();
    conn.set_value(&txn, &root, 1).unwrap();
    txn.commit().unwrap();
    let first = storage.last_transaction();

    let txn = manager.begin();
    conn.set_value(&txn, &root, 2).unwrap();
    txn.commit().unwrap();
    let second = storage.last_transaction();

    // undo the second change while storing an unrelated new object
    let txn = manager.begin();
    db.undo(second, &txn).unwrap();
    let extra = item("extra", 5);
    let extra_oid = conn.add(&txn, &extra).unwrap();
    txn.commit().unwrap();

    let tid = storage.last_transaction();
    assert_eq!(storage.load(extra_oid, "").unwrap().1, tid);
    let (data, serial) = storage.load(revdb_core::Oid::ROOT, "").unwrap();
    assert_eq!(serial, tid);
    assert_eq!(ItemRecord::from_bytes(&data).unwrap().value, 1);
    assert_eq!(db.history(revdb_core::Oid::ROOT, "", 10).unwrap()[2].tid, first);

    let reader = db.open_connection(&TransactionManager::new()).unwrap();
    assert_eq!(reader.value_of(&reader.root().unwrap()).unwrap(), 1);
}
