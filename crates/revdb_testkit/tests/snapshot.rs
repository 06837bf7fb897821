//! Snapshot isolation: a connection sees one consistent state per
//! transaction, whatever other connections commit meanwhile.

use proptest::prelude::*;
use revdb_core::{Connection, Database, Oid, TransactionManager};
use revdb_testkit::*;
use std::thread;

const OBJECTS: usize = 3;

fn initial_value(index: usize) -> i64 {
    index as i64 * 10_000 + 7
}

fn populate(db: &Database) -> Vec<Oid> {
    let manager = TransactionManager::new();
    let conn = db.open_connection(&manager).unwrap();
    let root = conn.root().unwrap();
    let txn = manager.begin();
    let objects: Vec<_> = (0..OBJECTS)
        .map(|i| item(&format!("o{i}"), initial_value(i)))
        .collect();
    for object in &objects {
        conn.link(&txn, &root, object).unwrap();
    }
    txn.commit().unwrap();
    objects.iter().map(|o| o.oid().unwrap()).collect()
}

fn values(conn: &Connection, oids: &[Oid]) -> Vec<i64> {
    oids.iter()
        .map(|&oid| conn.value_of(&conn.get(oid).unwrap()).unwrap())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn reads_stay_on_the_snapshot(
        preloaded in prop::collection::vec(any::<bool>(), OBJECTS),
        writes in write_history_strategy(OBJECTS),
    ) {
        let (db, _storage) = memory_database();
        let oids = populate(&db);

        let reader_manager = TransactionManager::new();
        let reader = db.open_connection(&reader_manager).unwrap();
        let reader_txn = reader_manager.begin();
        for (index, &oid) in oids.iter().enumerate() {
            if preloaded[index] {
                reader.value_of(&reader.get(oid).unwrap()).unwrap();
            }
        }

        let writer_manager = TransactionManager::new();
        let writer = db.open_connection(&writer_manager).unwrap();
        let mut expected_final: Vec<i64> = (0..OBJECTS).map(initial_value).collect();
        for txn_writes in &writes {
            let txn = writer_manager.begin();
            for &(index, value) in txn_writes {
                writer.set_value(&txn, &writer.get(oids[index]).unwrap(), value).unwrap();
                expected_final[index] = value;
            }
            txn.commit().unwrap();
        }

        let snapshot: Vec<i64> = (0..OBJECTS).map(initial_value).collect();
        prop_assert_eq!(values(&reader, &oids), snapshot.clone());
        prop_assert_eq!(values(&reader, &oids), snapshot);

        reader_txn.commit().unwrap();
        prop_assert_eq!(values(&reader, &oids), expected_final);
    }
}

#[test]
fn snapshot_holds_against_a_concurrent_writer() {
    init_test_logging();
    let (db, _storage) = memory_database();
    let oids = populate(&db);

    let reader_manager = TransactionManager::new();
    let reader = db.open_connection(&reader_manager).unwrap();
    let reader_txn = reader_manager.begin();
    let before = values(&reader, &oids);

    thread::scope(|scope| {
        let writer = scope.spawn(|| {
            let manager = TransactionManager::new();
            let conn = db.open_connection(&manager).unwrap();
            for round in 1..=20 {
                let txn = manager.begin();
                for &oid in &oids {
                    conn.set_value(&txn, &conn.get(oid).unwrap(), round).unwrap();
                }
                txn.commit().unwrap();
            }
        });
        while !writer.is_finished() {
            reader.cache_minimize();
            assert_eq!(values(&reader, &oids), before);
        }
        writer.join().unwrap();
    });

    assert_eq!(values(&reader, &oids), before);
    reader_txn.commit().unwrap();
    assert_eq!(values(&reader, &oids), vec![20; OBJECTS]);
}
