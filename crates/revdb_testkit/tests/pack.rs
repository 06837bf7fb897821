//! Pack: pruning old revisions and collecting unreachable objects.

use proptest::prelude::*;
use revdb_core::{CoreError, Oid, PackOutcome, Storage, Tid, TransactionManager};
use revdb_testkit::*;
use std::time::{Duration, SystemTime};

#[test]
fn pack_now_leaves_only_the_current_revision() {
    init_test_logging();
    let storage = MemoryFiles::new().open().unwrap();
    let oid = storage.new_oid().unwrap();
    commit_at(&storage, 5, &[(Oid::ROOT, 0, &encode_item("root", 0, &[oid]), &[oid])]).unwrap();
    commit_at(&storage, 10, &[(oid, 0, &item_bytes("o", 10), &[])]).unwrap();
    commit_at(&storage, 20, &[(oid, 10, &item_bytes("o", 20), &[])]).unwrap();
    commit_at(&storage, 30, &[(oid, 20, &item_bytes("o", 30), &[])]).unwrap();

    let now = Tid::from_system_time(SystemTime::now());
    let outcome = storage.pack(now, true).unwrap();
    assert!(matches!(outcome, PackOutcome::Completed(stats) if stats.revisions_removed == 2));

    assert_eq!(storage.load(oid, "").unwrap(), (item_bytes("o", 30), Tid::new(30)));
    for tid in [10, 20] {
        assert!(matches!(
            storage.load_serial(oid, Tid::new(tid)),
            Err(CoreError::NotFound { .. })
        ));
    }
}

#[test]
fn database_pack_collects_unlinked_objects() {
    init_test_logging();
    let (db, storage) = memory_database();
    let manager = TransactionManager::new();
    let conn = db.open_connection(&manager).unwrap();
    let root = conn.root().unwrap();

    let txn = manager.begin();
    let kept = item("kept", 1);
    let dropped = item("dropped", 2);
    conn.link(&txn, &root, &kept).unwrap();
    conn.link(&txn, &root, &dropped).unwrap();
    txn.commit().unwrap();
    let dropped_oid = dropped.oid().unwrap();

    let txn = manager.begin();
    conn.unlink_all(&txn, &root).unwrap();
    conn.link(&txn, &root, &kept).unwrap();
    conn.set_value(&txn, &kept, 3).unwrap();
    txn.commit().unwrap();

    let outcome = db.pack_older_than(Duration::ZERO, true).unwrap();
    assert!(matches!(outcome, PackOutcome::Completed(stats) if stats.objects_removed == 1));
    assert!(storage.load(dropped_oid, "").is_err());
    assert_eq!(db.history(kept.oid().unwrap(), "", 10).unwrap().len(), 1);

    // the cached copy of the dropped object is gone from storage too
    conn.cache_minimize();
    assert!(conn.value_of(&dropped).is_err());
    assert_eq!(conn.value_of(&kept).unwrap(), 3);
}

/// Commits every state of `history` and returns the oids of its objects.
fn commit_history(storage: &revdb_core::FullStorage, history: &GraphHistory) -> Vec<Oid> {
    let mut oids = vec![Oid::ROOT];
    for _ in 1..history.nodes {
        oids.push(storage.new_oid().unwrap());
    }
    let mut serials = vec![0u64; history.nodes];
    for (step, state) in history.states.iter().enumerate() {
        let at = 10 * (step as u64 + 1);
        let items: Vec<(Oid, u64, Vec<u8>, Vec<Oid>)> = state
            .iter()
            .enumerate()
            .map(|(node, links)| {
                let refs: Vec<Oid> = links.iter().map(|&l| oids[l]).collect();
                let data = encode_item(&format!("n{node}"), at as i64, &refs);
                (oids[node], serials[node], data, refs)
            })
            .collect();
        let borrowed: Vec<(Oid, u64, &[u8], &[Oid])> = items
            .iter()
            .map(|(oid, serial, data, refs)| (*oid, *serial, data.as_slice(), refs.as_slice()))
            .collect();
        commit_at(storage, at, &borrowed).unwrap();
        serials.iter_mut().for_each(|s| *s = at);
    }
    oids
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn pack_keeps_exactly_the_reachable_objects(history in graph_history_strategy()) {
        let storage = MemoryFiles::new().open().unwrap();
        let oids = commit_history(&storage, &history);
        let last = history.states.len() - 1;
        let reachable = history.reachable(last);

        let outcome = storage.pack(storage.last_transaction(), true).unwrap();
        let completed = matches!(outcome, PackOutcome::Completed(_));
        prop_assert!(completed, "pack did not complete: {:?}", outcome);

        for (node, oid) in oids.iter().enumerate() {
            let loaded = storage.load(*oid, "");
            if reachable[node] {
                prop_assert!(loaded.is_ok(), "reachable {} was removed", oid);
            } else {
                let removed = matches!(loaded, Err(CoreError::NotFound { .. }));
                prop_assert!(removed, "unreachable {} survived", oid);
            }
        }
    }

    #[test]
    fn pack_at_an_earlier_tid_keeps_what_was_reachable_then(history in graph_history_strategy()) {
        let storage = MemoryFiles::new().open().unwrap();
        let oids = commit_history(&storage, &history);
        let at = history.states.len() / 2;
        let pack_tid = Tid::new(10 * (at as u64 + 1));
        let reachable_then = history.reachable(at);
        let reachable_now = history.reachable(history.states.len() - 1);

        storage.pack(pack_tid, true).unwrap();

        for (node, oid) in oids.iter().enumerate() {
            if reachable_now[node] {
                prop_assert!(storage.load(*oid, "").is_ok());
            }
            if reachable_then[node] && at + 1 < history.states.len() {
                // every object was rewritten after the pack time
                prop_assert!(storage.load_before(*oid, pack_tid.next()).unwrap().is_some());
            }
        }
    }
}
