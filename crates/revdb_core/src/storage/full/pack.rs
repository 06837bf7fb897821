//! Pack: revision pruning, reference counting and mark-and-sweep.
//!
//! Every phase works off durable tables (`ObjRevs`, `DelQueue`, `OidQueue`,
//! `PackMarks`) and records its position in the info table, so a pack that
//! is stopped or crashes resumes where it left off. Each lock cycle handles
//! at most `pack_batch_size` work items and commits one batch per item.

use super::commit::TpcState;
use super::records::{info, to_cbor, PackPhase, PackState};
use super::{EngineState, FullStorage, MetadataRecord};
use crate::error::CoreResult;
use crate::kv::{self, encode_u64, TableId, WriteBatch};
use crate::storage::{PackOutcome, PackStats};
use crate::types::{Oid, Tid};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::Ordering;
use tracing::{debug, info};

/// Appends entries to one of the pack queues.
struct QueueWriter {
    table: TableId,
    next: u64,
}

impl QueueWriter {
    fn new(state: &EngineState, table: TableId) -> Self {
        let next = state
            .kv
            .last(table)
            .and_then(|(key, _)| kv::key_part(key, 0))
            .map_or(0, |seq| seq + 1);
        Self { table, next }
    }

    fn push(&mut self, batch: &mut WriteBatch, value: Vec<u8>) {
        batch.put(self.table, encode_u64(self.next), value);
        self.next += 1;
    }
}

/// First `limit` entries of a table.
fn head(state: &EngineState, table: TableId, limit: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    state
        .kv
        .prefix(table, &[])
        .take(limit)
        .map(|(k, v)| (k.to_vec(), v.to_vec()))
        .collect()
}

fn has_revision_after(state: &EngineState, oid: Oid, pack_tid: Tid) -> bool {
    state
        .revisions(oid)
        .next_back()
        .is_some_and(|(tid, _)| tid > pack_tid)
}

fn is_marked(state: &EngineState, oid: Oid) -> bool {
    state
        .kv
        .prefix(TableId::PackMarks, &kv::oid_key(oid))
        .next()
        .is_some()
}

/// Drops `oid` from the objects written by `tid`, and the transaction
/// description with the last of them.
fn forget_txn_oid(state: &EngineState, batch: &mut WriteBatch, tid: Tid, oid: Oid) {
    batch.delete(TableId::TxnOids, kv::tid_oid_key(tid, oid));
    let remaining = state
        .kv
        .prefix(TableId::TxnOids, &tid.to_bytes())
        .take(2)
        .count();
    if remaining <= 1 {
        batch.delete(TableId::TxnMetadata, tid.to_bytes().to_vec());
    }
}

/// Lowers the reference count of `oid` by `by`, queueing it for deletion
/// when nothing references it any more.
fn decref(
    state: &EngineState,
    batch: &mut WriteBatch,
    queue: &mut QueueWriter,
    oid: Oid,
    by: u64,
) {
    let count = state.kv.counter(TableId::Refcounts, &kv::oid_key(oid));
    batch.add(
        TableId::Refcounts,
        kv::oid_key(oid),
        -i64::try_from(by).unwrap_or(i64::MAX),
    );
    if count <= by && !oid.is_root() {
        queue.push(batch, kv::oid_key(oid));
    }
}

/// Drops one use of a pickle; the last use deletes it.
fn release_pickle(
    state: &EngineState,
    batch: &mut WriteBatch,
    queue: &mut QueueWriter,
    oid: Oid,
    lrevid: Tid,
) {
    let key = kv::oid_tid_key(oid, lrevid);
    let uses = state.kv.counter(TableId::PickleRefcounts, &key);
    batch.add(TableId::PickleRefcounts, key.clone(), -1);
    if uses <= 1 {
        batch.delete(TableId::Pickles, key.clone());
        batch.delete(TableId::References, key);
        for referent in state.references(oid, lrevid) {
            decref(state, batch, queue, referent, 1);
        }
    }
}

/// Removes every trace of an object.
fn delete_object(
    state: &EngineState,
    batch: &mut WriteBatch,
    queue: &mut QueueWriter,
    oid: Oid,
) -> CoreResult<()> {
    let prefix = kv::oid_key(oid);
    let mut decrements: BTreeMap<Oid, u64> = BTreeMap::new();
    for (key, _) in state.kv.prefix(TableId::PickleRefcounts, &prefix) {
        let lrevid = Tid::new(kv::key_part(key, 1).unwrap_or_default());
        for referent in state.references(oid, lrevid) {
            *decrements.entry(referent).or_default() += 1;
        }
        batch.delete(TableId::PickleRefcounts, key.to_vec());
    }
    for table in [TableId::Pickles, TableId::References, TableId::PackMarks] {
        for (key, _) in state.kv.prefix(table, &prefix) {
            batch.delete(table, key.to_vec());
        }
    }
    for (tid, bytes) in state.revisions(oid) {
        let record = MetadataRecord::decode(oid, bytes)?;
        batch.delete(TableId::Metadata, kv::oid_tid_key(oid, tid));
        forget_txn_oid(state, batch, tid, oid);
        if record.in_version() {
            batch.delete(TableId::CurrentVersions, kv::vid_oid_key(record.vid, oid));
        }
    }
    batch.delete(TableId::Serials, prefix.clone());
    batch.delete(TableId::Refcounts, prefix);
    for (referent, by) in decrements {
        if referent != oid {
            decref(state, batch, queue, referent, by);
        }
    }
    Ok(())
}

fn mark_item(value: &[u8]) -> Option<(Oid, Tid)> {
    Some((
        Oid::new(kv::key_part(value, 0)?),
        Tid::new(kv::key_part(value, 1)?),
    ))
}

/// Marks the revision of `oid` current as of `as_of` and queues what it
/// references.
fn mark(
    state: &EngineState,
    batch: &mut WriteBatch,
    queue: &mut QueueWriter,
    oid: Oid,
    as_of: Tid,
    pack_tid: Tid,
) -> CoreResult<()> {
    let low = kv::oid_tid_key(oid, Tid::ZERO);
    let high = kv::oid_tid_key(oid, as_of);
    let found = state
        .kv
        .range(
            TableId::Metadata,
            Bound::Included(low.as_slice()),
            Bound::Included(high.as_slice()),
        )
        .next_back();
    let Some((key, bytes)) = found else {
        return Ok(());
    };
    let tid = Tid::new(kv::key_part(key, 1).unwrap_or_default());
    let mark_key = kv::oid_tid_key(oid, tid);
    if state.kv.contains(TableId::PackMarks, &mark_key) {
        return Ok(());
    }
    let record = MetadataRecord::decode(oid, bytes)?;
    batch.put(TableId::PackMarks, mark_key, Vec::new());
    if record.in_version() && !record.nvrevid.is_zero() {
        queue.push(batch, kv::oid_tid_key(oid, record.nvrevid));
    }
    if !record.is_tombstone() {
        let child_as_of = tid.max(pack_tid);
        for child in state.references(oid, record.lrevid) {
            queue.push(batch, kv::oid_tid_key(child, child_as_of));
        }
    }
    Ok(())
}

impl FullStorage {
    pub(super) fn pack_storage(&self, pack_time: Tid, gc: bool) -> CoreResult<PackOutcome> {
        self.ensure_writable()?;
        let _running = self.pack_lock.lock();
        self.pack_stop.store(false, Ordering::Release);

        let pending = self.state.lock().pack_state.clone();
        if let Some(pending) = pending {
            info!(
                storage = %self.name,
                pack_tid = pending.pack_tid,
                phase = ?pending.phase,
                "resuming interrupted pack"
            );
            let mut stats = PackStats {
                pack_tid: Tid::new(pending.pack_tid),
                ..PackStats::default()
            };
            if self.run_pack(pending, &mut stats)? == PackOutcome::Stopped {
                return Ok(PackOutcome::Stopped);
            }
        }

        let pack_state = {
            // no commit may be in flight while the cutoff is chosen
            let _gate = self.gate.maintenance();
            let mut state = self.state.lock();
            let pack_tid = pack_time.min(state.last_tid).max(state.pack_tid);
            let pack_state = PackState {
                pack_tid: pack_tid.as_u64(),
                gc,
                phase: PackPhase::Prune,
                seeded: false,
                sweep_cursor: None,
            };
            let mut batch = WriteBatch::new();
            batch.put(TableId::Info, info::PACK_TID, encode_u64(pack_tid.as_u64()));
            batch.put(TableId::Info, info::PACK_STATE, to_cbor(&pack_state)?);
            state.kv.commit(batch)?;
            state.pack_tid = pack_tid;
            state.pack_state = Some(pack_state.clone());
            pack_state
        };
        info!(storage = %self.name, pack_tid = pack_state.pack_tid, gc, "pack started");
        let mut stats = PackStats {
            pack_tid: Tid::new(pack_state.pack_tid),
            ..PackStats::default()
        };
        self.run_pack(pack_state, &mut stats)
    }

    fn run_pack(&self, mut pack: PackState, stats: &mut PackStats) -> CoreResult<PackOutcome> {
        let batch_size = self.config.pack_batch_size.max(1);
        let pack_tid = Tid::new(pack.pack_tid);
        loop {
            if self.pack_stop.load(Ordering::Acquire) {
                info!(storage = %self.name, phase = ?pack.phase, "pack stopped");
                return Ok(PackOutcome::Stopped);
            }
            let mut state = self.state.lock();
            let phase_done = match pack.phase {
                PackPhase::Prune => prune_step(&mut state, pack_tid, batch_size, stats)?,
                PackPhase::Collect => collect_step(&mut state, pack_tid, batch_size, stats)?,
                PackPhase::Mark => mark_step(&mut state, &mut pack, batch_size)?,
                PackPhase::Sweep => sweep_step(&mut state, &mut pack, batch_size, stats)?,
                PackPhase::Cleanup => cleanup_step(&mut state, batch_size)?,
            };
            if !phase_done {
                continue;
            }
            let next = match pack.phase {
                PackPhase::Prune => Some(PackPhase::Collect),
                PackPhase::Collect if pack.gc => Some(PackPhase::Mark),
                PackPhase::Collect | PackPhase::Sweep => Some(PackPhase::Cleanup),
                PackPhase::Mark => Some(PackPhase::Sweep),
                PackPhase::Cleanup => None,
            };
            let Some(next) = next else {
                let mut batch = WriteBatch::new();
                batch.delete(TableId::Info, info::PACK_STATE);
                state.kv.commit(batch)?;
                state.pack_state = None;
                info!(
                    storage = %self.name,
                    pack_tid = %stats.pack_tid,
                    revisions_removed = stats.revisions_removed,
                    objects_removed = stats.objects_removed,
                    "pack finished"
                );
                return Ok(PackOutcome::Completed(*stats));
            };
            debug!(storage = %self.name, from = ?pack.phase, to = ?next, "pack phase done");
            pack.phase = next;
            save_progress(&mut state, &pack)?;
        }
    }

    /// Queues the objects of a just-finished commit for marking while a
    /// pack is traversing the reference graph.
    pub(super) fn note_pack_progress(
        &self,
        state: &mut EngineState,
        tpc: &TpcState,
    ) -> CoreResult<()> {
        let traversing = state.pack_state.as_ref().is_some_and(|p| {
            (p.phase == PackPhase::Mark && p.seeded) || p.phase == PackPhase::Sweep
        });
        if !traversing || tpc.staged.is_empty() {
            return Ok(());
        }
        let mut queue = QueueWriter::new(state, TableId::OidQueue);
        let mut batch = WriteBatch::new();
        for oid in tpc.staged.keys() {
            queue.push(&mut batch, kv::oid_tid_key(*oid, tpc.tid));
        }
        state.kv.commit_relaxed(batch)?;
        Ok(())
    }
}

fn save_progress(state: &mut EngineState, pack: &PackState) -> CoreResult<()> {
    let mut batch = WriteBatch::new();
    batch.put(TableId::Info, info::PACK_STATE, to_cbor(pack)?);
    state.kv.commit_relaxed(batch)?;
    state.pack_state = Some(pack.clone());
    Ok(())
}

fn prune_step(
    state: &mut EngineState,
    pack_tid: Tid,
    batch_size: usize,
    stats: &mut PackStats,
) -> CoreResult<bool> {
    let upper = pack_tid.as_u64().checked_add(1).map(|t| kv::key(&[t]));
    let end = match &upper {
        Some(key) => Bound::Excluded(key.as_slice()),
        None => Bound::Unbounded,
    };
    let keys: Vec<Vec<u8>> = state
        .kv
        .range(TableId::ObjRevs, Bound::Unbounded, end)
        .take(batch_size)
        .map(|(k, _)| k.to_vec())
        .collect();
    if keys.is_empty() {
        return Ok(true);
    }
    for key in keys {
        let mut batch = WriteBatch::new();
        batch.delete(TableId::ObjRevs, key.clone());
        if let (Some(oid), Some(revid)) = (kv::key_part(&key, 1), kv::key_part(&key, 2)) {
            let (oid, revid) = (Oid::new(oid), Tid::new(revid));
            let current = state.current(oid)?.map(|(tid, _)| tid);
            if let Some(record) = state.metadata(oid, revid)?.filter(|_| current != Some(revid)) {
                let mut queue = QueueWriter::new(state, TableId::DelQueue);
                batch.delete(TableId::Metadata, kv::oid_tid_key(oid, revid));
                forget_txn_oid(state, &mut batch, revid, oid);
                if !record.is_tombstone() {
                    release_pickle(state, &mut batch, &mut queue, oid, record.lrevid);
                }
                stats.revisions_removed += 1;
            }
        }
        state.kv.commit_relaxed(batch)?;
    }
    Ok(false)
}

fn collect_step(
    state: &mut EngineState,
    pack_tid: Tid,
    batch_size: usize,
    stats: &mut PackStats,
) -> CoreResult<bool> {
    let items = head(state, TableId::DelQueue, batch_size);
    if items.is_empty() {
        return Ok(true);
    }
    for (key, value) in items {
        let mut batch = WriteBatch::new();
        batch.delete(TableId::DelQueue, key);
        let oid = Oid::new(kv::decode_u64(&value));
        let unreferenced = state.kv.counter(TableId::Refcounts, &kv::oid_key(oid)) == 0;
        if unreferenced
            && !oid.is_root()
            && !state.is_pending(oid)
            && state.kv.contains(TableId::Serials, &kv::oid_key(oid))
            && !has_revision_after(state, oid, pack_tid)
        {
            let mut queue = QueueWriter::new(state, TableId::DelQueue);
            delete_object(state, &mut batch, &mut queue, oid)?;
            stats.objects_removed += 1;
            debug!(%oid, "unreferenced object removed");
        }
        state.kv.commit_relaxed(batch)?;
    }
    Ok(false)
}

/// Marks up to `batch_size` queued revisions. Returns true once the queue
/// is empty.
fn drain_marks(state: &mut EngineState, pack_tid: Tid, batch_size: usize) -> CoreResult<bool> {
    let items = head(state, TableId::OidQueue, batch_size);
    if items.is_empty() {
        return Ok(true);
    }
    for (key, value) in items {
        let mut batch = WriteBatch::new();
        batch.delete(TableId::OidQueue, key);
        if let Some((oid, as_of)) = mark_item(&value) {
            let mut queue = QueueWriter::new(state, TableId::OidQueue);
            mark(state, &mut batch, &mut queue, oid, as_of, pack_tid)?;
        }
        state.kv.commit_relaxed(batch)?;
    }
    Ok(false)
}

fn mark_step(state: &mut EngineState, pack: &mut PackState, batch_size: usize) -> CoreResult<bool> {
    let pack_tid = Tid::new(pack.pack_tid);
    if !pack.seeded {
        // roots: the root object as of pack time, and every later revision
        let mut queue = QueueWriter::new(state, TableId::OidQueue);
        let mut batch = WriteBatch::new();
        queue.push(&mut batch, kv::oid_tid_key(Oid::ROOT, pack_tid));
        let start = pack_tid.as_u64().checked_add(1).map(|t| kv::key(&[t]));
        if let Some(start) = start {
            for (key, _) in state.kv.range(
                TableId::TxnOids,
                Bound::Included(start.as_slice()),
                Bound::Unbounded,
            ) {
                if let (Some(tid), Some(oid)) = (kv::key_part(key, 0), kv::key_part(key, 1)) {
                    queue.push(&mut batch, kv::oid_tid_key(Oid::new(oid), Tid::new(tid)));
                }
            }
        }
        pack.seeded = true;
        batch.put(TableId::Info, info::PACK_STATE, to_cbor(&*pack)?);
        state.kv.commit_relaxed(batch)?;
        state.pack_state = Some(pack.clone());
        return Ok(false);
    }
    drain_marks(state, pack_tid, batch_size)
}

fn sweep_step(
    state: &mut EngineState,
    pack: &mut PackState,
    batch_size: usize,
    stats: &mut PackStats,
) -> CoreResult<bool> {
    let pack_tid = Tid::new(pack.pack_tid);
    // objects committed during the sweep are marked before anything else goes
    if !drain_marks(state, pack_tid, batch_size)? {
        return Ok(false);
    }
    let after = pack.sweep_cursor.map(|oid| kv::key(&[oid]));
    let start = match &after {
        Some(key) => Bound::Excluded(key.as_slice()),
        None => Bound::Unbounded,
    };
    let oids: Vec<Oid> = state
        .kv
        .range(TableId::Serials, start, Bound::Unbounded)
        .take(batch_size)
        .filter_map(|(k, _)| kv::key_part(k, 0).map(Oid::new))
        .collect();
    let Some(last) = oids.last().copied() else {
        return Ok(true);
    };
    for oid in oids {
        if oid.is_root()
            || state.is_pending(oid)
            || is_marked(state, oid)
            || has_revision_after(state, oid, pack_tid)
        {
            continue;
        }
        let mut batch = WriteBatch::new();
        let mut queue = QueueWriter::new(state, TableId::DelQueue);
        delete_object(state, &mut batch, &mut queue, oid)?;
        state.kv.commit_relaxed(batch)?;
        stats.objects_removed += 1;
        debug!(%oid, "unreachable object removed");
    }
    pack.sweep_cursor = Some(last.as_u64());
    save_progress(state, pack)?;
    Ok(false)
}

fn cleanup_step(state: &mut EngineState, batch_size: usize) -> CoreResult<bool> {
    let mut batch = WriteBatch::new();
    for table in [TableId::PackMarks, TableId::OidQueue, TableId::DelQueue] {
        for (key, _) in head(state, table, batch_size) {
            batch.delete(table, key);
        }
    }
    if batch.is_empty() {
        return Ok(true);
    }
    state.kv.commit_relaxed(batch)?;
    Ok(false)
}
