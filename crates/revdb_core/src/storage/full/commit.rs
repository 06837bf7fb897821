//! Two-phase commit and stores.

use super::records::{info, to_cbor, TxnRecord};
use super::{EngineState, FinishedTxn, FullStorage, GateOwner, MetadataRecord};
use crate::error::{CoreError, CoreResult};
use crate::kv::{self, encode_u64, PreparedBatch, TableId, WriteBatch};
use crate::storage::StoreOutcome;
use crate::transaction::Transaction;
use crate::types::{Oid, Tid, VersionId};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Committed transactions remembered for participants that finish late.
const MAX_UNFINISHED: usize = 64;

/// Where a staged revision gets its pickle from.
#[derive(Debug, Clone)]
pub(crate) enum StagedPickle {
    /// Fresh pickle written by this revision.
    New { data: Vec<u8>, refs: Vec<Oid> },
    /// Reuses the pickle of an older revision.
    Existing(Tid),
    /// Marks the object deleted.
    Tombstone,
}

/// A revision waiting for the commit to finish.
#[derive(Debug, Clone)]
pub(crate) struct StagedRevision {
    pub vid: VersionId,
    pub nvrevid: Tid,
    pub pickle: StagedPickle,
    /// Current revision when the first revision of the object was staged.
    pub prevrevid: Tid,
    /// Version of that revision.
    pub replaces_vid: VersionId,
    /// Revisions that stop being current when this one commits.
    pub obsoletes: Vec<Tid>,
}

/// A transaction between `tpc_begin` and `tpc_finish`.
#[derive(Debug)]
pub(crate) struct TpcState {
    pub txn: u64,
    pub tid: Tid,
    pub staged: BTreeMap<Oid, StagedRevision>,
    /// Versions first written by this transaction.
    pub new_versions: BTreeMap<String, VersionId>,
    pub prepared: Option<PreparedBatch>,
    pub voted: bool,
    /// Jars that called `tpc_begin` for this transaction.
    pub participants: usize,
}

impl EngineState {
    pub(crate) fn tpc_for(&mut self, txn: &Transaction) -> CoreResult<&mut TpcState> {
        match self.tpc.as_mut() {
            Some(tpc) if tpc.txn == txn.id() => Ok(tpc),
            _ => Err(CoreError::storage_system(format!(
                "transaction {} is not committing on this storage",
                txn.id()
            ))),
        }
    }

    /// Resolves a version name to a vid, allocating one for new versions.
    pub(crate) fn vid_for_write(&mut self, version: &str) -> CoreResult<VersionId> {
        if let Some(vid) = self.vid_of(version) {
            return Ok(vid);
        }
        let next = VersionId::new(self.last_vid + 1);
        let tpc = self
            .tpc
            .as_mut()
            .ok_or_else(|| CoreError::storage_system("no commit in progress"))?;
        let vid = *tpc.new_versions.entry(version.to_string()).or_insert(next);
        if vid == next {
            self.last_vid += 1;
        }
        Ok(vid)
    }

    /// Stages `revision` for `oid`, replacing an earlier staging of the same
    /// object in this transaction.
    pub(crate) fn stage(&mut self, oid: Oid, mut revision: StagedRevision) -> CoreResult<Tid> {
        let tpc = self
            .tpc
            .as_mut()
            .ok_or_else(|| CoreError::storage_system("no commit in progress"))?;
        if let Some(earlier) = tpc.staged.get(&oid) {
            revision.prevrevid = earlier.prevrevid;
            revision.replaces_vid = earlier.replaces_vid;
            revision.obsoletes.clone_from(&earlier.obsoletes);
        }
        tpc.staged.insert(oid, revision);
        Ok(tpc.tid)
    }
}

/// Revisions that stop being current when a revision in `new_vid` replaces
/// `current`.
pub(crate) fn obsoleted_by(current: Option<(Tid, MetadataRecord)>, new_vid: VersionId) -> Vec<Tid> {
    let Some((tid, record)) = current else {
        return Vec::new();
    };
    if new_vid.is_non_version() {
        let mut out = vec![tid];
        if record.in_version() && !record.nvrevid.is_zero() {
            out.push(record.nvrevid);
        }
        out
    } else if record.in_version() {
        vec![tid]
    } else {
        Vec::new()
    }
}

impl FullStorage {
    pub(super) fn begin_commit(&self, txn: &Transaction, at: Option<Tid>) -> CoreResult<()> {
        self.ensure_writable()?;
        let owner = GateOwner::Txn(txn.id());
        if !self.gate.enter(owner) {
            // another participant of the same transaction
            if let Some(tpc) = self.state.lock().tpc.as_mut().filter(|t| t.txn == txn.id()) {
                tpc.participants += 1;
            }
            return Ok(());
        }
        let mut state = self.state.lock();
        if self.closed.load(std::sync::atomic::Ordering::Acquire) {
            drop(state);
            self.gate.leave(owner);
            return Err(CoreError::StorageClosed);
        }
        let tid = match at {
            Some(tid) if tid <= state.last_tid => {
                drop(state);
                self.gate.leave(owner);
                return Err(CoreError::invalid_operation(format!(
                    "commit tid {tid} is not after the last commit"
                )));
            }
            Some(tid) => tid,
            None => state.last_tid.successor(),
        };
        debug!(storage = %self.name, txn = txn.id(), %tid, "commit begun");
        state.tpc = Some(TpcState {
            txn: txn.id(),
            tid,
            staged: BTreeMap::new(),
            new_versions: BTreeMap::new(),
            prepared: None,
            voted: false,
            participants: 1,
        });
        Ok(())
    }

    pub(super) fn store_revision(
        &self,
        oid: Oid,
        expected: Tid,
        data: &[u8],
        refs: &[Oid],
        version: &str,
        txn: &Transaction,
    ) -> CoreResult<StoreOutcome> {
        self.ensure_writable()?;
        let resolver = self.resolver();
        let mut state = self.state.lock();
        let tpc = state.tpc_for(txn)?;
        if tpc.voted {
            return Err(CoreError::storage_system("store after vote"));
        }
        let restaged_at = tpc.staged.contains_key(&oid).then_some(tpc.tid);

        let current = state.current(oid)?;
        let vid = state.vid_for_write(version)?;
        if let Some((_, record)) = current {
            if record.in_version() && record.vid != vid {
                return Err(CoreError::VersionLock {
                    oid,
                    locked_in: state.version_name(record.vid),
                });
            }
        }

        let mut pickle = StagedPickle::New {
            data: data.to_vec(),
            refs: normalize(refs),
        };
        let mut resolved = false;
        let committed_tid = current.map_or(Tid::ZERO, |(tid, _)| tid);
        // A second store in the same commit may be based on the first one.
        let expected = match restaged_at {
            Some(pending) if expected == pending => committed_tid,
            _ => expected,
        };
        if committed_tid != expected {
            let Some((_, record)) = current.filter(|(_, r)| !r.is_tombstone()) else {
                return Err(CoreError::WriteConflict {
                    oid,
                    expected,
                    current: current.map(|(tid, _)| tid),
                });
            };
            let committed = state.pickle(oid, record.lrevid)?;
            let old = if expected.is_zero() {
                None
            } else {
                state.load_serial(oid, expected).ok()
            };
            let merged = resolver
                .as_ref()
                .and_then(|r| r.resolve(oid, old.as_deref(), &committed, data));
            let Some(merged) = merged else {
                return Err(CoreError::WriteConflict {
                    oid,
                    expected,
                    current: Some(committed_tid),
                });
            };
            debug!(%oid, %expected, current = %committed_tid, "write conflict resolved");
            pickle = StagedPickle::New {
                data: merged.data,
                refs: normalize(&merged.refs),
            };
            resolved = true;
        }

        let nvrevid = match current {
            _ if vid.is_non_version() => Tid::ZERO,
            Some((_, record)) if record.vid == vid => record.nvrevid,
            Some((tid, record)) if !record.is_tombstone() => tid,
            _ => Tid::ZERO,
        };
        let tid = state.stage(
            oid,
            StagedRevision {
                vid,
                nvrevid,
                pickle,
                prevrevid: committed_tid,
                replaces_vid: current.map_or(VersionId::NON_VERSION, |(_, r)| r.vid),
                obsoletes: obsoleted_by(current, vid),
            },
        )?;
        Ok(if resolved {
            StoreOutcome::Resolved(tid)
        } else {
            StoreOutcome::Stored(tid)
        })
    }

    pub(super) fn vote(&self, txn: &Transaction) -> CoreResult<()> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if state.finished.contains_key(&txn.id()) {
            return Ok(());
        }
        if state.tpc_for(txn)?.voted {
            return Ok(());
        }
        let batch = build_commit_batch(&state, txn)?;
        let prepared = state.kv.prepare(batch)?;
        let tpc = state.tpc_for(txn)?;
        tpc.prepared = Some(prepared);
        tpc.voted = true;
        Ok(())
    }

    pub(super) fn finish(
        &self,
        txn: &Transaction,
        callback: &mut dyn FnMut(Tid, &[Oid]),
    ) -> CoreResult<Tid> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        if let Some(done) = state.finished.get_mut(&txn.id()) {
            // the first participant committed for everyone
            let tid = done.tid;
            done.waiting = done.waiting.saturating_sub(1);
            if done.waiting == 0 {
                state.finished.remove(&txn.id());
            }
            return Ok(tid);
        }
        if !state.tpc_for(txn)?.voted {
            let batch = build_commit_batch(&state, txn)?;
            let prepared = state.kv.prepare(batch)?;
            let tpc = state.tpc_for(txn)?;
            tpc.prepared = Some(prepared);
            tpc.voted = true;
        }

        let mut tpc = state
            .tpc
            .take()
            .ok_or_else(|| CoreError::storage_system("no commit in progress"))?;
        if let Some(prepared) = tpc.prepared.take() {
            if let Err(e) = state.kv.commit_prepared(prepared) {
                // the journal is in an unknown state; refuse further work
                self.closed.store(true, std::sync::atomic::Ordering::Release);
                self.gate.leave(GateOwner::Txn(tpc.txn));
                return Err(e);
            }
        }
        let oids: Vec<Oid> = tpc.staged.keys().copied().collect();
        callback(tpc.tid, &oids);
        state.last_tid = tpc.tid;
        if tpc.participants > 1 {
            if state.finished.len() >= MAX_UNFINISHED {
                // participants that never finish must not pin entries forever
                state.finished.pop_first();
            }
            state.finished.insert(
                tpc.txn,
                FinishedTxn {
                    tid: tpc.tid,
                    waiting: tpc.participants - 1,
                },
            );
        }
        if let Err(e) = self.note_pack_progress(&mut state, &tpc) {
            warn!(error = %e, "could not queue committed objects for the running pack");
        }
        debug!(
            storage = %self.name,
            tid = %tpc.tid,
            objects = tpc.staged.len(),
            "commit finished"
        );
        drop(state);
        self.gate.leave(GateOwner::Txn(tpc.txn));
        Ok(tpc.tid)
    }

    pub(super) fn abort(&self, txn: &Transaction) -> CoreResult<()> {
        let mut state = self.state.lock();
        let tpc = match state.tpc.take() {
            Some(tpc) if tpc.txn == txn.id() => tpc,
            other => {
                state.tpc = other;
                return Ok(());
            }
        };
        state.last_vid -= tpc.new_versions.len() as u64;
        let result = match tpc.prepared {
            Some(prepared) => state.kv.abort_prepared(prepared),
            None => Ok(()),
        };
        debug!(storage = %self.name, txn = tpc.txn, "commit aborted");
        drop(state);
        self.gate.leave(GateOwner::Txn(tpc.txn));
        result
    }
}

pub(crate) fn normalize(refs: &[Oid]) -> Vec<Oid> {
    refs.iter().copied().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Builds the batch that writes every staged revision of the transaction.
fn build_commit_batch(state: &EngineState, txn: &Transaction) -> CoreResult<WriteBatch> {
    let tpc = state
        .tpc
        .as_ref()
        .ok_or_else(|| CoreError::storage_system("no commit in progress"))?;
    let tid = tpc.tid;
    let mut batch = WriteBatch::new();

    for (&oid, revision) in &tpc.staged {
        let lrevid = match &revision.pickle {
            StagedPickle::New { data, refs } => {
                let pickle_key = kv::oid_tid_key(oid, tid);
                batch.put(TableId::Pickles, pickle_key.clone(), data.clone());
                if !refs.is_empty() {
                    batch.put(TableId::References, pickle_key, kv::encode_oids(refs));
                    for referent in refs {
                        batch.add(TableId::Refcounts, kv::oid_key(*referent), 1);
                    }
                }
                tid
            }
            StagedPickle::Existing(lrevid) => *lrevid,
            StagedPickle::Tombstone => Tid::ZERO,
        };
        if !lrevid.is_zero() {
            batch.add(TableId::PickleRefcounts, kv::oid_tid_key(oid, lrevid), 1);
        }

        let record = MetadataRecord {
            vid: revision.vid,
            nvrevid: revision.nvrevid,
            lrevid,
            prevrevid: revision.prevrevid,
        };
        batch.put(TableId::Metadata, kv::oid_tid_key(oid, tid), record.encode());
        batch.put(TableId::Serials, kv::oid_key(oid), encode_u64(tid.as_u64()));
        batch.put(TableId::TxnOids, kv::tid_oid_key(tid, oid), Vec::new());
        for obsolete in &revision.obsoletes {
            batch.put(
                TableId::ObjRevs,
                kv::key(&[tid.as_u64(), oid.as_u64(), obsolete.as_u64()]),
                Vec::new(),
            );
        }
        if !revision.replaces_vid.is_non_version() && revision.replaces_vid != revision.vid {
            batch.delete(
                TableId::CurrentVersions,
                kv::vid_oid_key(revision.replaces_vid, oid),
            );
        }
        if !revision.vid.is_non_version() {
            batch.put(
                TableId::CurrentVersions,
                kv::vid_oid_key(revision.vid, oid),
                Vec::new(),
            );
        }
    }

    for (name, vid) in &tpc.new_versions {
        batch.put(TableId::Vids, name.as_bytes().to_vec(), encode_u64(vid.as_u64()));
        batch.put(TableId::Versions, encode_u64(vid.as_u64()), name.as_bytes().to_vec());
    }
    if !tpc.staged.is_empty() {
        let record = TxnRecord {
            user: txn.user(),
            description: txn.description(),
            extension: txn.extension(),
        };
        batch.put(TableId::TxnMetadata, tid.to_bytes().to_vec(), to_cbor(&record)?);
    }
    batch.put(TableId::Info, info::LAST_TID, encode_u64(tid.as_u64()));
    batch.put(TableId::Info, info::LAST_VID, encode_u64(state.last_vid));
    Ok(batch)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::conflict::{FnResolver, ResolvedState};
    use crate::error::CoreError;
    use crate::storage::{Storage, StoreOutcome};
    use crate::transaction::TransactionManager;
    use crate::types::{Oid, Tid};
    use std::sync::Arc;

    #[test]
    fn stale_serial_is_a_write_conflict() {
        let storage = storage();
        let oid = storage.new_oid().unwrap();
        commit_at(&storage, 100, &[(oid, 0, b"v1", &[])]).unwrap();
        commit_at(&storage, 200, &[(oid, 100, b"v2", &[])]).unwrap();

        let err = commit_at(&storage, 300, &[(oid, 100, b"v3", &[])]).unwrap_err();
        assert!(matches!(
            err,
            CoreError::WriteConflict { expected, current: Some(current), .. }
                if expected == Tid::new(100) && current == Tid::new(200)
        ));
        assert_eq!(storage.load(oid, "").unwrap().0, b"v2");
    }

    #[test]
    fn resolver_merges_conflicting_store() {
        let storage = storage();
        storage.set_conflict_resolver(Arc::new(FnResolver(
            |_: Oid, old: Option<&[u8]>, committed: &[u8], new: &[u8]| {
                assert_eq!(old, Some(&b"v1"[..]));
                let mut data = committed.to_vec();
                data.extend_from_slice(new);
                Some(ResolvedState {
                    data,
                    refs: Vec::new(),
                })
            },
        )));
        let oid = storage.new_oid().unwrap();
        commit_at(&storage, 100, &[(oid, 0, b"v1", &[])]).unwrap();
        commit_at(&storage, 200, &[(oid, 100, b"v2", &[])]).unwrap();

        let txn = TransactionManager::new().begin();
        storage.tpc_begin(&txn).unwrap();
        let outcome = storage
            .store(oid, Tid::new(100), b"v3", &[], "", &txn)
            .unwrap();
        assert!(matches!(outcome, StoreOutcome::Resolved(tid) if tid > Tid::new(200)));
        storage.tpc_vote(&txn).unwrap();
        let tid = storage.tpc_finish(&txn, &mut |_, _| {}).unwrap();
        assert_eq!(storage.load(oid, "").unwrap(), (b"v2v3".to_vec(), tid));
    }

    #[test]
    fn aborted_commit_leaves_no_trace() {
        let storage = storage();
        let oid = storage.new_oid().unwrap();
        let txn = TransactionManager::new().begin();
        storage.tpc_begin(&txn).unwrap();
        storage.store(oid, Tid::ZERO, b"gone", &[], "", &txn).unwrap();
        storage.tpc_vote(&txn).unwrap();
        storage.tpc_abort(&txn).unwrap();
        storage.tpc_abort(&txn).unwrap();

        assert!(storage.load(oid, "").is_err());
        assert_eq!(storage.last_transaction(), Tid::ZERO);
        assert!(storage.pending_tid(&txn).is_none());
    }

    #[test]
    fn finish_runs_callback_with_commit_tid() {
        let storage = storage();
        let oid = storage.new_oid().unwrap();
        let txn = TransactionManager::new().begin();
        storage.tpc_begin(&txn).unwrap();
        storage.tpc_begin(&txn).unwrap();
        let pending = storage.pending_tid(&txn).unwrap();
        storage.store(oid, Tid::ZERO, b"x", &[], "", &txn).unwrap();
        let mut seen = None;
        let tid = storage
            .tpc_finish(&txn, &mut |tid, oids| seen = Some((tid, oids.to_vec())))
            .unwrap();
        assert_eq!(seen, Some((tid, vec![oid])));
        assert_eq!(tid, pending);

        // a second participant on the same storage learns the same tid
        let mut again = false;
        storage.tpc_vote(&txn).unwrap();
        let second = storage.tpc_finish(&txn, &mut |_, _| again = true).unwrap();
        assert_eq!(second, tid);
        assert!(!again);
    }

    #[test]
    fn late_participant_finishes_after_another_commit() {
        let storage = storage();
        let a = storage.new_oid().unwrap();
        let b = storage.new_oid().unwrap();
        let c = storage.new_oid().unwrap();

        // two jars of one transaction, finished one at a time
        let first = TransactionManager::new().begin();
        storage.tpc_begin(&first).unwrap();
        storage.tpc_begin(&first).unwrap();
        storage.store(a, Tid::ZERO, b"a", &[], "", &first).unwrap();
        storage.store(b, Tid::ZERO, b"b", &[], "", &first).unwrap();
        storage.tpc_vote(&first).unwrap();
        storage.tpc_vote(&first).unwrap();
        let mut written = Vec::new();
        let tid = storage
            .tpc_finish(&first, &mut |_, oids| written.extend_from_slice(oids))
            .unwrap();
        assert_eq!(written, vec![a, b]);

        let other = TransactionManager::new().begin();
        storage.tpc_begin(&other).unwrap();
        storage.store(c, Tid::ZERO, b"c", &[], "", &other).unwrap();
        storage.tpc_vote(&other).unwrap();
        let other_tid = storage.tpc_finish(&other, &mut |_, _| {}).unwrap();
        assert!(other_tid > tid);

        assert_eq!(storage.tpc_finish(&first, &mut |_, _| {}).unwrap(), tid);
        assert_eq!(storage.load(b, "").unwrap(), (b"b".to_vec(), tid));
        assert!(storage.state.lock().finished.is_empty());
    }

    #[test]
    fn explicit_commit_tid_must_advance() {
        let storage = storage();
        let oid = storage.new_oid().unwrap();
        commit_at(&storage, 100, &[(oid, 0, b"v1", &[])]).unwrap();
        let txn = TransactionManager::new().begin();
        assert!(storage.tpc_begin_at(&txn, Tid::new(100)).is_err());
        // the failed begin released the gate
        commit_at(&storage, 101, &[(oid, 100, b"v2", &[])]).unwrap();
    }

    #[test]
    fn store_requires_a_begun_commit() {
        let storage = storage();
        let txn = TransactionManager::new().begin();
        let result = storage.store(Oid::new(1), Tid::ZERO, b"x", &[], "", &txn);
        assert!(matches!(result, Err(CoreError::StorageSystem { .. })));
    }

    #[test]
    fn second_store_may_build_on_the_first() {
        let storage = storage();
        let oid = storage.new_oid().unwrap();
        commit_at(&storage, 100, &[(oid, 0, b"v1", &[])]).unwrap();

        let tid = commit_at(&storage, 200, &[(oid, 100, b"v2", &[]), (oid, 200, b"v3", &[])]).unwrap();
        assert_eq!(storage.load(oid, "").unwrap(), (b"v3".to_vec(), tid));
        assert_eq!(storage.load_before(oid, tid).unwrap().unwrap().data, b"v1");
    }

    #[test]
    fn creating_an_existing_object_conflicts() {
        let storage = storage();
        let oid = storage.new_oid().unwrap();
        commit_at(&storage, 100, &[(oid, 0, b"first", &[])]).unwrap();
        let err = commit_at(&storage, 200, &[(oid, 0, b"second", &[])]).unwrap_err();
        assert!(err.is_conflict());
    }
}
