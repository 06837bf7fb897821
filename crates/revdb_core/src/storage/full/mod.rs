//! The durable multi-revision storage engine.
//!
//! [`FullStorage`] keeps every revision of every object in the journaled
//! tables of [`crate::kv`]. A revision is a [`MetadataRecord`] keyed by
//! `(oid, tid)` plus, unless it reuses an older revision's pickle, the
//! pickle bytes and the list of objects the pickle references.
//!
//! All table access happens under one storage lock, taken per call. A
//! separate commit gate admits one transaction at a time between
//! `tpc_begin` and `tpc_finish`; pack takes the gate only while it picks
//! its cutoff, and then works in short lock cycles.

mod commit;
mod pack;
mod records;
mod undo;
mod versions;

pub use records::MetadataRecord;

use crate::config::StorageConfig;
use crate::conflict::ConflictResolver;
use crate::dir::{StorageDir, StorageFiles};
use crate::error::{CoreError, CoreResult};
use crate::kv::{self, decode_u64, encode_u64, KvOptions, KvStore, TableId, WriteBatch};
use crate::storage::{
    LoadedRevision, PackOutcome, RevisionInfo, Storage, StoreOutcome, TransactionDescription,
    UndoFilter,
};
use crate::transaction::Transaction;
use crate::types::{Oid, Tid, VersionId};
use commit::TpcState;
use parking_lot::{Condvar, Mutex, RwLock};
use records::{from_cbor, info, PackState};
use revdb_storage::InMemoryBackend;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Oids reserved durably at a time by `new_oid`.
const OID_BLOCK: u64 = 64;

/// Holder of the commit gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateOwner {
    Txn(u64),
    Maintenance,
}

/// Admits one committer at a time.
#[derive(Debug, Default)]
struct CommitGate {
    owner: Mutex<Option<GateOwner>>,
    released: Condvar,
}

impl CommitGate {
    /// Waits for the gate. Returns false if `owner` already holds it.
    fn enter(&self, owner: GateOwner) -> bool {
        let mut current = self.owner.lock();
        loop {
            match *current {
                None => {
                    *current = Some(owner);
                    return true;
                }
                Some(held) if held == owner && matches!(owner, GateOwner::Txn(_)) => {
                    return false;
                }
                Some(_) => self.released.wait(&mut current),
            }
        }
    }

    fn leave(&self, owner: GateOwner) {
        let mut current = self.owner.lock();
        if *current == Some(owner) {
            *current = None;
            self.released.notify_all();
        }
    }

    fn maintenance(&self) -> MaintenanceGuard<'_> {
        self.enter(GateOwner::Maintenance);
        MaintenanceGuard(self)
    }
}

struct MaintenanceGuard<'a>(&'a CommitGate);

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        self.0.leave(GateOwner::Maintenance);
    }
}

/// Everything guarded by the storage lock.
pub(crate) struct EngineState {
    pub(crate) kv: KvStore,
    pub(crate) last_oid: u64,
    /// Highest oid reserved in the info table; a reopened storage
    /// allocates above it.
    pub(crate) oid_ceiling: u64,
    pub(crate) last_tid: Tid,
    pub(crate) last_vid: u64,
    pub(crate) pack_tid: Tid,
    pub(crate) pack_state: Option<PackState>,
    pub(crate) tpc: Option<TpcState>,
    /// Committed transactions whose other participants have yet to call
    /// `tpc_finish`, by transaction id.
    pub(crate) finished: BTreeMap<u64, FinishedTxn>,
}

/// A committed transaction still waiting on participants.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FinishedTxn {
    pub tid: Tid,
    /// Participants that began the commit but have not finished it.
    pub waiting: usize,
}

impl EngineState {
    fn recover(kv: KvStore) -> CoreResult<Self> {
        let scalar = |name: &[u8]| kv.get(TableId::Info, name).map_or(0, decode_u64);
        let pack_state = kv
            .get(TableId::Info, info::PACK_STATE)
            .map(from_cbor::<PackState>)
            .transpose()?;
        let oid_ceiling = scalar(info::LAST_OID);
        Ok(Self {
            last_oid: oid_ceiling,
            oid_ceiling,
            last_tid: Tid::new(scalar(info::LAST_TID)),
            last_vid: scalar(info::LAST_VID),
            pack_tid: Tid::new(scalar(info::PACK_TID)),
            pack_state,
            tpc: None,
            finished: BTreeMap::new(),
            kv,
        })
    }

    /// Tid and metadata of the current revision.
    pub(crate) fn current(&self, oid: Oid) -> CoreResult<Option<(Tid, MetadataRecord)>> {
        let Some(serial) = self.kv.get(TableId::Serials, &kv::oid_key(oid)) else {
            return Ok(None);
        };
        let tid = Tid::new(decode_u64(serial));
        match self.metadata(oid, tid)? {
            Some(record) => Ok(Some((tid, record))),
            None => Err(CoreError::storage_system(format!(
                "{oid} has serial {tid} but no metadata"
            ))),
        }
    }

    pub(crate) fn metadata(&self, oid: Oid, tid: Tid) -> CoreResult<Option<MetadataRecord>> {
        self.kv
            .get(TableId::Metadata, &kv::oid_tid_key(oid, tid))
            .map(|bytes| MetadataRecord::decode(oid, bytes))
            .transpose()
    }

    /// All revisions of an object, oldest first.
    pub(crate) fn revisions(
        &self,
        oid: Oid,
    ) -> impl DoubleEndedIterator<Item = (Tid, &[u8])> + '_ {
        self.kv
            .prefix(TableId::Metadata, &kv::oid_key(oid))
            .map(|(k, v)| (Tid::new(kv::key_part(k, 1).unwrap_or_default()), v))
    }

    pub(crate) fn pickle(&self, oid: Oid, lrevid: Tid) -> CoreResult<Vec<u8>> {
        self.kv
            .get(TableId::Pickles, &kv::oid_tid_key(oid, lrevid))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                CoreError::storage_system(format!("pickle {lrevid} of {oid} is missing"))
            })
    }

    pub(crate) fn references(&self, oid: Oid, lrevid: Tid) -> Vec<Oid> {
        self.kv
            .get(TableId::References, &kv::oid_tid_key(oid, lrevid))
            .map(kv::decode_oids)
            .unwrap_or_default()
    }

    pub(crate) fn version_name(&self, vid: VersionId) -> String {
        if vid.is_non_version() {
            return String::new();
        }
        self.kv
            .get(TableId::Versions, &vid.as_u64().to_be_bytes())
            .map(|name| String::from_utf8_lossy(name).into_owned())
            .unwrap_or_default()
    }

    pub(crate) fn vid_of(&self, version: &str) -> Option<VersionId> {
        if version.is_empty() {
            return Some(VersionId::NON_VERSION);
        }
        self.kv
            .get(TableId::Vids, version.as_bytes())
            .map(|v| VersionId::new(decode_u64(v)))
    }

    fn load(&self, oid: Oid, version: &str) -> CoreResult<(Vec<u8>, Tid)> {
        let (tid, record) = self.current(oid)?.ok_or(CoreError::not_found(oid))?;
        let (tid, record) = if record.in_version() && self.version_name(record.vid) != version {
            if record.nvrevid.is_zero() {
                return Err(CoreError::not_found(oid));
            }
            let base = self
                .metadata(oid, record.nvrevid)?
                .ok_or(CoreError::revision_not_found(oid, record.nvrevid))?;
            (record.nvrevid, base)
        } else {
            (tid, record)
        };
        if record.is_tombstone() {
            return Err(CoreError::not_found(oid));
        }
        Ok((self.pickle(oid, record.lrevid)?, tid))
    }

    fn load_before(&self, oid: Oid, tid: Tid) -> CoreResult<Option<LoadedRevision>> {
        let mut start = None;
        for (rev, bytes) in self.revisions(oid).rev() {
            if rev >= tid {
                continue;
            }
            let record = MetadataRecord::decode(oid, bytes)?;
            if !record.in_version() {
                start = Some((rev, record));
                break;
            }
        }
        let Some((start, record)) = start else {
            return Ok(None);
        };
        if record.is_tombstone() {
            return Ok(None);
        }
        let mut end = None;
        for (rev, bytes) in self.revisions(oid) {
            if rev > start && !MetadataRecord::decode(oid, bytes)?.in_version() {
                end = Some(rev);
                break;
            }
        }
        Ok(Some(LoadedRevision {
            data: self.pickle(oid, record.lrevid)?,
            start,
            end,
        }))
    }

    fn load_serial(&self, oid: Oid, serial: Tid) -> CoreResult<Vec<u8>> {
        match self.metadata(oid, serial)? {
            Some(record) if !record.is_tombstone() => self.pickle(oid, record.lrevid),
            _ => Err(CoreError::revision_not_found(oid, serial)),
        }
    }

    pub(crate) fn txn_record(&self, tid: Tid) -> CoreResult<Option<records::TxnRecord>> {
        self.kv
            .get(TableId::TxnMetadata, &tid.to_bytes())
            .map(from_cbor)
            .transpose()
    }

    /// True if the transaction in commit has staged a revision of `oid`.
    pub(crate) fn is_pending(&self, oid: Oid) -> bool {
        self.tpc.as_ref().is_some_and(|tpc| tpc.staged.contains_key(&oid))
    }
}

/// Storage engine keeping every revision, with versions, undo and pack.
pub struct FullStorage {
    name: String,
    config: StorageConfig,
    _dir: Option<StorageDir>,
    state: Mutex<EngineState>,
    gate: CommitGate,
    pack_lock: Mutex<()>,
    pack_stop: AtomicBool,
    closed: AtomicBool,
    resolver: RwLock<Option<Arc<dyn ConflictResolver>>>,
}

impl FullStorage {
    /// Opens or creates a storage in a directory.
    pub fn open(path: impl AsRef<Path>, config: StorageConfig) -> CoreResult<Self> {
        let path = path.as_ref();
        let dir = StorageDir::open(path, config.create_if_missing, config.read_only)?;
        let files = dir.open_files()?;
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| path.display().to_string());
        Self::build(name, files, Some(dir), config)
    }

    /// Creates a volatile storage.
    pub fn open_in_memory(config: StorageConfig) -> CoreResult<Self> {
        let files = StorageFiles {
            journal: Box::new(InMemoryBackend::new()),
            snapshot_a: Box::new(InMemoryBackend::new()),
            snapshot_b: Box::new(InMemoryBackend::new()),
        };
        Self::open_with_files(files, config)
    }

    /// Opens a storage over caller-supplied backends.
    pub fn open_with_files(files: StorageFiles, config: StorageConfig) -> CoreResult<Self> {
        let name = config.name.clone().unwrap_or_else(|| "memory".to_string());
        Self::build(name, files, None, config)
    }

    fn build(
        name: String,
        files: StorageFiles,
        dir: Option<StorageDir>,
        config: StorageConfig,
    ) -> CoreResult<Self> {
        let kv = KvStore::open(
            files.journal,
            files.snapshot_a,
            files.snapshot_b,
            KvOptions {
                sync_on_commit: config.sync_on_commit,
                checkpoint_wal_size: config.checkpoint_wal_size,
                read_only: config.read_only,
            },
        )?;
        let state = EngineState::recover(kv)?;
        info!(
            storage = %name,
            last_tid = %state.last_tid,
            objects = state.kv.len(TableId::Serials),
            pack_pending = state.pack_state.is_some(),
            "storage opened"
        );
        Ok(Self {
            name,
            config,
            _dir: dir,
            state: Mutex::new(state),
            gate: CommitGate::default(),
            pack_lock: Mutex::new(()),
            pack_stop: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            resolver: RwLock::new(None),
        })
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::StorageClosed);
        }
        Ok(())
    }

    fn ensure_writable(&self) -> CoreResult<()> {
        self.ensure_open()?;
        if self.config.read_only {
            return Err(CoreError::ReadOnly);
        }
        Ok(())
    }

    fn resolver(&self) -> Option<Arc<dyn ConflictResolver>> {
        self.resolver.read().clone()
    }

    /// Tid below which undo is refused.
    pub fn pack_time(&self) -> Tid {
        self.state.lock().pack_tid
    }

    /// Number of objects with a current revision (deleted ones included).
    pub fn object_count(&self) -> usize {
        self.state.lock().kv.len(TableId::Serials)
    }

    /// Writes all tables to a snapshot and empties the journal.
    ///
    /// Waits for an in-flight commit to finish first.
    pub fn checkpoint(&self) -> CoreResult<()> {
        self.ensure_writable()?;
        let _gate = self.gate.maintenance();
        self.state.lock().kv.checkpoint()
    }

    /// Begins a commit at an explicit tid, which must be later than every
    /// committed tid.
    pub fn tpc_begin_at(&self, txn: &Transaction, tid: Tid) -> CoreResult<()> {
        self.begin_commit(txn, Some(tid))
    }
}

impl std::fmt::Debug for FullStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullStorage")
            .field("name", &self.name)
            .field("read_only", &self.config.read_only)
            .finish_non_exhaustive()
    }
}

impl Storage for FullStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_read_only(&self) -> bool {
        self.config.read_only
    }

    fn new_oid(&self) -> CoreResult<Oid> {
        self.ensure_writable()?;
        let mut state = self.state.lock();
        let oid = state.last_oid + 1;
        if oid > state.oid_ceiling {
            let ceiling = oid + OID_BLOCK - 1;
            let mut batch = WriteBatch::new();
            batch.put(TableId::Info, info::LAST_OID, encode_u64(ceiling));
            state.kv.commit(batch)?;
            state.oid_ceiling = ceiling;
            debug!(storage = %self.name, ceiling, "oids reserved");
        }
        state.last_oid = oid;
        Ok(Oid::new(oid))
    }

    fn last_transaction(&self) -> Tid {
        self.state.lock().last_tid
    }

    fn load(&self, oid: Oid, version: &str) -> CoreResult<(Vec<u8>, Tid)> {
        self.ensure_open()?;
        self.state.lock().load(oid, version)
    }

    fn load_before(&self, oid: Oid, tid: Tid) -> CoreResult<Option<LoadedRevision>> {
        self.ensure_open()?;
        self.state.lock().load_before(oid, tid)
    }

    fn load_serial(&self, oid: Oid, serial: Tid) -> CoreResult<Vec<u8>> {
        self.ensure_open()?;
        self.state.lock().load_serial(oid, serial)
    }

    fn store(
        &self,
        oid: Oid,
        expected: Tid,
        data: &[u8],
        refs: &[Oid],
        version: &str,
        txn: &Transaction,
    ) -> CoreResult<StoreOutcome> {
        self.store_revision(oid, expected, data, refs, version, txn)
    }

    fn tpc_begin(&self, txn: &Transaction) -> CoreResult<()> {
        self.begin_commit(txn, None)
    }

    fn tpc_vote(&self, txn: &Transaction) -> CoreResult<Vec<(Oid, StoreOutcome)>> {
        self.vote(txn)?;
        Ok(Vec::new())
    }

    fn tpc_finish(
        &self,
        txn: &Transaction,
        callback: &mut dyn FnMut(Tid, &[Oid]),
    ) -> CoreResult<Tid> {
        self.finish(txn, callback)
    }

    fn tpc_abort(&self, txn: &Transaction) -> CoreResult<()> {
        self.abort(txn)
    }

    fn pending_tid(&self, txn: &Transaction) -> Option<Tid> {
        self.state
            .lock()
            .tpc
            .as_ref()
            .filter(|tpc| tpc.txn == txn.id())
            .map(|tpc| tpc.tid)
    }

    fn undo(&self, tid: Tid, txn: &Transaction) -> CoreResult<Vec<Oid>> {
        self.undo_transaction(tid, txn)
    }

    fn undo_log(
        &self,
        first: i64,
        last: i64,
        filter: Option<UndoFilter<'_>>,
    ) -> CoreResult<Vec<TransactionDescription>> {
        self.ensure_open()?;
        undo::undo_log(&self.state.lock(), first, last, filter)
    }

    fn history(&self, oid: Oid, version: &str, size: usize) -> CoreResult<Vec<RevisionInfo>> {
        self.ensure_open()?;
        undo::history(&self.state.lock(), oid, version, size)
    }

    fn pack(&self, pack_time: Tid, gc: bool) -> CoreResult<PackOutcome> {
        self.pack_storage(pack_time, gc)
    }

    fn stop_pack(&self) {
        self.pack_stop.store(true, Ordering::Release);
    }

    fn commit_version(&self, source: &str, dest: &str, txn: &Transaction) -> CoreResult<Vec<Oid>> {
        self.move_version(source, Some(dest), txn)
    }

    fn abort_version(&self, version: &str, txn: &Transaction) -> CoreResult<Vec<Oid>> {
        self.move_version(version, None, txn)
    }

    fn versions(&self) -> CoreResult<Vec<String>> {
        self.ensure_open()?;
        Ok(versions::versions(&self.state.lock()))
    }

    fn version_empty(&self, version: &str) -> CoreResult<bool> {
        self.ensure_open()?;
        Ok(versions::version_empty(&self.state.lock(), version))
    }

    fn modified_in_version(&self, oid: Oid) -> CoreResult<String> {
        self.ensure_open()?;
        let state = self.state.lock();
        Ok(match state.current(oid)? {
            Some((_, record)) => state.version_name(record.vid),
            None => String::new(),
        })
    }

    fn set_conflict_resolver(&self, resolver: Arc<dyn ConflictResolver>) {
        *self.resolver.write() = Some(resolver);
    }

    fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.pack_stop.store(true, Ordering::Release);
        let mut state = self.state.lock();
        if let Some(tpc) = state.tpc.take() {
            warn!(storage = %self.name, txn = tpc.txn, "closing with a commit in progress");
            if let Some(prepared) = tpc.prepared {
                state.kv.abort_prepared(prepared)?;
            }
            self.gate.leave(GateOwner::Txn(tpc.txn));
        }
        if !self.config.read_only {
            state.kv.checkpoint()?;
        }
        debug!(storage = %self.name, "storage closed");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::transaction::TransactionManager;

    pub fn storage() -> FullStorage {
        FullStorage::open_in_memory(StorageConfig::new()).unwrap()
    }

    /// Commits one transaction storing `(oid, expected, data, refs)` items
    /// at tid `at`.
    pub fn commit_at(
        storage: &FullStorage,
        at: u64,
        items: &[(Oid, u64, &[u8], &[Oid])],
    ) -> CoreResult<Tid> {
        commit_in(storage, at, "", items)
    }

    pub fn commit_in(
        storage: &FullStorage,
        at: u64,
        version: &str,
        items: &[(Oid, u64, &[u8], &[Oid])],
    ) -> CoreResult<Tid> {
        let txn = TransactionManager::new().begin();
        storage.tpc_begin_at(&txn, Tid::new(at))?;
        for (oid, expected, data, refs) in items {
            if let Err(e) = storage.store(*oid, Tid::new(*expected), data, refs, version, &txn) {
                storage.tpc_abort(&txn)?;
                return Err(e);
            }
        }
        storage.tpc_vote(&txn)?;
        storage.tpc_finish(&txn, &mut |_, _| {})
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::transaction::TransactionManager;

    #[test]
    fn load_returns_current_revision() {
        let storage = storage();
        let oid = storage.new_oid().unwrap();
        commit_at(&storage, 100, &[(oid, 0, b"v1", &[])]).unwrap();
        commit_at(&storage, 200, &[(oid, 100, b"v2", &[])]).unwrap();

        assert_eq!(storage.load(oid, "").unwrap(), (b"v2".to_vec(), Tid::new(200)));
        assert_eq!(storage.load_serial(oid, Tid::new(100)).unwrap(), b"v1");
        assert_eq!(storage.last_transaction(), Tid::new(200));
        assert!(matches!(
            storage.load(Oid::new(99), ""),
            Err(CoreError::NotFound { .. })
        ));
    }

    #[test]
    fn load_before_reports_validity_window() {
        let storage = storage();
        let oid = storage.new_oid().unwrap();
        commit_at(&storage, 100, &[(oid, 0, b"v1", &[])]).unwrap();
        commit_at(&storage, 200, &[(oid, 100, b"v2", &[])]).unwrap();

        let old = storage.load_before(oid, Tid::new(200)).unwrap().unwrap();
        assert_eq!(old.data, b"v1");
        assert_eq!(old.start, Tid::new(100));
        assert_eq!(old.end, Some(Tid::new(200)));

        let now = storage.load_before(oid, Tid::new(201)).unwrap().unwrap();
        assert_eq!(now.end, None);
        assert!(storage.load_before(oid, Tid::new(100)).unwrap().is_none());
    }

    #[test]
    fn oids_are_fresh() {
        let storage = storage();
        let a = storage.new_oid().unwrap();
        let b = storage.new_oid().unwrap();
        assert!(b > a);
        assert!(!a.is_root());
    }

    #[test]
    fn reopen_recovers_committed_state() {
        let journal = InMemoryBackend::new();
        let a = InMemoryBackend::new();
        let b = InMemoryBackend::new();
        let files = || StorageFiles {
            journal: Box::new(journal.clone()),
            snapshot_a: Box::new(a.clone()),
            snapshot_b: Box::new(b.clone()),
        };
        let oid = {
            let storage = FullStorage::open_with_files(files(), StorageConfig::new()).unwrap();
            let oid = storage.new_oid().unwrap();
            commit_at(&storage, 100, &[(oid, 0, b"kept", &[])]).unwrap();
            oid
        };
        let storage = FullStorage::open_with_files(files(), StorageConfig::new()).unwrap();
        assert_eq!(storage.load(oid, "").unwrap().0, b"kept");
        assert!(storage.new_oid().unwrap() > oid);
        assert_eq!(storage.last_transaction(), Tid::new(100));
    }

    #[test]
    fn oids_handed_out_before_a_crash_are_not_reused() {
        let journal = InMemoryBackend::new();
        let a = InMemoryBackend::new();
        let b = InMemoryBackend::new();
        let files = || StorageFiles {
            journal: Box::new(journal.clone()),
            snapshot_a: Box::new(a.clone()),
            snapshot_b: Box::new(b.clone()),
        };
        let issued: Vec<Oid> = {
            let storage = FullStorage::open_with_files(files(), StorageConfig::new()).unwrap();
            (0..OID_BLOCK + 3).map(|_| storage.new_oid().unwrap()).collect()
        };
        let storage = FullStorage::open_with_files(files(), StorageConfig::new()).unwrap();
        let next = storage.new_oid().unwrap();
        assert!(issued.iter().all(|oid| *oid < next));

        // a commit does not move the reservation back
        commit_at(&storage, 100, &[(next, 0, b"x", &[])]).unwrap();
        drop(storage);
        let storage = FullStorage::open_with_files(files(), StorageConfig::new()).unwrap();
        assert!(storage.new_oid().unwrap() > next);
    }

    #[test]
    fn closed_storage_refuses_work() {
        let storage = storage();
        storage.close().unwrap();
        assert!(matches!(storage.load(Oid::ROOT, ""), Err(CoreError::StorageClosed)));
        let txn = TransactionManager::new().begin();
        assert!(matches!(storage.tpc_begin(&txn), Err(CoreError::StorageClosed)));
        storage.close().unwrap();
    }

    #[test]
    fn read_only_storage_refuses_writes() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("db");
        {
            let storage = FullStorage::open(&path, StorageConfig::new()).unwrap();
            let oid = storage.new_oid().unwrap();
            commit_at(&storage, 10, &[(oid, 0, b"x", &[])]).unwrap();
            storage.close().unwrap();
        }
        let storage = FullStorage::open(&path, StorageConfig::new().read_only(true)).unwrap();
        assert!(storage.is_read_only());
        assert_eq!(storage.load(Oid::new(1), "").unwrap().0, b"x");
        assert!(matches!(storage.new_oid(), Err(CoreError::ReadOnly)));
    }

    #[test]
    fn checkpoint_keeps_data() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("db");
        {
            let storage = FullStorage::open(&path, StorageConfig::new()).unwrap();
            let oid = storage.new_oid().unwrap();
            commit_at(&storage, 10, &[(oid, 0, b"a", &[])]).unwrap();
            storage.checkpoint().unwrap();
            commit_at(&storage, 20, &[(oid, 10, b"b", &[])]).unwrap();
        }
        let storage = FullStorage::open(&path, StorageConfig::new()).unwrap();
        assert_eq!(storage.load(Oid::new(1), "").unwrap(), (b"b".to_vec(), Tid::new(20)));
        assert_eq!(storage.load_serial(Oid::new(1), Tid::new(10)).unwrap(), b"a");
    }
}
