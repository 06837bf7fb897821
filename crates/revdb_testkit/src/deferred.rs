//! A storage that reports store outcomes at vote time.

use parking_lot::Mutex;
use revdb_core::{
    ConflictResolver, CoreResult, LoadedRevision, Oid, PackOutcome, RevisionInfo, Storage,
    StoreOutcome, Tid, Transaction, TransactionDescription, UndoFilter,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Wraps a storage so that every `store` answers
/// [`StoreOutcome::Deferred`] and the real outcomes come back from
/// `tpc_vote`, the way a storage behind a network link batches them.
pub struct DeferredStorage {
    inner: Arc<dyn Storage>,
    pending: Mutex<HashMap<u64, Vec<(Oid, StoreOutcome)>>>,
}

impl DeferredStorage {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self {
            inner,
            pending: Mutex::new(HashMap::new()),
        }
    }
}

impl Storage for DeferredStorage {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn sort_key(&self) -> String {
        self.inner.sort_key()
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    fn new_oid(&self) -> CoreResult<Oid> {
        self.inner.new_oid()
    }

    fn last_transaction(&self) -> Tid {
        self.inner.last_transaction()
    }

    fn load(&self, oid: Oid, version: &str) -> CoreResult<(Vec<u8>, Tid)> {
        self.inner.load(oid, version)
    }

    fn load_before(&self, oid: Oid, tid: Tid) -> CoreResult<Option<LoadedRevision>> {
        self.inner.load_before(oid, tid)
    }

    fn load_serial(&self, oid: Oid, serial: Tid) -> CoreResult<Vec<u8>> {
        self.inner.load_serial(oid, serial)
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
        let outcome = self.inner.store(oid, expected, data, refs, version, txn)?;
        self.pending
            .lock()
            .entry(txn.id())
            .or_default()
            .push((oid, outcome));
        Ok(StoreOutcome::Deferred)
    }

    fn tpc_begin(&self, txn: &Transaction) -> CoreResult<()> {
        self.inner.tpc_begin(txn)
    }

    fn tpc_vote(&self, txn: &Transaction) -> CoreResult<Vec<(Oid, StoreOutcome)>> {
        let mut outcomes = self.inner.tpc_vote(txn)?;
        outcomes.extend(self.pending.lock().remove(&txn.id()).unwrap_or_default());
        Ok(outcomes)
    }

    fn tpc_finish(
        &self,
        txn: &Transaction,
        callback: &mut dyn FnMut(Tid, &[Oid]),
    ) -> CoreResult<Tid> {
        self.inner.tpc_finish(txn, callback)
    }

    fn tpc_abort(&self, txn: &Transaction) -> CoreResult<()> {
        self.pending.lock().remove(&txn.id());
        self.inner.tpc_abort(txn)
    }

    fn pending_tid(&self, txn: &Transaction) -> Option<Tid> {
        self.inner.pending_tid(txn)
    }

    fn undo(&self, tid: Tid, txn: &Transaction) -> CoreResult<Vec<Oid>> {
        self.inner.undo(tid, txn)
    }

    fn undo_log(
        &self,
        first: i64,
        last: i64,
        filter: Option<UndoFilter<'_>>,
    ) -> CoreResult<Vec<TransactionDescription>> {
        self.inner.undo_log(first, last, filter)
    }

    fn history(&self, oid: Oid, version: &str, size: usize) -> CoreResult<Vec<RevisionInfo>> {
        self.inner.history(oid, version, size)
    }

    fn pack(&self, pack_time: Tid, gc: bool) -> CoreResult<PackOutcome> {
        self.inner.pack(pack_time, gc)
    }

    fn stop_pack(&self) {
        self.inner.stop_pack();
    }

    fn commit_version(&self, source: &str, dest: &str, txn: &Transaction) -> CoreResult<Vec<Oid>> {
        self.inner.commit_version(source, dest, txn)
    }

    fn abort_version(&self, version: &str, txn: &Transaction) -> CoreResult<Vec<Oid>> {
        self.inner.abort_version(version, txn)
    }

    fn versions(&self) -> CoreResult<Vec<String>> {
        self.inner.versions()
    }

    fn version_empty(&self, version: &str) -> CoreResult<bool> {
        self.inner.version_empty(version)
    }

    fn modified_in_version(&self, oid: Oid) -> CoreResult<String> {
        self.inner.modified_in_version(oid)
    }

    fn set_conflict_resolver(&self, resolver: Arc<dyn ConflictResolver>) {
        self.inner.set_conflict_resolver(resolver);
    }

    fn close(&self) -> CoreResult<()> {
        self.inner.close()
    }
}
