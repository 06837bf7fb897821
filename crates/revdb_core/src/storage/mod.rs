//! The storage interface consumed by connections and the database.
//!
//! A storage keeps every committed revision of every object, keyed by
//! `(oid, tid)`. Writes go through two-phase commit:
//!
//! ```text
//! tpc_begin ─► store* / undo / commit_version / abort_version ─► tpc_vote ─► tpc_finish
//!     └────────────────────────────── tpc_abort ◄───────────────────────────┘
//! ```
//!
//! Only one transaction is between `tpc_begin` and `tpc_finish` on a storage
//! at a time; other committers block in `tpc_begin`.

pub mod full;

pub use full::FullStorage;

use crate::conflict::ConflictResolver;
use crate::error::CoreResult;
use crate::transaction::Transaction;
use crate::types::{Oid, Tid};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Result of storing one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// Stored as given; the object's new serial.
    Stored(Tid),
    /// A conflict was resolved by merging. The caller's copy of the object
    /// is stale and must be reloaded.
    Resolved(Tid),
    /// The outcome is reported by `tpc_vote`.
    Deferred,
}

impl StoreOutcome {
    /// The new serial, unless deferred.
    #[must_use]
    pub fn serial(self) -> Option<Tid> {
        match self {
            Self::Stored(tid) | Self::Resolved(tid) => Some(tid),
            Self::Deferred => None,
        }
    }
}

/// A revision returned by [`Storage::load_before`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedRevision {
    /// Pickle bytes.
    pub data: Vec<u8>,
    /// Tid that wrote the revision.
    pub start: Tid,
    /// Tid of the revision that replaced it, if it is no longer current.
    pub end: Option<Tid>,
}

/// A committed transaction as listed by [`Storage::undo_log`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionDescription {
    /// Transaction id.
    pub tid: Tid,
    /// User that committed it.
    pub user: String,
    /// Free-form description.
    pub description: String,
    /// Extension metadata.
    pub extension: BTreeMap<String, String>,
}

/// One entry of [`Storage::history`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionInfo {
    /// Tid of the revision.
    pub tid: Tid,
    /// Version the revision belongs to (empty for non-version).
    pub version: String,
    /// Pickle size in bytes (0 for a deletion).
    pub size: usize,
    /// Committing user.
    pub user: String,
    /// Transaction description.
    pub description: String,
}

/// Summary of a finished pack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PackStats {
    /// The pack time actually used.
    pub pack_tid: Tid,
    /// Non-current revisions removed.
    pub revisions_removed: u64,
    /// Objects removed entirely.
    pub objects_removed: u64,
}

/// How a pack ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackOutcome {
    /// All phases ran to the end.
    Completed(PackStats),
    /// [`Storage::stop_pack`] was called; the next pack resumes the work.
    Stopped,
}

/// Filter applied by [`Storage::undo_log`].
pub type UndoFilter<'a> = &'a dyn Fn(&TransactionDescription) -> bool;

/// A multi-revision object store.
pub trait Storage: Send + Sync {
    /// Storage name.
    fn name(&self) -> &str;

    /// Key that orders storages in two-phase commit. Storages that compare
    /// equal are begun in an unspecified but stable order.
    fn sort_key(&self) -> String {
        self.name().to_string()
    }

    /// True if writes are refused.
    fn is_read_only(&self) -> bool;

    /// Allocates a fresh object id. Ids are never handed out twice.
    fn new_oid(&self) -> CoreResult<Oid>;

    /// Tid of the most recent commit.
    fn last_transaction(&self) -> Tid;

    /// Loads the current state of an object as seen from `version`.
    ///
    /// Returns the pickle and its serial.
    fn load(&self, oid: Oid, version: &str) -> CoreResult<(Vec<u8>, Tid)>;

    /// Loads the non-version revision that was current just before `tid`.
    ///
    /// `None` if the object did not exist then, was deleted, or the
    /// revision has been packed away.
    fn load_before(&self, oid: Oid, tid: Tid) -> CoreResult<Option<LoadedRevision>>;

    /// Loads the revision written by `serial`.
    fn load_serial(&self, oid: Oid, serial: Tid) -> CoreResult<Vec<u8>>;

    /// Stores a new revision inside the transaction's commit.
    ///
    /// `expected` is the serial the caller's copy is based on
    /// ([`Tid::ZERO`] for new objects).
    fn store(
        &self,
        oid: Oid,
        expected: Tid,
        data: &[u8],
        refs: &[Oid],
        version: &str,
        txn: &Transaction,
    ) -> CoreResult<StoreOutcome>;

    /// Starts the commit of `txn`. Blocks while another transaction is
    /// committing. Calling it again for the same transaction is a no-op.
    fn tpc_begin(&self, txn: &Transaction) -> CoreResult<()>;

    /// Prepares the commit durably. Returns the outcomes of stores that
    /// answered [`StoreOutcome::Deferred`].
    fn tpc_vote(&self, txn: &Transaction) -> CoreResult<Vec<(Oid, StoreOutcome)>>;

    /// Makes the transaction's writes visible.
    ///
    /// `callback` runs with the commit tid and every object the transaction
    /// wrote, once the commit is durable and before other committers are
    /// admitted. Several jars may share one storage within a transaction:
    /// the first `tpc_finish` commits the work of all of them and runs the
    /// callback; later calls for the same transaction return the same tid
    /// without running it.
    fn tpc_finish(
        &self,
        txn: &Transaction,
        callback: &mut dyn FnMut(Tid, &[Oid]),
    ) -> CoreResult<Tid>;

    /// Discards the transaction's writes. Safe to call in any state.
    fn tpc_abort(&self, txn: &Transaction) -> CoreResult<()>;

    /// The tid the transaction will commit at, once begun.
    fn pending_tid(&self, txn: &Transaction) -> Option<Tid>;

    /// Reverts the changes of transaction `tid` inside `txn`'s commit.
    /// Returns the affected objects.
    fn undo(&self, tid: Tid, txn: &Transaction) -> CoreResult<Vec<Oid>>;

    /// Lists committed transactions, newest first.
    ///
    /// Skips the first `first` matches and stops before index `last`; a
    /// negative `last` means "`-last` entries".
    fn undo_log(
        &self,
        first: i64,
        last: i64,
        filter: Option<UndoFilter<'_>>,
    ) -> CoreResult<Vec<TransactionDescription>>;

    /// Revision history of an object, newest first.
    fn history(&self, oid: Oid, version: &str, size: usize) -> CoreResult<Vec<RevisionInfo>>;

    /// Removes revisions that stopped being current at or before
    /// `pack_time` and, with `gc`, objects unreachable from the root.
    fn pack(&self, pack_time: Tid, gc: bool) -> CoreResult<PackOutcome>;

    /// Asks a running pack to stop at the next safe point.
    fn stop_pack(&self);

    /// Moves every object in version `source` into `dest` (empty for
    /// non-version). Returns the affected objects.
    fn commit_version(&self, source: &str, dest: &str, txn: &Transaction) -> CoreResult<Vec<Oid>>;

    /// Discards the changes made in a version. Returns the affected objects.
    fn abort_version(&self, version: &str, txn: &Transaction) -> CoreResult<Vec<Oid>>;

    /// Versions that hold at least one object.
    fn versions(&self) -> CoreResult<Vec<String>>;

    /// True if no object is locked in `version`.
    fn version_empty(&self, version: &str) -> CoreResult<bool>;

    /// Version the object is locked in, or empty.
    fn modified_in_version(&self, oid: Oid) -> CoreResult<String>;

    /// Installs the resolver used when a store conflicts.
    fn set_conflict_resolver(&self, resolver: Arc<dyn ConflictResolver>);

    /// Closes the storage. Further calls fail with `StorageClosed`.
    fn close(&self) -> CoreResult<()>;
}
