//! Connections: MVCC sessions over a database.
//!
//! A connection owns a cache of persistent objects and loads their state
//! on first access. Commits of other connections are not applied straight
//! away: their oids are queued and only turned into ghosts at the next
//! transaction boundary, so one transaction sees one consistent state.
//! While invalidations are queued, reading an invalidated object loads the
//! revision that was current before the first queued commit (`txn_time`).
//! If there is none, the read fails with [`CoreError::ReadConflict`].
//!
//! Connections take part in transactions as jars; see `jar.rs`.

mod jar;
mod subtxn;

use crate::cache::{ObjectCache, PickleCache};
use crate::db::DbShared;
use crate::error::{CoreError, CoreResult};
use crate::persistent::{ObjectState, PRef, Persistent, PersistentObject, ReferenceReader};
use crate::storage::Storage;
use crate::transaction::Transaction;
use crate::types::{Oid, Tid};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use subtxn::TmpStore;
use tracing::{debug, error};

#[derive(Default)]
struct Invalidations {
    oids: HashSet<Oid>,
    /// Tid of the first queued commit.
    txn_time: Option<Tid>,
    /// Objects whose read failed with a read conflict in this transaction.
    conflicts: HashSet<Oid>,
}

#[derive(Default)]
struct CommitState {
    /// Added and not stored yet.
    added: Vec<PRef>,
    /// Existing objects stored in the running commit.
    modified: Vec<Oid>,
    /// New objects stored in the running commit.
    created: Vec<PRef>,
    stored: HashSet<Oid>,
    /// Sub-transaction staging, once a sub-commit ran.
    tmp: Option<TmpStore>,
    /// The running commit is a sub-commit.
    sub_active: bool,
    /// New objects stored by committed sub-transactions.
    sub_created: Vec<PRef>,
}

impl CommitState {
    fn reset_tpc(&mut self) {
        self.modified.clear();
        self.created.clear();
        self.stored.clear();
        self.sub_active = false;
    }
}

pub(crate) struct ConnectionInner {
    id: u64,
    weak_self: Weak<ConnectionInner>,
    db: Arc<DbShared>,
    storage: Arc<dyn Storage>,
    version: String,
    mvcc: bool,
    cache: Mutex<Box<dyn ObjectCache>>,
    invalidations: Mutex<Invalidations>,
    commit: Mutex<CommitState>,
    txn: Mutex<Option<Transaction>>,
    loads: AtomicU64,
    stores: AtomicU64,
    closed: AtomicBool,
}

impl ConnectionInner {
    pub(crate) fn new(id: u64, db: Arc<DbShared>, version: String) -> Arc<Self> {
        let storage = Arc::clone(db.storage());
        let mvcc = db.config().mvcc && version.is_empty();
        let cache_size = db.config().cache_size;
        Arc::new_cyclic(|weak_self| Self {
            id,
            weak_self: weak_self.clone(),
            db,
            storage,
            version,
            mvcc,
            cache: Mutex::new(Box::new(PickleCache::new(cache_size))),
            invalidations: Mutex::new(Invalidations::default()),
            commit: Mutex::new(CommitState::default()),
            txn: Mutex::new(None),
            loads: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::ConnectionClosed);
        }
        Ok(())
    }

    fn ensure_owned(&self, object: &PRef) -> CoreResult<()> {
        if object.has_owner() && !object.belongs_to(self) {
            return Err(CoreError::invalid_reference(format!(
                "{} belongs to another connection",
                display_oid(object)
            )));
        }
        Ok(())
    }

    /// Binds the connection to `txn` for the rest of that transaction.
    fn join(&self, txn: &Transaction) -> CoreResult<()> {
        if !txn.is_active() {
            return Err(CoreError::invalid_operation(format!(
                "transaction {} is not active",
                txn.id()
            )));
        }
        let mut bound = self.txn.lock();
        match bound.as_ref() {
            Some(current) if !current.same_as(txn) && current.is_active() => {
                Err(CoreError::invalid_operation(format!(
                    "connection is working for transaction {}",
                    current.id()
                )))
            }
            _ => {
                *bound = Some(txn.clone());
                Ok(())
            }
        }
    }

    fn release(&self, txn: &Transaction) {
        let mut bound = self.txn.lock();
        if bound.as_ref().is_some_and(|t| t.same_as(txn)) {
            *bound = None;
        }
    }

    /// Gives a new object an oid in this connection.
    pub(crate) fn adopt(&self, object: &PRef) -> CoreResult<Oid> {
        self.ensure_open()?;
        let oid = self.storage.new_oid()?;
        object.attach(oid, self.weak_self.clone());
        Ok(oid)
    }

    /// The cached object for `oid`, or a new ghost. Does not check that
    /// the object exists.
    pub(crate) fn ghost_for(&self, oid: Oid) -> CoreResult<PRef> {
        self.ensure_open()?;
        let mut cache = self.cache.lock();
        if let Some(object) = cache.get(oid) {
            return Ok(object);
        }
        let ghost = PersistentObject::ghost(oid, self.weak_self.clone());
        cache.set(oid, Arc::clone(&ghost));
        Ok(ghost)
    }

    fn get(&self, oid: Oid) -> CoreResult<PRef> {
        self.ensure_open()?;
        if let Some(object) = self.cache.lock().get(oid) {
            return Ok(object);
        }
        if self.tmp_load(oid).is_none() {
            self.storage.load(oid, &self.version)?;
            self.loads.fetch_add(1, Ordering::Relaxed);
        }
        self.ghost_for(oid)
    }

    fn add(&self, txn: &Transaction, object: &PRef) -> CoreResult<Oid> {
        self.ensure_open()?;
        if let Some(oid) = object.oid() {
            self.ensure_owned(object)?;
            return Ok(oid);
        }
        self.join(txn)?;
        let oid = self.adopt(object)?;
        self.cache.lock().set(oid, Arc::clone(object));
        self.commit.lock().added.push(Arc::clone(object));
        txn.register(object)?;
        debug!(connection = self.id, %oid, "object added");
        Ok(oid)
    }

    fn is_invalidated(&self, oid: Oid) -> bool {
        self.invalidations.lock().oids.contains(&oid)
    }

    fn tmp_load(&self, oid: Oid) -> Option<(Vec<u8>, Tid)> {
        self.commit.lock().tmp.as_ref().and_then(|tmp| tmp.load(oid))
    }

    pub(crate) fn activate(&self, object: &PRef) -> CoreResult<()> {
        if !object.is_ghost() {
            return Ok(());
        }
        self.ensure_open()?;
        let Some(oid) = object.oid() else {
            return Ok(());
        };
        match self.setstate(object, oid) {
            Err(err) if !err.is_conflict() => {
                error!(connection = self.id, %oid, error = %err, "couldn't load state");
                Err(err)
            }
            other => other,
        }
    }

    fn setstate(&self, object: &PRef, oid: Oid) -> CoreResult<()> {
        if let Some((data, serial)) = self.tmp_load(oid) {
            return self.install(object, oid, &data, serial);
        }
        if self.is_invalidated(oid) {
            return self.load_before_or_conflict(object, oid);
        }
        let (data, serial) = self.storage.load(oid, &self.version)?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        // An invalidation may have arrived between the check and the load.
        if self.is_invalidated(oid) {
            return self.load_before_or_conflict(object, oid);
        }
        self.install(object, oid, &data, serial)
    }

    fn load_before_or_conflict(&self, object: &PRef, oid: Oid) -> CoreResult<()> {
        if self.mvcc {
            let txn_time = self.invalidations.lock().txn_time;
            if let Some(txn_time) = txn_time {
                let revision = match self.storage.load_before(oid, txn_time) {
                    Ok(revision) => revision,
                    Err(CoreError::NotFound { .. }) => None,
                    Err(err) => return Err(err),
                };
                if let Some(revision) = revision {
                    self.loads.fetch_add(1, Ordering::Relaxed);
                    debug!(connection = self.id, %oid, serial = %revision.start, "loaded non-current revision");
                    return self.install(object, oid, &revision.data, revision.start);
                }
            }
        }
        self.invalidations.lock().conflicts.insert(oid);
        let bound = self.txn.lock().clone();
        if let Some(txn) = bound {
            if txn.is_active() {
                txn.register(object)?;
            }
        }
        Err(CoreError::ReadConflict { oid })
    }

    fn install(&self, object: &PRef, oid: Oid, data: &[u8], serial: Tid) -> CoreResult<()> {
        let mut reader = ReferenceReader::new(self);
        let state = self.db.factory().decode(oid, data, &mut reader)?;
        object.set_loaded(state, serial);
        Ok(())
    }

    fn read<R>(&self, object: &PRef, f: impl FnOnce(&dyn Persistent) -> R) -> CoreResult<R> {
        self.ensure_owned(object)?;
        self.activate(object)?;
        object
            .with_state(f)
            .ok_or_else(|| CoreError::invalid_operation(format!("{} has no state", display_oid(object))))
    }

    fn write<R>(
        &self,
        txn: &Transaction,
        object: &PRef,
        f: impl FnOnce(&mut dyn Persistent) -> R,
    ) -> CoreResult<R> {
        self.ensure_owned(object)?;
        if object.has_owner() {
            self.activate(object)?;
            self.join(txn)?;
            if object.state() == ObjectState::Saved {
                txn.register(object)?;
                object.mark_changed();
            }
        }
        object
            .with_state_mut(f)
            .ok_or_else(|| CoreError::invalid_operation(format!("{} has no state", display_oid(object))))
    }

    /// Queues an invalidation from another connection's commit.
    pub(crate) fn invalidate(&self, tid: Tid, oids: &[Oid]) {
        let mut invalidations = self.invalidations.lock();
        invalidations.txn_time.get_or_insert(tid);
        invalidations.oids.extend(oids.iter().copied());
    }

    pub(crate) fn flush_invalidations(&self) {
        {
            let mut invalidations = self.invalidations.lock();
            let oids: Vec<Oid> = invalidations.oids.drain().collect();
            if !oids.is_empty() {
                debug!(connection = self.id, count = oids.len(), "applying invalidations");
            }
            self.cache.lock().invalidate(&mut oids.into_iter());
            invalidations.txn_time = None;
        }
        self.cache.lock().incremental_gc();
    }

    fn end_transaction(&self, txn: &Transaction) {
        self.release(txn);
        self.invalidations.lock().conflicts.clear();
        self.flush_invalidations();
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cache.lock().clear();
        self.db.forget(self.id);
        debug!(connection = self.id, "connection closed");
    }
}

fn display_oid(object: &PRef) -> String {
    object
        .oid()
        .map_or_else(|| "unsaved object".to_string(), |oid| oid.to_string())
}

/// A session on a [`Database`](crate::Database).
///
/// Each thread works with its own connection and its own
/// [`TransactionManager`](crate::TransactionManager). Operations that
/// modify objects take the transaction explicitly.
#[derive(Clone)]
pub struct Connection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Connection id, unique within its database.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Version the connection reads and writes ("" = non-version).
    #[must_use]
    pub fn version(&self) -> &str {
        &self.inner.version
    }

    /// The root object.
    pub fn root(&self) -> CoreResult<PRef> {
        self.get(Oid::ROOT)
    }

    /// The object with id `oid`: the cached one if present, otherwise a
    /// ghost. Fails with [`CoreError::NotFound`] if the storage has no live
    /// revision of it.
    pub fn get(&self, oid: Oid) -> CoreResult<PRef> {
        self.inner.get(oid)
    }

    /// Adds a new object to the connection and registers it with `txn`.
    /// It is stored when `txn` commits. Adding an object the connection
    /// already owns returns its oid.
    pub fn add(&self, txn: &Transaction, object: &PRef) -> CoreResult<Oid> {
        self.inner.add(txn, object)
    }

    /// Loads the state of a ghost.
    pub fn activate(&self, object: &PRef) -> CoreResult<()> {
        self.inner.ensure_owned(object)?;
        self.inner.activate(object)
    }

    /// Reads an object's state.
    pub fn read<R>(&self, object: &PRef, f: impl FnOnce(&dyn Persistent) -> R) -> CoreResult<R> {
        self.inner.read(object, f)
    }

    /// Reads an object's state as a `T`.
    pub fn read_as<T: Persistent, R>(&self, object: &PRef, f: impl FnOnce(&T) -> R) -> CoreResult<R> {
        self.inner
            .read(object, |state| state.as_any().downcast_ref::<T>().map(f))?
            .ok_or_else(|| type_mismatch::<T>(object))
    }

    /// Modifies an object's state and registers the object with `txn`.
    pub fn write<R>(
        &self,
        txn: &Transaction,
        object: &PRef,
        f: impl FnOnce(&mut dyn Persistent) -> R,
    ) -> CoreResult<R> {
        self.inner.write(txn, object, f)
    }

    /// Modifies an object's state as a `T`.
    ///
    /// The object is registered with `txn` even if it turns out not to be
    /// a `T`.
    pub fn write_as<T: Persistent, R>(
        &self,
        txn: &Transaction,
        object: &PRef,
        f: impl FnOnce(&mut T) -> R,
    ) -> CoreResult<R> {
        self.inner
            .write(txn, object, |state| state.as_any_mut().downcast_mut::<T>().map(f))?
            .ok_or_else(|| type_mismatch::<T>(object))
    }

    /// Queues invalidations; they take effect at the next transaction
    /// boundary or [`flush_invalidations`](Self::flush_invalidations).
    pub fn invalidate(&self, tid: Tid, oids: &[Oid]) {
        self.inner.invalidate(tid, oids);
    }

    /// Turns every queued invalidation into a ghost and forgets
    /// `txn_time`.
    pub fn flush_invalidations(&self) {
        self.inner.flush_invalidations();
    }

    /// Tid of the first queued invalidation, if any.
    #[must_use]
    pub fn txn_time(&self) -> Option<Tid> {
        self.inner.invalidations.lock().txn_time
    }

    /// Aborts the transaction the connection works for, if any, and
    /// applies queued invalidations.
    pub fn sync(&self) -> CoreResult<()> {
        let bound = self.inner.txn.lock().clone();
        let result = match bound {
            Some(txn) if txn.is_active() => txn.abort(),
            _ => Ok(()),
        };
        self.inner.flush_invalidations();
        result
    }

    /// Runs one incremental collection of the object cache.
    pub fn cache_gc(&self) {
        self.inner.cache.lock().incremental_gc();
    }

    /// Ghosts every saved object in the cache.
    pub fn cache_minimize(&self) {
        self.inner.cache.lock().minimize();
    }

    /// Ghosts saved objects not used within the last `max_age` cache
    /// accesses.
    pub fn cache_full_sweep(&self, max_age: u64) {
        self.inner.cache.lock().full_sweep(max_age);
    }

    /// Number of cached objects, ghosts included.
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.inner.cache.lock().len()
    }

    /// Number of cached objects with loaded state.
    #[must_use]
    pub fn cache_non_ghost_count(&self) -> usize {
        self.inner.cache.lock().non_ghost_count()
    }

    /// Returns `(loads, stores)` since the last reset, resetting the
    /// counters if `clear` is true.
    pub fn transfer_counts(&self, clear: bool) -> (u64, u64) {
        if clear {
            (
                self.inner.loads.swap(0, Ordering::Relaxed),
                self.inner.stores.swap(0, Ordering::Relaxed),
            )
        } else {
            (
                self.inner.loads.load(Ordering::Relaxed),
                self.inner.stores.load(Ordering::Relaxed),
            )
        }
    }

    /// Closes the connection. Objects it owns become unusable.
    pub fn close(&self) {
        self.inner.close();
    }

    /// True after [`close`](Self::close).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

fn type_mismatch<T>(object: &PRef) -> CoreError {
    CoreError::invalid_operation(format!(
        "{} is not a {}",
        display_oid(object),
        std::any::type_name::<T>()
    ))
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("version", &self.inner.version)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support;
