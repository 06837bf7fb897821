//! The connection's side of two-phase commit.
//!
//! A top-level commit writes straight to the storage. A sub-transaction
//! commit writes to the connection's [`TmpStore`]; the top-level commit
//! then replays the staged states into the storage (`commit_sub`) before
//! storing whatever changed since.

use super::{CommitState, ConnectionInner, TmpStore};
use crate::error::{CoreError, CoreResult};
use crate::persistent::{ObjectState, PRef, ReferenceWriter};
use crate::storage::StoreOutcome;
use crate::transaction::{Jar, Synchronizer, Transaction, TxnObject};
use crate::types::{Oid, Tid};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::debug;

impl ConnectionInner {
    fn object_of<'a>(&self, entry: &'a TxnObject) -> CoreResult<(&'a PRef, Oid)> {
        let TxnObject::Object(object) = entry else {
            return Err(CoreError::invalid_reference(
                "connections only commit persistent objects",
            ));
        };
        match object.oid() {
            Some(oid) if object.belongs_to(self) => Ok((object, oid)),
            _ => Err(CoreError::invalid_reference(
                "object does not belong to this connection",
            )),
        }
    }

    /// Applies a store outcome to the in-memory object.
    fn apply_outcome(&self, object: &PRef, outcome: StoreOutcome) {
        match outcome {
            StoreOutcome::Stored(tid) => object.mark_saved(tid),
            StoreOutcome::Resolved(tid) => {
                object.set_serial(tid);
                object.ghostify();
            }
            StoreOutcome::Deferred => {}
        }
    }

    /// Stores `object` and every new object its state references.
    fn store_graph(
        &self,
        state: &mut CommitState,
        object: &PRef,
        txn: &Transaction,
    ) -> CoreResult<()> {
        let mut pending = vec![Arc::clone(object)];
        while let Some(object) = pending.pop() {
            let Some(oid) = object.oid() else {
                continue;
            };
            if !state.stored.insert(oid) {
                continue;
            }
            let serial = object.serial();
            let created = serial.is_zero();
            if !created
                && self.is_invalidated(oid)
                && !object.with_state(|s| s.can_resolve_conflicts()).unwrap_or(false)
            {
                return Err(CoreError::WriteConflict {
                    oid,
                    expected: serial,
                    current: None,
                });
            }

            let mut writer = ReferenceWriter::for_connection(self);
            let data = object
                .with_state(|s| s.encode(&mut writer))
                .ok_or_else(|| CoreError::invalid_operation(format!("{oid} has no state")))??;
            let (refs, discovered) = writer.finish();
            pending.extend(discovered);

            let outcome = if state.sub_active {
                let tmp = state.tmp.get_or_insert_with(TmpStore::new);
                tmp.store(oid, serial, data, refs);
                StoreOutcome::Stored(serial)
            } else {
                self.storage.store(oid, serial, &data, &refs, &self.version, txn)?
            };
            self.stores.fetch_add(1, Ordering::Relaxed);
            if created {
                state.created.push(Arc::clone(&object));
            } else {
                state.modified.push(oid);
            }
            self.cache.lock().set(oid, Arc::clone(&object));
            self.apply_outcome(&object, outcome);
        }
        Ok(())
    }

    /// Rolls back the in-memory side of stores made in the running commit.
    fn forget_stores(&self, state: &mut CommitState) {
        let mut cache = self.cache.lock();
        cache.invalidate(&mut state.modified.iter().copied());
        for object in state.created.drain(..) {
            if let Some(oid) = object.oid() {
                cache.remove(oid);
            }
            object.detach();
        }
        state.added.clear();
    }
}

impl Jar for ConnectionInner {
    fn sort_key(&self) -> Option<String> {
        Some(self.storage.sort_key())
    }

    fn tpc_begin(&self, txn: &Transaction, sub: bool) -> CoreResult<()> {
        self.ensure_open()?;
        let mut state = self.commit.lock();
        state.reset_tpc();
        if sub {
            state.tmp.get_or_insert_with(TmpStore::new).begin();
            state.sub_active = true;
            return Ok(());
        }
        self.storage.tpc_begin(txn)
    }

    fn commit(&self, entry: &TxnObject, txn: &Transaction) -> CoreResult<()> {
        let (object, oid) = self.object_of(entry)?;
        if self.invalidations.lock().conflicts.contains(&oid) {
            return Err(CoreError::ReadConflict { oid });
        }
        if !matches!(object.state(), ObjectState::Unsaved | ObjectState::Changed) {
            return Ok(());
        }
        let mut state = self.commit.lock();
        self.store_graph(&mut state, object, txn)
    }

    fn tpc_vote(&self, txn: &Transaction) -> CoreResult<()> {
        if self.commit.lock().sub_active {
            return Ok(());
        }
        for (oid, outcome) in self.storage.tpc_vote(txn)? {
            let cached = self.cache.lock().get(oid);
            if let Some(object) = cached {
                self.apply_outcome(&object, outcome);
            }
        }
        Ok(())
    }

    fn tpc_finish(&self, txn: &Transaction) -> CoreResult<()> {
        let mut state = self.commit.lock();
        if state.sub_active {
            if let Some(tmp) = state.tmp.as_mut() {
                tmp.finish();
            }
            let created: Vec<PRef> = state.created.drain(..).collect();
            state.sub_created.extend(created);
            state.added.clear();
            state.reset_tpc();
            return Ok(());
        }

        let mut own: HashSet<Oid> = state.modified.iter().copied().collect();
        own.extend(state.created.iter().filter_map(|o| o.oid()));
        let db = Arc::clone(&self.db);
        let id = self.id;
        let tid = self.storage.tpc_finish(txn, &mut |tid, written| {
            db.invalidate(tid, written, Some(id));
            // objects written by other jars of this transaction
            let others: Vec<Oid> = written.iter().copied().filter(|o| !own.contains(o)).collect();
            if !others.is_empty() {
                self.invalidate(tid, &others);
            }
        })?;
        debug!(connection = self.id, %tid, objects = own.len(), "commit finished");
        state.reset_tpc();
        state.added.clear();
        state.sub_created.clear();
        state.tmp = None;
        drop(state);
        self.end_transaction(txn);
        Ok(())
    }

    fn tpc_abort(&self, txn: &Transaction) -> CoreResult<()> {
        let mut state = self.commit.lock();
        if state.sub_active {
            if let Some(tmp) = state.tmp.as_mut() {
                tmp.abort();
            }
            self.forget_stores(&mut state);
            state.reset_tpc();
            return Ok(());
        }
        let result = self.storage.tpc_abort(txn);
        self.forget_stores(&mut state);
        state.reset_tpc();
        drop(state);
        self.end_transaction(txn);
        result
    }

    fn abort(&self, entry: &TxnObject, _txn: &Transaction) -> CoreResult<()> {
        let (object, oid) = self.object_of(entry)?;
        let mut state = self.commit.lock();
        if let Some(pos) = state.added.iter().position(|o| Arc::ptr_eq(o, object)) {
            state.added.remove(pos);
            self.cache.lock().remove(oid);
            object.detach();
            return Ok(());
        }
        object.ghostify();
        Ok(())
    }

    fn supports_subtransactions(&self) -> bool {
        true
    }

    fn commit_sub(&self, txn: &Transaction) -> CoreResult<()> {
        let mut state = self.commit.lock();
        state.reset_tpc();
        self.storage.tpc_begin(txn)?;
        let Some(tmp) = state.tmp.take() else {
            return Ok(());
        };
        let created: Vec<PRef> = state.sub_created.drain(..).collect();
        for (oid, entry) in tmp.into_entries() {
            let outcome = self
                .storage
                .store(oid, entry.serial, &entry.data, &entry.refs, &self.version, txn)?;
            self.stores.fetch_add(1, Ordering::Relaxed);
            if !entry.serial.is_zero() {
                state.modified.push(oid);
            }
            let cached = self.cache.lock().get(oid);
            if let Some(object) = cached {
                match outcome {
                    StoreOutcome::Stored(tid) => object.set_serial(tid),
                    StoreOutcome::Resolved(tid) => {
                        object.set_serial(tid);
                        if object.state() != ObjectState::Changed {
                            object.ghostify();
                        }
                    }
                    StoreOutcome::Deferred => {}
                }
            }
        }
        state.created = created;
        debug!(connection = self.id, txn = txn.id(), "sub-transaction work replayed");
        Ok(())
    }

    fn abort_sub(&self, _txn: &Transaction) -> CoreResult<()> {
        let mut state = self.commit.lock();
        let Some(tmp) = state.tmp.take() else {
            return Ok(());
        };
        let mut cache = self.cache.lock();
        cache.invalidate(&mut tmp.oids());
        for object in state.sub_created.drain(..) {
            if let Some(oid) = object.oid() {
                cache.remove(oid);
            }
            object.detach();
        }
        Ok(())
    }
}

impl Synchronizer for ConnectionInner {
    fn new_transaction(&self, _txn: &Transaction) {
        if !self.closed.load(Ordering::Acquire) {
            self.flush_invalidations();
        }
    }

    fn after_completion(&self, txn: &Transaction) {
        let bound = self.txn.lock().clone();
        if bound.is_some_and(|b| !b.same_as(txn) && b.is_active()) {
            return;
        }
        {
            let mut state = self.commit.lock();
            for object in state.added.drain(..) {
                if object.serial() == Tid::ZERO && object.state() == ObjectState::Unsaved {
                    if let Some(oid) = object.oid() {
                        self.cache.lock().remove(oid);
                    }
                    object.detach();
                }
            }
        }
        self.end_transaction(txn);
    }
}
