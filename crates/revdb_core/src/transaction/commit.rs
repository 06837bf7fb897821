//! Two-phase commit across the registered jars.

use crate::error::{CoreError, CoreResult};
use crate::transaction::jar::{Jar, TxnObject};
use crate::transaction::state::{contains_jar, push_unique, sort_jars, TransactionStatus};
use crate::transaction::Transaction;
use std::mem;
use std::sync::Arc;
use tracing::{debug, error, warn};

impl Transaction {
    /// Commits the transaction.
    ///
    /// Jars are begun in sort-key order, objects are committed in
    /// registration order, then every jar votes and finishes. Any failure
    /// unwinds all jars and is returned; the transaction ends up aborted.
    /// A failure after at least one jar finished hoses the process.
    pub fn commit(&self) -> CoreResult<()> {
        self.run_commit(false)
    }

    /// Commits the work registered since the last sub-transaction commit
    /// into the jars' temporary stores. The transaction stays active.
    pub fn commit_sub(&self) -> CoreResult<()> {
        self.run_commit(true)
    }

    fn run_commit(&self, sub: bool) -> CoreResult<()> {
        let manager = Arc::clone(&self.inner.manager);
        let (objects, sub_jars) = self.with_state(|state| -> CoreResult<(Vec<TxnObject>, Vec<Arc<dyn Jar>>)> {
            state.ensure_active()?;
            if manager.is_hosed() {
                return Err(CoreError::Hosed);
            }
            let mut objects = mem::take(&mut state.objects);
            if sub {
                return Ok((objects, Vec::new()));
            }
            state.status = TransactionStatus::Committing;
            objects.append(&mut state.deferred);
            Ok((objects, mem::take(&mut state.sub_jars)))
        })?;

        let mut jars = Vec::new();
        let mut participating = Vec::with_capacity(objects.len());
        let mut deferred = Vec::new();
        for object in objects {
            if let Some(jar) = object.jar() {
                if sub && !jar.supports_subtransactions() {
                    deferred.push(object);
                    continue;
                }
                push_unique(&mut jars, jar);
            }
            participating.push(object);
        }
        if sub {
            self.with_state(|state| state.deferred.extend(deferred));
        }
        for jar in &sub_jars {
            push_unique(&mut jars, Arc::clone(jar));
        }
        sort_jars(&mut jars);
        debug!(txn = self.id(), sub, jars = jars.len(), objects = participating.len(), "commit");

        let mut ncommitted = 0;
        let result = self.two_phase(&participating, &jars, &sub_jars, sub, &mut ncommitted);

        match result {
            Ok(()) if sub => {
                self.with_state(|state| {
                    for jar in jars {
                        push_unique(&mut state.sub_jars, jar);
                    }
                });
                Ok(())
            }
            Ok(()) => {
                self.with_state(|state| state.status = TransactionStatus::Committed);
                manager.after_completion(self);
                Ok(())
            }
            Err(err) => {
                self.unwind(&participating[ncommitted..], &jars, &sub_jars);
                if !sub {
                    self.with_state(|state| state.status = TransactionStatus::Aborted);
                    manager.after_completion(self);
                }
                Err(err)
            }
        }
    }

    fn two_phase(
        &self,
        objects: &[TxnObject],
        jars: &[Arc<dyn Jar>],
        sub_jars: &[Arc<dyn Jar>],
        sub: bool,
        ncommitted: &mut usize,
    ) -> CoreResult<()> {
        for jar in jars {
            if sub {
                match jar.tpc_begin(self, true) {
                    Err(CoreError::Unsupported { .. }) => jar.tpc_begin(self, false)?,
                    other => other?,
                }
            } else if contains_jar(sub_jars, jar) {
                jar.commit_sub(self)?;
            } else {
                jar.tpc_begin(self, false)?;
            }
        }

        for object in objects {
            if let Some(jar) = object.jar() {
                jar.commit(object, self)?;
            }
            *ncommitted += 1;
        }

        if !sub {
            for jar in jars {
                jar.tpc_vote(self)?;
            }
        }

        // Once one jar has finished its work is durable; a later failure
        // cannot be rolled back.
        for (finished, jar) in jars.iter().enumerate() {
            if let Err(err) = jar.tpc_finish(self) {
                if finished > 0 {
                    self.inner.manager.set_hosed();
                    error!(
                        txn = self.id(),
                        finished,
                        error = %err,
                        "jar failed in the last phase of two-phase commit after others finished; \
                         further commits are refused"
                    );
                } else {
                    error!(txn = self.id(), error = %err, "jar failed in the last phase of two-phase commit");
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn unwind(&self, pending: &[TxnObject], jars: &[Arc<dyn Jar>], sub_jars: &[Arc<dyn Jar>]) {
        for object in pending {
            if let Some(jar) = object.jar() {
                if let Err(err) = jar.abort(object, self) {
                    warn!(txn = self.id(), object = ?object, error = %err, "object abort failed during unwind");
                }
            }
        }
        for jar in jars {
            if let Err(err) = jar.tpc_abort(self) {
                warn!(txn = self.id(), error = %err, "tpc_abort failed during unwind");
            }
        }
        for jar in sub_jars {
            if let Err(err) = jar.abort_sub(self) {
                warn!(txn = self.id(), error = %err, "abort_sub failed during unwind");
            }
        }
    }

    /// Aborts the transaction.
    ///
    /// Every registered object is aborted and every jar holding
    /// sub-transaction work discards it, even if some of them fail. The
    /// first failure is returned afterwards. Aborting twice is a no-op.
    pub fn abort(&self) -> CoreResult<()> {
        let taken = self.with_state(|state| match state.status {
            TransactionStatus::Aborted => Ok(None),
            TransactionStatus::Active => {
                state.status = TransactionStatus::Aborted;
                let mut objects = mem::take(&mut state.objects);
                objects.append(&mut state.deferred);
                Ok(Some((objects, mem::take(&mut state.sub_jars))))
            }
            status => Err(CoreError::invalid_operation(format!(
                "cannot abort a transaction that is {status:?}"
            ))),
        })?;
        let Some((objects, sub_jars)) = taken else {
            return Ok(());
        };

        let mut first = self.abort_objects(&objects);
        for jar in sub_jars.iter().rev() {
            if let Err(err) = jar.abort_sub(self) {
                warn!(txn = self.id(), error = %err, "abort_sub failed");
                first.get_or_insert(err);
            }
        }
        self.inner.manager.after_completion(self);
        first.map_or(Ok(()), Err)
    }

    /// Aborts the objects registered since the last sub-transaction commit.
    /// Committed sub-transaction work is kept.
    pub fn abort_sub(&self) -> CoreResult<()> {
        let objects = self.with_state(|state| {
            state.ensure_active()?;
            Ok::<_, CoreError>(mem::take(&mut state.objects))
        })?;
        self.abort_objects(&objects).map_or(Ok(()), Err)
    }

    fn abort_objects(&self, objects: &[TxnObject]) -> Option<CoreError> {
        let mut first = None;
        for object in objects {
            let Some(jar) = object.jar() else {
                continue;
            };
            if let Err(err) = jar.abort(object, self) {
                warn!(txn = self.id(), object = ?object, error = %err, "object abort failed");
                first.get_or_insert(err);
            }
        }
        first
    }
}
