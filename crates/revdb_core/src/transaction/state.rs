//! Transaction state.

use crate::error::{CoreError, CoreResult};
use crate::persistent::PRef;
use crate::transaction::jar::{jar_addr, Jar, TxnObject};
use crate::transaction::manager::ManagerShared;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Transaction is open and accepts registrations.
    Active,
    /// A top-level commit is running.
    Committing,
    /// Transaction has been committed.
    Committed,
    /// Transaction has been aborted, or its commit failed.
    Aborted,
}

impl TransactionStatus {
    /// True for `Committed` and `Aborted`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

pub(crate) struct TxnState {
    pub status: TransactionStatus,
    /// Registered since the last sub-transaction commit, in order.
    pub objects: Vec<TxnObject>,
    /// Objects of jars without sub-transaction support, held back from
    /// sub-commits.
    pub deferred: Vec<TxnObject>,
    /// Jars holding committed sub-transaction work.
    pub sub_jars: Vec<Arc<dyn Jar>>,
    pub user: String,
    pub description: String,
    pub extension: BTreeMap<String, String>,
}

impl TxnState {
    pub(crate) fn ensure_active(&self) -> CoreResult<()> {
        match self.status {
            TransactionStatus::Active => Ok(()),
            status => Err(CoreError::invalid_operation(format!(
                "transaction is {status:?}"
            ))),
        }
    }
}

pub(crate) struct TxnInner {
    pub id: u64,
    pub manager: Arc<ManagerShared>,
    pub state: Mutex<TxnState>,
}

/// A unit of work spanning one or more jars.
///
/// `Transaction` is a cheap handle; clones refer to the same transaction.
/// It is passed explicitly to every connection and storage call that acts
/// on its behalf.
#[derive(Clone)]
pub struct Transaction {
    pub(crate) inner: Arc<TxnInner>,
}

impl Transaction {
    pub(crate) fn new(id: u64, manager: Arc<ManagerShared>) -> Self {
        Self {
            inner: Arc::new(TxnInner {
                id,
                manager,
                state: Mutex::new(TxnState {
                    status: TransactionStatus::Active,
                    objects: Vec::new(),
                    deferred: Vec::new(),
                    sub_jars: Vec::new(),
                    user: String::new(),
                    description: String::new(),
                    extension: BTreeMap::new(),
                }),
            }),
        }
    }

    /// Returns the transaction id. Unique within the process.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Returns the current status.
    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        self.inner.state.lock().status
    }

    /// Checks if the transaction still accepts work.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status() == TransactionStatus::Active
    }

    /// True if both handles refer to the same transaction.
    #[must_use]
    pub fn same_as(&self, other: &Transaction) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Registers a modified (or conflicting) object. Registering the same
    /// object twice has no effect.
    pub fn register(&self, object: &PRef) -> CoreResult<()> {
        self.join(TxnObject::Object(Arc::clone(object)))
    }

    /// Registers a participant that is its own jar.
    pub fn join_resource(&self, jar: Arc<dyn Jar>) -> CoreResult<()> {
        self.join(TxnObject::Resource(jar))
    }

    fn join(&self, entry: TxnObject) -> CoreResult<()> {
        let mut state = self.inner.state.lock();
        state.ensure_active()?;
        let known = state
            .objects
            .iter()
            .chain(state.deferred.iter())
            .any(|o| o.same_as(&entry));
        if !known {
            state.objects.push(entry);
        }
        Ok(())
    }

    /// True if the object is registered and not yet committed.
    #[must_use]
    pub fn is_registered(&self, object: &PRef) -> bool {
        let entry = TxnObject::Object(Arc::clone(object));
        let state = self.inner.state.lock();
        state
            .objects
            .iter()
            .chain(state.deferred.iter())
            .any(|o| o.same_as(&entry))
    }

    /// Appends a line to the transaction description.
    pub fn note(&self, text: &str) {
        let mut state = self.inner.state.lock();
        if !state.description.is_empty() {
            state.description.push('\n');
        }
        state.description.push_str(text);
    }

    /// Sets the user, qualified by `path` when it is not empty.
    pub fn set_user(&self, user: &str, path: &str) {
        let mut state = self.inner.state.lock();
        state.user = if path.is_empty() {
            user.to_string()
        } else {
            format!("{path} {user}")
        };
    }

    /// Sets one entry of the extension metadata.
    pub fn set_extension(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .state
            .lock()
            .extension
            .insert(key.into(), value.into());
    }

    /// Returns the user.
    #[must_use]
    pub fn user(&self) -> String {
        self.inner.state.lock().user.clone()
    }

    /// Returns the description.
    #[must_use]
    pub fn description(&self) -> String {
        self.inner.state.lock().description.clone()
    }

    /// Returns the extension metadata.
    #[must_use]
    pub fn extension(&self) -> BTreeMap<String, String> {
        self.inner.state.lock().extension.clone()
    }

    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut TxnState) -> R) -> R {
        f(&mut self.inner.state.lock())
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Adds `jar` to `jars` unless a jar at the same address is present.
pub(crate) fn push_unique(jars: &mut Vec<Arc<dyn Jar>>, jar: Arc<dyn Jar>) {
    let addr = jar_addr(&jar);
    if !jars.iter().any(|j| jar_addr(j) == addr) {
        jars.push(jar);
    }
}

pub(crate) fn contains_jar(jars: &[Arc<dyn Jar>], jar: &Arc<dyn Jar>) -> bool {
    let addr = jar_addr(jar);
    jars.iter().any(|j| jar_addr(j) == addr)
}

/// Orders jars by sort key, then by address.
pub(crate) fn sort_jars(jars: &mut [Arc<dyn Jar>]) {
    jars.sort_by_cached_key(|j| (j.sort_key(), jar_addr(j)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionManager;

    #[test]
    fn metadata_accumulates() {
        let txn = TransactionManager::new().begin();
        txn.note("first");
        txn.note("second");
        txn.set_user("alice", "/site");
        txn.set_extension("reason", "test");

        assert_eq!(txn.description(), "first\nsecond");
        assert_eq!(txn.user(), "/site alice");
        assert_eq!(txn.extension().get("reason").map(String::as_str), Some("test"));
    }

    #[test]
    fn terminal_transactions_reject_work() {
        let txn = TransactionManager::new().begin();
        assert!(txn.is_active());
        txn.commit().unwrap();
        assert_eq!(txn.status(), TransactionStatus::Committed);
        assert!(txn.status().is_terminal());
        assert!(matches!(txn.commit(), Err(CoreError::InvalidOperation { .. })));
    }

    #[test]
    fn clones_share_state() {
        let txn = TransactionManager::new().begin();
        let other = txn.clone();
        other.note("shared");
        assert!(txn.same_as(&other));
        assert_eq!(txn.description(), "shared");
    }
}
