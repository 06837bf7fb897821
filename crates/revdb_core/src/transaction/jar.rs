//! The participant protocol driven by [`Transaction::commit`].

use crate::error::{CoreError, CoreResult};
use crate::persistent::PRef;
use crate::transaction::Transaction;
use std::fmt;
use std::sync::Arc;

/// A transaction participant.
///
/// Connections are jars for the objects they own; storage-level operations
/// such as undo join a transaction as resources that are their own jar.
///
/// Call order for one jar in a top-level commit:
///
/// ```text
/// tpc_begin(sub = false) | commit_sub
///   commit(object)*
///   tpc_vote
///   tpc_finish
/// ```
///
/// On failure anywhere, the coordinator calls `abort` for every object it
/// did not get to, `tpc_abort` on every jar and `abort_sub` on jars that
/// took part in sub-transactions.
pub trait Jar: Send + Sync {
    /// Key that orders jars in two-phase commit. Jars without a key sort
    /// first, by address.
    fn sort_key(&self) -> Option<String> {
        None
    }

    /// Starts two-phase commit. `sub` is true for a sub-transaction
    /// commit; jars that cannot tell the difference may return
    /// [`CoreError::Unsupported`] and are begun again with `sub = false`.
    fn tpc_begin(&self, txn: &Transaction, sub: bool) -> CoreResult<()>;

    /// Writes one registered object.
    fn commit(&self, object: &TxnObject, txn: &Transaction) -> CoreResult<()>;

    /// Votes on the commit. Jars that need no vote keep the default.
    fn tpc_vote(&self, _txn: &Transaction) -> CoreResult<()> {
        Ok(())
    }

    /// Makes the commit permanent.
    fn tpc_finish(&self, txn: &Transaction) -> CoreResult<()>;

    /// Rolls the commit back. Must be safe to call even if `tpc_begin`
    /// never ran.
    fn tpc_abort(&self, txn: &Transaction) -> CoreResult<()>;

    /// Discards the changes of one registered object.
    fn abort(&self, object: &TxnObject, txn: &Transaction) -> CoreResult<()>;

    /// True if the jar can hold sub-transaction commits. Objects of other
    /// jars are held back until the top-level commit.
    fn supports_subtransactions(&self) -> bool {
        false
    }

    /// Starts the top-level commit of the work collected by
    /// sub-transaction commits. Replaces `tpc_begin`.
    fn commit_sub(&self, _txn: &Transaction) -> CoreResult<()> {
        Err(CoreError::unsupported("commit_sub"))
    }

    /// Discards the work collected by sub-transaction commits.
    fn abort_sub(&self, _txn: &Transaction) -> CoreResult<()> {
        Err(CoreError::unsupported("abort_sub"))
    }
}

/// Something registered with a transaction.
#[derive(Clone)]
pub enum TxnObject {
    /// A persistent object; its connection is the jar.
    Object(PRef),
    /// A participant that is its own jar.
    Resource(Arc<dyn Jar>),
}

impl TxnObject {
    /// The jar responsible for this entry, if any.
    #[must_use]
    pub fn jar(&self) -> Option<Arc<dyn Jar>> {
        match self {
            Self::Object(object) => object.jar(),
            Self::Resource(jar) => Some(Arc::clone(jar)),
        }
    }

    /// The persistent object, for object entries.
    #[must_use]
    pub fn object(&self) -> Option<&PRef> {
        match self {
            Self::Object(object) => Some(object),
            Self::Resource(_) => None,
        }
    }

    pub(crate) fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Object(a), Self::Object(b)) => Arc::ptr_eq(a, b),
            (Self::Resource(a), Self::Resource(b)) => jar_addr(a) == jar_addr(b),
            _ => false,
        }
    }
}

impl fmt::Debug for TxnObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Object(object) => f.debug_tuple("Object").field(&object.oid()).finish(),
            Self::Resource(jar) => f.debug_tuple("Resource").field(&jar.sort_key()).finish(),
        }
    }
}

/// Address of the jar's data, used as its identity.
pub(crate) fn jar_addr(jar: &Arc<dyn Jar>) -> usize {
    Arc::as_ptr(jar).cast::<()>() as usize
}
