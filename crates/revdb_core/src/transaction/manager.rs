//! Transaction manager.

use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Transaction ids are unique across managers; storages key their commit
/// state on them.
static NEXT_TXN_ID: AtomicU64 = AtomicU64::new(1);

/// Set once a commit failed after some of its jars had finished. Applies to
/// every manager in the process and is never cleared.
static HOSED: AtomicBool = AtomicBool::new(false);

/// Observer of transaction boundaries.
pub trait Synchronizer: Send + Sync {
    /// Called when the manager starts a transaction.
    fn new_transaction(&self, _txn: &Transaction) {}

    /// Called after a top-level commit or abort, successful or not.
    fn after_completion(&self, txn: &Transaction);
}

/// State shared by a manager and its transactions.
pub(crate) struct ManagerShared {
    synchronizers: Mutex<Vec<Weak<dyn Synchronizer>>>,
}

impl ManagerShared {
    pub(crate) fn is_hosed(&self) -> bool {
        HOSED.load(Ordering::Acquire)
    }

    pub(crate) fn set_hosed(&self) {
        HOSED.store(true, Ordering::Release);
    }

    fn live_synchronizers(&self) -> Vec<Arc<dyn Synchronizer>> {
        let mut synchronizers = self.synchronizers.lock();
        synchronizers.retain(|s| s.strong_count() > 0);
        synchronizers.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn after_completion(&self, txn: &Transaction) {
        for synchronizer in self.live_synchronizers() {
            synchronizer.after_completion(txn);
        }
    }
}

/// Creates transactions and tracks the state they share.
///
/// Once any commit fails half way through its final phase the process is
/// *hosed*: every later commit, through any manager, fails with
/// [`CoreError::Hosed`](crate::CoreError::Hosed). The storages involved
/// can no longer be trusted to agree; recovery means checking them and
/// restarting the process.
#[derive(Clone)]
pub struct TransactionManager {
    shared: Arc<ManagerShared>,
}

impl TransactionManager {
    /// Creates a manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ManagerShared {
                synchronizers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Starts a transaction and announces it to the synchronizers.
    #[must_use]
    pub fn begin(&self) -> Transaction {
        let id = NEXT_TXN_ID.fetch_add(1, Ordering::Relaxed);
        let txn = Transaction::new(id, Arc::clone(&self.shared));
        for synchronizer in self.shared.live_synchronizers() {
            synchronizer.new_transaction(&txn);
        }
        txn
    }

    /// Registers an observer. The manager holds it weakly.
    pub fn register_synchronizer(&self, synchronizer: Weak<dyn Synchronizer>) {
        self.shared.synchronizers.lock().push(synchronizer);
    }

    /// True after a partially failed final commit phase anywhere in the
    /// process.
    #[must_use]
    pub fn is_hosed(&self) -> bool {
        self.shared.is_hosed()
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("hosed", &self.is_hosed())
            .finish_non_exhaustive()
    }
}
