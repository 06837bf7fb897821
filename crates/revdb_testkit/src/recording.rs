//! A transaction participant that records the calls it receives.

use parking_lot::Mutex;
use revdb_core::{CoreError, CoreResult, Jar, Transaction, TxnObject};
use std::sync::Arc;

/// One call received by a [`RecordingJar`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JarCall {
    /// Jar name.
    pub jar: String,
    /// Protocol step (`tpc_begin`, `commit`, `tpc_vote`, ...).
    pub step: &'static str,
    /// Id of the transaction the call was made for.
    pub txn: u64,
}

/// Calls shared by several jars, in arrival order.
pub type CallLog = Arc<Mutex<Vec<JarCall>>>;

/// A new, empty call log.
pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// A jar that writes nothing and logs every call.
///
/// Jars sort by name. A jar can be told to fail at one step.
pub struct RecordingJar {
    name: String,
    log: CallLog,
    fail_at: Mutex<Option<&'static str>>,
}

impl RecordingJar {
    /// A jar logging to `log`.
    pub fn new(name: &str, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            log: Arc::clone(log),
            fail_at: Mutex::new(None),
        })
    }

    /// Makes the jar fail the next time it reaches `step`.
    pub fn fail_at(&self, step: &'static str) {
        *self.fail_at.lock() = Some(step);
    }

    /// Registers the jar with `txn`.
    pub fn join(self: &Arc<Self>, txn: &Transaction) -> CoreResult<()> {
        txn.join_resource(Arc::clone(self) as Arc<dyn Jar>)
    }

    fn record(&self, step: &'static str, txn: &Transaction) -> CoreResult<()> {
        self.log.lock().push(JarCall {
            jar: self.name.clone(),
            step,
            txn: txn.id(),
        });
        let mut fail_at = self.fail_at.lock();
        if *fail_at == Some(step) {
            *fail_at = None;
            return Err(CoreError::storage_system(format!("{} failed in {step}", self.name)));
        }
        Ok(())
    }
}

impl Jar for RecordingJar {
    fn sort_key(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn tpc_begin(&self, txn: &Transaction, _sub: bool) -> CoreResult<()> {
        self.record("tpc_begin", txn)
    }

    fn commit(&self, _object: &TxnObject, txn: &Transaction) -> CoreResult<()> {
        self.record("commit", txn)
    }

    fn tpc_vote(&self, txn: &Transaction) -> CoreResult<()> {
        self.record("tpc_vote", txn)
    }

    fn tpc_finish(&self, txn: &Transaction) -> CoreResult<()> {
        self.record("tpc_finish", txn)
    }

    fn tpc_abort(&self, txn: &Transaction) -> CoreResult<()> {
        self.record("tpc_abort", txn)
    }

    fn abort(&self, _object: &TxnObject, txn: &Transaction) -> CoreResult<()> {
        self.record("abort", txn)
    }
}

/// The jars that received `step`, in call order, for one transaction.
pub fn jars_at(log: &CallLog, step: &str, txn: u64) -> Vec<String> {
    log.lock()
        .iter()
        .filter(|call| call.step == step && call.txn == txn)
        .map(|call| call.jar.clone())
        .collect()
}
