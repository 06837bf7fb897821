//! In-memory staging of sub-transaction commits.

use crate::types::{Oid, Tid};
use std::collections::BTreeMap;

/// A stored object state waiting for the top-level commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TmpEntry {
    pub data: Vec<u8>,
    pub refs: Vec<Oid>,
    /// Serial the state was based on; the top-level commit stores with it.
    pub serial: Tid,
}

/// Holds the states written by committed sub-transactions, plus the
/// writes of the sub-commit in progress.
#[derive(Debug, Default)]
pub(crate) struct TmpStore {
    committed: BTreeMap<Oid, TmpEntry>,
    pending: BTreeMap<Oid, TmpEntry>,
}

impl TmpStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn store(&mut self, oid: Oid, serial: Tid, data: Vec<u8>, refs: Vec<Oid>) {
        let serial = self.committed.get(&oid).map_or(serial, |e| e.serial);
        self.pending.insert(oid, TmpEntry { data, refs, serial });
    }

    pub(crate) fn finish(&mut self) {
        self.committed.append(&mut self.pending);
    }

    /// Drops the writes of the sub-commit in progress.
    pub(crate) fn abort(&mut self) {
        self.pending.clear();
    }

    pub(crate) fn load(&self, oid: Oid) -> Option<(Vec<u8>, Tid)> {
        self.committed.get(&oid).map(|e| (e.data.clone(), e.serial))
    }

    pub(crate) fn oids(&self) -> impl Iterator<Item = Oid> + '_ {
        self.committed.keys().copied()
    }

    pub(crate) fn into_entries(self) -> BTreeMap<Oid, TmpEntry> {
        self.committed
    }
}
