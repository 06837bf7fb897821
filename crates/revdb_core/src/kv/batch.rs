//! Write batches.

use crate::kv::TableId;

/// One mutation inside a [`WriteBatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Set a key.
    Put {
        /// Target table.
        table: TableId,
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },
    /// Remove a key.
    Delete {
        /// Target table.
        table: TableId,
        /// Key bytes.
        key: Vec<u8>,
    },
    /// Add a signed delta to a counter. A counter that drops to zero or
    /// below is removed.
    Add {
        /// Target table.
        table: TableId,
        /// Key bytes.
        key: Vec<u8>,
        /// Signed change.
        delta: i64,
    },
}

/// Mutations that are journaled and applied as one atomic unit.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    /// Creates an empty batch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `table[key] = value`.
    pub fn put(&mut self, table: TableId, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Put {
            table,
            key: key.into(),
            value: value.into(),
        });
    }

    /// Queues removal of `table[key]`.
    pub fn delete(&mut self, table: TableId, key: impl Into<Vec<u8>>) {
        self.ops.push(BatchOp::Delete {
            table,
            key: key.into(),
        });
    }

    /// Queues a counter change.
    pub fn add(&mut self, table: TableId, key: impl Into<Vec<u8>>, delta: i64) {
        if delta != 0 {
            self.ops.push(BatchOp::Add {
                table,
                key: key.into(),
                delta,
            });
        }
    }

    /// Number of queued mutations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// True if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Queued mutations, in order.
    #[must_use]
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub(crate) fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}
