//! The journaled table store.

use crate::error::{CoreError, CoreResult};
use crate::kv::batch::{BatchOp, WriteBatch};
use crate::kv::snapshot::SnapshotStore;
use crate::kv::{decode_u64, encode_u64, TableId};
use crate::wal::{WalManager, WalRecord};
use revdb_storage::StorageBackend;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use tracing::{debug, info, warn};

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// Options for [`KvStore::open`].
#[derive(Debug, Clone, Copy)]
pub struct KvOptions {
    /// Sync the journal at every durable commit.
    pub sync_on_commit: bool,
    /// Journal size that triggers an automatic checkpoint (0 = never).
    pub checkpoint_wal_size: u64,
    /// Refuse all writes.
    pub read_only: bool,
}

/// A batch whose mutations are journaled but not yet committed.
///
/// Produced by [`KvStore::prepare`]; must be handed back to
/// [`KvStore::commit_prepared`] or [`KvStore::abort_prepared`].
#[derive(Debug)]
#[must_use = "a prepared batch must be committed or aborted"]
pub struct PreparedBatch {
    id: u64,
    ops: Vec<BatchOp>,
}

impl PreparedBatch {
    /// Journal batch id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Ordered in-memory tables backed by a journal and ping-pong snapshots.
///
/// Not internally synchronized; the storage engine owns it behind its
/// single storage lock.
pub struct KvStore {
    tables: Vec<Table>,
    journal: WalManager,
    snapshots: SnapshotStore,
    options: KvOptions,
    next_batch: u64,
    sequence: u64,
    prepared: BTreeSet<u64>,
}

impl KvStore {
    /// Opens the store, recovering tables from the snapshots and journal.
    pub fn open(
        journal: Box<dyn StorageBackend>,
        snapshot_a: Box<dyn StorageBackend>,
        snapshot_b: Box<dyn StorageBackend>,
        options: KvOptions,
    ) -> CoreResult<Self> {
        let mut snapshots = SnapshotStore::new(snapshot_a, snapshot_b);
        let mut tables = vec![Table::new(); TableId::COUNT];
        let image = snapshots.load()?;
        let snapshot_sequence = image.as_ref().map_or(0, |i| i.sequence);
        if let Some(image) = image {
            for (table, key, value) in image.entries {
                tables[table.index()].insert(key, value);
            }
        }

        let journal = WalManager::new(journal, options.sync_on_commit);
        let mut store = Self {
            tables,
            journal,
            snapshots,
            options,
            next_batch: 1,
            sequence: snapshot_sequence,
            prepared: BTreeSet::new(),
        };
        store.recover(snapshot_sequence)?;
        Ok(store)
    }

    fn recover(&mut self, snapshot_sequence: u64) -> CoreResult<()> {
        let mut open: HashMap<u64, Vec<BatchOp>> = HashMap::new();
        let mut committed = Vec::new();
        let mut max_batch = 0;
        let mut max_sequence = snapshot_sequence;

        let (valid_end, total_size) = {
            let mut iter = self.journal.iter()?;
            for result in iter.by_ref() {
                let (_, record) = result?;
                if let Some(batch) = record.batch() {
                    max_batch = max_batch.max(batch);
                }
                match record {
                    WalRecord::Begin { batch } => {
                        open.entry(batch).or_default();
                    }
                    WalRecord::Put {
                        batch,
                        table,
                        key,
                        value,
                    } => open.entry(batch).or_default().push(BatchOp::Put {
                        table: table_from_byte(table)?,
                        key,
                        value,
                    }),
                    WalRecord::Delete { batch, table, key } => {
                        open.entry(batch).or_default().push(BatchOp::Delete {
                            table: table_from_byte(table)?,
                            key,
                        });
                    }
                    WalRecord::Add {
                        batch,
                        table,
                        key,
                        delta,
                    } => open.entry(batch).or_default().push(BatchOp::Add {
                        table: table_from_byte(table)?,
                        key,
                        delta,
                    }),
                    WalRecord::Commit { batch, sequence } => {
                        let ops = open.remove(&batch).unwrap_or_default();
                        if sequence > snapshot_sequence {
                            committed.push(ops);
                            max_sequence = max_sequence.max(sequence);
                        }
                    }
                    WalRecord::Abort { batch } => {
                        open.remove(&batch);
                    }
                    WalRecord::Checkpoint { sequence } => {
                        if sequence > snapshot_sequence {
                            return Err(CoreError::snapshot_corruption(format!(
                                "journal checkpoint at sequence {sequence} but newest snapshot is at {snapshot_sequence}"
                            )));
                        }
                    }
                }
            }
            (iter.valid_end(), iter.total_size())
        };

        let replayed = committed.len();
        for ops in committed {
            self.apply(ops);
        }
        self.sequence = max_sequence;
        self.next_batch = max_batch + 1;

        if valid_end < total_size && !self.options.read_only {
            warn!(
                valid_end,
                total_size, "discarding torn record at the end of the journal"
            );
            self.journal.truncate(valid_end)?;
        }
        info!(
            snapshot_sequence,
            replayed,
            discarded = open.len(),
            sequence = self.sequence,
            "journal recovered"
        );
        Ok(())
    }

    fn apply(&mut self, ops: Vec<BatchOp>) {
        for op in ops {
            match op {
                BatchOp::Put { table, key, value } => {
                    self.tables[table.index()].insert(key, value);
                }
                BatchOp::Delete { table, key } => {
                    self.tables[table.index()].remove(&key);
                }
                BatchOp::Add { table, key, delta } => {
                    let map = &mut self.tables[table.index()];
                    let current = map.get(&key).map_or(0, |v| decode_u64(v));
                    let updated = i128::from(current) + i128::from(delta);
                    if updated <= 0 {
                        map.remove(&key);
                    } else {
                        let updated = u64::try_from(updated).unwrap_or(u64::MAX);
                        map.insert(key, encode_u64(updated));
                    }
                }
            }
        }
    }

    fn ensure_writable(&self) -> CoreResult<()> {
        if self.options.read_only {
            return Err(CoreError::ReadOnly);
        }
        Ok(())
    }

    fn journal_batch(&mut self, ops: &[BatchOp]) -> CoreResult<u64> {
        let id = self.next_batch;
        self.next_batch += 1;
        let mut records = Vec::with_capacity(ops.len() + 1);
        records.push(WalRecord::Begin { batch: id });
        for op in ops {
            records.push(match op {
                BatchOp::Put { table, key, value } => WalRecord::Put {
                    batch: id,
                    table: table.as_byte(),
                    key: key.clone(),
                    value: value.clone(),
                },
                BatchOp::Delete { table, key } => WalRecord::Delete {
                    batch: id,
                    table: table.as_byte(),
                    key: key.clone(),
                },
                BatchOp::Add { table, key, delta } => WalRecord::Add {
                    batch: id,
                    table: table.as_byte(),
                    key: key.clone(),
                    delta: *delta,
                },
            });
        }
        self.journal.append_all(&records)?;
        Ok(id)
    }

    fn finish_commit(&mut self, id: u64, ops: Vec<BatchOp>, durable: bool) -> CoreResult<u64> {
        let sequence = self.sequence + 1;
        let record = WalRecord::Commit {
            batch: id,
            sequence,
        };
        if durable {
            self.journal.append_durable(&record)?;
        } else {
            self.journal.append(&record)?;
            self.journal.flush()?;
        }
        self.apply(ops);
        self.sequence = sequence;
        self.maybe_checkpoint();
        Ok(sequence)
    }

    /// Journals and applies `batch` atomically. Returns its commit sequence.
    pub fn commit(&mut self, batch: WriteBatch) -> CoreResult<u64> {
        self.commit_with(batch, true)
    }

    /// Like [`KvStore::commit`], but only flushes the journal instead of
    /// following the sync policy. Used for pack bookkeeping, where losing
    /// the last few batches in a crash only loses progress.
    pub fn commit_relaxed(&mut self, batch: WriteBatch) -> CoreResult<u64> {
        self.commit_with(batch, false)
    }

    fn commit_with(&mut self, batch: WriteBatch, durable: bool) -> CoreResult<u64> {
        self.ensure_writable()?;
        if batch.is_empty() {
            return Ok(self.sequence);
        }
        let ops = batch.into_ops();
        let id = self.journal_batch(&ops)?;
        self.finish_commit(id, ops, durable)
    }

    /// Journals `batch` without applying it.
    pub fn prepare(&mut self, batch: WriteBatch) -> CoreResult<PreparedBatch> {
        self.ensure_writable()?;
        let ops = batch.into_ops();
        let id = self.journal_batch(&ops)?;
        self.prepared.insert(id);
        Ok(PreparedBatch { id, ops })
    }

    /// Commits a prepared batch.
    pub fn commit_prepared(&mut self, prepared: PreparedBatch) -> CoreResult<u64> {
        self.prepared.remove(&prepared.id);
        self.finish_commit(prepared.id, prepared.ops, true)
    }

    /// Discards a prepared batch.
    pub fn abort_prepared(&mut self, prepared: PreparedBatch) -> CoreResult<()> {
        self.prepared.remove(&prepared.id);
        self.journal.append(&WalRecord::Abort { batch: prepared.id })?;
        self.journal.flush()
    }

    /// Writes all tables to the inactive snapshot and clears the journal.
    ///
    /// Refused while a prepared batch is outstanding, since its journal
    /// records would be lost.
    pub fn checkpoint(&mut self) -> CoreResult<()> {
        self.ensure_writable()?;
        if !self.prepared.is_empty() {
            return Err(CoreError::invalid_operation(
                "cannot checkpoint while a prepared batch is outstanding",
            ));
        }
        let sequence = self.sequence;
        let tables = &self.tables;
        let entries = TableId::ALL.into_iter().flat_map(|table| {
            tables[table.index()]
                .iter()
                .map(move |(k, v)| (table, k.as_slice(), v.as_slice()))
        });
        self.snapshots.write(sequence, entries)?;
        self.journal.clear()?;
        self.journal
            .append_durable(&WalRecord::Checkpoint { sequence })?;
        debug!(sequence, "checkpoint written");
        Ok(())
    }

    fn maybe_checkpoint(&mut self) {
        let threshold = self.options.checkpoint_wal_size;
        if threshold == 0 || !self.prepared.is_empty() {
            return;
        }
        match self.journal.size() {
            Ok(size) if size >= threshold => {
                if let Err(e) = self.checkpoint() {
                    warn!(error = %e, "automatic checkpoint failed");
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not read journal size"),
        }
    }

    /// Current commit sequence.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Current journal size in bytes.
    pub fn journal_size(&self) -> CoreResult<u64> {
        self.journal.size()
    }

    /// Syncs the journal.
    pub fn sync(&self) -> CoreResult<()> {
        self.journal.sync()
    }

    /// Looks up a key.
    #[must_use]
    pub fn get(&self, table: TableId, key: &[u8]) -> Option<&[u8]> {
        self.tables[table.index()].get(key).map(Vec::as_slice)
    }

    /// True if the key exists.
    #[must_use]
    pub fn contains(&self, table: TableId, key: &[u8]) -> bool {
        self.tables[table.index()].contains_key(key)
    }

    /// Reads a counter; missing keys are zero.
    #[must_use]
    pub fn counter(&self, table: TableId, key: &[u8]) -> u64 {
        self.get(table, key).map_or(0, decode_u64)
    }

    /// Number of keys in a table.
    #[must_use]
    pub fn len(&self, table: TableId) -> usize {
        self.tables[table.index()].len()
    }

    /// True if the table has no keys.
    #[must_use]
    pub fn is_empty(&self, table: TableId) -> bool {
        self.tables[table.index()].is_empty()
    }

    /// Iterates keys within the given bounds, in order.
    ///
    /// An empty or inverted range yields nothing.
    pub fn range<'a>(
        &'a self,
        table: TableId,
        start: Bound<&[u8]>,
        end: Bound<&[u8]>,
    ) -> impl DoubleEndedIterator<Item = (&'a [u8], &'a [u8])> + 'a {
        let bounds = if is_empty_range(start, end) {
            (Bound::Included(&[][..]), Bound::Excluded(&[][..]))
        } else {
            (start, end)
        };
        self.tables[table.index()]
            .range::<[u8], _>(bounds)
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Iterates keys starting with `prefix`, in order.
    pub fn prefix<'a>(
        &'a self,
        table: TableId,
        prefix: &[u8],
    ) -> impl DoubleEndedIterator<Item = (&'a [u8], &'a [u8])> + 'a {
        let end = prefix_end(prefix);
        let upper = match &end {
            Some(end) => Bound::Excluded(end.as_slice()),
            None => Bound::Unbounded,
        };
        self.tables[table.index()]
            .range::<[u8], _>((Bound::Included(prefix), upper))
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// First entry of a table.
    #[must_use]
    pub fn first(&self, table: TableId) -> Option<(&[u8], &[u8])> {
        self.tables[table.index()]
            .first_key_value()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }

    /// Last entry of a table.
    #[must_use]
    pub fn last(&self, table: TableId) -> Option<(&[u8], &[u8])> {
        self.tables[table.index()]
            .last_key_value()
            .map(|(k, v)| (k.as_slice(), v.as_slice()))
    }
}

impl std::fmt::Debug for KvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvStore")
            .field("sequence", &self.sequence)
            .field("prepared", &self.prepared.len())
            .finish_non_exhaustive()
    }
}

fn table_from_byte(byte: u8) -> CoreResult<TableId> {
    TableId::from_byte(byte)
        .ok_or_else(|| CoreError::journal_corruption(format!("unknown table {byte}")))
}

fn is_empty_range(start: Bound<&[u8]>, end: Bound<&[u8]>) -> bool {
    match (start, end) {
        (Bound::Included(s), Bound::Included(e)) => s > e,
        (Bound::Included(s) | Bound::Excluded(s), Bound::Excluded(e))
        | (Bound::Excluded(s), Bound::Included(e)) => s >= e,
        _ => false,
    }
}

fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}
