//! Journal writer.

use crate::error::{CoreError, CoreResult};
use crate::wal::record::{compute_crc32, WalRecord, WAL_MAGIC, WAL_VERSION};
use crate::wal::WalRecordIterator;
use parking_lot::Mutex;
use revdb_storage::StorageBackend;

/// magic (4) + version (2) + type (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;

/// Append-only journal over a storage backend.
pub struct WalManager {
    backend: Mutex<Box<dyn StorageBackend>>,
    sync_on_commit: bool,
}

impl WalManager {
    /// Creates a journal over `backend`.
    pub fn new(backend: Box<dyn StorageBackend>, sync_on_commit: bool) -> Self {
        Self {
            backend: Mutex::new(backend),
            sync_on_commit,
        }
    }

    /// Encodes one record with its envelope.
    pub fn frame(record: &WalRecord) -> CoreResult<Vec<u8>> {
        let payload = record.encode_payload()?;
        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_operation("journal record payload too large"))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&WAL_MAGIC);
        data.extend_from_slice(&WAL_VERSION.to_le_bytes());
        data.push(record.record_type().as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Appends one record, returning its offset. Not flushed.
    pub fn append(&self, record: &WalRecord) -> CoreResult<u64> {
        let data = Self::frame(record)?;
        Ok(self.backend.lock().append(&data)?)
    }

    /// Appends several records in one backend write and flushes them.
    pub fn append_all(&self, records: &[WalRecord]) -> CoreResult<u64> {
        let mut data = Vec::new();
        for record in records {
            data.extend(Self::frame(record)?);
        }
        let mut backend = self.backend.lock();
        let offset = backend.append(&data)?;
        backend.flush()?;
        Ok(offset)
    }

    /// Appends a commit-point record and makes it durable according to the
    /// sync policy.
    pub fn append_durable(&self, record: &WalRecord) -> CoreResult<u64> {
        let data = Self::frame(record)?;
        let mut backend = self.backend.lock();
        let offset = backend.append(&data)?;
        backend.flush()?;
        if self.sync_on_commit {
            backend.sync()?;
        }
        Ok(offset)
    }

    /// Flushes pending writes.
    pub fn flush(&self) -> CoreResult<()> {
        self.backend.lock().flush()?;
        Ok(())
    }

    /// Forces everything written so far to durable storage.
    pub fn sync(&self) -> CoreResult<()> {
        self.backend.lock().sync()?;
        Ok(())
    }

    /// Returns the current journal size.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.backend.lock().size()?)
    }

    /// Returns a streaming iterator over journal records.
    ///
    /// The iterator holds the journal lock until dropped.
    pub fn iter(&self) -> CoreResult<WalRecordIterator<'_>> {
        WalRecordIterator::new(self.backend.lock(), 0)
    }

    /// Reads all records from the journal.
    pub fn read_all(&self) -> CoreResult<Vec<(u64, WalRecord)>> {
        self.iter()?.collect()
    }

    /// Truncates the journal to `offset`.
    pub fn truncate(&self, offset: u64) -> CoreResult<()> {
        self.backend.lock().truncate(offset)?;
        Ok(())
    }

    /// Clears the journal.
    pub fn clear(&self) -> CoreResult<()> {
        self.truncate(0)
    }
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager")
            .field("sync_on_commit", &self.sync_on_commit)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revdb_storage::InMemoryBackend;

    #[test]
    fn records_come_back_in_order() {
        let wal = WalManager::new(Box::new(InMemoryBackend::new()), false);
        let records = vec![
            WalRecord::Begin { batch: 1 },
            WalRecord::Put {
                batch: 1,
                table: 1,
                key: b"k".to_vec(),
                value: b"v".to_vec(),
            },
            WalRecord::Commit {
                batch: 1,
                sequence: 1,
            },
        ];
        wal.append_all(&records[..2]).unwrap();
        wal.append_durable(&records[2]).unwrap();

        let read: Vec<_> = wal.read_all().unwrap().into_iter().map(|(_, r)| r).collect();
        assert_eq!(read, records);
    }

    #[test]
    fn offsets_are_byte_positions() {
        let wal = WalManager::new(Box::new(InMemoryBackend::new()), false);
        let first = wal.append(&WalRecord::Begin { batch: 1 }).unwrap();
        let second = wal.append(&WalRecord::Begin { batch: 2 }).unwrap();
        assert_eq!(first, 0);
        assert_eq!(second, (HEADER_SIZE + 8 + CRC_SIZE) as u64);

        let read = wal.read_all().unwrap();
        assert_eq!(read[1].0, second);
    }

    #[test]
    fn clear_empties_the_journal() {
        let wal = WalManager::new(Box::new(InMemoryBackend::new()), true);
        wal.append_durable(&WalRecord::Checkpoint { sequence: 9 }).unwrap();
        assert!(wal.size().unwrap() > 0);
        wal.clear().unwrap();
        assert_eq!(wal.size().unwrap(), 0);
        assert!(wal.read_all().unwrap().is_empty());
    }
}
