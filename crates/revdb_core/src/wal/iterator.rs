//! Streaming journal record iterator.

use crate::error::{CoreError, CoreResult};
use crate::wal::record::{compute_crc32, WalRecord, WalRecordType, WAL_MAGIC, WAL_VERSION};
use crate::wal::writer::{CRC_SIZE, HEADER_SIZE};
use parking_lot::MutexGuard;
use revdb_storage::StorageBackend;

/// A streaming iterator over journal records.
///
/// Reads one record at a time from the backend and yields
/// `(offset, record)` pairs.
///
/// # Error Handling
///
/// - Truncated records (incomplete header or payload) end the iteration.
///   [`WalRecordIterator::valid_end`] then reports where the last complete
///   record ended, so the caller can cut the torn tail off.
/// - CRC mismatches, bad magic, unknown record types and newer format
///   versions are errors.
pub struct WalRecordIterator<'a> {
    backend: MutexGuard<'a, Box<dyn StorageBackend>>,
    total_size: u64,
    offset: u64,
    finished: bool,
}

impl<'a> WalRecordIterator<'a> {
    /// Creates an iterator starting at `start_offset`.
    pub fn new(
        backend: MutexGuard<'a, Box<dyn StorageBackend>>,
        start_offset: u64,
    ) -> CoreResult<Self> {
        let total_size = backend.size()?;
        Ok(Self {
            backend,
            total_size,
            offset: start_offset,
            finished: false,
        })
    }

    /// Offset just past the last complete record read so far.
    #[must_use]
    pub fn valid_end(&self) -> u64 {
        self.offset
    }

    /// Total size of the journal when iteration started.
    #[must_use]
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    fn read_next_record(&mut self) -> CoreResult<Option<(u64, WalRecord)>> {
        if self.finished {
            return Ok(None);
        }
        let start = self.offset;
        let remaining = self.total_size - start;

        if remaining < HEADER_SIZE as u64 {
            self.finished = true;
            return Ok(None);
        }
        let header = self.backend.read_at(start, HEADER_SIZE)?;

        if header[0..4] != WAL_MAGIC {
            self.finished = true;
            return Err(CoreError::journal_corruption(format!(
                "invalid magic at offset {start}"
            )));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > WAL_VERSION {
            self.finished = true;
            return Err(CoreError::journal_corruption(format!(
                "unsupported version {version} at offset {start}"
            )));
        }

        let type_byte = header[6];
        let Some(record_type) = WalRecordType::from_byte(type_byte) else {
            self.finished = true;
            return Err(CoreError::journal_corruption(format!(
                "unknown record type {type_byte} at offset {start}"
            )));
        };

        let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;
        if remaining < total_len as u64 {
            // torn write at the tail
            self.finished = true;
            return Ok(None);
        }

        let body = self
            .backend
            .read_at(start + HEADER_SIZE as u64, payload_len + CRC_SIZE)?;
        let (payload, crc_bytes) = body.split_at(payload_len);
        let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);

        let mut covered = header;
        covered.extend_from_slice(payload);
        let computed_crc = compute_crc32(&covered);
        if stored_crc != computed_crc {
            self.finished = true;
            return Err(CoreError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let record = WalRecord::decode_payload(record_type, payload)?;
        self.offset += total_len as u64;
        Ok(Some((start, record)))
    }
}

impl Iterator for WalRecordIterator<'_> {
    type Item = CoreResult<(u64, WalRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next_record() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
