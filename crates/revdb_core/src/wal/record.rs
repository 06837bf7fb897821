//! Journal record types and serialization.

use crate::error::{CoreError, CoreResult};

/// Magic bytes identifying a journal record.
pub const WAL_MAGIC: [u8; 4] = *b"RJNL";

/// Current journal format version.
pub const WAL_VERSION: u16 = 1;

/// Type of journal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalRecordType {
    /// Start of a write batch.
    Begin = 1,
    /// Set a key in a table.
    Put = 2,
    /// Remove a key from a table.
    Delete = 3,
    /// Add a signed delta to a counter key.
    Add = 4,
    /// Batch becomes durable and visible.
    Commit = 5,
    /// Batch is discarded.
    Abort = 6,
    /// Checkpoint marker.
    Checkpoint = 7,
}

impl WalRecordType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Begin),
            2 => Some(Self::Put),
            3 => Some(Self::Delete),
            4 => Some(Self::Add),
            5 => Some(Self::Commit),
            6 => Some(Self::Abort),
            7 => Some(Self::Checkpoint),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A journal record.
///
/// Mutations carry the id of the batch they belong to; a batch only takes
/// effect once its `Commit` record is complete in the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    /// Start of a batch.
    Begin {
        /// Batch id.
        batch: u64,
    },

    /// Set `key` to `value` in `table`.
    Put {
        /// Batch id.
        batch: u64,
        /// Raw table id.
        table: u8,
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },

    /// Remove `key` from `table`.
    Delete {
        /// Batch id.
        batch: u64,
        /// Raw table id.
        table: u8,
        /// Key bytes.
        key: Vec<u8>,
    },

    /// Add `delta` to the counter stored at `key`.
    Add {
        /// Batch id.
        batch: u64,
        /// Raw table id.
        table: u8,
        /// Key bytes.
        key: Vec<u8>,
        /// Signed change.
        delta: i64,
    },

    /// Commit a batch.
    Commit {
        /// Batch id.
        batch: u64,
        /// Commit sequence number, strictly increasing.
        sequence: u64,
    },

    /// Discard a batch.
    Abort {
        /// Batch id.
        batch: u64,
    },

    /// Tables up to `sequence` are in a snapshot.
    Checkpoint {
        /// Sequence number covered by the snapshot.
        sequence: u64,
    },
}

impl WalRecord {
    /// Maximum size for a key or value in a journal record.
    pub const MAX_FIELD_SIZE: usize = u32::MAX as usize;

    /// Returns the record type.
    #[must_use]
    pub fn record_type(&self) -> WalRecordType {
        match self {
            Self::Begin { .. } => WalRecordType::Begin,
            Self::Put { .. } => WalRecordType::Put,
            Self::Delete { .. } => WalRecordType::Delete,
            Self::Add { .. } => WalRecordType::Add,
            Self::Commit { .. } => WalRecordType::Commit,
            Self::Abort { .. } => WalRecordType::Abort,
            Self::Checkpoint { .. } => WalRecordType::Checkpoint,
        }
    }

    /// Returns the batch id if this record belongs to a batch.
    #[must_use]
    pub fn batch(&self) -> Option<u64> {
        match self {
            Self::Begin { batch }
            | Self::Put { batch, .. }
            | Self::Delete { batch, .. }
            | Self::Add { batch, .. }
            | Self::Commit { batch, .. }
            | Self::Abort { batch } => Some(*batch),
            Self::Checkpoint { .. } => None,
        }
    }

    /// Serializes the record payload (without envelope).
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        match self {
            Self::Begin { batch } | Self::Abort { batch } => {
                buf.extend_from_slice(&batch.to_le_bytes());
            }
            Self::Put {
                batch,
                table,
                key,
                value,
            } => {
                buf.extend_from_slice(&batch.to_le_bytes());
                buf.push(*table);
                put_field(&mut buf, key)?;
                put_field(&mut buf, value)?;
            }
            Self::Delete { batch, table, key } => {
                buf.extend_from_slice(&batch.to_le_bytes());
                buf.push(*table);
                put_field(&mut buf, key)?;
            }
            Self::Add {
                batch,
                table,
                key,
                delta,
            } => {
                buf.extend_from_slice(&batch.to_le_bytes());
                buf.push(*table);
                put_field(&mut buf, key)?;
                buf.extend_from_slice(&delta.to_le_bytes());
            }
            Self::Commit { batch, sequence } => {
                buf.extend_from_slice(&batch.to_le_bytes());
                buf.extend_from_slice(&sequence.to_le_bytes());
            }
            Self::Checkpoint { sequence } => {
                buf.extend_from_slice(&sequence.to_le_bytes());
            }
        }
        Ok(buf)
    }

    /// Deserializes a record from its type and payload.
    pub fn decode_payload(record_type: WalRecordType, payload: &[u8]) -> CoreResult<Self> {
        let mut reader = PayloadReader { payload, cursor: 0 };
        let record = match record_type {
            WalRecordType::Begin => Self::Begin {
                batch: reader.u64()?,
            },
            WalRecordType::Put => Self::Put {
                batch: reader.u64()?,
                table: reader.u8()?,
                key: reader.field()?,
                value: reader.field()?,
            },
            WalRecordType::Delete => Self::Delete {
                batch: reader.u64()?,
                table: reader.u8()?,
                key: reader.field()?,
            },
            WalRecordType::Add => Self::Add {
                batch: reader.u64()?,
                table: reader.u8()?,
                key: reader.field()?,
                delta: reader.u64()? as i64,
            },
            WalRecordType::Commit => Self::Commit {
                batch: reader.u64()?,
                sequence: reader.u64()?,
            },
            WalRecordType::Abort => Self::Abort {
                batch: reader.u64()?,
            },
            WalRecordType::Checkpoint => Self::Checkpoint {
                sequence: reader.u64()?,
            },
        };
        if reader.cursor != payload.len() {
            return Err(CoreError::journal_corruption(format!(
                "trailing bytes in {record_type:?} record: expected {} bytes, got {}",
                reader.cursor,
                payload.len()
            )));
        }
        Ok(record)
    }
}

fn put_field(buf: &mut Vec<u8>, bytes: &[u8]) -> CoreResult<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| {
        CoreError::invalid_operation(format!(
            "journal field too large: {} bytes exceeds maximum of {} bytes",
            bytes.len(),
            WalRecord::MAX_FIELD_SIZE
        ))
    })?;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(bytes);
    Ok(())
}

struct PayloadReader<'a> {
    payload: &'a [u8],
    cursor: usize,
}

impl PayloadReader<'_> {
    fn take(&mut self, n: usize) -> CoreResult<&[u8]> {
        if self.cursor + n > self.payload.len() {
            return Err(CoreError::journal_corruption("unexpected end of payload"));
        }
        let slice = &self.payload[self.cursor..self.cursor + n];
        self.cursor += n;
        Ok(slice)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let bytes: [u8; 8] = self
            .take(8)?
            .try_into()
            .map_err(|_| CoreError::journal_corruption("invalid u64"))?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn field(&mut self) -> CoreResult<Vec<u8>> {
        let bytes: [u8; 4] = self
            .take(4)?
            .try_into()
            .map_err(|_| CoreError::journal_corruption("invalid length"))?;
        let len = u32::from_le_bytes(bytes) as usize;
        Ok(self.take(len)?.to_vec())
    }
}

/// Computes CRC32 checksum for data.
pub fn compute_crc32(data: &[u8]) -> u32 {
    // IEEE polynomial, reflected
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: WalRecord) {
        let payload = record.encode_payload().unwrap();
        let decoded = WalRecord::decode_payload(record.record_type(), &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn record_type_bytes() {
        for t in [
            WalRecordType::Begin,
            WalRecordType::Put,
            WalRecordType::Delete,
            WalRecordType::Add,
            WalRecordType::Commit,
            WalRecordType::Abort,
            WalRecordType::Checkpoint,
        ] {
            assert_eq!(WalRecordType::from_byte(t.as_byte()), Some(t));
        }
        assert_eq!(WalRecordType::from_byte(0), None);
        assert_eq!(WalRecordType::from_byte(99), None);
    }

    #[test]
    fn mutation_records_keep_their_fields() {
        roundtrip(WalRecord::Put {
            batch: 3,
            table: 2,
            key: vec![0, 0, 0, 1],
            value: b"pickle".to_vec(),
        });
        roundtrip(WalRecord::Delete {
            batch: 3,
            table: 9,
            key: Vec::new(),
        });
        roundtrip(WalRecord::Add {
            batch: 4,
            table: 5,
            key: vec![7; 8],
            delta: -3,
        });
        roundtrip(WalRecord::Commit {
            batch: 4,
            sequence: 77,
        });
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let mut payload = WalRecord::Begin { batch: 1 }.encode_payload().unwrap();
        payload.push(0);
        assert!(matches!(
            WalRecord::decode_payload(WalRecordType::Begin, &payload),
            Err(CoreError::JournalCorruption { .. })
        ));
    }

    #[test]
    fn short_payload_is_corruption() {
        let payload = WalRecord::Put {
            batch: 1,
            table: 1,
            key: b"key".to_vec(),
            value: b"value".to_vec(),
        }
        .encode_payload()
        .unwrap();
        assert!(WalRecord::decode_payload(WalRecordType::Put, &payload[..payload.len() - 2]).is_err());
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }
}
