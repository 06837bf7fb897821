//! Ping-pong table snapshots.
//!
//! A snapshot file holds one generation of every table:
//!
//! ```text
//! Start : magic "RSNP" (4) | version (2) | sequence (8)
//! Entry : table (1) | key len (4) | key | value len (4) | value
//! End   : 0xFF | sequence (8) | entry count (8) | crc32 (4)
//! ```
//!
//! Two files alternate. A checkpoint always overwrites the older one, so a
//! crash mid-write leaves the newer generation intact. A file without an
//! End marker is a torn write and is ignored.

use crate::error::{CoreError, CoreResult};
use crate::kv::TableId;
use crate::wal::compute_crc32;
use revdb_storage::StorageBackend;
use tracing::warn;

const SNAPSHOT_MAGIC: [u8; 4] = *b"RSNP";
const SNAPSHOT_VERSION: u16 = 1;
const END_MARKER: u8 = 0xFF;

/// A decoded snapshot generation.
#[derive(Debug, Default)]
pub(crate) struct SnapshotImage {
    pub sequence: u64,
    pub entries: Vec<(TableId, Vec<u8>, Vec<u8>)>,
}

/// Which of the two snapshot files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    A,
    B,
}

impl Slot {
    fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

/// The pair of snapshot files.
pub(crate) struct SnapshotStore {
    a: Box<dyn StorageBackend>,
    b: Box<dyn StorageBackend>,
    /// Slot holding the newest valid generation.
    active: Option<Slot>,
}

impl SnapshotStore {
    pub fn new(a: Box<dyn StorageBackend>, b: Box<dyn StorageBackend>) -> Self {
        Self { a, b, active: None }
    }

    fn backend(&mut self, slot: Slot) -> &mut Box<dyn StorageBackend> {
        match slot {
            Slot::A => &mut self.a,
            Slot::B => &mut self.b,
        }
    }

    /// Loads the newest complete generation, if any.
    pub fn load(&mut self) -> CoreResult<Option<SnapshotImage>> {
        let a = decode(&self.a.read_all()?, "snapshot-a")?;
        let b = decode(&self.b.read_all()?, "snapshot-b")?;
        let (image, slot) = match (a, b) {
            (Some(a), Some(b)) if b.sequence > a.sequence => (Some(b), Some(Slot::B)),
            (Some(a), _) => (Some(a), Some(Slot::A)),
            (None, Some(b)) => (Some(b), Some(Slot::B)),
            (None, None) => (None, None),
        };
        self.active = slot;
        Ok(image)
    }

    /// Writes a new generation into the inactive slot and makes it active.
    pub fn write<'a, I>(&mut self, sequence: u64, entries: I) -> CoreResult<()>
    where
        I: IntoIterator<Item = (TableId, &'a [u8], &'a [u8])>,
    {
        let target = self.active.map_or(Slot::A, Slot::other);
        let mut data = Vec::new();
        data.extend_from_slice(&SNAPSHOT_MAGIC);
        data.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        data.extend_from_slice(&sequence.to_le_bytes());
        let mut count: u64 = 0;
        for (table, key, value) in entries {
            data.push(table.as_byte());
            push_field(&mut data, key)?;
            push_field(&mut data, value)?;
            count += 1;
        }
        data.push(END_MARKER);
        data.extend_from_slice(&sequence.to_le_bytes());
        data.extend_from_slice(&count.to_le_bytes());
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());

        let backend = self.backend(target);
        backend.truncate(0)?;
        backend.append(&data)?;
        backend.flush()?;
        backend.sync()?;
        self.active = Some(target);
        Ok(())
    }
}

fn push_field(data: &mut Vec<u8>, bytes: &[u8]) -> CoreResult<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| CoreError::invalid_operation("snapshot field too large"))?;
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(bytes);
    Ok(())
}

fn decode(data: &[u8], name: &str) -> CoreResult<Option<SnapshotImage>> {
    if data.is_empty() {
        return Ok(None);
    }
    let mut cursor = Cursor { data, pos: 0 };
    let Some(magic) = cursor.take(4) else {
        warn!(snapshot = name, "ignoring torn snapshot header");
        return Ok(None);
    };
    if magic != SNAPSHOT_MAGIC {
        return Err(CoreError::snapshot_corruption(format!("{name}: invalid magic")));
    }
    let (Some(version), Some(sequence)) = (cursor.u16(), cursor.u64()) else {
        warn!(snapshot = name, "ignoring torn snapshot header");
        return Ok(None);
    };
    if version > SNAPSHOT_VERSION {
        return Err(CoreError::snapshot_corruption(format!(
            "{name}: unsupported version {version}"
        )));
    }

    let mut entries = Vec::new();
    loop {
        let Some(tag) = cursor.take(1).map(|b| b[0]) else {
            warn!(snapshot = name, "ignoring snapshot without end marker");
            return Ok(None);
        };
        if tag == END_MARKER {
            break;
        }
        let Some(table) = TableId::from_byte(tag) else {
            return Err(CoreError::snapshot_corruption(format!(
                "{name}: unknown table {tag}"
            )));
        };
        let (Some(key), Some(value)) = (cursor.field(), cursor.field()) else {
            warn!(snapshot = name, "ignoring snapshot without end marker");
            return Ok(None);
        };
        entries.push((table, key, value));
    }

    let (Some(end_sequence), Some(count)) = (cursor.u64(), cursor.u64()) else {
        warn!(snapshot = name, "ignoring snapshot with torn trailer");
        return Ok(None);
    };
    let crc_offset = cursor.pos;
    let Some(stored) = cursor.u32() else {
        warn!(snapshot = name, "ignoring snapshot with torn trailer");
        return Ok(None);
    };
    let computed = compute_crc32(&data[..crc_offset]);
    if stored != computed {
        return Err(CoreError::ChecksumMismatch {
            expected: stored,
            actual: computed,
        });
    }
    if end_sequence != sequence || count != entries.len() as u64 {
        return Err(CoreError::snapshot_corruption(format!(
            "{name}: trailer does not match contents"
        )));
    }
    Ok(Some(SnapshotImage { sequence, entries }))
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take(4).map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        self.take(8)
            .and_then(|b| b.try_into().ok())
            .map(u64::from_le_bytes)
    }

    fn field(&mut self) -> Option<Vec<u8>> {
        let len = self.u32()? as usize;
        self.take(len).map(<[u8]>::to_vec)
    }
}
