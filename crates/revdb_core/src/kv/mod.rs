//! Journaled table layer.
//!
//! The storage engine keeps all of its bookkeeping in a fixed set of ordered
//! tables. Keys are compared bytewise; multi-part keys are concatenations of
//! big-endian ids, so a key-range scan over a prefix visits one object's (or
//! one transaction's) entries in id order.
//!
//! Mutations are grouped into [`WriteBatch`]es. A batch is written to the
//! journal and applied to the in-memory tables as a unit; on open the tables
//! are rebuilt from the newest snapshot plus the committed journal batches.

mod batch;
mod snapshot;
mod store;

pub use batch::{BatchOp, WriteBatch};
pub use store::{KvOptions, KvStore, PreparedBatch};

use crate::types::{Oid, Tid, VersionId};

/// The logical tables of the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TableId {
    /// `oid` → tid of the object's current revision.
    Serials = 1,
    /// `oid | tid` → [`MetadataRecord`](crate::storage::full::MetadataRecord).
    Metadata = 2,
    /// `oid | lrevid` → pickle bytes.
    Pickles = 3,
    /// `oid | lrevid` → packed list of referenced oids.
    References = 4,
    /// `oid | lrevid` → number of metadata records using the pickle.
    PickleRefcounts = 5,
    /// `oid` → number of pickles referencing the object.
    Refcounts = 6,
    /// version name → vid.
    Vids = 7,
    /// `vid` → version name.
    Versions = 8,
    /// `vid | oid` → empty; objects with a live revision in the version.
    CurrentVersions = 9,
    /// `tid | oid` → empty; objects written by a transaction.
    TxnOids = 10,
    /// `tid` → encoded transaction description.
    TxnMetadata = 11,
    /// `tid | oid | revid` → empty; revision `revid` stopped being current at `tid`.
    ObjRevs = 12,
    /// Named scalars (last oid, last tid, pack time, pack state).
    Info = 13,
    /// `oid | tid` → empty; revisions reached by the pack mark phase.
    PackMarks = 14,
    /// `seq` → `oid | tid`; mark phase frontier.
    OidQueue = 15,
    /// `seq` → `oid`; objects whose refcount dropped to zero during a pack.
    DelQueue = 16,
}

impl TableId {
    /// Number of tables.
    pub const COUNT: usize = 16;

    /// All tables, in id order.
    pub const ALL: [TableId; Self::COUNT] = [
        Self::Serials,
        Self::Metadata,
        Self::Pickles,
        Self::References,
        Self::PickleRefcounts,
        Self::Refcounts,
        Self::Vids,
        Self::Versions,
        Self::CurrentVersions,
        Self::TxnOids,
        Self::TxnMetadata,
        Self::ObjRevs,
        Self::Info,
        Self::PackMarks,
        Self::OidQueue,
        Self::DelQueue,
    ];

    /// Converts a byte to a table id.
    pub fn from_byte(b: u8) -> Option<Self> {
        Self::ALL.get(usize::from(b).checked_sub(1)?).copied()
    }

    /// Converts the table id to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    pub(crate) const fn index(self) -> usize {
        self as usize - 1
    }
}

/// Builds a key from big-endian 8-byte parts.
#[must_use]
pub fn key(parts: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(parts.len() * 8);
    for part in parts {
        out.extend_from_slice(&part.to_be_bytes());
    }
    out
}

/// `oid` key.
#[must_use]
pub fn oid_key(oid: Oid) -> Vec<u8> {
    oid.to_bytes().to_vec()
}

/// `oid | tid` key.
#[must_use]
pub fn oid_tid_key(oid: Oid, tid: Tid) -> Vec<u8> {
    key(&[oid.as_u64(), tid.as_u64()])
}

/// `tid | oid` key.
#[must_use]
pub fn tid_oid_key(tid: Tid, oid: Oid) -> Vec<u8> {
    key(&[tid.as_u64(), oid.as_u64()])
}

/// `vid | oid` key.
#[must_use]
pub fn vid_oid_key(vid: VersionId, oid: Oid) -> Vec<u8> {
    key(&[vid.as_u64(), oid.as_u64()])
}

/// Reads the 8-byte big-endian part at `index` of a composite key.
#[must_use]
pub fn key_part(key: &[u8], index: usize) -> Option<u64> {
    let start = index.checked_mul(8)?;
    let bytes: [u8; 8] = key.get(start..start + 8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

/// Encodes a counter value.
#[must_use]
pub fn encode_u64(value: u64) -> Vec<u8> {
    value.to_be_bytes().to_vec()
}

/// Decodes a counter value; anything malformed reads as zero.
#[must_use]
pub fn decode_u64(bytes: &[u8]) -> u64 {
    bytes
        .try_into()
        .map(u64::from_be_bytes)
        .unwrap_or_default()
}

/// Encodes a list of oids.
#[must_use]
pub fn encode_oids(oids: &[Oid]) -> Vec<u8> {
    let mut out = Vec::with_capacity(oids.len() * 8);
    for oid in oids {
        out.extend_from_slice(&oid.to_bytes());
    }
    out
}

/// Decodes a list of oids written by [`encode_oids`].
#[must_use]
pub fn decode_oids(bytes: &[u8]) -> Vec<Oid> {
    bytes
        .chunks_exact(8)
        .filter_map(|chunk| chunk.try_into().ok().map(Oid::from_bytes))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_bytes() {
        for table in TableId::ALL {
            assert_eq!(TableId::from_byte(table.as_byte()), Some(table));
        }
        assert_eq!(TableId::from_byte(0), None);
        assert_eq!(TableId::from_byte(17), None);
        assert_eq!(TableId::DelQueue.index(), TableId::COUNT - 1);
    }

    #[test]
    fn composite_keys_split_back_into_parts() {
        let k = oid_tid_key(Oid::new(3), Tid::new(900));
        assert_eq!(key_part(&k, 0), Some(3));
        assert_eq!(key_part(&k, 1), Some(900));
        assert_eq!(key_part(&k, 2), None);
    }

    #[test]
    fn oid_lists() {
        let oids = vec![Oid::new(1), Oid::new(u64::MAX)];
        assert_eq!(decode_oids(&encode_oids(&oids)), oids);
        assert!(decode_oids(&[]).is_empty());
        assert_eq!(decode_u64(&encode_u64(42)), 42);
        assert_eq!(decode_u64(b"bad"), 0);
    }
}
