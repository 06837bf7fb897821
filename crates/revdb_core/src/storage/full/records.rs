//! Encoded values of the engine tables.

use crate::error::{CoreError, CoreResult};
use crate::types::{Oid, Tid, VersionId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Links a revision to its neighbours.
///
/// `lrevid` names the revision whose pickle this revision uses; it equals
/// the revision's own tid when the pickle was written by it, and is zero
/// for a deletion (tombstone).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataRecord {
    /// Version the revision belongs to.
    pub vid: VersionId,
    /// For version revisions, the non-version revision underneath.
    pub nvrevid: Tid,
    /// Revision owning the pickle.
    pub lrevid: Tid,
    /// Revision that was current before this one.
    pub prevrevid: Tid,
}

impl MetadataRecord {
    const SIZE: usize = 32;

    /// True if the revision marks the object as deleted.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.lrevid.is_zero()
    }

    /// True if the revision lives in a version.
    #[must_use]
    pub fn in_version(&self) -> bool {
        !self.vid.is_non_version()
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.vid.as_u64().to_be_bytes());
        out.extend_from_slice(&self.nvrevid.to_bytes());
        out.extend_from_slice(&self.lrevid.to_bytes());
        out.extend_from_slice(&self.prevrevid.to_bytes());
        out
    }

    pub(crate) fn decode(oid: Oid, bytes: &[u8]) -> CoreResult<Self> {
        if bytes.len() != Self::SIZE {
            return Err(CoreError::storage_system(format!(
                "metadata record of {oid} has {} bytes",
                bytes.len()
            )));
        }
        let part = |i: usize| crate::kv::key_part(bytes, i).unwrap_or_default();
        Ok(Self {
            vid: VersionId::new(part(0)),
            nvrevid: Tid::new(part(1)),
            lrevid: Tid::new(part(2)),
            prevrevid: Tid::new(part(3)),
        })
    }
}

/// Transaction description stored per committed tid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct TxnRecord {
    pub user: String,
    pub description: String,
    pub extension: BTreeMap<String, String>,
}

/// Pack phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum PackPhase {
    /// Removing revisions that stopped being current at or before pack time.
    Prune,
    /// Deleting objects whose reference count dropped to zero.
    Collect,
    /// Traversing the reference graph from the roots.
    Mark,
    /// Deleting objects the mark phase did not reach.
    Sweep,
    /// Dropping marks and leftover queue entries.
    Cleanup,
}

/// Durable progress of a pack, kept so an interrupted pack can resume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct PackState {
    pub pack_tid: u64,
    pub gc: bool,
    pub phase: PackPhase,
    /// True once the mark queue was seeded with the roots.
    pub seeded: bool,
    /// Last object the sweep looked at.
    pub sweep_cursor: Option<u64>,
}

/// Names of the scalars in the info table.
pub(crate) mod info {
    pub const LAST_OID: &[u8] = b"last_oid";
    pub const LAST_TID: &[u8] = b"last_tid";
    pub const LAST_VID: &[u8] = b"last_vid";
    pub const PACK_TID: &[u8] = b"pack_tid";
    pub const PACK_STATE: &[u8] = b"pack_state";
}

pub(crate) fn to_cbor<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(value, &mut out).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(out)
}

pub(crate) fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::de::from_reader(bytes).map_err(|e| CoreError::codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_layout() {
        let record = MetadataRecord {
            vid: VersionId::new(2),
            nvrevid: Tid::new(10),
            lrevid: Tid::new(20),
            prevrevid: Tid::new(15),
        };
        let bytes = record.encode();
        assert_eq!(bytes.len(), 32);
        assert_eq!(MetadataRecord::decode(Oid::new(1), &bytes).unwrap(), record);
        assert!(MetadataRecord::decode(Oid::new(1), &bytes[..31]).is_err());
        assert!(record.in_version());
        assert!(!record.is_tombstone());
    }

    #[test]
    fn pack_state_survives_cbor() {
        let state = PackState {
            pack_tid: 77,
            gc: true,
            phase: PackPhase::Sweep,
            seeded: true,
            sweep_cursor: Some(12),
        };
        let decoded: PackState = from_cbor(&to_cbor(&state).unwrap()).unwrap();
        assert_eq!(decoded, state);
        assert!(from_cbor::<TxnRecord>(&[0xFF, 0x00]).is_err());
    }
}
