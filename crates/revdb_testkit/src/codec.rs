//! A small object type for tests.
//!
//! An [`Item`] has a name, an integer value and links to other items. It
//! is encoded as CBOR. Items created with [`mergeable_item`] resolve write
//! conflicts by keeping the newer writer's state.

use revdb_core::{
    Connection, CoreError, CoreResult, ObjectFactory, Oid, PRef, Persistent, PersistentObject,
    ReferenceReader, ReferenceWriter, ResolvedState, Transaction,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A named value with links.
pub struct Item {
    /// Name.
    pub name: String,
    /// Value.
    pub value: i64,
    /// Linked items.
    pub links: Vec<PRef>,
    /// Write conflicts on this item are resolved by taking the new state.
    pub mergeable: bool,
}

/// Stored form of an [`Item`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRecord {
    /// Name.
    pub name: String,
    /// Value.
    pub value: i64,
    /// Oids of linked items.
    pub links: Vec<u64>,
    /// See [`Item::mergeable`].
    pub mergeable: bool,
}

impl ItemRecord {
    /// Encodes the record.
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(self, &mut out).map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(out)
    }

    /// Decodes a record.
    pub fn from_bytes(data: &[u8]) -> CoreResult<Self> {
        ciborium::de::from_reader(data).map_err(|e| CoreError::codec(e.to_string()))
    }

    /// Linked oids.
    #[must_use]
    pub fn link_oids(&self) -> Vec<Oid> {
        self.links.iter().copied().map(Oid::new).collect()
    }
}

impl Persistent for Item {
    fn encode(&self, refs: &mut ReferenceWriter<'_>) -> CoreResult<Vec<u8>> {
        let links = self
            .links
            .iter()
            .map(|link| refs.reference(link).map(Oid::as_u64))
            .collect::<CoreResult<Vec<_>>>()?;
        ItemRecord {
            name: self.name.clone(),
            value: self.value,
            links,
            mergeable: self.mergeable,
        }
        .to_bytes()
    }

    fn can_resolve_conflicts(&self) -> bool {
        self.mergeable
    }
}

/// Decodes [`Item`]s.
#[derive(Debug, Default)]
pub struct ItemFactory;

impl ObjectFactory for ItemFactory {
    fn decode(
        &self,
        _oid: Oid,
        data: &[u8],
        refs: &mut ReferenceReader<'_>,
    ) -> CoreResult<Box<dyn Persistent>> {
        let record = ItemRecord::from_bytes(data)?;
        let links = record
            .links
            .into_iter()
            .map(|oid| refs.resolve(Oid::new(oid)))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Box::new(Item {
            name: record.name,
            value: record.value,
            links,
            mergeable: record.mergeable,
        }))
    }

    fn new_root(&self) -> Box<dyn Persistent> {
        Box::new(Item {
            name: "root".to_string(),
            value: 0,
            links: Vec::new(),
            mergeable: false,
        })
    }

    fn resolve_conflict(
        &self,
        _oid: Oid,
        _old: Option<&[u8]>,
        _committed: &[u8],
        new: &[u8],
    ) -> Option<ResolvedState> {
        let record = ItemRecord::from_bytes(new).ok().filter(|r| r.mergeable)?;
        Some(ResolvedState {
            refs: record.link_oids(),
            data: new.to_vec(),
        })
    }
}

/// A new, unsaved item.
pub fn item(name: &str, value: i64) -> PRef {
    PersistentObject::new(Item {
        name: name.to_string(),
        value,
        links: Vec::new(),
        mergeable: false,
    })
}

/// A new, unsaved item that resolves write conflicts.
pub fn mergeable_item(name: &str, value: i64) -> PRef {
    PersistentObject::new(Item {
        name: name.to_string(),
        value,
        links: Vec::new(),
        mergeable: true,
    })
}

/// Encoded item without links, for driving a storage directly.
pub fn item_bytes(name: &str, value: i64) -> Vec<u8> {
    encode_item(name, value, &[])
}

/// Encoded item linking to `links`.
pub fn encode_item(name: &str, value: i64, links: &[Oid]) -> Vec<u8> {
    let record = ItemRecord {
        name: name.to_string(),
        value,
        links: links.iter().map(|oid| oid.as_u64()).collect(),
        mergeable: false,
    };
    record.to_bytes().expect("item records always encode")
}

/// Item accessors on a connection.
pub trait ItemAccess {
    /// The item's value.
    fn value_of(&self, object: &PRef) -> CoreResult<i64>;

    /// The item's name.
    fn name_of(&self, object: &PRef) -> CoreResult<String>;

    /// The item's links.
    fn links_of(&self, object: &PRef) -> CoreResult<Vec<PRef>>;

    /// Sets the item's value inside `txn`.
    fn set_value(&self, txn: &Transaction, object: &PRef, value: i64) -> CoreResult<()>;

    /// Appends a link from `parent` to `child` inside `txn`.
    fn link(&self, txn: &Transaction, parent: &PRef, child: &PRef) -> CoreResult<()>;

    /// Removes every link of `parent` inside `txn`.
    fn unlink_all(&self, txn: &Transaction, parent: &PRef) -> CoreResult<()>;
}

impl ItemAccess for Connection {
    fn value_of(&self, object: &PRef) -> CoreResult<i64> {
        self.read_as(object, |item: &Item| item.value)
    }

    fn name_of(&self, object: &PRef) -> CoreResult<String> {
        self.read_as(object, |item: &Item| item.name.clone())
    }

    fn links_of(&self, object: &PRef) -> CoreResult<Vec<PRef>> {
        self.read_as(object, |item: &Item| item.links.clone())
    }

    fn set_value(&self, txn: &Transaction, object: &PRef, value: i64) -> CoreResult<()> {
        self.write_as(txn, object, |item: &mut Item| item.value = value)
    }

    fn link(&self, txn: &Transaction, parent: &PRef, child: &PRef) -> CoreResult<()> {
        let child = Arc::clone(child);
        self.write_as(txn, parent, move |item: &mut Item| item.links.push(child))
    }

    fn unlink_all(&self, txn: &Transaction, parent: &PRef) -> CoreResult<()> {
        self.write_as(txn, parent, |item: &mut Item| item.links.clear())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_through_cbor() {
        let record = ItemRecord {
            name: "a".into(),
            value: -7,
            links: vec![3, 9],
            mergeable: true,
        };
        let decoded = ItemRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.link_oids(), vec![Oid::new(3), Oid::new(9)]);
    }

    #[test]
    fn only_mergeable_items_resolve() {
        let factory = ItemFactory;
        let plain = item_bytes("x", 1);
        assert!(factory.resolve_conflict(Oid::new(1), None, &plain, &plain).is_none());

        let merged = ItemRecord {
            name: "x".into(),
            value: 2,
            links: vec![4],
            mergeable: true,
        }
        .to_bytes()
        .unwrap();
        let resolved = factory.resolve_conflict(Oid::new(1), None, &plain, &merged).unwrap();
        assert_eq!(resolved.data, merged);
        assert_eq!(resolved.refs, vec![Oid::new(4)]);
    }
}
