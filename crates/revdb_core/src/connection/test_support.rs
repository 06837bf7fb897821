use crate::conflict::ResolvedState;
use crate::error::{CoreError, CoreResult};
use crate::persistent::{
    ObjectFactory, PRef, Persistent, PersistentObject, ReferenceReader, ReferenceWriter,
};
use crate::{Connection, Database, DatabaseConfig, FullStorage, StorageConfig};
use crate::types::Oid;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub struct Node {
    pub value: String,
    pub children: Vec<PRef>,
    pub mergeable: bool,
}

#[derive(Serialize, Deserialize)]
struct NodeRecord {
    value: String,
    children: Vec<u64>,
    mergeable: bool,
}

fn to_bytes(record: &NodeRecord) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::ser::into_writer(record, &mut out).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(out)
}

fn from_bytes(data: &[u8]) -> CoreResult<NodeRecord> {
    ciborium::de::from_reader(data).map_err(|e| CoreError::codec(e.to_string()))
}

impl Persistent for Node {
    fn encode(&self, refs: &mut ReferenceWriter<'_>) -> CoreResult<Vec<u8>> {
        let children = self
            .children
            .iter()
            .map(|child| refs.reference(child).map(Oid::as_u64))
            .collect::<CoreResult<Vec<_>>>()?;
        to_bytes(&NodeRecord {
            value: self.value.clone(),
            children,
            mergeable: self.mergeable,
        })
    }

    fn can_resolve_conflicts(&self) -> bool {
        self.mergeable
    }
}

pub struct NodeFactory;

impl ObjectFactory for NodeFactory {
    fn decode(
        &self,
        _oid: Oid,
        data: &[u8],
        refs: &mut ReferenceReader<'_>,
    ) -> CoreResult<Box<dyn Persistent>> {
        let record = from_bytes(data)?;
        let children = record
            .children
            .into_iter()
            .map(|oid| refs.resolve(Oid::new(oid)))
            .collect::<CoreResult<Vec<_>>>()?;
        Ok(Box::new(Node {
            value: record.value,
            children,
            mergeable: record.mergeable,
        }))
    }

    fn new_root(&self) -> Box<dyn Persistent> {
        Box::new(Node {
            value: "root".to_string(),
            children: Vec::new(),
            mergeable: false,
        })
    }

    /// Takes the newer writer's state.
    fn resolve_conflict(
        &self,
        _oid: Oid,
        _old: Option<&[u8]>,
        _committed: &[u8],
        new: &[u8],
    ) -> Option<ResolvedState> {
        let record = from_bytes(new).ok().filter(|r| r.mergeable)?;
        Some(ResolvedState {
            data: new.to_vec(),
            refs: record.children.into_iter().map(Oid::new).collect(),
        })
    }
}

pub fn node(value: &str) -> PRef {
    PersistentObject::new(Node {
        value: value.to_string(),
        children: Vec::new(),
        mergeable: false,
    })
}

pub fn mergeable(value: &str) -> PRef {
    PersistentObject::new(Node {
        value: value.to_string(),
        children: Vec::new(),
        mergeable: true,
    })
}

pub fn database_with(config: DatabaseConfig) -> (Database, Arc<FullStorage>) {
    let storage = Arc::new(FullStorage::open_in_memory(StorageConfig::new()).unwrap());
    let db = Database::open(storage.clone(), Arc::new(NodeFactory), config).unwrap();
    (db, storage)
}

pub fn database() -> (Database, Arc<FullStorage>) {
    database_with(DatabaseConfig::new())
}

pub fn value(conn: &Connection, object: &PRef) -> CoreResult<String> {
    conn.read_as(object, |n: &Node| n.value.clone())
}

pub fn set_value(
    conn: &Connection,
    txn: &crate::Transaction,
    object: &PRef,
    value: &str,
) -> CoreResult<()> {
    conn.write_as(txn, object, |n: &mut Node| n.value = value.to_string())
}

pub fn link(conn: &Connection, txn: &crate::Transaction, parent: &PRef, child: &PRef) -> CoreResult<()> {
    let child = Arc::clone(child);
    conn.write_as(txn, parent, move |n: &mut Node| n.children.push(child))
}

pub fn children(conn: &Connection, object: &PRef) -> CoreResult<Vec<PRef>> {
    conn.read_as(object, |n: &Node| n.children.clone())
}
