//! The database: a storage, an object factory and the open connections.

use crate::config::DatabaseConfig;
use crate::conflict::{ConflictResolver, ResolvedState};
use crate::connection::{Connection, ConnectionInner};
use crate::error::{CoreError, CoreResult};
use crate::persistent::{ObjectFactory, ReferenceWriter};
use crate::storage::{
    PackOutcome, RevisionInfo, Storage, TransactionDescription, UndoFilter,
};
use crate::transaction::{Jar, Synchronizer, Transaction, TransactionManager, TxnObject};
use crate::types::{Oid, Tid};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

pub(crate) struct DbShared {
    storage: Arc<dyn Storage>,
    factory: Arc<dyn ObjectFactory>,
    config: DatabaseConfig,
    connections: Mutex<Vec<Weak<ConnectionInner>>>,
    next_connection: AtomicU64,
}

impl DbShared {
    pub(crate) fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub(crate) fn factory(&self) -> &Arc<dyn ObjectFactory> {
        &self.factory
    }

    pub(crate) fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    fn live_connections(&self) -> Vec<Arc<ConnectionInner>> {
        let mut connections = self.connections.lock();
        connections.retain(|c| c.strong_count() > 0);
        connections.iter().filter_map(Weak::upgrade).collect()
    }

    /// Queues an invalidation on every connection except `origin`.
    pub(crate) fn invalidate(&self, tid: Tid, oids: &[Oid], origin: Option<u64>) {
        for connection in self.live_connections() {
            if Some(connection.id()) != origin {
                connection.invalidate(tid, oids);
            }
        }
    }

    pub(crate) fn forget(&self, id: u64) {
        self.connections
            .lock()
            .retain(|c| c.upgrade().is_some_and(|c| c.id() != id));
    }
}

/// Conflict resolver backed by the database's object factory.
struct FactoryResolver {
    factory: Arc<dyn ObjectFactory>,
}

impl ConflictResolver for FactoryResolver {
    fn resolve(
        &self,
        oid: Oid,
        old: Option<&[u8]>,
        committed: &[u8],
        new: &[u8],
    ) -> Option<ResolvedState> {
        self.factory.resolve_conflict(oid, old, committed, new)
    }
}

/// An object database.
///
/// Cheap to clone; clones share the storage and the connection registry.
#[derive(Clone)]
pub struct Database {
    shared: Arc<DbShared>,
}

impl Database {
    /// Opens a database on `storage`, creating the root object if the
    /// storage is empty.
    pub fn open(
        storage: Arc<dyn Storage>,
        factory: Arc<dyn ObjectFactory>,
        config: DatabaseConfig,
    ) -> CoreResult<Self> {
        storage.set_conflict_resolver(Arc::new(FactoryResolver {
            factory: Arc::clone(&factory),
        }));
        let db = Self {
            shared: Arc::new(DbShared {
                storage,
                factory,
                config,
                connections: Mutex::new(Vec::new()),
                next_connection: AtomicU64::new(1),
            }),
        };
        db.ensure_root()?;
        Ok(db)
    }

    fn ensure_root(&self) -> CoreResult<()> {
        let storage = &self.shared.storage;
        match storage.load(Oid::ROOT, "") {
            Ok(_) => return Ok(()),
            Err(CoreError::NotFound { .. }) if !storage.is_read_only() => {}
            Err(err) => return Err(err),
        }
        let root = self.shared.factory.new_root();
        let mut writer = ReferenceWriter::detached();
        let data = root.encode(&mut writer)?;
        let txn = TransactionManager::new().begin();
        txn.note("initial database creation");

        storage.tpc_begin(&txn)?;
        let stored = storage
            .store(Oid::ROOT, Tid::ZERO, &data, writer.refs(), "", &txn)
            .and_then(|_| storage.tpc_vote(&txn));
        if let Err(err) = stored {
            storage.tpc_abort(&txn)?;
            return Err(err);
        }
        let tid = storage.tpc_finish(&txn, &mut |_, _| {})?;
        info!(storage = storage.name(), %tid, "root object created");
        Ok(())
    }

    /// The underlying storage.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.shared.storage
    }

    /// Opens a connection in the configured default version.
    pub fn open_connection(&self, manager: &TransactionManager) -> CoreResult<Connection> {
        let version = self.shared.config.version.clone();
        self.open_connection_in(manager, &version)
    }

    /// Opens a connection working in `version` ("" = non-version).
    ///
    /// The connection applies invalidations at the boundaries of
    /// `manager`'s transactions.
    pub fn open_connection_in(
        &self,
        manager: &TransactionManager,
        version: &str,
    ) -> CoreResult<Connection> {
        let id = self.shared.next_connection.fetch_add(1, Ordering::Relaxed);
        let inner = ConnectionInner::new(id, Arc::clone(&self.shared), version.to_string());
        self.shared.connections.lock().push(Arc::downgrade(&inner));
        let weak: Weak<ConnectionInner> = Arc::downgrade(&inner);
        manager.register_synchronizer(weak as Weak<dyn Synchronizer>);
        debug!(connection = id, version, "connection opened");
        Ok(Connection { inner })
    }

    /// Number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.shared.live_connections().len()
    }

    /// Queues an invalidation of `oids` on every connection but `origin`.
    pub fn invalidate(&self, tid: Tid, oids: &[Oid], origin: Option<&Connection>) {
        self.shared.invalidate(tid, oids, origin.map(Connection::id));
    }

    /// Undoes the transaction `tid` as part of `txn`.
    pub fn undo(&self, tid: Tid, txn: &Transaction) -> CoreResult<()> {
        self.join(txn, StorageOp::Undo(tid))
    }

    /// Moves the objects of version `source` into `dest` as part of `txn`.
    pub fn commit_version(&self, source: &str, dest: &str, txn: &Transaction) -> CoreResult<()> {
        self.join(
            txn,
            StorageOp::CommitVersion {
                source: source.to_string(),
                dest: dest.to_string(),
            },
        )
    }

    /// Discards version `version` as part of `txn`.
    pub fn abort_version(&self, version: &str, txn: &Transaction) -> CoreResult<()> {
        self.join(txn, StorageOp::AbortVersion(version.to_string()))
    }

    fn join(&self, txn: &Transaction, op: StorageOp) -> CoreResult<()> {
        let resource = Arc::new(StorageResource {
            db: Arc::clone(&self.shared),
            op,
            oids: Mutex::new(Vec::new()),
        });
        txn.join_resource(resource)
    }

    /// Packs the storage as of `pack_time`.
    pub fn pack(&self, pack_time: Tid, gc: bool) -> CoreResult<PackOutcome> {
        self.shared.storage.pack(pack_time, gc)
    }

    /// Packs away history older than `age`.
    pub fn pack_older_than(&self, age: Duration, gc: bool) -> CoreResult<PackOutcome> {
        let cutoff = SystemTime::now().checked_sub(age).unwrap_or(SystemTime::UNIX_EPOCH);
        self.pack(Tid::from_system_time(cutoff), gc)
    }

    /// Lists undoable transactions, newest first.
    pub fn undo_log(
        &self,
        first: i64,
        last: i64,
        filter: Option<UndoFilter<'_>>,
    ) -> CoreResult<Vec<TransactionDescription>> {
        self.shared.storage.undo_log(first, last, filter)
    }

    /// Revision history of an object, newest first.
    pub fn history(&self, oid: Oid, version: &str, size: usize) -> CoreResult<Vec<RevisionInfo>> {
        self.shared.storage.history(oid, version, size)
    }

    /// Closes every connection and the storage.
    pub fn close(&self) -> CoreResult<()> {
        for connection in self.shared.live_connections() {
            (Connection { inner: connection }).close();
        }
        self.shared.storage.close()
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("storage", &self.shared.storage.name())
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

enum StorageOp {
    Undo(Tid),
    CommitVersion { source: String, dest: String },
    AbortVersion(String),
}

/// A storage-level operation taking part in a transaction as its own jar.
struct StorageResource {
    db: Arc<DbShared>,
    op: StorageOp,
    oids: Mutex<Vec<Oid>>,
}

impl Jar for StorageResource {
    fn sort_key(&self) -> Option<String> {
        Some(self.db.storage.sort_key())
    }

    fn tpc_begin(&self, txn: &Transaction, _sub: bool) -> CoreResult<()> {
        self.db.storage.tpc_begin(txn)
    }

    fn commit(&self, _object: &TxnObject, txn: &Transaction) -> CoreResult<()> {
        let storage = &self.db.storage;
        let oids = match &self.op {
            StorageOp::Undo(tid) => storage.undo(*tid, txn)?,
            StorageOp::CommitVersion { source, dest } => storage.commit_version(source, dest, txn)?,
            StorageOp::AbortVersion(version) => storage.abort_version(version, txn)?,
        };
        *self.oids.lock() = oids;
        Ok(())
    }

    fn tpc_vote(&self, txn: &Transaction) -> CoreResult<()> {
        self.db.storage.tpc_vote(txn).map(drop)
    }

    fn tpc_finish(&self, txn: &Transaction) -> CoreResult<()> {
        let db = &self.db;
        let tid = db
            .storage
            .tpc_finish(txn, &mut |tid, written| db.invalidate(tid, written, None))?;
        debug!(%tid, objects = self.oids.lock().len(), "storage operation committed");
        Ok(())
    }

    fn tpc_abort(&self, txn: &Transaction) -> CoreResult<()> {
        self.oids.lock().clear();
        self.db.storage.tpc_abort(txn)
    }

    fn abort(&self, _object: &TxnObject, _txn: &Transaction) -> CoreResult<()> {
        Ok(())
    }
}
