//! Storage and database fixtures.
//!
//! [`MemoryFiles`] keeps the bytes of an in-memory storage alive across
//! opens, so a test can drop a storage at any point and reopen it the way
//! a restarted process would. [`TempStorage`] does the same with a real
//! directory.

use crate::codec::ItemFactory;
use crate::crash::{CrashControl, CrashableBackend};
use revdb_core::{
    CoreResult, Database, DatabaseConfig, FullStorage, Oid, Storage, StorageConfig, StorageFiles,
    Tid, Transaction, TransactionManager,
};
use revdb_storage::InMemoryBackend;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// The three byte stores of an in-memory storage, shared with every
/// storage opened over them.
#[derive(Debug, Clone, Default)]
pub struct MemoryFiles {
    journal: InMemoryBackend,
    snapshot_a: InMemoryBackend,
    snapshot_b: InMemoryBackend,
}

impl MemoryFiles {
    /// Empty files.
    pub fn new() -> Self {
        Self::default()
    }

    /// Backends for opening a storage.
    pub fn files(&self) -> StorageFiles {
        StorageFiles {
            journal: Box::new(self.journal.clone()),
            snapshot_a: Box::new(self.snapshot_a.clone()),
            snapshot_b: Box::new(self.snapshot_b.clone()),
        }
    }

    /// Backends whose journal can be made to fail mid-write.
    pub fn crashable_files(&self) -> (StorageFiles, Arc<CrashControl>) {
        let journal = CrashableBackend::new(Box::new(self.journal.clone()));
        let control = journal.control();
        let files = StorageFiles {
            journal: Box::new(journal),
            snapshot_a: Box::new(self.snapshot_a.clone()),
            snapshot_b: Box::new(self.snapshot_b.clone()),
        };
        (files, control)
    }

    /// Opens a storage over the files.
    pub fn open(&self) -> CoreResult<Arc<FullStorage>> {
        FullStorage::open_with_files(self.files(), StorageConfig::new()).map(Arc::new)
    }

    /// Opens a storage whose journal can be crashed.
    pub fn open_crashable(&self) -> CoreResult<(Arc<FullStorage>, Arc<CrashControl>)> {
        let (files, control) = self.crashable_files();
        let storage = FullStorage::open_with_files(files, StorageConfig::new())?;
        Ok((Arc::new(storage), control))
    }

    /// Size of the journal in bytes.
    pub fn journal_len(&self) -> usize {
        self.journal.data().len()
    }
}

/// A storage in a temporary directory, removed on drop.
pub struct TempStorage {
    dir: TempDir,
}

impl TempStorage {
    /// Creates an empty temporary directory.
    pub fn new() -> Self {
        Self {
            dir: TempDir::new().expect("Failed to create temp directory"),
        }
    }

    /// Path of the storage directory.
    pub fn path(&self) -> PathBuf {
        self.dir.path().join("store")
    }

    /// Opens (or creates) the storage.
    pub fn open(&self) -> CoreResult<Arc<FullStorage>> {
        self.open_with(StorageConfig::new())
    }

    /// Opens the storage with `config`.
    pub fn open_with(&self, config: StorageConfig) -> CoreResult<Arc<FullStorage>> {
        FullStorage::open(self.path(), config).map(Arc::new)
    }

    /// The temporary directory itself.
    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

impl Default for TempStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens a database of [`Item`](crate::codec::Item)s on `storage`.
pub fn item_database(storage: Arc<FullStorage>) -> CoreResult<Database> {
    item_database_with(storage, DatabaseConfig::new())
}

/// Opens a database of items with an explicit configuration.
pub fn item_database_with(storage: Arc<FullStorage>, config: DatabaseConfig) -> CoreResult<Database> {
    Database::open(storage, Arc::new(ItemFactory), config)
}

/// An in-memory item database and its storage.
pub fn memory_database() -> (Database, Arc<FullStorage>) {
    let storage = MemoryFiles::new().open().expect("Failed to open in-memory storage");
    let db = item_database(Arc::clone(&storage)).expect("Failed to open database");
    (db, storage)
}

/// Runs `f` with an in-memory item database.
///
/// # Example
///
/// ```rust
/// use revdb_testkit::{with_memory_database, ItemAccess};
/// use revdb_core::TransactionManager;
///
/// with_memory_database(|db| {
///     let conn = db.open_connection(&TransactionManager::new()).unwrap();
///     let root = conn.root().unwrap();
///     assert_eq!(conn.name_of(&root).unwrap(), "root");
/// });
/// ```
pub fn with_memory_database<F, R>(f: F) -> R
where
    F: FnOnce(&Database) -> R,
{
    let (db, _storage) = memory_database();
    f(&db)
}

/// Begins a transaction on a fresh manager, runs `f` in it and commits.
///
/// For setup code that does not care which manager runs the commit.
pub fn commit_with<F>(f: F) -> CoreResult<()>
where
    F: FnOnce(&Transaction) -> CoreResult<()>,
{
    let txn = TransactionManager::new().begin();
    match f(&txn) {
        Ok(()) => txn.commit(),
        Err(err) => {
            txn.abort()?;
            Err(err)
        }
    }
}

/// Commits one transaction at tid `at` straight to a storage, storing
/// `(oid, expected serial, data, refs)` items in the non-version.
pub fn commit_at(storage: &FullStorage, at: u64, items: &[(Oid, u64, &[u8], &[Oid])]) -> CoreResult<Tid> {
    let txn = TransactionManager::new().begin();
    storage.tpc_begin_at(&txn, Tid::new(at))?;
    for (oid, expected, data, refs) in items {
        if let Err(err) = storage.store(*oid, Tid::new(*expected), data, refs, "", &txn) {
            storage.tpc_abort(&txn)?;
            return Err(err);
        }
    }
    storage.tpc_vote(&txn)?;
    storage.tpc_finish(&txn, &mut |_, _| {})
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_files_survive_reopen() {
        let files = MemoryFiles::new();
        {
            let storage = files.open().unwrap();
            item_database(Arc::clone(&storage)).unwrap();
        }
        assert!(files.journal_len() > 0);
        let storage = files.open().unwrap();
        assert!(storage.load(Oid::ROOT, "").is_ok());
    }

    #[test]
    fn temp_storage_reopens() {
        let temp = TempStorage::new();
        {
            let storage = temp.open().unwrap();
            item_database(Arc::clone(&storage)).unwrap();
            storage.close().unwrap();
        }
        let storage = temp.open().unwrap();
        assert_eq!(storage.object_count(), 1);
    }
}
