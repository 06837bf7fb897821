//! Storage directory management.
//!
//! File system layout of a storage:
//!
//! ```text
//! <path>/
//! ├─ LOCK            # Advisory lock, exclusive for writers
//! ├─ journal.log     # Write-ahead journal
//! ├─ snapshot-a.dat  # Table snapshot, generation A
//! └─ snapshot-b.dat  # Table snapshot, generation B
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use revdb_storage::{FileBackend, StorageBackend};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const JOURNAL_FILE: &str = "journal.log";
const SNAPSHOT_A_FILE: &str = "snapshot-a.dat";
const SNAPSHOT_B_FILE: &str = "snapshot-b.dat";

/// The three byte stores a storage engine runs on.
pub struct StorageFiles {
    /// Write-ahead journal.
    pub journal: Box<dyn StorageBackend>,
    /// Snapshot generation A.
    pub snapshot_a: Box<dyn StorageBackend>,
    /// Snapshot generation B.
    pub snapshot_b: Box<dyn StorageBackend>,
}

impl std::fmt::Debug for StorageFiles {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageFiles").finish_non_exhaustive()
    }
}

/// An opened storage directory.
///
/// Holds the directory lock for as long as it lives: exclusive for
/// writers, shared for read-only opens.
#[derive(Debug)]
pub struct StorageDir {
    path: PathBuf,
    read_only: bool,
    _lock_file: File,
}

impl StorageDir {
    /// Opens or creates a storage directory.
    ///
    /// # Errors
    ///
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds a conflicting lock (`StorageLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool, read_only: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing && !read_only {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_operation(format!(
                    "storage directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_operation(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        let locked = if read_only {
            FileExt::try_lock_shared(&lock_file)
        } else {
            FileExt::try_lock_exclusive(&lock_file)
        };
        if locked.is_err() {
            return Err(CoreError::StorageLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            read_only,
            _lock_file: lock_file,
        })
    }

    /// Directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the journal file.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.path.join(JOURNAL_FILE)
    }

    /// Paths of the two snapshot files.
    #[must_use]
    pub fn snapshot_paths(&self) -> [PathBuf; 2] {
        [self.path.join(SNAPSHOT_A_FILE), self.path.join(SNAPSHOT_B_FILE)]
    }

    /// True if no journal has been written yet.
    #[must_use]
    pub fn is_new(&self) -> bool {
        !self.journal_path().exists()
    }

    /// Opens the journal and snapshot files as backends.
    pub fn open_files(&self) -> CoreResult<StorageFiles> {
        let [a, b] = self.snapshot_paths();
        Ok(StorageFiles {
            journal: self.open_file(&self.journal_path())?,
            snapshot_a: self.open_file(&a)?,
            snapshot_b: self.open_file(&b)?,
        })
    }

    fn open_file(&self, path: &Path) -> CoreResult<Box<dyn StorageBackend>> {
        if self.read_only {
            if !path.exists() {
                // read-only opens see a missing file as empty
                return Ok(Box::new(revdb_storage::InMemoryBackend::new()));
            }
            return Ok(Box::new(FileBackend::open_read_only(path)?));
        }
        Ok(Box::new(FileBackend::open(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("new_storage");
        let dir = StorageDir::open(&path, true, false).unwrap();
        assert!(path.is_dir());
        assert!(dir.is_new());
        assert_eq!(dir.journal_path(), path.join("journal.log"));
    }

    #[test]
    fn open_fails_if_not_exists_and_no_create() {
        let temp = tempdir().unwrap();
        let result = StorageDir::open(&temp.path().join("missing"), false, false);
        assert!(matches!(result, Err(CoreError::InvalidOperation { .. })));
    }

    #[test]
    fn lock_prevents_second_writer() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("locked");
        let _first = StorageDir::open(&path, true, false).unwrap();
        assert!(matches!(
            StorageDir::open(&path, true, false),
            Err(CoreError::StorageLocked)
        ));
        assert!(matches!(
            StorageDir::open(&path, true, true),
            Err(CoreError::StorageLocked)
        ));
    }

    #[test]
    fn readers_share_the_lock() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("shared");
        drop(StorageDir::open(&path, true, false).unwrap());

        let _r1 = StorageDir::open(&path, false, true).unwrap();
        let _r2 = StorageDir::open(&path, false, true).unwrap();
        assert!(StorageDir::open(&path, false, false).is_err());
    }

    #[test]
    fn files_are_created_on_open() {
        let temp = tempdir().unwrap();
        let dir = StorageDir::open(&temp.path().join("files"), true, false).unwrap();
        let mut files = dir.open_files().unwrap();
        files.journal.append(b"x").unwrap();
        assert!(!dir.is_new());
        for path in dir.snapshot_paths() {
            assert!(path.exists());
        }
    }
}
