//! Error types for the revdb core.

use crate::types::{Oid, Tid};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in revdb core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(#[from] revdb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An invalidated object could not be read from a consistent snapshot.
    #[error("read conflict on {oid}")]
    ReadConflict {
        /// The object whose read conflicted.
        oid: Oid,
    },

    /// A store found a newer committed revision and nothing resolved it.
    #[error("write conflict on {oid}: expected serial {expected}, current {}", display_serial(.current))]
    WriteConflict {
        /// The object being stored.
        oid: Oid,
        /// Serial the writer based its change on.
        expected: Tid,
        /// Serial currently committed, when known.
        current: Option<Tid>,
    },

    /// An undo request cannot be carried out.
    #[error("cannot undo: {message}")]
    Undo {
        /// Why the undo was refused.
        message: String,
    },

    /// An object is owned by another connection, or was used outside its
    /// connection.
    #[error("invalid object reference: {message}")]
    InvalidObjectReference {
        /// Description of the bad reference.
        message: String,
    },

    /// Structural violation inside the storage engine.
    #[error("storage system error: {message}")]
    StorageSystem {
        /// Description of the violation.
        message: String,
    },

    /// Write into an object locked by a different version.
    #[error("{oid} is locked in version {locked_in:?}")]
    VersionLock {
        /// The locked object.
        oid: Oid,
        /// Version that holds the lock.
        locked_in: String,
    },

    /// A multi-participant commit failed half way; commits are refused until
    /// the process restarts.
    #[error("transactions are hosed: a previous commit partially failed in its final phase")]
    Hosed,

    /// Object or revision does not exist.
    #[error("{oid} not found{}", display_at(.tid))]
    NotFound {
        /// The missing object.
        oid: Oid,
        /// The specific revision looked for, if any.
        tid: Option<Tid>,
    },

    /// Write attempted on a read-only storage.
    #[error("storage is read-only")]
    ReadOnly,

    /// Connection has been closed.
    #[error("connection is closed")]
    ConnectionClosed,

    /// Storage has been closed.
    #[error("storage is closed")]
    StorageClosed,

    /// Participant does not implement the requested operation.
    #[error("unsupported operation: {operation}")]
    Unsupported {
        /// Name of the operation.
        operation: &'static str,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Journal is corrupted or invalid.
    #[error("journal corruption: {message}")]
    JournalCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Table snapshot is corrupted or invalid.
    #[error("snapshot corruption: {message}")]
    SnapshotCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// Another process holds the storage directory lock.
    #[error("storage locked: another process has exclusive access")]
    StorageLocked,

    /// Object state or metadata could not be encoded or decoded.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },
}

fn display_serial(serial: &Option<Tid>) -> String {
    match serial {
        Some(tid) => tid.to_string(),
        None => "unknown".to_string(),
    }
}

fn display_at(tid: &Option<Tid>) -> String {
    match tid {
        Some(tid) => format!(" at {tid}"),
        None => String::new(),
    }
}

impl CoreError {
    /// Creates a not-found error for the current revision of `oid`.
    pub fn not_found(oid: Oid) -> Self {
        Self::NotFound { oid, tid: None }
    }

    /// Creates a not-found error for the revision of `oid` at `tid`.
    pub fn revision_not_found(oid: Oid, tid: Tid) -> Self {
        Self::NotFound {
            oid,
            tid: Some(tid),
        }
    }

    /// Creates an undo error.
    pub fn undo(message: impl Into<String>) -> Self {
        Self::Undo {
            message: message.into(),
        }
    }

    /// Creates an invalid object reference error.
    pub fn invalid_reference(message: impl Into<String>) -> Self {
        Self::InvalidObjectReference {
            message: message.into(),
        }
    }

    /// Creates a storage system error.
    pub fn storage_system(message: impl Into<String>) -> Self {
        Self::StorageSystem {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates a journal corruption error.
    pub fn journal_corruption(message: impl Into<String>) -> Self {
        Self::JournalCorruption {
            message: message.into(),
        }
    }

    /// Creates a snapshot corruption error.
    pub fn snapshot_corruption(message: impl Into<String>) -> Self {
        Self::SnapshotCorruption {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates an unsupported-operation error.
    pub fn unsupported(operation: &'static str) -> Self {
        Self::Unsupported { operation }
    }

    /// True for read and write conflicts.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ReadConflict { .. } | Self::WriteConflict { .. })
    }

    /// True when retrying the whole transaction may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.is_conflict()
    }
}
