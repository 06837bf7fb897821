//! # revdb core
//!
//! An embedded transactional object database.
//!
//! This crate provides:
//! - [`FullStorage`]: a durable storage that keeps every revision of every
//!   object, with undo, pack and versions
//! - [`Database`] and [`Connection`]: per-thread sessions with an object
//!   cache and snapshot (MVCC) reads
//! - [`TransactionManager`] and [`Transaction`]: two-phase commit across
//!   any number of [`Jar`]s, with sub-transactions
//!
//! Applications describe their object types with [`Persistent`] and an
//! [`ObjectFactory`]. Objects refer to each other by [`PRef`]; new objects
//! reachable from a stored object are stored with it.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod config;
mod conflict;
mod connection;
mod db;
mod dir;
mod error;
pub mod kv;
mod persistent;
pub mod storage;
mod transaction;
mod types;
pub mod wal;

pub use cache::{ObjectCache, PickleCache};
pub use config::{DatabaseConfig, StorageConfig};
pub use conflict::{ConflictResolver, FnResolver, NoResolver, ResolvedState};
pub use connection::Connection;
pub use db::Database;
pub use dir::{StorageDir, StorageFiles};
pub use error::{CoreError, CoreResult};
pub use persistent::{
    AsAny, ObjectFactory, ObjectState, PRef, Persistent, PersistentObject, ReferenceReader,
    ReferenceWriter,
};
pub use storage::{
    FullStorage, LoadedRevision, PackOutcome, PackStats, RevisionInfo, Storage, StoreOutcome,
    TransactionDescription, UndoFilter,
};
pub use transaction::{
    Jar, Synchronizer, Transaction, TransactionManager, TransactionStatus, TxnObject,
};
pub use types::{Oid, Serial, Tid, VersionId};
