//! # revdb storage backends
//!
//! The lowest layer of revdb: append-only byte stores that the journal and
//! snapshot files of the object database are written to.
//!
//! Backends never interpret their contents. Record framing, checksums and
//! recovery all live in `revdb_core`.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - volatile bytes; clones share the same buffer so a
//!   test can "crash" a storage and reopen it over the surviving bytes
//! - [`FileBackend`] - a single OS file
//!
//! ## Example
//!
//! ```rust
//! use revdb_storage::{InMemoryBackend, StorageBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"revision").unwrap();
//! assert_eq!(backend.read_at(offset, 8).unwrap(), b"revision");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
