//! Write-ahead journal for durability and crash recovery.
//!
//! Every table mutation is written to the journal, grouped into batches,
//! before it is applied. A batch becomes durable when its `Commit` record is
//! complete; on open, committed batches are replayed in commit order.
//!
//! ## Record Format
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! ## Recovery Policy
//!
//! - A truncated header or payload at the end of the journal is a crash
//!   mid-write: the incomplete record is discarded, along with any batch
//!   whose `Commit` never made it.
//! - CRC mismatches, bad magic, unknown types and future versions are fatal.
//!   The storage refuses to open rather than silently losing data.
//!
//! ## Invariants
//!
//! - The journal is append-only between checkpoints.
//! - Records of different batches may interleave; only `Commit` order counts.
//! - Replay is idempotent: batches at or below the snapshot sequence are skipped.

mod iterator;
mod record;
mod writer;

pub use iterator::WalRecordIterator;
pub use record::{compute_crc32, WalRecord, WalRecordType};
pub use writer::WalManager;
