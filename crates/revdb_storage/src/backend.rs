//! The byte-store contract.

use crate::error::StorageResult;

/// An append-only byte store.
///
/// revdb keeps two kinds of files on a backend: the write-ahead journal and
/// the table snapshots. Both are written strictly by appending and are only
/// ever shortened with [`StorageBackend::truncate`] (journal reset after a
/// checkpoint, snapshot rewrite).
///
/// # Invariants
///
/// - `append` returns the offset the bytes landed at, which equals the size
///   before the call
/// - `read_at` returns exactly what was appended at that offset
/// - after `sync` returns, everything appended so far survives a crash
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Fails with `ReadPastEnd` if any part of the range is beyond the
    /// current size, or with an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    fn flush(&mut self) -> StorageResult<()>;

    /// Current size in bytes; the offset of the next append.
    fn size(&self) -> StorageResult<u64>;

    /// Forces data and metadata to durable media.
    fn sync(&mut self) -> StorageResult<()>;

    /// Discards everything from `new_size` onwards.
    ///
    /// # Errors
    ///
    /// Fails with `TruncateBeyondEnd` if `new_size` exceeds the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Reads the whole store.
    fn read_all(&self) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        let len = usize::try_from(size).map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::OutOfMemory, "store too large to map")
        })?;
        self.read_at(0, len)
    }

    /// Truncates the store to zero bytes.
    fn clear(&mut self) -> StorageResult<()> {
        self.truncate(0)
    }
}
