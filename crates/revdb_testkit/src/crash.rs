//! Simulated crashes.
//!
//! A [`CrashableBackend`] wraps a backend and starts failing writes once a
//! byte budget is spent. The write that crosses the budget is applied
//! partially, which is what a torn write at power loss leaves behind.
//! Tests arm the budget through a shared [`CrashControl`], drop the
//! storage, and reopen a fresh one over the surviving bytes.

use revdb_storage::{StorageBackend, StorageError, StorageResult};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Crash settings shared between a test and its backend.
#[derive(Debug)]
pub struct CrashControl {
    written: AtomicU64,
    crash_at: AtomicU64,
    fail_sync: AtomicBool,
    crashed: AtomicBool,
}

impl Default for CrashControl {
    fn default() -> Self {
        Self {
            written: AtomicU64::new(0),
            crash_at: AtomicU64::new(u64::MAX),
            fail_sync: AtomicBool::new(false),
            crashed: AtomicBool::new(false),
        }
    }
}

impl CrashControl {
    /// Lets `bytes` more bytes through, then crashes.
    pub fn crash_after(&self, bytes: u64) {
        let written = self.written.load(Ordering::SeqCst);
        self.crash_at.store(written.saturating_add(bytes), Ordering::SeqCst);
    }

    /// Makes `flush` and `sync` fail.
    pub fn fail_sync(&self, fail: bool) {
        self.fail_sync.store(fail, Ordering::SeqCst);
    }

    /// True once a write or sync has failed.
    pub fn has_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Disarms the crash.
    pub fn reset(&self) {
        self.crash_at.store(u64::MAX, Ordering::SeqCst);
        self.fail_sync.store(false, Ordering::SeqCst);
        self.crashed.store(false, Ordering::SeqCst);
    }
}

fn crash(message: &str) -> StorageError {
    StorageError::Io(io::Error::new(io::ErrorKind::Other, message.to_string()))
}

/// A backend that fails on command.
pub struct CrashableBackend {
    inner: Box<dyn StorageBackend>,
    control: Arc<CrashControl>,
}

impl CrashableBackend {
    /// Wraps `inner`.
    pub fn new(inner: Box<dyn StorageBackend>) -> Self {
        Self {
            inner,
            control: Arc::new(CrashControl::default()),
        }
    }

    /// Handle for arming the crash.
    pub fn control(&self) -> Arc<CrashControl> {
        Arc::clone(&self.control)
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let control = &self.control;
        if control.has_crashed() {
            return Err(crash("backend crashed earlier"));
        }
        let written = control.written.load(Ordering::SeqCst);
        let budget = control.crash_at.load(Ordering::SeqCst).saturating_sub(written);
        if (data.len() as u64) <= budget {
            control.written.fetch_add(data.len() as u64, Ordering::SeqCst);
            return self.inner.append(data);
        }
        control.crashed.store(true, Ordering::SeqCst);
        let partial = budget as usize;
        if partial > 0 {
            self.inner.append(&data[..partial])?;
            control.written.fetch_add(budget, Ordering::SeqCst);
        }
        Err(crash("simulated crash during write"))
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.control.fail_sync.load(Ordering::SeqCst) {
            self.control.crashed.store(true, Ordering::SeqCst);
            return Err(crash("simulated crash during flush"));
        }
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.control.fail_sync.load(Ordering::SeqCst) {
            self.control.crashed.store(true, Ordering::SeqCst);
            return Err(crash("simulated crash during sync"));
        }
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use revdb_storage::InMemoryBackend;

    #[test]
    fn write_crossing_the_budget_is_torn() {
        let bytes = InMemoryBackend::new();
        let mut backend = CrashableBackend::new(Box::new(bytes.clone()));
        let control = backend.control();
        backend.append(b"abcd").unwrap();

        control.crash_after(2);
        assert!(backend.append(b"efgh").is_err());
        assert!(control.has_crashed());
        assert_eq!(bytes.data(), b"abcdef");
        assert!(backend.append(b"i").is_err());

        control.reset();
        backend.append(b"i").unwrap();
        assert_eq!(bytes.data(), b"abcdefi");
    }

    #[test]
    fn failing_sync() {
        let mut backend = CrashableBackend::new(Box::new(InMemoryBackend::new()));
        backend.control().fail_sync(true);
        assert!(backend.sync().is_err());
        assert!(backend.control().has_crashed());
    }
}
