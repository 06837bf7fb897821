//! Storage and database configuration.

/// Configuration for opening a [`FullStorage`](crate::FullStorage).
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Whether to create the storage directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Open without write access. Stores, commits and packs are refused.
    pub read_only: bool,

    /// Whether to sync the journal on every commit (safer but slower).
    pub sync_on_commit: bool,

    /// Name reported by the storage; also its two-phase commit sort key.
    /// Defaults to the directory path, or `"memory"` for in-memory storages.
    pub name: Option<String>,

    /// Work items a pack processes per acquisition of the storage lock.
    pub pack_batch_size: usize,

    /// Journal size in bytes that triggers an automatic checkpoint
    /// (0 = never).
    pub checkpoint_wal_size: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            read_only: false,
            sync_on_commit: true,
            name: None,
            pack_batch_size: 100,
            checkpoint_wal_size: 16 * 1024 * 1024, // 16 MB
        }
    }
}

impl StorageConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the storage if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets read-only mode.
    #[must_use]
    pub const fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Sets whether to sync the journal on every commit.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the storage name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets how many pack work items run per lock cycle. Zero is treated as one.
    #[must_use]
    pub const fn pack_batch_size(mut self, size: usize) -> Self {
        self.pack_batch_size = size;
        self
    }

    /// Sets the automatic checkpoint threshold.
    #[must_use]
    pub const fn checkpoint_wal_size(mut self, bytes: u64) -> Self {
        self.checkpoint_wal_size = bytes;
        self
    }
}

/// Configuration for a [`Database`](crate::Database).
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Target number of non-ghost objects kept in each connection cache.
    pub cache_size: usize,

    /// Serve invalidated objects from a consistent snapshot instead of
    /// raising a read conflict straight away.
    pub mvcc: bool,

    /// Version new connections work in (empty = non-version).
    pub version: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            cache_size: 400,
            mvcc: true,
            version: String::new(),
        }
    }
}

impl DatabaseConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-connection cache target.
    #[must_use]
    pub const fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    /// Enables or disables snapshot reads.
    #[must_use]
    pub const fn mvcc(mut self, value: bool) -> Self {
        self.mvcc = value;
        self
    }

    /// Sets the default version for new connections.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = StorageConfig::default();
        assert!(config.create_if_missing);
        assert!(!config.read_only);
        assert!(config.sync_on_commit);
        assert!(config.name.is_none());

        let db = DatabaseConfig::default();
        assert!(db.mvcc);
        assert!(db.version.is_empty());
    }

    #[test]
    fn builder_pattern() {
        let config = StorageConfig::new()
            .create_if_missing(false)
            .sync_on_commit(false)
            .name("main")
            .pack_batch_size(7)
            .checkpoint_wal_size(0);

        assert!(!config.create_if_missing);
        assert!(!config.sync_on_commit);
        assert_eq!(config.name.as_deref(), Some("main"));
        assert_eq!(config.pack_batch_size, 7);
        assert_eq!(config.checkpoint_wal_size, 0);

        let db = DatabaseConfig::new().cache_size(10).mvcc(false).version("draft");
        assert_eq!(db.cache_size, 10);
        assert!(!db.mvcc);
        assert_eq!(db.version, "draft");
    }
}
