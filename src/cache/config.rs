//! Cache engine configuration

use std::path::PathBuf;

/// Default storage root of the shard databases
pub const DEFAULT_CACHE_DIR: &str = "/var/cache/dircache";

/// Default location of the custom shard definitions
pub const DEFAULT_SHARD_CONFIG: &str = "/etc/dircache/shards.json";

/// Default number of dispatched events between two cleanup passes
pub const DEFAULT_CLEANUP_INTERVAL: u64 = 1000;

/// Configuration for [`CacheEngine`](super::CacheEngine)
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding the LMDB environment
    pub cache_dir: PathBuf,
    /// JSON document with operator-declared shard definitions
    pub shard_config: PathBuf,
    /// Upper bound of the memory map (MiB)
    pub map_size_mb: usize,
    /// Maximum number of shards (named databases)
    pub max_shards: u32,
    /// Events between cleanup passes; 0 disables periodic cleanup
    pub cleanup_interval: u64,
    /// Activate the built-in membership shards
    pub builtin_shards: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            shard_config: PathBuf::from(DEFAULT_SHARD_CONFIG),
            map_size_mb: 1024,
            max_shards: 64,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            builtin_shards: true,
        }
    }
}

impl CacheConfig {
    /// Configuration rooted in `dir`: databases in `dir/db`, definitions in
    /// `dir/shards.json`
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            cache_dir: dir.join("db"),
            shard_config: dir.join("shards.json"),
            ..Self::default()
        }
    }

    pub fn with_cleanup_interval(mut self, interval: u64) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn without_builtin_shards(mut self) -> Self {
        self.builtin_shards = false;
        self
    }
}
