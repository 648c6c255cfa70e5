//! Engine-wide configuration.

/// Configuration for opening a [`crate::Engine`].
///
/// Fixed at open time; it is not persisted to disk. Opening a database with
/// a different `num_shards` than a previous session is permitted and only
/// affects how the in-memory index is partitioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Number of shards the in-memory index is partitioned into.
    pub num_shards: usize,
    /// Soft maximum size, in bytes, of a single segment before rollover.
    pub max_log_file_size: u64,
}

impl Config {
    /// Builds a custom configuration. `num_shards` must be at least 1.
    pub fn new(num_shards: usize, max_log_file_size: u64) -> Self {
        Self { num_shards, max_log_file_size }
    }

    /// Small preset: 8 shards, 30 MiB segments. Suited to small or
    /// short-lived databases.
    pub fn small() -> Self {
        Self { num_shards: 8, max_log_file_size: 30 * 1024 * 1024 }
    }

    /// Standard preset: 32 shards, 256 MiB segments. The default choice for
    /// most workloads.
    pub fn standard() -> Self {
        Self { num_shards: 32, max_log_file_size: 256 * 1024 * 1024 }
    }

    /// Xlarge preset: 128 shards, 512 MiB segments. Suited to large
    /// key counts and high write concurrency.
    pub fn xlarge() -> Self {
        Self { num_shards: 128, max_log_file_size: 512 * 1024 * 1024 }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::standard()
    }
}
