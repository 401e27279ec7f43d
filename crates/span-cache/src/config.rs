use std::fmt::Display;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default upper bound for a single span file (2 MiB).
pub const DEFAULT_MAX_SPAN_SIZE: u64 = 2 * 1024 * 1024;

/// Default size of the buffer sitting in front of each span file.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 20 * 1024;

/// Configuration of the on-disk cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding span files and metadata
    pub cache_dir: PathBuf,

    /// Maximum size of a single span file in bytes (0 = unlimited)
    pub max_span_size: u64,

    /// Buffer size used by the cache writer
    pub write_buffer_size: usize,

    /// Whether span files are fsynced before they are committed
    pub sync_on_commit: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("span-cache"),
            max_span_size: DEFAULT_MAX_SPAN_SIZE,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            sync_on_commit: true,
        }
    }
}

impl Display for CacheConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let max_span_display = if self.max_span_size == 0 {
            "unlimited".to_string()
        } else {
            format!("{} bytes", self.max_span_size)
        };

        write!(
            f,
            "CacheConfig {{ cache_dir: {}, max_span_size: {}, write_buffer_size: {}, sync_on_commit: {} }}",
            self.cache_dir.display(),
            max_span_display,
            self.write_buffer_size,
            self.sync_on_commit
        )
    }
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.config.cache_dir = cache_dir.into();
        self
    }

    pub fn max_span_size(mut self, max_span_size: u64) -> Self {
        self.config.max_span_size = max_span_size;
        self
    }

    pub fn write_buffer_size(mut self, write_buffer_size: usize) -> Self {
        self.config.write_buffer_size = write_buffer_size.max(1);
        self
    }

    pub fn sync_on_commit(mut self, sync_on_commit: bool) -> Self {
        self.config.sync_on_commit = sync_on_commit;
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}

/// Behaviour switches for a [`CacheDataSource`](crate::CacheDataSource).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheFlags {
    /// Wait for a locked range instead of reading it from upstream without caching.
    pub block_on_cache: bool,

    /// After a cache read or write failure, serve later opens straight from upstream.
    pub ignore_cache_on_error: bool,

    /// Serve unbounded requests for keys of unknown length straight from upstream.
    pub ignore_cache_for_unset_length_requests: bool,
}

impl CacheFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_on_cache(mut self, value: bool) -> Self {
        self.block_on_cache = value;
        self
    }

    pub fn ignore_cache_on_error(mut self, value: bool) -> Self {
        self.ignore_cache_on_error = value;
        self
    }

    pub fn ignore_cache_for_unset_length_requests(mut self, value: bool) -> Self {
        self.ignore_cache_for_unset_length_requests = value;
        self
    }
}
