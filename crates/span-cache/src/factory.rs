use std::fmt;
use std::sync::Arc;

use crate::config::CacheFlags;
use crate::sink::CacheDataSink;
use crate::source::{CacheDataSource, CacheEventListener};
use crate::store::SimpleCache;
use crate::upstream::{DataSource, FileDataSource};

/// Function producing a fresh upstream source for each created data source
pub type UpstreamFactory = Arc<dyn Fn() -> Box<dyn DataSource> + Send + Sync>;

/// Factory for [`CacheDataSource`] instances sharing one cache
#[derive(Clone)]
pub struct CacheDataSourceFactory {
    /// Cache read and written by created sources
    cache: SimpleCache,
    /// Upstream source constructor
    upstream_factory: UpstreamFactory,
    /// Behavior flags applied to every created source
    flags: CacheFlags,
    /// Span size for writes, `None` for read-only sources
    max_span_size: Option<u64>,
    /// Listener shared by created sources
    listener: Option<Arc<dyn CacheEventListener>>,
}

impl CacheDataSourceFactory {
    /// Create a factory writing spans of the cache's configured size
    pub fn new<F>(cache: SimpleCache, upstream_factory: F) -> Self
    where
        F: Fn() -> Box<dyn DataSource> + Send + Sync + 'static,
    {
        let max_span_size = cache.config().max_span_size;
        Self {
            cache,
            upstream_factory: Arc::new(upstream_factory),
            flags: CacheFlags::default(),
            max_span_size: Some(max_span_size),
            listener: None,
        }
    }

    /// Set behavior flags
    pub fn with_flags(mut self, flags: CacheFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Set the maximum span size of written spans (0 = unlimited)
    pub fn with_max_span_size(mut self, max_span_size: u64) -> Self {
        self.max_span_size = Some(max_span_size);
        self
    }

    /// Never write to the cache
    pub fn read_only(mut self) -> Self {
        self.max_span_size = None;
        self
    }

    /// Set the listener notified by created sources
    pub fn with_listener(mut self, listener: Arc<dyn CacheEventListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Create a new data source
    pub fn create_data_source(&self) -> CacheDataSource {
        let sink = self
            .max_span_size
            .map(|max_span_size| CacheDataSink::new(self.cache.clone(), max_span_size));
        let source = CacheDataSource::with_components(
            self.cache.clone(),
            (self.upstream_factory)(),
            Box::new(FileDataSource::new()),
            sink,
            self.flags,
        );
        match &self.listener {
            Some(listener) => source.with_listener(Arc::clone(listener)),
            None => source,
        }
    }
}

impl fmt::Debug for CacheDataSourceFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheDataSourceFactory")
            .field("cache", &self.cache)
            .field("flags", &self.flags)
            .field("max_span_size", &self.max_span_size)
            .finish_non_exhaustive()
    }
}
