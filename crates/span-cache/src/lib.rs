//! # Span Cache
//!
//! A byte-range disk cache that sits between a media consumer and an upstream
//! byte source.
//!
//! Resources are identified by a string key and cached as immutable, non
//! overlapping spans, each backed by one file in the cache directory.
//! Reads are served from spans where possible and from upstream otherwise,
//! with upstream data written through to the cache as it is read.
//!
//! ## Features
//!
//! - [`SimpleCache`]: span index, range locks shared by concurrent sessions,
//!   content length metadata, and reconstruction from the directory on open
//! - [`CacheDataSink`]: splits a byte stream into span files of bounded size
//! - [`CacheDataSource`]: routes each part of a request to a cached span or to
//!   upstream, transparently switching between them
//! - Pluggable [`CacheEvictor`] policies, with a least recently used one built in
//!
//! ## Example
//!
//! ```no_run
//! use span_cache::{CacheConfig, CacheDataSource, DataSpec, NoOpEvictor, SimpleCache};
//! use span_cache::test_utils::{FakeDataSource, read_to_end};
//!
//! let config = CacheConfig::builder().cache_dir("/tmp/media-cache").build();
//! let cache = SimpleCache::open(config, NoOpEvictor)?;
//! let upstream = FakeDataSource::with_data(vec![0u8; 64]);
//!
//! let mut source = CacheDataSource::new(cache, upstream);
//! source.open(&DataSpec::new("https://example.com/video.mp4").with_length(16))?;
//! let data = read_to_end(&mut source)?;
//! source.close()?;
//! assert_eq!(data.len(), 16);
//! # Ok::<(), span_cache::CacheError>(())
//! ```

pub mod config;
pub mod error;
pub mod evictor;
pub mod factory;
mod index;
pub mod sink;
pub mod source;
pub mod span;
pub mod store;
pub mod test_utils;
pub mod upstream;

pub use config::{CacheConfig, CacheConfigBuilder, CacheFlags};
pub use error::{CacheError, Result};
pub use evictor::{CacheEvictor, LeastRecentlyUsedEvictor, NoOpEvictor};
pub use factory::{CacheDataSourceFactory, UpstreamFactory};
pub use sink::CacheDataSink;
pub use source::{CacheDataSource, CacheEventListener, SourceState};
pub use span::CacheSpan;
pub use store::{SimpleCache, SpanLock, SpanLookup};
pub use upstream::{DataSource, DataSpec, FileDataSource};
