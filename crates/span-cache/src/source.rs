//! # Cache Data Source
//!
//! [`CacheDataSource`] serves reads of a resource from cached spans where
//! possible and from upstream otherwise, writing upstream data through to the
//! cache as it goes.
//!
//! A request is served as a series of sub-ranges. Each sub-range is either a
//! part of a cached span or a hole read from upstream; when one is exhausted
//! the next is looked up and opened without the caller noticing the seam.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::CacheFlags;
use crate::error::{CacheError, Result};
use crate::sink::CacheDataSink;
use crate::span::CacheSpan;
use crate::store::{SimpleCache, SpanLock, SpanLookup};
use crate::upstream::{DataSource, DataSpec, FileDataSource};

/// Receives statistics about reads served from the cache.
pub trait CacheEventListener: Send + Sync {
    /// Called on close when at least one byte was read from cached spans.
    fn on_cached_bytes_read(&self, cache_size_bytes: u64, cached_bytes_read: u64);
}

/// Lifecycle of a [`CacheDataSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Closed,
    Opening,
    ReadingFromCache,
    ReadingFromUpstream,
    /// A call failed; the source must be closed before it can be opened again.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transport {
    Cache,
    Upstream,
}

/// How the open sub-range is expected to end.
///
/// Only the last two say anything about where the resource ends; running
/// into a `Limit` must never be taken as end of stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeBound {
    /// A boundary picked by the router: the requested length or the next cached span.
    Limit,
    /// The end of the resource as declared by upstream when it was opened.
    ResourceEnd,
    /// No known end; upstream running dry marks the end of the resource.
    Unbounded,
}

#[derive(Debug, Clone, Copy)]
struct SubRange {
    transport: Transport,
    position: u64,
    length: Option<u64>,
    bound: RangeBound,
    read: u64,
    writing: bool,
}

impl SubRange {
    fn remaining(&self) -> Option<u64> {
        self.length.map(|length| length - self.read)
    }
}

/// Where a failure happened, which decides what happens to an in-flight write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Upstream,
    CacheRead,
    CacheWrite,
}

#[derive(Debug)]
struct Failure {
    stage: Stage,
    error: CacheError,
}

impl Failure {
    fn upstream(error: CacheError) -> Self {
        Self {
            stage: Stage::Upstream,
            error,
        }
    }

    fn cache_read(error: CacheError) -> Self {
        Self {
            stage: Stage::CacheRead,
            error,
        }
    }

    fn cache_write(error: CacheError) -> Self {
        Self {
            stage: Stage::CacheWrite,
            error,
        }
    }
}

enum Plan {
    Cache(CacheSpan),
    Upstream {
        length: Option<u64>,
        lock: Option<SpanLock>,
    },
}

/// Reads a resource through the cache.
pub struct CacheDataSource {
    cache: SimpleCache,
    upstream: Box<dyn DataSource>,
    cache_read: Box<dyn DataSource>,
    cache_write: Option<CacheDataSink>,
    flags: CacheFlags,
    listener: Option<Arc<dyn CacheEventListener>>,

    state: SourceState,
    request: Option<DataSpec>,
    key: String,
    read_position: u64,
    bytes_remaining: Option<u64>,
    current: Option<SubRange>,
    ignore_cache: bool,
    seen_cache_error: bool,
    total_cached_bytes_read: u64,
}

impl CacheDataSource {
    /// Create a source that reads spans from disk and writes upstream data
    /// into spans of the cache's configured size.
    pub fn new(cache: SimpleCache, upstream: impl DataSource + 'static) -> Self {
        let sink = CacheDataSink::from_config(cache.clone());
        Self::with_components(
            cache,
            Box::new(upstream),
            Box::new(FileDataSource::new()),
            Some(sink),
            CacheFlags::default(),
        )
    }

    /// Create a source from explicit parts. Without `cache_write` the cache is
    /// only read, never written.
    pub fn with_components(
        cache: SimpleCache,
        upstream: Box<dyn DataSource>,
        cache_read: Box<dyn DataSource>,
        cache_write: Option<CacheDataSink>,
        flags: CacheFlags,
    ) -> Self {
        Self {
            cache,
            upstream,
            cache_read,
            cache_write,
            flags,
            listener: None,
            state: SourceState::Closed,
            request: None,
            key: String::new(),
            read_position: 0,
            bytes_remaining: None,
            current: None,
            ignore_cache: false,
            seen_cache_error: false,
            total_cached_bytes_read: 0,
        }
    }

    pub fn with_flags(mut self, flags: CacheFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn CacheEventListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn cache(&self) -> &SimpleCache {
        &self.cache
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    /// Uri of the open request.
    pub fn uri(&self) -> Option<&str> {
        self.request.as_ref().map(|request| request.uri.as_str())
    }

    /// Open `request`, returning the number of bytes that will be served, or
    /// `None` if that is not known yet.
    pub fn open(&mut self, request: &DataSpec) -> Result<Option<u64>> {
        if self.state != SourceState::Closed {
            return Err(CacheError::InvalidRequest(format!(
                "cannot open a source in state {:?}",
                self.state
            )));
        }
        self.state = SourceState::Opening;
        match self.open_request(request) {
            Ok(length) => {
                debug!(
                    key = %self.key,
                    position = request.position,
                    length = ?request.length,
                    resolved = ?length,
                    ignore_cache = self.ignore_cache,
                    "Opened cache data source"
                );
                Ok(length)
            }
            Err(failure) => Err(self.fail(failure)),
        }
    }

    fn open_request(&mut self, request: &DataSpec) -> std::result::Result<Option<u64>, Failure> {
        if request.length.is_some() && request.end().is_none() {
            return Err(Failure::upstream(CacheError::InvalidRequest(format!(
                "range at {} with length {:?} overflows",
                request.position, request.length
            ))));
        }

        self.key = request.cache_key().to_string();
        let key = self.key.as_str();
        let position = request.position;
        let content_length = self.cache.content_length(key);

        self.ignore_cache = (self.flags.ignore_cache_on_error && self.seen_cache_error)
            || (request.length.is_none()
                && content_length.is_none()
                && self.flags.ignore_cache_for_unset_length_requests);

        self.bytes_remaining = if self.ignore_cache {
            request.length
        } else {
            match (request.length, content_length) {
                (Some(length), Some(content_length)) => {
                    if position + length > content_length {
                        return Err(Failure::upstream(CacheError::unsatisfiable(
                            key,
                            position,
                            Some(length),
                            Some(content_length),
                        )));
                    }
                    Some(length)
                }
                (Some(length), None) => Some(length),
                (None, Some(content_length)) => {
                    if position > content_length {
                        return Err(Failure::upstream(CacheError::unsatisfiable(
                            key,
                            position,
                            None,
                            Some(content_length),
                        )));
                    }
                    Some(content_length - position)
                }
                (None, None) => None,
            }
        };

        self.read_position = position;
        self.request = Some(request.clone());

        if self.bytes_remaining == Some(0) {
            self.state = SourceState::ReadingFromCache;
        } else {
            self.open_next_source(true)?;
        }
        Ok(if self.ignore_cache {
            request.length
        } else {
            self.bytes_remaining
        })
    }

    /// Look up what covers the read position and open the matching transport.
    ///
    /// Returns `Ok(false)` when upstream reports that the resource ends at the
    /// read position.
    fn open_next_source(&mut self, initial: bool) -> std::result::Result<bool, Failure> {
        let Some(request) = self.request.clone() else {
            return Err(Failure::cache_read(CacheError::InvalidRequest(
                "no open request".to_string(),
            )));
        };
        let position = self.read_position;
        let remaining = self.bytes_remaining;

        let plan = if self.ignore_cache {
            Plan::Upstream {
                length: remaining,
                lock: None,
            }
        } else if self.cache_write.is_none() {
            self.plan_without_lock(position, remaining)
        } else {
            let lookup = if self.flags.block_on_cache {
                self.cache.start_read_write(&self.key, position, remaining)
            } else {
                self.cache.try_start_read_write(&self.key, position, remaining)
            };
            match lookup {
                Ok(SpanLookup::Cached(span)) => Plan::Cache(span),
                Ok(SpanLookup::Hole(lock)) => Plan::Upstream {
                    length: lock.length(),
                    lock: Some(lock),
                },
                Err(CacheError::LockContention { .. }) => {
                    debug!(key = %self.key, position, "Range is being cached elsewhere, reading through");
                    self.plan_without_lock(position, remaining)
                }
                Err(e) => return Err(Failure::cache_read(e)),
            }
        };

        match plan {
            Plan::Cache(span) => {
                let (Some(file), Some(span_length)) = (span.file.as_ref(), span.length) else {
                    return Err(Failure::cache_read(CacheError::InvalidRequest(format!(
                        "span at {} of key '{}' has no backing file",
                        span.position, span.key
                    ))));
                };
                let file_position = position - span.position;
                let available = span_length - file_position;
                let length = remaining.map_or(available, |remaining| remaining.min(available));
                let file_spec = DataSpec::new(file.to_string_lossy())
                    .with_key(self.key.clone())
                    .with_position(file_position)
                    .with_length(length);
                self.cache_read
                    .open(&file_spec)
                    .map_err(Failure::cache_read)?;

                trace!(key = %self.key, position, length, "Reading from cached span");
                self.current = Some(SubRange {
                    transport: Transport::Cache,
                    position,
                    length: Some(length),
                    bound: RangeBound::Limit,
                    read: 0,
                    writing: false,
                });
                self.state = SourceState::ReadingFromCache;
                Ok(true)
            }
            Plan::Upstream { length, lock } => {
                let upstream_spec = request.subrange(position, length);
                let resolved = match self.upstream.open(&upstream_spec) {
                    Ok(resolved) => resolved,
                    Err(e) if !initial && length.is_none() && e.is_unsatisfiable_range() => {
                        // Everything up to here was read; upstream says there is no more.
                        drop(lock);
                        trace!(key = %self.key, position, "Upstream rejected range at end of resource");
                        self.record_content_length(position)?;
                        self.bytes_remaining = Some(0);
                        return Ok(false);
                    }
                    Err(e) => return Err(Failure::upstream(e)),
                };

                let (length, bound) = match (length, resolved) {
                    (Some(length), _) => (Some(length), RangeBound::Limit),
                    (None, Some(resolved)) if !self.ignore_cache => {
                        self.bytes_remaining = Some(resolved);
                        (Some(resolved), RangeBound::ResourceEnd)
                    }
                    (None, _) => (None, RangeBound::Unbounded),
                };

                let writing = match (lock, self.cache_write.as_mut()) {
                    (Some(lock), Some(sink)) => {
                        if let Err(e) = sink.open(lock, &request.subrange(position, length)) {
                            if let Err(close_error) = self.upstream.close() {
                                warn!(error = %close_error, "Failed to close upstream");
                            }
                            return Err(Failure::cache_write(e));
                        }
                        true
                    }
                    _ => false,
                };

                trace!(
                    key = %self.key,
                    position,
                    length = ?length,
                    bound = ?bound,
                    writing,
                    "Reading from upstream"
                );
                self.current = Some(SubRange {
                    transport: Transport::Upstream,
                    position,
                    length,
                    bound,
                    read: 0,
                    writing,
                });
                self.state = SourceState::ReadingFromUpstream;
                Ok(true)
            }
        }
    }

    fn plan_without_lock(&self, position: u64, remaining: Option<u64>) -> Plan {
        let span = self.cache.lookup(&self.key, position);
        if span.is_cached() {
            Plan::Cache(span)
        } else {
            Plan::Upstream {
                length: min_length(span.length, remaining),
                lock: None,
            }
        }
    }

    /// Read into `buf`, returning the number of bytes read; `Ok(0)` marks the
    /// end of the requested range.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.state {
            SourceState::ReadingFromCache | SourceState::ReadingFromUpstream => {}
            state => {
                return Err(CacheError::InvalidRequest(format!(
                    "cannot read from a source in state {state:?}"
                )));
            }
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.read_inner(buf).map_err(|failure| self.fail(failure))
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> std::result::Result<usize, Failure> {
        loop {
            let Some(current) = self.current else {
                return Ok(0);
            };

            if current.remaining() == Some(0) {
                self.close_current()?;
                if current.bound == RangeBound::ResourceEnd {
                    self.record_content_length(self.read_position)?;
                }
                if self.bytes_remaining == Some(0) || !self.open_next_source(false)? {
                    return Ok(0);
                }
                continue;
            }

            let max = current.remaining().map_or(buf.len(), |remaining| {
                buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX))
            });
            let read = match current.transport {
                Transport::Cache => self.cache_read.read(&mut buf[..max]),
                Transport::Upstream => self.upstream.read(&mut buf[..max]),
            };
            let read = match (read, current.transport) {
                (Ok(read), _) => read,
                (Err(e), Transport::Cache) => return Err(Failure::cache_read(e)),
                (Err(e), Transport::Upstream) => return Err(Failure::upstream(e)),
            };

            if read == 0 {
                if current.transport == Transport::Cache {
                    return Err(Failure::cache_read(CacheError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!(
                            "cached span of key '{}' ended at {} before its recorded length",
                            self.key, self.read_position
                        ),
                    ))));
                }
                trace!(
                    key = %self.key,
                    position = self.read_position,
                    bound = ?current.bound,
                    "Upstream reached end of stream"
                );
                self.close_current()?;
                // A short bounded response says nothing certain about the resource length.
                let unbounded_request = self
                    .request
                    .as_ref()
                    .is_some_and(|request| request.length.is_none());
                if unbounded_request {
                    self.record_content_length(self.read_position)?;
                }
                self.bytes_remaining = Some(0);
                return Ok(0);
            }

            if current.writing {
                if let Some(sink) = self.cache_write.as_mut() {
                    sink.write(self.read_position, &buf[..read])
                        .map_err(Failure::cache_write)?;
                }
            }

            let read_u64 = read as u64;
            if let Some(current) = self.current.as_mut() {
                current.read += read_u64;
            }
            if current.transport == Transport::Cache {
                self.total_cached_bytes_read += read_u64;
            }
            self.read_position += read_u64;
            self.bytes_remaining = self.bytes_remaining.map(|r| r.saturating_sub(read_u64));
            return Ok(read);
        }
    }

    /// Close the current transport and commit whatever was written for it.
    fn close_current(&mut self) -> std::result::Result<(), Failure> {
        let Some(current) = self.current.take() else {
            return Ok(());
        };
        let closed = match current.transport {
            Transport::Cache => self.cache_read.close().map_err(Failure::cache_read),
            Transport::Upstream => self.upstream.close().map_err(Failure::upstream),
        };
        let committed = match self.cache_write.as_mut() {
            Some(sink) if current.writing => sink.close().map_err(Failure::cache_write),
            _ => Ok(()),
        };
        trace!(
            key = %self.key,
            position = current.position,
            read = current.read,
            "Closed sub-range"
        );
        closed.and(committed)
    }

    /// Record `length` as the content length of the open key.
    ///
    /// Only skipped when the open bypasses the cache or the source is read-only;
    /// a pass-through sub-range that cached nothing (for example after lock
    /// contention) still records the end it observed.
    fn record_content_length(&self, length: u64) -> std::result::Result<(), Failure> {
        if self.ignore_cache || self.cache_write.is_none() {
            return Ok(());
        }
        self.cache
            .set_content_length(&self.key, length)
            .map_err(Failure::cache_write)
    }

    /// Tear down the current sub-range after a failure and enter the error state.
    ///
    /// Data mirrored before an upstream or cache-read failure is committed; a
    /// failure while writing discards the span being written.
    fn fail(&mut self, failure: Failure) -> CacheError {
        if let Some(current) = self.current.take() {
            let closed = match current.transport {
                Transport::Cache => self.cache_read.close(),
                Transport::Upstream => self.upstream.close(),
            };
            if let Err(e) = closed {
                warn!(key = %self.key, error = %e, "Failed to close transport after error");
            }
            if current.writing && failure.stage != Stage::CacheWrite {
                if let Some(sink) = self.cache_write.as_mut() {
                    if let Err(e) = sink.close() {
                        warn!(key = %self.key, error = %e, "Failed to commit cached data after error");
                    }
                }
            }
        }
        if failure.stage == Stage::CacheWrite {
            if let Some(sink) = self.cache_write.as_mut() {
                sink.abort();
            }
        }

        if failure.stage != Stage::Upstream {
            self.seen_cache_error = true;
        }
        warn!(
            key = %self.key,
            position = self.read_position,
            stage = ?failure.stage,
            error = %failure.error,
            "Cache data source failed"
        );
        self.state = SourceState::Error;
        failure.error
    }

    /// Release the current transport, commit any in-flight write and return to
    /// the closed state. Safe to call in any state.
    pub fn close(&mut self) -> Result<()> {
        let result = self.close_current();

        if self.total_cached_bytes_read > 0 {
            if let Some(listener) = &self.listener {
                listener.on_cached_bytes_read(self.cache.cache_space(), self.total_cached_bytes_read);
            }
            self.total_cached_bytes_read = 0;
        }

        self.request = None;
        self.bytes_remaining = None;
        self.state = SourceState::Closed;

        result.map_err(|failure| {
            if failure.stage != Stage::Upstream {
                self.seen_cache_error = true;
            }
            failure.error
        })
    }
}

fn min_length(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::evictor::NoOpEvictor;
    use crate::factory::CacheDataSourceFactory;
    use crate::init_test_tracing;
    use crate::test_utils::{FakeDataSource, assert_cache_empty, read_to_end};
    use parking_lot::Mutex;
    use std::sync::atomic::Ordering;
    use std::thread;
    use tempfile::tempdir;

    const KEY_1: &str = "key 1";
    const MAX_SPAN_SIZE: u64 = 3;

    fn test_data() -> Vec<u8> {
        (0..10).collect()
    }

    fn open_cache(dir: &std::path::Path) -> SimpleCache {
        let config = CacheConfig::builder()
            .cache_dir(dir)
            .max_span_size(MAX_SPAN_SIZE)
            .sync_on_commit(false)
            .build();
        SimpleCache::open(config, NoOpEvictor).unwrap()
    }

    fn upstream(unknown_length: bool) -> FakeDataSource {
        FakeDataSource::with_data(test_data()).simulate_unknown_length(unknown_length)
    }

    fn spec(position: u64, length: Option<u64>) -> DataSpec {
        DataSpec::new("test://data")
            .with_key(KEY_1)
            .with_position(position)
            .with_length_option(length)
    }

    fn read(source: &mut CacheDataSource, position: u64, length: Option<u64>) -> (Option<u64>, Vec<u8>) {
        let resolved = source.open(&spec(position, length)).unwrap();
        let data = read_to_end(source).unwrap();
        source.close().unwrap();
        (resolved, data)
    }

    fn span_ranges(cache: &SimpleCache) -> Vec<(u64, Option<u64>)> {
        cache
            .spans_for(KEY_1)
            .iter()
            .map(|span| (span.position, span.length))
            .collect()
    }

    #[derive(Default)]
    struct RecordingListener {
        calls: Mutex<Vec<(u64, u64)>>,
    }

    impl CacheEventListener for RecordingListener {
        fn on_cached_bytes_read(&self, cache_size_bytes: u64, cached_bytes_read: u64) {
            self.calls.lock().push((cache_size_bytes, cached_bytes_read));
        }
    }

    #[test]
    fn test_max_span_size() {
        init_test_tracing!();
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let mut source = CacheDataSource::new(cache.clone(), upstream(true));

        let (resolved, data) = read(&mut source, 0, None);
        assert_eq!(resolved, None);
        assert_eq!(data, test_data());
        assert_eq!(
            span_ranges(&cache),
            vec![(0, Some(3)), (3, Some(3)), (6, Some(3)), (9, Some(1))]
        );
        assert_eq!(cache.content_length(KEY_1), Some(10));
        assert_eq!(cache.cache_space(), 10);
    }

    fn assert_cache_and_read(bounded: bool, unknown_length: bool) {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let length = bounded.then_some(10);

        let mut source = CacheDataSource::new(cache.clone(), upstream(unknown_length));
        let (resolved, data) = read(&mut source, 0, length);
        let expected = if !bounded && unknown_length { None } else { Some(10) };
        assert_eq!(resolved, expected);
        assert_eq!(data, test_data());

        // Served entirely from the cache the second time around.
        let fresh = upstream(unknown_length);
        let opens = fresh.open_counter();
        let mut source = CacheDataSource::new(cache.clone(), fresh);
        let (resolved, data) = read(&mut source, 0, length);
        assert_eq!(resolved, Some(10));
        assert_eq!(data, test_data());
        assert_eq!(opens.load(Ordering::SeqCst), 0);
        assert_eq!(cache.cache_space(), 10);
    }

    #[test]
    fn test_cache_and_read() {
        assert_cache_and_read(true, false);
    }

    #[test]
    fn test_cache_and_read_unknown_length() {
        assert_cache_and_read(true, true);
    }

    #[test]
    fn test_cache_and_read_unbounded_request() {
        assert_cache_and_read(false, false);
    }

    #[test]
    fn test_cache_and_read_unbounded_request_unknown_length() {
        assert_cache_and_read(false, true);
    }

    #[test]
    fn test_unsatisfiable_range() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());

        // A bounded read does not learn the content length.
        let mut source = CacheDataSource::new(cache.clone(), upstream(true));
        read(&mut source, 0, Some(10));
        assert_eq!(cache.content_length(KEY_1), None);

        // An unbounded read finds the end when upstream rejects the range after the last span.
        let (resolved, data) = read(&mut source, 0, None);
        assert_eq!(resolved, None);
        assert_eq!(data, test_data());
        assert_eq!(cache.content_length(KEY_1), Some(10));

        let err = source.open(&spec(10, Some(5))).unwrap_err();
        assert!(err.is_unsatisfiable_range());
        assert_eq!(source.state(), SourceState::Error);
        source.close().unwrap();
        assert_eq!(source.state(), SourceState::Closed);
    }

    #[test]
    fn test_content_length_edge_cases() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let mut source = CacheDataSource::new(cache.clone(), upstream(true));

        let (resolved, data) = read(&mut source, 8, Some(2));
        assert_eq!(resolved, Some(2));
        assert_eq!(data, vec![8, 9]);
        assert_eq!(cache.content_length(KEY_1), None);

        let (resolved, data) = read(&mut source, 0, None);
        assert_eq!(resolved, None);
        assert_eq!(data, test_data());
        assert_eq!(cache.content_length(KEY_1), Some(10));
    }

    #[test]
    fn test_read_at_content_length_is_empty() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let mut source = CacheDataSource::new(cache.clone(), upstream(false));
        read(&mut source, 0, None);

        let (resolved, data) = read(&mut source, 10, None);
        assert_eq!(resolved, Some(0));
        assert!(data.is_empty());
        assert!(source.open(&spec(11, None)).unwrap_err().is_unsatisfiable_range());
    }

    #[test]
    fn test_premature_end_of_bounded_request_leaves_content_length_unset() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let mut source = CacheDataSource::new(cache.clone(), upstream(true));

        let (resolved, data) = read(&mut source, 5, Some(10));
        assert_eq!(resolved, Some(10));
        assert_eq!(data, vec![5, 6, 7, 8, 9]);
        assert_eq!(cache.content_length(KEY_1), None);
        assert_eq!(span_ranges(&cache), vec![(5, Some(3)), (8, Some(2))]);

        // An unbounded read reaching the same end does record it.
        let (_, data) = read(&mut source, 0, None);
        assert_eq!(data, test_data());
        assert_eq!(cache.content_length(KEY_1), Some(10));
    }

    #[test]
    fn test_ignore_cache_for_unset_length_requests() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let flags = CacheFlags::new().ignore_cache_for_unset_length_requests(true);
        let mut source = CacheDataSource::new(cache.clone(), upstream(true)).with_flags(flags);

        let (resolved, data) = read(&mut source, 0, None);
        assert_eq!(resolved, None);
        assert_eq!(data, test_data());
        assert_cache_empty(&cache);
        assert_eq!(cache.content_length(KEY_1), None);
    }

    #[test]
    fn test_ignore_cache_for_unset_length_request_mid_resource() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let flags = CacheFlags::new().ignore_cache_for_unset_length_requests(true);
        let mut source = CacheDataSource::new(cache.clone(), upstream(false)).with_flags(flags);

        let (resolved, data) = read(&mut source, 8, None);
        assert_eq!(resolved, None);
        assert_eq!(data, vec![8, 9]);
        assert_cache_empty(&cache);

        // Bounded requests still go through the cache.
        let (resolved, _) = read(&mut source, 8, Some(2));
        assert_eq!(resolved, Some(2));
        assert_eq!(span_ranges(&cache), vec![(8, Some(2))]);
    }

    #[test]
    fn test_read_only_cache() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let mut source = CacheDataSource::with_components(
            cache.clone(),
            Box::new(upstream(false)),
            Box::new(FileDataSource::new()),
            None,
            CacheFlags::default(),
        );

        let (_, data) = read(&mut source, 0, None);
        assert_eq!(data, test_data());
        assert_cache_empty(&cache);
        assert_eq!(cache.content_length(KEY_1), None);
    }

    #[test]
    fn test_reread_leaves_spans_unchanged() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let mut source = CacheDataSource::new(cache.clone(), upstream(false));

        read(&mut source, 2, Some(5));
        let spans = cache.spans_for(KEY_1);
        let (_, data) = read(&mut source, 2, Some(5));
        assert_eq!(data, vec![2, 3, 4, 5, 6]);
        assert_eq!(cache.spans_for(KEY_1), spans);

        // Filling the gaps around the cached range keeps spans disjoint.
        let (_, data) = read(&mut source, 0, None);
        assert_eq!(data, test_data());
        let ranges = span_ranges(&cache);
        for pair in ranges.windows(2) {
            let (position, length) = pair[0];
            assert!(position + length.unwrap() <= pair[1].0, "{ranges:?}");
        }
        assert_eq!(cache.cache_space(), 10);
    }

    #[test]
    fn test_upstream_error_commits_mirrored_bytes() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let flaky = FakeDataSource::new()
            .append_data(vec![0u8, 1, 2, 3, 4])
            .append_read_error("connection reset")
            .append_data(vec![5u8, 6, 7, 8, 9]);
        let mut source = CacheDataSource::new(cache.clone(), flaky);

        source.open(&spec(0, None)).unwrap();
        assert_eq!(source.state(), SourceState::ReadingFromUpstream);
        let err = read_to_end(&mut source).unwrap_err();
        assert!(matches!(err, CacheError::Upstream(_)));
        assert_eq!(source.state(), SourceState::Error);
        assert!(source.read(&mut [0u8; 4]).is_err());
        source.close().unwrap();

        assert_eq!(span_ranges(&cache), vec![(0, Some(3)), (3, Some(2))]);
        assert_eq!(cache.content_length(KEY_1), None);

        // The error fires once; the next read resumes after the cached bytes.
        let (_, data) = read(&mut source, 0, None);
        assert_eq!(data, test_data());
        assert_eq!(cache.content_length(KEY_1), Some(10));
    }

    #[test]
    fn test_cache_write_failure_discards_partial_span() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let mut source = CacheDataSource::new(cache.clone(), upstream(false));
        source.open(&spec(0, None)).unwrap();

        let mut byte = [0u8; 1];
        assert_eq!(source.read(&mut byte).unwrap(), 1);
        // Pull the span file out from under the writer before it fills up.
        for entry in std::fs::read_dir(dir.path()).unwrap() {
            let path = entry.unwrap().path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                std::fs::remove_file(path).unwrap();
            }
        }
        assert_eq!(source.read(&mut byte).unwrap(), 1);
        let err = source.read(&mut byte).unwrap_err();
        assert!(matches!(err, CacheError::Io(_)));
        assert_eq!(source.state(), SourceState::Error);
        source.close().unwrap();

        assert!(cache.spans_for(KEY_1).is_empty());
        assert_eq!(cache.content_length(KEY_1), None);
        assert!(matches!(
            cache.try_start_read_write(KEY_1, 0, None).unwrap(),
            SpanLookup::Hole(_)
        ));

        let (_, data) = read(&mut source, 0, None);
        assert_eq!(data, test_data());
        assert_eq!(cache.cache_space(), 10);
    }

    #[test]
    fn test_close_mid_read_commits_mirrored_bytes_and_releases_lock() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let mut source = CacheDataSource::new(cache.clone(), upstream(false));
        source.open(&spec(0, None)).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(source.read(&mut buf).unwrap(), 4);
        assert_eq!(buf, [0, 1, 2, 3]);
        source.close().unwrap();
        assert_eq!(source.state(), SourceState::Closed);

        assert_eq!(span_ranges(&cache), vec![(0, Some(3)), (3, Some(1))]);
        assert_eq!(cache.content_length(KEY_1), None);
        match cache.try_start_read_write(KEY_1, 4, None).unwrap() {
            SpanLookup::Hole(lock) => assert_eq!((lock.position(), lock.length()), (4, None)),
            SpanLookup::Cached(span) => panic!("unexpected cached span {span:?}"),
        }
    }

    #[test]
    fn test_contended_range_is_read_through() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let held = cache.try_start_read_write(KEY_1, 0, None).unwrap();

        let mut source = CacheDataSource::new(cache.clone(), upstream(false));
        let (resolved, data) = read(&mut source, 0, None);
        assert_eq!(resolved, Some(10));
        assert_eq!(data, test_data());
        assert!(cache.spans_for(KEY_1).is_empty());
        drop(held);
    }

    #[test]
    fn test_concurrent_sources_share_cached_spans() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let factory = CacheDataSourceFactory::new(cache.clone(), || Box::new(upstream(false)))
            .with_flags(CacheFlags::new().block_on_cache(true));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let mut source = factory.create_data_source();
                thread::spawn(move || read(&mut source, 0, None).1)
            })
            .collect();
        for reader in readers {
            assert_eq!(reader.join().unwrap(), test_data());
        }

        assert_eq!(
            span_ranges(&cache),
            vec![(0, Some(3)), (3, Some(3)), (6, Some(3)), (9, Some(1))]
        );
        assert_eq!(cache.cache_space(), 10);
    }

    #[test]
    fn test_ignore_cache_after_cache_error() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let mut source = CacheDataSource::new(cache.clone(), upstream(false));
        read(&mut source, 0, None);

        let first = cache.spans_for(KEY_1)[0].clone();
        std::fs::remove_file(first.file.as_ref().unwrap()).unwrap();

        let flags = CacheFlags::new().ignore_cache_on_error(true);
        let mut source = CacheDataSource::new(cache.clone(), upstream(false)).with_flags(flags);
        assert!(matches!(source.open(&spec(0, None)), Err(CacheError::Io(_))));
        source.close().unwrap();

        let (resolved, data) = read(&mut source, 0, None);
        assert_eq!(resolved, None);
        assert_eq!(data, test_data());
    }

    #[test]
    fn test_listener_receives_cached_bytes_read() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let listener = Arc::new(RecordingListener::default());
        let mut source = CacheDataSource::new(cache.clone(), upstream(false))
            .with_listener(listener.clone());

        read(&mut source, 0, Some(6));
        assert!(listener.calls.lock().is_empty());

        let (_, data) = read(&mut source, 0, None);
        assert_eq!(data, test_data());
        assert_eq!(*listener.calls.lock(), vec![(10, 6)]);
    }

    #[test]
    fn test_invalid_requests() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let mut source = CacheDataSource::new(cache.clone(), upstream(false));

        assert!(matches!(
            source.read(&mut [0u8; 4]),
            Err(CacheError::InvalidRequest(_))
        ));

        source.open(&spec(0, Some(4))).unwrap();
        assert_eq!(source.uri(), Some("test://data"));
        assert_eq!(source.read(&mut []).unwrap(), 0);
        assert!(matches!(
            source.open(&spec(0, None)),
            Err(CacheError::InvalidRequest(_))
        ));
        source.close().unwrap();
        source.close().unwrap();
        assert_eq!(source.uri(), None);

        assert!(matches!(
            source.open(&spec(u64::MAX - 1, Some(5))),
            Err(CacheError::InvalidRequest(_))
        ));
        source.close().unwrap();
    }

    #[test]
    fn test_factory_creates_read_only_sources() {
        let dir = tempdir().unwrap();
        let cache = open_cache(dir.path());
        let factory =
            CacheDataSourceFactory::new(cache.clone(), || Box::new(upstream(false))).read_only();

        let mut source = factory.create_data_source();
        let (_, data) = read(&mut source, 0, None);
        assert_eq!(data, test_data());
        assert_cache_empty(&cache);

        let mut source = factory.with_max_span_size(0).create_data_source();
        read(&mut source, 0, None);
        assert_eq!(span_ranges(&cache), vec![(0, Some(10))]);
    }
}
