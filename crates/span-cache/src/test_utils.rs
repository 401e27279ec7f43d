//! Helpers for testing code built on the cache.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;

use crate::error::{CacheError, Result};
use crate::source::CacheDataSource;
use crate::span::{SPAN_SUFFIX, has_suffix};
use crate::store::SimpleCache;
use crate::upstream::{DataSource, DataSpec};

/// Macro to initialize tracing for tests
///
/// Usage:
/// - `init_test_tracing!()` - uses DEBUG level (default)
/// - `init_test_tracing!(INFO)` - uses specified level
#[macro_export]
macro_rules! init_test_tracing {
    () => {
        init_test_tracing!(DEBUG);
    };
    ($level:ident) => {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::$level)
            .with_test_writer()
            .try_init();
    };
}

#[derive(Debug, Clone)]
enum Segment {
    Data(Bytes),
    Error(String),
}

/// An in-memory upstream made of data segments, optionally interleaved with
/// read errors. Each error fires once per source.
#[derive(Debug, Clone, Default)]
pub struct FakeDataSource {
    segments: Vec<Segment>,
    simulate_unknown_length: bool,
    opened: Arc<AtomicUsize>,
    fired: HashSet<usize>,
    position: u64,
    end: u64,
    open: bool,
}

impl FakeDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source serving `data` as a single segment.
    pub fn with_data(data: impl Into<Bytes>) -> Self {
        Self::new().append_data(data)
    }

    pub fn append_data(mut self, data: impl Into<Bytes>) -> Self {
        self.segments.push(Segment::Data(data.into()));
        self
    }

    /// Fail the read that reaches the current end of the data.
    pub fn append_read_error(mut self, message: impl Into<String>) -> Self {
        self.segments.push(Segment::Error(message.into()));
        self
    }

    /// Report an unknown length when opened for an unbounded range.
    pub fn simulate_unknown_length(mut self, unknown: bool) -> Self {
        self.simulate_unknown_length = unknown;
        self
    }

    /// Counter of successful and failed `open` calls, shared by clones.
    pub fn open_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.opened)
    }

    pub fn total_length(&self) -> u64 {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Data(data) => data.len() as u64,
                Segment::Error(_) => 0,
            })
            .sum()
    }
}

impl DataSource for FakeDataSource {
    fn open(&mut self, spec: &DataSpec) -> Result<Option<u64>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let total = self.total_length();
        if spec.position >= total {
            return Err(CacheError::unsatisfiable(
                spec.cache_key(),
                spec.position,
                spec.length,
                Some(total),
            ));
        }
        self.position = spec.position;
        self.end = spec.end().map_or(total, |end| end.min(total));
        self.open = true;

        if self.simulate_unknown_length && spec.length.is_none() {
            Ok(None)
        } else {
            Ok(Some(spec.length.unwrap_or(total - spec.position)))
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.open {
            return Err(CacheError::InvalidRequest(
                "fake source is not open".to_string(),
            ));
        }

        let mut offset = 0u64;
        for (index, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Error(message) => {
                    if offset == self.position && self.fired.insert(index) {
                        return Err(CacheError::Upstream(io::Error::other(message.clone())));
                    }
                }
                Segment::Data(data) => {
                    let segment_end = offset + data.len() as u64;
                    if self.position >= offset && self.position < segment_end {
                        if self.position >= self.end {
                            return Ok(0);
                        }
                        let start = (self.position - offset) as usize;
                        let available = (segment_end.min(self.end) - self.position) as usize;
                        let n = buf.len().min(available);
                        buf[..n].copy_from_slice(&data[start..start + n]);
                        self.position += n as u64;
                        return Ok(n);
                    }
                    offset = segment_end;
                }
            }
        }
        Ok(0)
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}

/// Read `source` until it reports the end of the requested range.
pub fn read_to_end(source: &mut CacheDataSource) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0u8; 4];
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

/// Assert that `cache` holds no spans, in memory or on disk.
pub fn assert_cache_empty(cache: &SimpleCache) {
    assert!(cache.keys().is_empty(), "cache has keys {:?}", cache.keys());
    assert_eq!(cache.cache_space(), 0);
    let span_files = std::fs::read_dir(cache.cache_dir())
        .map(|entries| {
            entries
                .filter_map(|entry| entry.ok())
                .filter(|entry| has_suffix(&entry.path(), SPAN_SUFFIX))
                .count()
        })
        .unwrap_or(0);
    assert_eq!(span_files, 0, "span files left in {:?}", cache.cache_dir());
}

// Re-export the macro
pub use crate::init_test_tracing;
