//! # Cache Store
//!
//! [`SimpleCache`] owns the span index and coordinates concurrent sessions:
//! readers look spans up without locking, writers acquire an exclusive lock on
//! the byte range they are about to fill and commit span files into it.
//!
//! Blocking lock requests are served in arrival order: a waiter never takes a
//! range overlapping the request of an earlier waiter for the same key.

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::config::CacheConfig;
use crate::error::{CacheError, Result};
use crate::evictor::CacheEvictor;
use crate::index::{SpanIndex, remove_file_best_effort};
use crate::span::{CacheSpan, TEMP_SUFFIX, encode_key};

/// Outcome of asking the store for the data at a position.
#[derive(Debug)]
pub enum SpanLookup {
    /// The position is cached; read it from the span's file.
    Cached(CacheSpan),
    /// The position is not cached; the caller holds the write lock for the hole.
    Hole(SpanLock),
}

/// Exclusive right to write spans into a byte range of a key.
///
/// The lock is released when dropped.
pub struct SpanLock {
    cache: SimpleCache,
    id: u64,
    hole: CacheSpan,
}

impl SpanLock {
    /// The locked range, described as a hole.
    pub fn span(&self) -> &CacheSpan {
        &self.hole
    }

    pub fn key(&self) -> &str {
        &self.hole.key
    }

    pub fn position(&self) -> u64 {
        self.hole.position
    }

    /// Length of the locked range, `None` when it is open ended.
    pub fn length(&self) -> Option<u64> {
        self.hole.length
    }

    /// Exclusive end of the locked range, `None` when it is open ended.
    pub fn end(&self) -> Option<u64> {
        self.hole.end()
    }

    pub fn cache(&self) -> &SimpleCache {
        &self.cache
    }
}

impl fmt::Debug for SpanLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanLock")
            .field("id", &self.id)
            .field("key", &self.hole.key)
            .field("position", &self.hole.position)
            .field("length", &self.hole.length)
            .finish()
    }
}

impl Drop for SpanLock {
    fn drop(&mut self) {
        self.cache.release(self.id);
    }
}

#[derive(Debug)]
struct LockedRange {
    id: u64,
    key: String,
    position: u64,
    end: Option<u64>,
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    key: String,
    position: u64,
    end: Option<u64>,
}

fn ranges_overlap(a_start: u64, a_end: Option<u64>, b_start: u64, b_end: Option<u64>) -> bool {
    a_end.is_none_or(|end| b_start < end) && b_end.is_none_or(|end| a_start < end)
}

enum Resolution {
    Cached(CacheSpan),
    Free(CacheSpan),
    Locked,
}

#[derive(Debug)]
struct CacheState {
    index: SpanIndex,
    locks: Vec<LockedRange>,
    waiters: VecDeque<Waiter>,
}

impl CacheState {
    fn resolve(&self, key: &str, position: u64, max_length: Option<u64>) -> Resolution {
        let span = self.index.lookup(key, position);
        if span.is_cached() {
            return Resolution::Cached(span);
        }

        let mut end = span.end();
        for lock in self.locks.iter().filter(|lock| lock.key == key) {
            if lock.position <= position && lock.end.is_none_or(|e| position < e) {
                return Resolution::Locked;
            }
            if lock.position > position {
                end = Some(end.map_or(lock.position, |e| e.min(lock.position)));
            }
        }
        if let Some(max_length) = max_length {
            let limit = position.saturating_add(max_length);
            end = Some(end.map_or(limit, |e| e.min(limit)));
        }
        Resolution::Free(CacheSpan::hole(key, position, end.map(|e| e - position)))
    }

    fn earlier_waiter_conflicts(&self, ticket: u64, hole: &CacheSpan) -> bool {
        self.waiters
            .iter()
            .take_while(|waiter| waiter.ticket < ticket)
            .any(|waiter| {
                waiter.key == hole.key
                    && ranges_overlap(waiter.position, waiter.end, hole.position, hole.end())
            })
    }

    fn holds(&self, id: u64) -> Option<&LockedRange> {
        self.locks.iter().find(|lock| lock.id == id)
    }
}

struct CacheInner {
    config: CacheConfig,
    state: Mutex<CacheState>,
    lock_released: Condvar,
    evictor: Box<dyn CacheEvictor>,
    next_id: AtomicU64,
}

/// A span cache stored in a single directory.
///
/// Cloning is cheap; all clones share the same index.
#[derive(Clone)]
pub struct SimpleCache {
    inner: Arc<CacheInner>,
}

impl fmt::Debug for SimpleCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SimpleCache")
            .field("cache_dir", &self.inner.config.cache_dir)
            .finish_non_exhaustive()
    }
}

impl SimpleCache {
    /// Open the cache at `config.cache_dir`, rebuilding the index from the directory.
    ///
    /// Every span found on disk is reported to `evictor`.
    pub fn open(config: CacheConfig, evictor: impl CacheEvictor + 'static) -> Result<Self> {
        let index = SpanIndex::load(&config.cache_dir)?;
        let existing = index.all_spans();

        let cache = Self {
            inner: Arc::new(CacheInner {
                config,
                state: Mutex::new(CacheState {
                    index,
                    locks: Vec::new(),
                    waiters: VecDeque::new(),
                }),
                lock_released: Condvar::new(),
                evictor: Box::new(evictor),
                next_id: AtomicU64::new(1),
            }),
        };

        for span in &existing {
            cache.inner.evictor.on_span_added(&cache, span);
        }

        debug!(config = %cache.inner.config, spans = existing.len(), "Cache opened");
        Ok(cache)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn cache_dir(&self) -> &Path {
        &self.inner.config.cache_dir
    }

    /// Keys that have at least one cached span.
    pub fn keys(&self) -> Vec<String> {
        self.inner.state.lock().index.keys()
    }

    /// Snapshot of the committed spans of `key`, ordered by position.
    pub fn spans_for(&self, key: &str) -> Vec<CacheSpan> {
        self.inner.state.lock().index.spans(key)
    }

    /// Total number of cached bytes over all keys.
    pub fn cache_space(&self) -> u64 {
        self.inner.state.lock().index.total_bytes()
    }

    pub fn content_length(&self, key: &str) -> Option<u64> {
        self.inner.state.lock().index.content_length(key)
    }

    /// Record the total length of `key`.
    ///
    /// Fails with [`CacheError::InconsistentLength`] if a different length was
    /// recorded before, or if cached data already extends past `value`.
    pub fn set_content_length(&self, key: &str, value: u64) -> Result<()> {
        let changed = self.inner.state.lock().index.set_content_length(key, value)?;
        if changed {
            debug!(key = %key, content_length = value, "Recorded content length");
        }
        Ok(())
    }

    /// Number of contiguous cached bytes of `key` starting at `position`,
    /// looking at most `length` bytes ahead.
    pub fn cached_bytes(&self, key: &str, position: u64, length: Option<u64>) -> u64 {
        let state = self.inner.state.lock();
        let end = length.map(|length| position.saturating_add(length));
        let mut current = position;
        while end.is_none_or(|end| current < end) {
            let span = state.index.lookup(key, current);
            match span.end() {
                Some(span_end) if span.is_cached() => current = span_end,
                _ => break,
            }
        }
        end.map_or(current, |end| current.min(end)) - position
    }

    /// Whether `[position, position + length)` of `key` is fully cached.
    pub fn is_cached(&self, key: &str, position: u64, length: u64) -> bool {
        self.cached_bytes(key, position, Some(length)) == length
    }

    /// The cached span containing `position`, or the hole starting there.
    ///
    /// Takes no lock; use it when the caller never writes.
    pub fn lookup(&self, key: &str, position: u64) -> CacheSpan {
        let span = self.inner.state.lock().index.lookup(key, position);
        if span.is_cached() {
            self.touch(&span)
        } else {
            span
        }
    }

    /// Return the cached span containing `position`, or lock the hole starting there,
    /// waiting for other writers of that range to finish first.
    ///
    /// The hole is bounded by the next cached span, the next locked range, and
    /// `max_length`.
    pub fn start_read_write(
        &self,
        key: &str,
        position: u64,
        max_length: Option<u64>,
    ) -> Result<SpanLookup> {
        let mut state = self.inner.state.lock();
        let ticket = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        state.waiters.push_back(Waiter {
            ticket,
            key: key.to_string(),
            position,
            end: max_length.map(|length| position.saturating_add(length)),
        });

        let resolved = loop {
            match state.resolve(key, position, max_length) {
                Resolution::Cached(span) => break Ok(span),
                Resolution::Free(hole) if !state.earlier_waiter_conflicts(ticket, &hole) => {
                    break Err(hole);
                }
                _ => {
                    trace!(key = %key, position, ticket, "Waiting for locked range");
                    self.inner.lock_released.wait(&mut state);
                }
            }
        };

        state.waiters.retain(|waiter| waiter.ticket != ticket);
        let outcome = match resolved {
            Ok(span) => {
                drop(state);
                SpanLookup::Cached(self.touch(&span))
            }
            Err(hole) => {
                let lock = self.acquire(&mut state, hole);
                drop(state);
                SpanLookup::Hole(lock)
            }
        };
        // Our departure from the queue may unblock later waiters.
        self.inner.lock_released.notify_all();
        Ok(outcome)
    }

    /// Like [`start_read_write`](Self::start_read_write), but fails with
    /// [`CacheError::LockContention`] instead of waiting.
    pub fn try_start_read_write(
        &self,
        key: &str,
        position: u64,
        max_length: Option<u64>,
    ) -> Result<SpanLookup> {
        let mut state = self.inner.state.lock();
        match state.resolve(key, position, max_length) {
            Resolution::Cached(span) => {
                drop(state);
                Ok(SpanLookup::Cached(self.touch(&span)))
            }
            Resolution::Free(hole) if !state.earlier_waiter_conflicts(u64::MAX, &hole) => {
                Ok(SpanLookup::Hole(self.acquire(&mut state, hole)))
            }
            _ => Err(CacheError::LockContention {
                key: key.to_string(),
                position,
            }),
        }
    }

    fn acquire(&self, state: &mut CacheState, hole: CacheSpan) -> SpanLock {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        state.locks.push(LockedRange {
            id,
            key: hole.key.clone(),
            position: hole.position,
            end: hole.end(),
        });
        trace!(key = %hole.key, position = hole.position, length = ?hole.length, id, "Locked range");
        SpanLock {
            cache: self.clone(),
            id,
            hole,
        }
    }

    fn release(&self, id: u64) {
        let mut state = self.inner.state.lock();
        state.locks.retain(|lock| lock.id != id);
        drop(state);
        trace!(id, "Released range");
        self.inner.lock_released.notify_all();
    }

    fn touch(&self, span: &CacheSpan) -> CacheSpan {
        let touched = self.inner.state.lock().index.touch(span);
        match touched {
            Some((old, new)) => {
                self.inner.evictor.on_span_touched(self, &old, &new);
                new
            }
            None => span.clone(),
        }
    }

    /// Allocate a temporary file for writing data at `position` under `lock`.
    ///
    /// `max_length` is the largest number of bytes the writer expects to put in it.
    pub fn start_file(
        &self,
        lock: &SpanLock,
        position: u64,
        max_length: Option<u64>,
    ) -> Result<PathBuf> {
        self.check_lock(lock, position, 0)?;
        self.inner
            .evictor
            .on_start_file(self, lock.key(), position, max_length.unwrap_or(0));

        fs::create_dir_all(self.cache_dir())?;
        let unique = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!(
            "{}.{position}.{}-{unique}.{TEMP_SUFFIX}",
            encode_key(lock.key()),
            std::process::id()
        );
        Ok(self.cache_dir().join(name))
    }

    fn check_lock(&self, lock: &SpanLock, position: u64, length: u64) -> Result<()> {
        let state = self.inner.state.lock();
        let Some(held) = state.holds(lock.id) else {
            return Err(CacheError::WriteSequencing(format!(
                "lock {} on key '{}' is no longer held",
                lock.id,
                lock.key()
            )));
        };
        let end = position.checked_add(length);
        if position < held.position || !held.end.is_none_or(|e| end.is_some_and(|end| end <= e)) {
            return Err(CacheError::WriteSequencing(format!(
                "range [{position}, +{length}) is outside the locked range [{}, {:?}) of key '{}'",
                held.position,
                held.end,
                lock.key()
            )));
        }
        Ok(())
    }

    /// Publish the fully written file at `temp_path` as the span
    /// `[position, position + length)` of the lock's key.
    ///
    /// The span becomes visible atomically. Empty files are discarded and
    /// `Ok(None)` is returned. The evictor is notified once the span is visible;
    /// the span stays inside the caller's lock, so it cannot be evicted
    /// during that notification.
    pub fn commit_file(
        &self,
        lock: &SpanLock,
        temp_path: &Path,
        position: u64,
        length: u64,
    ) -> Result<Option<CacheSpan>> {
        if length == 0 {
            remove_file_best_effort(temp_path);
            return Ok(None);
        }

        let file_len = fs::metadata(temp_path)?.len();
        if file_len != length {
            remove_file_best_effort(temp_path);
            return Err(CacheError::WriteSequencing(format!(
                "span file {} holds {file_len} bytes, expected {length}",
                temp_path.display()
            )));
        }
        if let Err(e) = self.check_lock(lock, position, length) {
            remove_file_best_effort(temp_path);
            return Err(e);
        }

        let span = {
            let mut state = self.inner.state.lock();
            let key = lock.key();
            if let Err(e) = state.index.check_insert(key, position, length) {
                remove_file_best_effort(temp_path);
                return Err(e);
            }
            let final_path = state.index.span_path(key, position, length);
            if let Err(e) = fs::rename(temp_path, &final_path) {
                warn!(from = ?temp_path, to = ?final_path, error = %e, "Failed to rename span file");
                remove_file_best_effort(temp_path);
                return Err(e.into());
            }
            let span = CacheSpan::cached(key, position, length, final_path);
            state.index.insert(span.clone())?;
            span
        };

        debug!(key = %span.key, position, length, "Committed span");
        self.inner.evictor.on_span_added(self, &span);
        Ok(Some(span))
    }

    /// Remove a committed span and delete its file.
    ///
    /// Returns `Ok(false)` when the span is unknown or lies inside a locked range.
    pub fn remove_span(&self, span: &CacheSpan) -> Result<bool> {
        let removed = {
            let mut state = self.inner.state.lock();
            let locked = state.locks.iter().any(|lock| {
                lock.key == span.key
                    && ranges_overlap(lock.position, lock.end, span.position, span.end())
            });
            if locked {
                return Ok(false);
            }
            let Some(removed) = state.index.remove(span) else {
                return Ok(false);
            };
            removed
        };

        if let Some(file) = &removed.file {
            match fs::remove_file(file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = ?file, error = %e, "Failed to delete evicted span file");
                    self.inner.evictor.on_span_removed(self, &removed);
                    return Err(e.into());
                }
            }
        }
        debug!(key = %removed.key, position = removed.position, "Removed span");
        self.inner.evictor.on_span_removed(self, &removed);
        Ok(true)
    }
}
