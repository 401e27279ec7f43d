//! # Cache Evictors
//!
//! Eviction policies are notified by the store whenever spans are added,
//! removed or read, and may call back into the store to remove spans.
//! Notifications are delivered without any store lock held.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::span::CacheSpan;
use crate::store::SimpleCache;

/// A policy deciding which spans to delete under space pressure.
pub trait CacheEvictor: Send + Sync {
    /// Called after `span` was committed. `span` itself cannot be removed during this call.
    fn on_span_added(&self, cache: &SimpleCache, span: &CacheSpan);

    /// Called after `span` was removed from the cache.
    fn on_span_removed(&self, _cache: &SimpleCache, _span: &CacheSpan) {}

    /// Called when a cached span was handed out for reading.
    fn on_span_touched(&self, _cache: &SimpleCache, _old: &CacheSpan, _new: &CacheSpan) {}

    /// Called before a writer starts a file of at most `length` bytes.
    fn on_start_file(&self, _cache: &SimpleCache, _key: &str, _position: u64, _length: u64) {}
}

/// Evictor that never removes anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEvictor;

impl CacheEvictor for NoOpEvictor {
    fn on_span_added(&self, _cache: &SimpleCache, _span: &CacheSpan) {}
}

#[derive(Debug, Default)]
struct LruState {
    // (key, position) -> (last_access, length)
    entries: HashMap<(String, u64), (u64, u64)>,
    // (last_access, key, position)
    order: BTreeSet<(u64, String, u64)>,
    current_size: u64,
}

impl LruState {
    fn add(&mut self, span: &CacheSpan) {
        let length = span.cached_len();
        let previous = self
            .entries
            .insert((span.key.clone(), span.position), (span.last_access, length));
        if let Some((last_access, old_length)) = previous {
            self.order
                .remove(&(last_access, span.key.clone(), span.position));
            self.current_size -= old_length;
        }
        self.order
            .insert((span.last_access, span.key.clone(), span.position));
        self.current_size += length;
    }

    fn remove(&mut self, span: &CacheSpan) {
        let id = (span.key.clone(), span.position);
        if let Some((last_access, length)) = self.entries.remove(&id) {
            self.order.remove(&(last_access, id.0, id.1));
            self.current_size -= length;
        }
    }

    /// Move a tracked span to its new access time. Spans no longer tracked stay untracked.
    fn touch(&mut self, span: &CacheSpan) {
        let Some(entry) = self.entries.get_mut(&(span.key.clone(), span.position)) else {
            return;
        };
        let last_access = entry.0;
        if span.last_access <= last_access {
            return;
        }
        entry.0 = span.last_access;
        self.order
            .remove(&(last_access, span.key.clone(), span.position));
        self.order
            .insert((span.last_access, span.key.clone(), span.position));
    }
}

/// Evicts the least recently read spans once the cache grows past `max_bytes`.
#[derive(Debug)]
pub struct LeastRecentlyUsedEvictor {
    max_bytes: u64,
    state: Mutex<LruState>,
}

impl LeastRecentlyUsedEvictor {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            state: Mutex::new(LruState::default()),
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Bytes currently accounted for by this evictor.
    pub fn current_size(&self) -> u64 {
        self.state.lock().current_size
    }

    fn evict(&self, cache: &SimpleCache, required_space: u64) {
        let candidates: Vec<(u64, String, u64)> = {
            let state = self.state.lock();
            if state.current_size.saturating_add(required_space) <= self.max_bytes {
                return;
            }
            state.order.iter().cloned().collect()
        };

        for (_, key, position) in candidates {
            if self.state.lock().current_size.saturating_add(required_space) <= self.max_bytes {
                break;
            }
            let Some(span) = cache
                .spans_for(&key)
                .into_iter()
                .find(|span| span.position == position)
            else {
                continue;
            };
            match cache.remove_span(&span) {
                Ok(true) => debug!(key = %key, position, "Evicted span"),
                Ok(false) => trace!(key = %key, position, "Span is protected, skipping"),
                Err(e) => debug!(key = %key, position, error = %e, "Failed to evict span"),
            }
        }
    }
}

impl CacheEvictor for LeastRecentlyUsedEvictor {
    fn on_span_added(&self, cache: &SimpleCache, span: &CacheSpan) {
        self.state.lock().add(span);
        self.evict(cache, 0);
    }

    fn on_span_removed(&self, _cache: &SimpleCache, span: &CacheSpan) {
        self.state.lock().remove(span);
    }

    fn on_span_touched(&self, _cache: &SimpleCache, _old: &CacheSpan, new: &CacheSpan) {
        self.state.lock().touch(new);
    }

    fn on_start_file(&self, cache: &SimpleCache, _key: &str, _position: u64, length: u64) {
        self.evict(cache, length);
    }
}
