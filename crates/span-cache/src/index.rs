//! # Span Index
//!
//! In-memory arena of committed spans, keyed by cache key and position.
//! The cache directory is authoritative: [`SpanIndex::load`] rebuilds the
//! whole index from the file names found on disk.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::ops::Bound::{Excluded, Unbounded};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CacheError, Result};
use crate::span::{
    CacheSpan, METADATA_SUFFIX, SPAN_SUFFIX, TEMP_SUFFIX, has_suffix, metadata_file_name,
    parse_span_file_name, span_file_name,
};

/// Contents of a `<hex(key)>.meta` file.
#[derive(Debug, Serialize, Deserialize)]
struct ContentMetadata {
    key: String,
    content_length: u64,
}

/// Everything known about a single key.
#[derive(Debug, Default)]
struct CachedContent {
    spans: BTreeMap<u64, CacheSpan>,
    content_length: Option<u64>,
}

impl CachedContent {
    fn span_containing(&self, position: u64) -> Option<&CacheSpan> {
        self.spans
            .range(..=position)
            .next_back()
            .map(|(_, span)| span)
            .filter(|span| span.contains(position))
    }

    fn next_span_start(&self, position: u64) -> Option<u64> {
        self.spans
            .range((Excluded(position), Unbounded))
            .next()
            .map(|(start, _)| *start)
    }

    fn overlaps(&self, position: u64, length: u64) -> bool {
        let Some(end) = position.checked_add(length) else {
            return true;
        };
        let before = self
            .spans
            .range(..=position)
            .next_back()
            .is_some_and(|(_, span)| span.end().is_some_and(|e| e > position));
        let after = self
            .spans
            .range(position..)
            .next()
            .is_some_and(|(start, _)| *start < end);
        before || after
    }

    fn max_end(&self) -> u64 {
        self.spans
            .values()
            .next_back()
            .and_then(|span| span.end())
            .unwrap_or(0)
    }

    fn is_empty(&self) -> bool {
        self.spans.is_empty() && self.content_length.is_none()
    }
}

#[derive(Debug)]
pub(crate) struct SpanIndex {
    root: PathBuf,
    contents: HashMap<String, CachedContent>,
    total_bytes: u64,
}

impl SpanIndex {
    /// Scan `root` and rebuild the index from the files found there.
    ///
    /// Leftover temporary files are deleted, as are span files whose size does not
    /// match their name, that overlap an already loaded span, or that extend past
    /// the recorded content length of their key.
    pub(crate) fn load(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;

        let mut index = Self {
            root: root.to_path_buf(),
            contents: HashMap::new(),
            total_bytes: 0,
        };

        let mut found_spans = Vec::new();
        for entry in fs::read_dir(root)? {
            let entry = entry?;
            let path = entry.path();
            if !entry.file_type()?.is_file() {
                continue;
            }

            if has_suffix(&path, TEMP_SUFFIX) {
                debug!(path = ?path, "Removing leftover temporary file");
                remove_file_best_effort(&path);
            } else if has_suffix(&path, METADATA_SUFFIX) {
                match read_metadata(&path) {
                    Ok(metadata) => {
                        index
                            .contents
                            .entry(metadata.key)
                            .or_default()
                            .content_length = Some(metadata.content_length);
                    }
                    Err(e) => {
                        warn!(path = ?path, error = %e, "Dropping unreadable metadata file");
                        remove_file_best_effort(&path);
                    }
                }
            } else if has_suffix(&path, SPAN_SUFFIX) {
                let parsed = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .and_then(parse_span_file_name);
                let Some((key, position, length)) = parsed else {
                    warn!(path = ?path, "Dropping span file with malformed name");
                    remove_file_best_effort(&path);
                    continue;
                };
                let metadata = entry.metadata()?;
                let last_access = metadata
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                found_spans.push((key, position, length, metadata.len(), last_access, path));
            }
        }

        found_spans.sort_by(|a, b| (&a.0, a.1).cmp(&(&b.0, b.1)));
        for (key, position, length, file_len, last_access, path) in found_spans {
            if length == 0 || file_len != length {
                warn!(path = ?path, length, file_len, "Dropping truncated span file");
                remove_file_best_effort(&path);
                continue;
            }

            let content = index.contents.entry(key.clone()).or_default();
            if content.overlaps(position, length) {
                warn!(path = ?path, key = %key, position, length, "Dropping overlapping span file");
                remove_file_best_effort(&path);
                continue;
            }
            if content
                .content_length
                .is_some_and(|content_length| position + length > content_length)
            {
                warn!(path = ?path, key = %key, position, length, "Dropping span past content length");
                remove_file_best_effort(&path);
                continue;
            }

            let mut span = CacheSpan::cached(&key, position, length, path);
            span.last_access = last_access;
            content.spans.insert(position, span);
            index.total_bytes += length;
        }

        debug!(
            root = ?index.root,
            keys = index.contents.len(),
            total_bytes = index.total_bytes,
            "Span index loaded"
        );
        Ok(index)
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .contents
            .iter()
            .filter(|(_, content)| !content.spans.is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub(crate) fn spans(&self, key: &str) -> Vec<CacheSpan> {
        self.contents
            .get(key)
            .map(|content| content.spans.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn all_spans(&self) -> Vec<CacheSpan> {
        self.contents
            .values()
            .flat_map(|content| content.spans.values().cloned())
            .collect()
    }

    /// The cached span containing `position`, or the hole starting there.
    ///
    /// A hole ends at the next cached span, or is open ended when none follows.
    pub(crate) fn lookup(&self, key: &str, position: u64) -> CacheSpan {
        let Some(content) = self.contents.get(key) else {
            return CacheSpan::hole(key, position, None);
        };
        if let Some(span) = content.span_containing(position) {
            return span.clone();
        }
        let length = content
            .next_span_start(position)
            .map(|start| start - position);
        CacheSpan::hole(key, position, length)
    }

    pub(crate) fn content_length(&self, key: &str) -> Option<u64> {
        self.contents.get(key).and_then(|c| c.content_length)
    }

    /// Record the content length of `key`, persisting it next to the spans.
    ///
    /// Returns `Ok(false)` when the same value was already recorded.
    pub(crate) fn set_content_length(&mut self, key: &str, value: u64) -> Result<bool> {
        let content = self.contents.entry(key.to_string()).or_default();
        match content.content_length {
            Some(recorded) if recorded == value => return Ok(false),
            Some(recorded) => {
                return Err(CacheError::InconsistentLength {
                    key: key.to_string(),
                    recorded,
                    observed: value,
                });
            }
            None => {}
        }
        let max_end = content.max_end();
        if max_end > value {
            return Err(CacheError::InconsistentLength {
                key: key.to_string(),
                recorded: max_end,
                observed: value,
            });
        }

        let metadata = ContentMetadata {
            key: key.to_string(),
            content_length: value,
        };
        let path = self.root.join(metadata_file_name(key));
        write_atomically(&path, &serde_json::to_vec(&metadata)?)?;

        content.content_length = Some(value);
        Ok(true)
    }

    /// Path a committed span of the given range is stored at.
    pub(crate) fn span_path(&self, key: &str, position: u64, length: u64) -> PathBuf {
        self.root.join(span_file_name(key, position, length))
    }

    /// Check that a span of the given range could be committed: it must not
    /// overlap an existing span or exceed the recorded content length.
    pub(crate) fn check_insert(&self, key: &str, position: u64, length: u64) -> Result<()> {
        let Some(content) = self.contents.get(key) else {
            return Ok(());
        };
        if content.overlaps(position, length) {
            return Err(CacheError::WriteSequencing(format!(
                "span [{position}, {}) of key '{key}' overlaps a committed span",
                position + length
            )));
        }
        if let Some(content_length) = content.content_length {
            if position + length > content_length {
                return Err(CacheError::InconsistentLength {
                    key: key.to_string(),
                    recorded: content_length,
                    observed: position + length,
                });
            }
        }
        Ok(())
    }

    /// Add a committed span.
    pub(crate) fn insert(&mut self, span: CacheSpan) -> Result<()> {
        let length = span.length.ok_or_else(|| {
            CacheError::WriteSequencing("cannot commit an open-ended span".to_string())
        })?;
        self.check_insert(&span.key, span.position, length)?;
        self.contents
            .entry(span.key.clone())
            .or_default()
            .spans
            .insert(span.position, span);
        self.total_bytes += length;
        Ok(())
    }

    /// Remove the span matching `span`. Returns the removed record.
    pub(crate) fn remove(&mut self, span: &CacheSpan) -> Option<CacheSpan> {
        let content = self.contents.get_mut(&span.key)?;
        if content.spans.get(&span.position) != Some(span) {
            return None;
        }
        let removed = content.spans.remove(&span.position)?;
        self.total_bytes -= removed.cached_len();
        if content.is_empty() {
            self.contents.remove(&span.key);
        }
        Some(removed)
    }

    /// Replace the stored record of `span` with a touched copy, returning the
    /// previous and the new record.
    pub(crate) fn touch(&mut self, span: &CacheSpan) -> Option<(CacheSpan, CacheSpan)> {
        let stored = self
            .contents
            .get_mut(&span.key)?
            .spans
            .get_mut(&span.position)
            .filter(|stored| **stored == *span)?;
        let touched = stored.touched();
        let old = std::mem::replace(stored, touched);
        Some((old, stored.clone()))
    }
}

fn read_metadata(path: &Path) -> Result<ContentMetadata> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Write `data` to a temporary file next to `path`, then rename it into place.
fn write_atomically(path: &Path, data: &[u8]) -> Result<()> {
    let temp_path = path.with_extension(TEMP_SUFFIX);
    if let Err(e) = fs::write(&temp_path, data) {
        warn!(path = ?temp_path, error = %e, "Failed to write metadata file");
        remove_file_best_effort(&temp_path);
        return Err(e.into());
    }
    if let Err(e) = fs::rename(&temp_path, path) {
        warn!(from = ?temp_path, to = ?path, error = %e, "Failed to rename metadata file");
        remove_file_best_effort(&temp_path);
        return Err(e.into());
    }
    Ok(())
}

pub(crate) fn remove_file_best_effort(path: &Path) {
    match fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            warn!(path = ?path, error = %e, "Failed to remove cache file");
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_span(root: &Path, key: &str, position: u64, data: &[u8]) -> PathBuf {
        let path = root.join(span_file_name(key, position, data.len() as u64));
        fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_load_rebuilds_spans_from_file_names() {
        let dir = tempdir().unwrap();
        write_span(dir.path(), "key 1", 0, &[0, 1, 2]);
        write_span(dir.path(), "key 1", 3, &[3, 4, 5]);
        write_span(dir.path(), "key 2", 8, &[8, 9]);

        let index = SpanIndex::load(dir.path()).unwrap();
        assert_eq!(index.keys(), vec!["key 1".to_string(), "key 2".to_string()]);
        assert_eq!(index.total_bytes(), 8);

        let spans = index.spans("key 1");
        assert_eq!(spans.len(), 2);
        assert_eq!((spans[0].position, spans[0].length), (0, Some(3)));
        assert_eq!((spans[1].position, spans[1].length), (3, Some(3)));
    }

    #[test]
    fn test_load_drops_inconsistent_files() {
        let dir = tempdir().unwrap();
        write_span(dir.path(), "k", 0, &[0, 1, 2]);
        // Overlaps [0, 3).
        let overlapping = write_span(dir.path(), "k", 2, &[2, 3]);
        // Name claims 5 bytes, file holds 2.
        let truncated = dir.path().join(span_file_name("k", 10, 5));
        fs::write(&truncated, [1, 2]).unwrap();
        let temp = dir.path().join("6b.0.99.tmp");
        fs::write(&temp, [0]).unwrap();
        fs::write(dir.path().join("unrelated.txt"), b"hello").unwrap();

        let index = SpanIndex::load(dir.path()).unwrap();
        assert_eq!(index.spans("k").len(), 1);
        assert!(!overlapping.exists());
        assert!(!truncated.exists());
        assert!(!temp.exists());
        assert!(dir.path().join("unrelated.txt").exists());
    }

    #[test]
    fn test_load_drops_span_name_ending_past_u64() {
        let dir = tempdir().unwrap();
        write_span(dir.path(), "k", 0, &[0, 1]);
        let huge = dir.path().join(span_file_name("k", u64::MAX, 1));
        fs::write(&huge, [7]).unwrap();

        let index = SpanIndex::load(dir.path()).unwrap();
        assert_eq!(index.spans("k").len(), 1);
        assert_eq!(index.total_bytes(), 2);
        assert!(!huge.exists());
    }

    #[test]
    fn test_content_length_persists_and_is_immutable() {
        let dir = tempdir().unwrap();
        {
            let mut index = SpanIndex::load(dir.path()).unwrap();
            assert!(index.set_content_length("k", 10).unwrap());
            assert!(!index.set_content_length("k", 10).unwrap());
            assert!(matches!(
                index.set_content_length("k", 11),
                Err(CacheError::InconsistentLength {
                    recorded: 10,
                    observed: 11,
                    ..
                })
            ));
        }

        let index = SpanIndex::load(dir.path()).unwrap();
        assert_eq!(index.content_length("k"), Some(10));
        assert_eq!(index.content_length("other"), None);
    }

    #[test]
    fn test_content_length_below_cached_data_is_rejected() {
        let dir = tempdir().unwrap();
        write_span(dir.path(), "k", 4, &[4, 5, 6]);
        let mut index = SpanIndex::load(dir.path()).unwrap();
        assert!(matches!(
            index.set_content_length("k", 6),
            Err(CacheError::InconsistentLength { .. })
        ));
        assert_eq!(index.content_length("k"), None);
    }

    #[test]
    fn test_lookup_returns_spans_and_holes() {
        let dir = tempdir().unwrap();
        write_span(dir.path(), "k", 3, &[3, 4, 5]);
        write_span(dir.path(), "k", 8, &[8, 9]);
        let index = SpanIndex::load(dir.path()).unwrap();

        let hole = index.lookup("k", 0);
        assert!(!hole.is_cached());
        assert_eq!((hole.position, hole.length), (0, Some(3)));

        let cached = index.lookup("k", 4);
        assert!(cached.is_cached());
        assert_eq!((cached.position, cached.length), (3, Some(3)));

        let gap = index.lookup("k", 6);
        assert_eq!((gap.position, gap.length), (6, Some(2)));

        let tail = index.lookup("k", 10);
        assert!(tail.is_open_ended());

        let unknown = index.lookup("missing", 5);
        assert_eq!((unknown.position, unknown.length), (5, None));
    }

    #[test]
    fn test_insert_rejects_overlap() {
        let dir = tempdir().unwrap();
        let mut index = SpanIndex::load(dir.path()).unwrap();
        let path = index.span_path("k", 2, 4);
        index
            .insert(CacheSpan::cached("k", 2, 4, path.clone()))
            .unwrap();

        for (position, length) in [(0, 3), (5, 2), (3, 1), (0, 10)] {
            let path = index.span_path("k", position, length);
            assert!(
                index
                    .insert(CacheSpan::cached("k", position, length, path))
                    .is_err(),
                "[{position}, +{length}) should overlap"
            );
        }

        let adjacent = index.span_path("k", 6, 1);
        index.insert(CacheSpan::cached("k", 6, 1, adjacent)).unwrap();
        assert_eq!(index.total_bytes(), 5);
    }

    #[test]
    fn test_remove_only_matching_span() {
        let dir = tempdir().unwrap();
        let path = write_span(dir.path(), "k", 0, &[1, 2]);
        let mut index = SpanIndex::load(dir.path()).unwrap();

        let stranger = CacheSpan::cached("k", 0, 1, path.clone());
        assert!(index.remove(&stranger).is_none());

        let span = CacheSpan::cached("k", 0, 2, path);
        assert!(index.remove(&span).is_some());
        assert_eq!(index.total_bytes(), 0);
        assert!(index.keys().is_empty());
    }
}
