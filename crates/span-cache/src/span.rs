//! # Cache Spans
//!
//! A span describes a contiguous byte range of one key. Spans returned by the
//! store are either cached (backed by a file) or holes describing a gap.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Extension of committed span files.
pub(crate) const SPAN_SUFFIX: &str = "span";
/// Extension of per-key metadata files.
pub(crate) const METADATA_SUFFIX: &str = "meta";
/// Extension of files that are still being written.
pub(crate) const TEMP_SUFFIX: &str = "tmp";

/// An immutable description of a byte range of a key.
#[derive(Debug, Clone)]
pub struct CacheSpan {
    /// Key of the resource this span belongs to
    pub key: String,
    /// Position of the first byte of the span
    pub position: u64,
    /// Length of the span, `None` for a hole extending to the end of the resource
    pub length: Option<u64>,
    /// Backing file, `None` for a hole
    pub file: Option<PathBuf>,
    /// Last access time in milliseconds since the Unix epoch
    pub last_access: u64,
}

impl CacheSpan {
    pub(crate) fn cached(key: &str, position: u64, length: u64, file: PathBuf) -> Self {
        Self {
            key: key.to_string(),
            position,
            length: Some(length),
            file: Some(file),
            last_access: now_millis(),
        }
    }

    pub(crate) fn hole(key: &str, position: u64, length: Option<u64>) -> Self {
        Self {
            key: key.to_string(),
            position,
            length,
            file: None,
            last_access: now_millis(),
        }
    }

    /// Whether the span is backed by a file.
    pub fn is_cached(&self) -> bool {
        self.file.is_some()
    }

    /// Whether the span extends to the (unknown) end of the resource.
    pub fn is_open_ended(&self) -> bool {
        self.length.is_none()
    }

    /// Exclusive end position, `None` when open ended.
    pub fn end(&self) -> Option<u64> {
        self.length.map(|length| self.position.saturating_add(length))
    }

    /// Whether `position` lies inside this span.
    pub fn contains(&self, position: u64) -> bool {
        position >= self.position && self.end().is_none_or(|end| position < end)
    }

    /// Length of a cached span, 0 for holes.
    pub fn cached_len(&self) -> u64 {
        if self.is_cached() {
            self.length.unwrap_or(0)
        } else {
            0
        }
    }

    pub(crate) fn touched(&self) -> Self {
        Self {
            last_access: now_millis(),
            ..self.clone()
        }
    }
}

impl PartialEq for CacheSpan {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.position == other.position
            && self.length == other.length
            && self.file == other.file
    }
}

impl Eq for CacheSpan {}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Encode a key so it can be used as part of a file name.
pub(crate) fn encode_key(key: &str) -> String {
    hex::encode(key.as_bytes())
}

fn decode_key(encoded: &str) -> Option<String> {
    let bytes = hex::decode(encoded).ok()?;
    String::from_utf8(bytes).ok()
}

/// `<hex(key)>.<position>.<length>.span`
pub(crate) fn span_file_name(key: &str, position: u64, length: u64) -> String {
    format!("{}.{position}.{length}.{SPAN_SUFFIX}", encode_key(key))
}

/// Parse a span file name back into `(key, position, length)`.
pub(crate) fn parse_span_file_name(name: &str) -> Option<(String, u64, u64)> {
    let mut parts = name.split('.');
    let key = decode_key(parts.next()?)?;
    let position: u64 = parts.next()?.parse().ok()?;
    let length: u64 = parts.next()?.parse().ok()?;
    position.checked_add(length)?;
    if parts.next()? != SPAN_SUFFIX || parts.next().is_some() {
        return None;
    }
    Some((key, position, length))
}

/// `<hex(key)>.meta`
pub(crate) fn metadata_file_name(key: &str) -> String {
    format!("{}.{METADATA_SUFFIX}", encode_key(key))
}

pub(crate) fn has_suffix(path: &Path, suffix: &str) -> bool {
    path.extension().is_some_and(|ext| ext == suffix)
}
