use std::io;

/// Errors raised by the cache store, the cache writer and the read router.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(
        "Range not satisfiable for key '{key}': position {position}, length {length:?}, content length {content_length:?}"
    )]
    UnsatisfiableRange {
        key: String,
        position: u64,
        length: Option<u64>,
        content_length: Option<u64>,
    },

    #[error("Inconsistent content length for key '{key}': recorded {recorded}, observed {observed}")]
    InconsistentLength {
        key: String,
        recorded: u64,
        observed: u64,
    },

    #[error("Write sequencing error: {0}")]
    WriteSequencing(String),

    #[error("Upstream error: {0}")]
    Upstream(#[source] io::Error),

    #[error("Range of key '{key}' starting at {position} is locked by another writer")]
    LockContention { key: String, position: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),
}

impl CacheError {
    pub(crate) fn unsatisfiable(
        key: &str,
        position: u64,
        length: Option<u64>,
        content_length: Option<u64>,
    ) -> Self {
        CacheError::UnsatisfiableRange {
            key: key.to_string(),
            position,
            length,
            content_length,
        }
    }

    /// Whether this error originated in the local cache rather than upstream.
    pub fn is_cache_error(&self) -> bool {
        matches!(
            self,
            CacheError::Io(_)
                | CacheError::Metadata(_)
                | CacheError::WriteSequencing(_)
                | CacheError::InconsistentLength { .. }
        )
    }

    /// Whether this is upstream's way of saying the requested range lies past the end.
    pub fn is_unsatisfiable_range(&self) -> bool {
        matches!(self, CacheError::UnsatisfiableRange { .. })
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
