//! # Data Sources
//!
//! The minimal transport contract shared by upstream sources and by the
//! reader of local span files.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{CacheError, Result};

/// Describes a byte range of a resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSpec {
    /// Location of the resource, interpreted by the upstream source
    pub uri: String,
    /// Explicit cache key; the uri is used when absent
    pub key: Option<String>,
    /// Position of the first requested byte
    pub position: u64,
    /// Number of requested bytes, `None` to read until the end of the resource
    pub length: Option<u64>,
}

impl DataSpec {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            key: None,
            position: 0,
            length: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_position(mut self, position: u64) -> Self {
        self.position = position;
        self
    }

    pub fn with_length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    pub fn with_length_option(mut self, length: Option<u64>) -> Self {
        self.length = length;
        self
    }

    /// Key under which this resource is cached.
    pub fn cache_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.uri)
    }

    /// Exclusive end of the range, `None` when unbounded or overflowing.
    pub fn end(&self) -> Option<u64> {
        self.length
            .and_then(|length| self.position.checked_add(length))
    }

    /// A copy of this request covering `[position, position + length)`.
    pub fn subrange(&self, position: u64, length: Option<u64>) -> Self {
        Self {
            uri: self.uri.clone(),
            key: self.key.clone(),
            position,
            length,
        }
    }
}

/// A source of bytes that can be opened at a position.
///
/// `read` returns `Ok(0)` at the end of the opened range when given a
/// non-empty buffer. `open` fails with [`CacheError::UnsatisfiableRange`] when
/// the range starts past the end of a resource of known length.
pub trait DataSource: Send {
    /// Open `spec`, returning the number of bytes that can be read, if known.
    fn open(&mut self, spec: &DataSpec) -> Result<Option<u64>>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn close(&mut self) -> Result<()>;
}

/// Reads a range of a local file, the `uri` being its path.
#[derive(Debug, Default)]
pub struct FileDataSource {
    reader: Option<io::Take<BufReader<File>>>,
}

impl FileDataSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataSource for FileDataSource {
    fn open(&mut self, spec: &DataSpec) -> Result<Option<u64>> {
        let mut file = File::open(Path::new(&spec.uri))?;
        let file_len = file.metadata()?.len();
        if spec.position > file_len || spec.end().is_some_and(|end| end > file_len) {
            return Err(CacheError::unsatisfiable(
                &spec.uri,
                spec.position,
                spec.length,
                Some(file_len),
            ));
        }
        file.seek(SeekFrom::Start(spec.position))?;

        let length = spec.length.unwrap_or(file_len - spec.position);
        self.reader = Some(BufReader::new(file).take(length));
        Ok(Some(length))
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let Some(reader) = self.reader.as_mut() else {
            return Err(CacheError::InvalidRequest(
                "file source is not open".to_string(),
            ));
        };
        Ok(reader.read(buf)?)
    }

    fn close(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}
