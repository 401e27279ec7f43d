//! # Cache Sink
//!
//! [`CacheDataSink`] turns a contiguous byte stream into span files. Each file
//! is capped at the configured maximum span size; a full file is committed to
//! the store immediately and the next byte starts a new one.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use tracing::{debug, trace};

use crate::error::{CacheError, Result};
use crate::index::remove_file_best_effort;
use crate::store::{SimpleCache, SpanLock};
use crate::upstream::DataSpec;

struct SpanFile {
    path: PathBuf,
    writer: BufWriter<File>,
    position: u64,
    written: u64,
}

impl SpanFile {
    fn flush(&mut self, sync: bool) -> Result<()> {
        self.writer.flush()?;
        if sync {
            self.writer.get_ref().sync_all()?;
        }
        Ok(())
    }
}

struct WriteSession {
    lock: SpanLock,
    next_position: u64,
    end: Option<u64>,
    file: Option<SpanFile>,
    bytes_committed: u64,
}

impl WriteSession {
    /// Commit the current file, if any. On failure the file is discarded.
    fn commit_file(&mut self, sync: bool) -> Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };
        if let Err(e) = file.flush(sync) {
            drop(file.writer);
            remove_file_best_effort(&file.path);
            return Err(e);
        }
        drop(file.writer);

        let committed =
            self.lock
                .cache()
                .commit_file(&self.lock, &file.path, file.position, file.written)?;
        if committed.is_some() {
            self.bytes_committed += file.written;
        }
        Ok(())
    }

    fn discard_file(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file.writer);
            remove_file_best_effort(&file.path);
        }
    }
}

/// Writes data into the cache as a series of span files.
pub struct CacheDataSink {
    cache: SimpleCache,
    max_span_size: u64,
    buffer_size: usize,
    sync_on_commit: bool,
    session: Option<WriteSession>,
}

impl CacheDataSink {
    /// Create a sink writing spans of at most `max_span_size` bytes (0 = unlimited).
    pub fn new(cache: SimpleCache, max_span_size: u64) -> Self {
        let config = cache.config();
        let buffer_size = config.write_buffer_size.max(1);
        let sync_on_commit = config.sync_on_commit;
        Self {
            cache,
            max_span_size: if max_span_size == 0 {
                u64::MAX
            } else {
                max_span_size
            },
            buffer_size,
            sync_on_commit,
            session: None,
        }
    }

    /// Create a sink using the span size configured for `cache`.
    pub fn from_config(cache: SimpleCache) -> Self {
        let max_span_size = cache.config().max_span_size;
        Self::new(cache, max_span_size)
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    pub fn cache(&self) -> &SimpleCache {
        &self.cache
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Start writing `spec` into the range held by `lock`.
    ///
    /// The session ends at whichever comes first of the end of `spec` and the
    /// end of the locked range. The lock is released when the session closes.
    pub fn open(&mut self, lock: SpanLock, spec: &DataSpec) -> Result<()> {
        if self.session.is_some() {
            return Err(CacheError::WriteSequencing(
                "cache sink is already open".to_string(),
            ));
        }
        if spec.cache_key() != lock.key() || spec.position != lock.position() {
            return Err(CacheError::WriteSequencing(format!(
                "request for '{}' at {} does not match lock on '{}' at {}",
                spec.cache_key(),
                spec.position,
                lock.key(),
                lock.position()
            )));
        }

        let end = match (lock.end(), spec.end()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        trace!(key = %lock.key(), position = spec.position, end = ?end, "Cache sink opened");
        self.session = Some(WriteSession {
            next_position: spec.position,
            end,
            file: None,
            bytes_committed: 0,
            lock,
        });
        Ok(())
    }

    /// Append `data`, which must start exactly where the previous write ended.
    pub fn write(&mut self, position: u64, data: &[u8]) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Err(CacheError::WriteSequencing(
                "cache sink is not open".to_string(),
            ));
        };
        if position != session.next_position {
            return Err(CacheError::WriteSequencing(format!(
                "write at {position} but next expected position is {}",
                session.next_position
            )));
        }
        let write_end = position.checked_add(data.len() as u64);
        if let Some(end) = session.end {
            if write_end.is_none_or(|write_end| write_end > end) {
                return Err(CacheError::WriteSequencing(format!(
                    "write of {} bytes at {position} runs past the end of the session at {end}",
                    data.len()
                )));
            }
        }

        let mut remaining = data;
        while !remaining.is_empty() {
            if session.file.is_none() {
                let max_length = match session.end {
                    Some(end) => self.max_span_size.min(end - session.next_position),
                    None => self.max_span_size,
                };
                let path = self.cache.start_file(
                    &session.lock,
                    session.next_position,
                    (max_length != u64::MAX).then_some(max_length),
                )?;
                let file = File::create(&path)?;
                session.file = Some(SpanFile {
                    path,
                    writer: BufWriter::with_capacity(self.buffer_size, file),
                    position: session.next_position,
                    written: 0,
                });
            }

            let Some(file) = session.file.as_mut() else {
                break;
            };
            let room = self.max_span_size - file.written;
            let chunk = remaining.len().min(room.min(usize::MAX as u64) as usize);
            file.writer.write_all(&remaining[..chunk])?;
            file.written += chunk as u64;
            session.next_position += chunk as u64;
            remaining = &remaining[chunk..];

            if file.written == self.max_span_size {
                session.commit_file(self.sync_on_commit)?;
            }
        }
        Ok(())
    }

    /// Commit whatever was written and release the lock.
    pub fn close(&mut self) -> Result<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        let result = session.commit_file(self.sync_on_commit);
        debug!(
            key = %session.lock.key(),
            position = session.lock.position(),
            bytes = session.bytes_committed,
            "Cache sink closed"
        );
        result
    }

    /// Discard the span being written and release the lock.
    ///
    /// Spans that were already completed stay committed.
    pub fn abort(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.discard_file();
            debug!(
                key = %session.lock.key(),
                position = session.next_position,
                "Cache sink aborted"
            );
        }
    }
}

impl Drop for CacheDataSink {
    fn drop(&mut self) {
        self.abort();
    }
}
