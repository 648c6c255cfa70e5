//! The append-only segment log file.
//!
//! A log record is encoded as:
//!
//! - Key length as little-endian u32.
//! - Value length as little-endian u32.
//! - Key as raw bytes.
//! - Value as raw bytes.
//!
//! There is no padding, checksum, or type tag between records.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Length of the two size prefixes that precede every record.
const HEADER_LEN: u64 = 8;

/// Formats a segment id as its 16-digit zero-padded filename.
pub fn segment_filename(id: u32) -> String {
    format!("{id:016}")
}

/// Whether a segment with the given write cursor counts as full. Factored
/// out of [`LogFile::is_full`] as a pure function so the boundary condition
/// can be tested directly.
fn cursor_is_full(cursor: u64, max_size: u64) -> bool {
    cursor >= max_size
}

/// One append-only segment, identified by its segment id.
///
/// Reads are positional (`pread`-style) and never contend with the write
/// cursor or with each other; only `write_item` mutates on-disk state, and
/// the engine is responsible for serializing calls to it.
#[derive(Debug)]
pub struct LogFile {
    id: u32,
    path: PathBuf,
    file: File,
    write_cursor: AtomicU64,
    max_size: u64,
}

impl LogFile {
    /// Opens the segment `id` in `dir`, creating it if it does not exist.
    /// The write cursor starts at zero; callers that are replaying an
    /// existing segment must call [`LogFile::set_write_cursor`] afterward.
    pub fn open_or_create(dir: &Path, id: u32, max_size: u64) -> Result<Self> {
        let path = dir.join(segment_filename(id));
        let file =
            OpenOptions::new().read(true).write(true).create(true).truncate(false).open(&path)?;
        Ok(Self { id, path, file, write_cursor: AtomicU64::new(0), max_size })
    }

    /// The segment id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Path to the segment file on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current write cursor, i.e. the offset the next `write_item` will
    /// write at.
    pub fn write_cursor(&self) -> u64 {
        self.write_cursor.load(Ordering::Acquire)
    }

    /// Sets the write cursor. Used by the engine after replaying the
    /// segment at open.
    pub fn set_write_cursor(&self, pos: u64) {
        self.write_cursor.store(pos, Ordering::Release);
    }

    /// Whether the write cursor has reached or passed `max_size`. A soft
    /// bound: callers check this *before* writing, not after, so a single
    /// write may push the cursor past `max_size`.
    pub fn is_full(&self) -> bool {
        cursor_is_full(self.write_cursor.load(Ordering::Acquire), self.max_size)
    }

    /// Appends `key`/`value` at the current write cursor and fsyncs before
    /// returning. Returns `(item_offset, value_offset)`. On failure the
    /// write cursor is left untouched, since it is only advanced after the
    /// write and sync both succeed.
    pub fn write_item(&self, key: &[u8], value: &[u8]) -> Result<(u64, u64)> {
        let item_offset = self.write_cursor.load(Ordering::Acquire);
        let value_offset = item_offset + HEADER_LEN + key.len() as u64;

        let mut buf = Vec::with_capacity((HEADER_LEN as usize) + key.len() + value.len());
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);

        self.file.write_all_at(&buf, item_offset)?;
        self.file.sync_all()?;

        self.write_cursor.store(item_offset + buf.len() as u64, Ordering::Release);
        Ok((item_offset, value_offset))
    }

    /// Reads exactly `value_size` bytes from `value_offset`. Loops on
    /// partial reads (rather than `read_exact_at`) so a short file reports
    /// how many bytes it actually had, not just that it had too few.
    pub fn read_value(&self, value_offset: u64, value_size: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; value_size as usize];
        let mut read = 0usize;
        while read < buf.len() {
            match self.file.read_at(&mut buf[read..], value_offset + read as u64) {
                Ok(0) => break,
                Ok(n) => read += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::Io(err)),
            }
        }
        if read < buf.len() {
            return Err(Error::ShortRead { expected: buf.len(), actual: read });
        }
        Ok(buf)
    }

    /// Reads a whole record at `item_offset`, returning
    /// `(key, value, item_offset, value_offset)`.
    pub fn read_item(&self, item_offset: u64) -> Result<(Vec<u8>, Vec<u8>, u64, u64)> {
        let mut len_buf = [0u8; 4];
        self.file.read_exact_at(&mut len_buf, item_offset)?;
        let key_len = u32::from_le_bytes(len_buf);

        self.file.read_exact_at(&mut len_buf, item_offset + 4)?;
        let value_len = u32::from_le_bytes(len_buf);

        let mut key = vec![0u8; key_len as usize];
        self.file.read_exact_at(&mut key, item_offset + HEADER_LEN)?;

        let value_offset = item_offset + HEADER_LEN + key_len as u64;
        let mut value = vec![0u8; value_len as usize];
        self.file.read_exact_at(&mut value, value_offset)?;

        Ok((key, value, item_offset, value_offset))
    }

    /// Returns a lazy, single-pass iterator over every record in the
    /// segment, starting at offset 0, reading through an independently
    /// positioned clone of the file handle.
    pub fn iterate(&self) -> Result<LogIterator> {
        Ok(LogIterator { file: self.file.try_clone()?, offset: 0, finished: false })
    }
}

/// One record yielded by [`LogIterator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub item_offset: u64,
    pub value_offset: u64,
}

/// A lazy, single-pass, forward iterator over the records of a segment.
///
/// Terminates silently (yields `None`) at the first short read — a torn
/// tail left by a crash mid-write is "not yet committed" and is dropped
/// rather than reported as an error. A genuine I/O error that is not an
/// end-of-file condition is surfaced once, as `Some(Err(..))`, before the
/// iterator stops.
pub struct LogIterator {
    file: File,
    offset: u64,
    finished: bool,
}

impl LogIterator {
    /// The offset of the first byte that did not parse as a complete
    /// record. The engine adopts this as the segment's write cursor after
    /// replay.
    pub fn final_offset(&self) -> u64 {
        self.offset
    }

    fn try_read_record(&self) -> std::io::Result<LogRecord> {
        let mut len_buf = [0u8; 4];
        self.file.read_exact_at(&mut len_buf, self.offset)?;
        let key_len = u32::from_le_bytes(len_buf);

        self.file.read_exact_at(&mut len_buf, self.offset + 4)?;
        let value_len = u32::from_le_bytes(len_buf);

        let mut key = vec![0u8; key_len as usize];
        self.file.read_exact_at(&mut key, self.offset + HEADER_LEN)?;

        let value_offset = self.offset + HEADER_LEN + key_len as u64;
        let mut value = vec![0u8; value_len as usize];
        self.file.read_exact_at(&mut value, value_offset)?;

        Ok(LogRecord { key, value, item_offset: self.offset, value_offset })
    }
}

impl Iterator for LogIterator {
    type Item = Result<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.try_read_record() {
            Ok(record) => {
                self.offset = record.value_offset + record.value.len() as u64;
                Some(Ok(record))
            }
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err.into()))
            }
        }
    }
}
