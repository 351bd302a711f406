//! Write-Ahead Log (WAL) for durability.
//!
//! Entries use the frame format from [`crate::codec`]. On recovery, all valid
//! entries are replayed; a torn or corrupt tail ends the replay and is cut
//! off before the log is reopened for appends.

use crate::codec::{self, CodecError};
use crate::record::Record;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Seek, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WAL encoding error: {0}")]
    Codec(#[from] CodecError),
}

/// Fsync policy for the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Fsync after every write.
    Always,
    /// Fsync periodically (caller controls).
    Batch,
    /// Never explicitly fsync (OS decides).
    None,
}

impl FsyncPolicy {
    pub fn from_str_config(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "always" => Self::Always,
            "none" => Self::None,
            _ => Self::Batch,
        }
    }
}

/// An append-only write-ahead log.
#[derive(Debug)]
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    fsync: FsyncPolicy,
    entries_written: u64,
}

impl Wal {
    /// Open or create a WAL file at the given path.
    pub fn open(path: &Path, fsync: FsyncPolicy) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            fsync,
            entries_written: 0,
        })
    }

    /// Append a record to the WAL.
    pub fn append(&mut self, record: &Record) -> Result<(), WalError> {
        let frame = codec::encode_frame(record)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;

        if self.fsync == FsyncPolicy::Always {
            self.writer.get_ref().sync_all()?;
        }

        self.entries_written += 1;
        Ok(())
    }

    /// Explicitly fsync the WAL (for batch mode).
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Discard every entry. Called once the memtable contents are durable
    /// in a published segment.
    pub fn reset(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        let file = self.writer.get_ref();
        file.set_len(0)?;
        if self.fsync != FsyncPolicy::None {
            file.sync_all()?;
        }
        tracing::debug!(path = ?self.path, entries = self.entries_written, "WAL reset");
        self.entries_written = 0;
        Ok(())
    }

    /// Number of entries written since open or the last reset.
    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }

    /// Replay all valid entries from a WAL file.
    /// Returns the records in order. Stops at the first corrupt entry.
    pub fn replay(path: &Path) -> Result<Vec<Record>, WalError> {
        Ok(read_valid_prefix(path)?.0)
    }

    /// Replay like [`Wal::replay`], then truncate the file to its last good
    /// frame so later appends are not stranded behind a bad tail.
    pub fn recover(path: &Path) -> Result<Vec<Record>, WalError> {
        let (records, valid_len) = read_valid_prefix(path)?;
        let file = match OpenOptions::new().write(true).open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(records),
            Err(e) => return Err(WalError::Io(e)),
        };
        let file_len = file.metadata()?.len();
        if file_len > valid_len {
            tracing::warn!(
                path = ?path,
                "truncating WAL from {} to {} bytes after {} valid entries",
                file_len,
                valid_len,
                records.len()
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }
        Ok(records)
    }
}

/// Records up to the first unreadable frame, and the byte length they span.
fn read_valid_prefix(path: &Path) -> Result<(Vec<Record>, u64), WalError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((vec![], 0)),
        Err(e) => return Err(WalError::Io(e)),
    };

    let mut reader = BufReader::new(file);
    let mut records = Vec::new();
    let mut valid_len = 0;

    loop {
        match codec::read_frame::<_, Record>(&mut reader) {
            Ok(Some(record)) => {
                records.push(record);
                valid_len = reader.stream_position()?;
            }
            Ok(None) => break,
            Err(CodecError::Io(e)) => return Err(WalError::Io(e)),
            Err(e) => {
                tracing::warn!(
                    "WAL entry {} unreadable ({}); stopping replay",
                    records.len(),
                    e
                );
                break;
            }
        }
    }

    Ok((records, valid_len))
}
