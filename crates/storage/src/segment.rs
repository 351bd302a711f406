//! Immutable sorted segments.
//!
//! A segment is a pair of files sharing a generation number: `{gen}.seg`
//! holds framed records sorted by key, `{gen}.idx` holds one framed
//! [`IndexEntry`] per record. The index is loaded into memory on open and
//! searched by binary search, so a point lookup costs one seek and one read.
//!
//! Segments are never modified after they are written. Readers open their
//! own file handle per call, so lookups need no lock. A segment replaced by
//! compaction is marked obsolete and its files are removed when the last
//! `Arc<Segment>` is dropped.

use crate::codec;
use crate::engine::StorageError;
use crate::record::Record;
use ringkv_common::Timestamp;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Location and version of one record inside a segment's data file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: Vec<u8>,
    pub timestamp: Timestamp,
    pub offset: u64,
    pub len: u64,
}

pub fn data_path(dir: &Path, gen: u64) -> PathBuf {
    dir.join(format!("{:06}.seg", gen))
}

pub fn index_path(dir: &Path, gen: u64) -> PathBuf {
    dir.join(format!("{:06}.idx", gen))
}

/// Parse the generation out of a segment or index file name.
pub fn parse_gen(file_name: &str) -> Option<u64> {
    file_name
        .strip_suffix(".seg")
        .or_else(|| file_name.strip_suffix(".idx"))
        .and_then(|stem| stem.parse().ok())
}

#[derive(Debug)]
pub struct Segment {
    gen: u64,
    data_path: PathBuf,
    index_path: PathBuf,
    index: Vec<IndexEntry>,
    obsolete: AtomicBool,
}

impl Segment {
    /// Write `records` as generation `gen`. Records must be sorted by key
    /// with no duplicates, which is how the memtable and the compaction
    /// merge produce them.
    pub fn write<'a, I>(dir: &Path, gen: u64, records: I) -> Result<Self, StorageError>
    where
        I: IntoIterator<Item = &'a Record>,
    {
        let data_path = data_path(dir, gen);
        let index_path = index_path(dir, gen);

        let mut data = BufWriter::new(File::create(&data_path)?);
        let mut idx = BufWriter::new(File::create(&index_path)?);
        let mut index: Vec<IndexEntry> = Vec::new();
        let mut offset = 0u64;

        for record in records {
            debug_assert!(
                index.last().map_or(true, |prev| prev.key < record.key),
                "segment records must be strictly sorted"
            );
            let frame = codec::encode_frame(record)?;
            data.write_all(&frame)?;

            let entry = IndexEntry {
                key: record.key.clone(),
                timestamp: record.timestamp,
                offset,
                len: frame.len() as u64,
            };
            idx.write_all(&codec::encode_frame(&entry)?)?;
            offset += frame.len() as u64;
            index.push(entry);
        }

        data.flush()?;
        data.get_ref().sync_all()?;
        idx.flush()?;
        idx.get_ref().sync_all()?;

        tracing::debug!(gen, keys = index.len(), bytes = offset, "segment written");

        Ok(Self {
            gen,
            data_path,
            index_path,
            index,
            obsolete: AtomicBool::new(false),
        })
    }

    /// Open an existing segment and load its index.
    pub fn open(dir: &Path, gen: u64) -> Result<Self, StorageError> {
        let data_path = data_path(dir, gen);
        let index_path = index_path(dir, gen);

        let mut reader = BufReader::new(File::open(&index_path)?);
        let mut index: Vec<IndexEntry> = Vec::new();
        while let Some(entry) = codec::read_frame::<_, IndexEntry>(&mut reader)? {
            if let Some(prev) = index.last() {
                if prev.key >= entry.key {
                    return Err(StorageError::Corrupt(format!(
                        "segment {} index out of order at key {}",
                        gen,
                        hex::encode(&entry.key)
                    )));
                }
            }
            index.push(entry);
        }

        let data_len = fs::metadata(&data_path)?.len();
        if let Some(last) = index.last() {
            if last.offset + last.len > data_len {
                return Err(StorageError::Corrupt(format!(
                    "segment {} data file shorter than its index ({} < {})",
                    gen,
                    data_len,
                    last.offset + last.len
                )));
            }
        }

        Ok(Self {
            gen,
            data_path,
            index_path,
            index,
            obsolete: AtomicBool::new(false),
        })
    }

    pub fn gen(&self) -> u64 {
        self.gen
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Index entry for `key`, if the segment holds it.
    pub fn find(&self, key: &[u8]) -> Option<&IndexEntry> {
        self.index
            .binary_search_by(|entry| entry.key.as_slice().cmp(key))
            .ok()
            .map(|i| &self.index[i])
    }

    /// Point lookup. Tombstones are returned as records.
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>, StorageError> {
        match self.find(key) {
            Some(entry) => self.read(entry).map(Some),
            None => Ok(None),
        }
    }

    /// Read the record an index entry points at.
    pub fn read(&self, entry: &IndexEntry) -> Result<Record, StorageError> {
        let mut file = File::open(&self.data_path)?;
        self.read_at(&mut file, entry)
    }

    fn read_at(&self, file: &mut File, entry: &IndexEntry) -> Result<Record, StorageError> {
        file.seek(SeekFrom::Start(entry.offset))?;
        let mut buf = vec![0u8; entry.len as usize];
        file.read_exact(&mut buf)?;
        let record: Record = codec::decode_frame(&buf)?;
        if record.key != entry.key {
            return Err(StorageError::Corrupt(format!(
                "segment {} offset {} holds key {}, index says {}",
                self.gen,
                entry.offset,
                hex::encode(&record.key),
                hex::encode(&entry.key)
            )));
        }
        Ok(record)
    }

    /// Records with `start <= key < end` (unbounded when `end` is `None`),
    /// tombstones included, in key order.
    pub fn scan(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<Record>, StorageError> {
        let first = self
            .index
            .partition_point(|entry| entry.key.as_slice() < start);
        let entries: Vec<&IndexEntry> = self.index[first..]
            .iter()
            .take_while(|entry| end.map_or(true, |end| entry.key.as_slice() < end))
            .collect();
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.data_path)?;
        entries
            .into_iter()
            .map(|entry| self.read_at(&mut file, entry))
            .collect()
    }

    /// Every record, read sequentially.
    pub fn records(&self) -> Result<Vec<Record>, StorageError> {
        let mut reader = BufReader::new(File::open(&self.data_path)?);
        let mut records = Vec::with_capacity(self.index.len());
        while let Some(record) = codec::read_frame::<_, Record>(&mut reader)? {
            records.push(record);
        }
        if records.len() != self.index.len() {
            return Err(StorageError::Corrupt(format!(
                "segment {} has {} records but {} index entries",
                self.gen,
                records.len(),
                self.index.len()
            )));
        }
        Ok(records)
    }

    /// Schedule the files for removal once no reader holds this segment.
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if !self.obsolete.load(Ordering::Acquire) {
            return;
        }
        for path in [&self.data_path, &self.index_path] {
            if let Err(e) = fs::remove_file(path) {
                tracing::warn!("failed to remove obsolete segment file {:?}: {}", path, e);
            }
        }
        tracing::debug!(gen = self.gen, "obsolete segment removed");
    }
}
