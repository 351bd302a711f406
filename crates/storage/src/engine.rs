//! Storage engine: WAL + memtable + immutable sorted segments.
//!
//! All writes go through the WAL first (for durability), then into the
//! memtable. When the memtable grows past its flush threshold it is written
//! out as a new segment, the MANIFEST is updated, and the WAL is reset.
//! Reads check the memtable, then segments from newest to oldest.
//!
//! Writers serialize on one mutex. The live segment list is an
//! `Arc<SegmentSet>` behind a read-write lock; readers clone the `Arc` and
//! release the lock before touching disk, and flush/compaction only take the
//! write lock to swap in a new list.

use crate::backend::Storage;
use crate::codec::CodecError;
use crate::compaction::{self, keep_newest};
use crate::manifest::{Manifest, MANIFEST_TMP_FILE};
use crate::memtable::Memtable;
use crate::record::Record;
use crate::segment::{self, Segment};
use crate::wal::{FsyncPolicy, Wal, WalError};
use parking_lot::{Mutex, RwLock};
use ringkv_common::Timestamp;
use ringkv_metrics::{metrics, start_storage_timer};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const WAL_FILE: &str = "wal.log";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("encoding error: {0}")]
    Codec(#[from] CodecError),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt storage: {0}")]
    Corrupt(String),
    #[error("storage is closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub fsync: FsyncPolicy,
    /// Flush the memtable once it holds roughly this many bytes.
    pub memtable_flush_bytes: usize,
    /// How long tombstones survive compaction.
    pub tombstone_grace: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            fsync: FsyncPolicy::Batch,
            memtable_flush_bytes: 4 * 1024 * 1024,
            tombstone_grace: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Point-in-time counters, see [`StorageEngine::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub memtable_keys: usize,
    pub memtable_bytes: usize,
    pub wal_entries: u64,
    pub segments: usize,
    pub segment_records: usize,
}

#[derive(Debug)]
struct WriteState {
    memtable: Memtable,
    wal: Wal,
}

/// Live segments, oldest data first.
#[derive(Debug, Default)]
struct SegmentSet {
    segments: Vec<Arc<Segment>>,
}

/// The storage engine. All operations are synchronous (blocking I/O).
/// The async boundary is at the caller (KV layer).
#[derive(Debug)]
pub struct StorageEngine {
    dir: PathBuf,
    options: EngineOptions,
    state: Mutex<WriteState>,
    segments: RwLock<Arc<SegmentSet>>,
    /// Serializes MANIFEST rewrites between flush and compaction.
    manifest_lock: Mutex<()>,
    compaction_lock: Mutex<()>,
    next_gen: AtomicU64,
    closed: AtomicBool,
}

impl StorageEngine {
    /// Open or create a storage engine at the given directory.
    pub fn open(data_dir: &Path, options: EngineOptions) -> Result<Self, StorageError> {
        fs::create_dir_all(data_dir)?;

        let manifest = Manifest::load(data_dir)?.unwrap_or_default();
        let live: HashSet<u64> = manifest.segments.iter().copied().collect();
        remove_orphans(data_dir, &live)?;

        let mut segments = Vec::with_capacity(manifest.segments.len());
        for &gen in &manifest.segments {
            segments.push(Arc::new(Segment::open(data_dir, gen)?));
        }
        let next_gen = manifest
            .segments
            .iter()
            .map(|gen| gen + 1)
            .max()
            .unwrap_or(1)
            .max(manifest.next_gen)
            .max(1);

        // Replay WAL to rebuild memtable
        let wal_path = data_dir.join(WAL_FILE);
        let mut memtable = Memtable::new();
        for record in Wal::recover(&wal_path)? {
            memtable.put(record);
        }
        let wal = Wal::open(&wal_path, options.fsync)?;

        tracing::info!(
            "storage engine opened at {:?}: {} segments, {} keys recovered from WAL",
            data_dir,
            segments.len(),
            memtable.len()
        );

        let engine = Self {
            dir: data_dir.to_path_buf(),
            options,
            state: Mutex::new(WriteState { memtable, wal }),
            segments: RwLock::new(Arc::new(SegmentSet { segments })),
            manifest_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            next_gen: AtomicU64::new(next_gen),
            closed: AtomicBool::new(false),
        };

        {
            let mut state = engine.state.lock();
            if state.memtable.size_bytes() >= engine.options.memtable_flush_bytes {
                engine.flush_locked(&mut state)?;
            }
        }

        Ok(engine)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn snapshot(&self) -> Arc<SegmentSet> {
        self.segments.read().clone()
    }

    /// Number of live segments.
    pub fn segment_count(&self) -> usize {
        self.snapshot().segments.len()
    }

    /// The visible version for `key`, tombstones included.
    pub fn get(&self, key: &[u8]) -> Result<Option<Record>, StorageError> {
        {
            let state = self.state.lock();
            self.ensure_open()?;
            if let Some(record) = state.memtable.get(key) {
                return Ok(Some(record.clone()));
            }
        }
        // Taken after the memtable miss: a concurrent flush publishes its
        // segment before clearing the memtable, so nothing falls in between.
        let snapshot = self.snapshot();
        for segment in snapshot.segments.iter().rev() {
            if let Some(record) = segment.get(key)? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    pub fn put(&self, key: &[u8], value: &[u8], timestamp: Timestamp) -> Result<(), StorageError> {
        self.write(Record::put(key.to_vec(), value.to_vec(), timestamp))
    }

    pub fn delete(&self, key: &[u8], timestamp: Timestamp) -> Result<(), StorageError> {
        self.write(Record::tombstone(key.to_vec(), timestamp))
    }

    fn write(&self, record: Record) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        self.ensure_open()?;

        if !self.supersedes_visible(&state.memtable, &record)? {
            tracing::debug!(
                key = %hex::encode(&record.key),
                ts = %record.timestamp,
                "ignoring write older than the stored version"
            );
            return Ok(());
        }

        state.wal.append(&record)?;
        state.memtable.put(record);

        if state.memtable.size_bytes() >= self.options.memtable_flush_bytes {
            // The write itself is durable in the WAL; a failed flush is
            // retried on the next write.
            if let Err(e) = self.flush_locked(&mut state) {
                tracing::warn!("memtable flush failed: {}", e);
            }
        }
        Ok(())
    }

    /// Whether `record` beats the version currently visible for its key.
    fn supersedes_visible(&self, memtable: &Memtable, record: &Record) -> Result<bool, StorageError> {
        if let Some(existing) = memtable.get(&record.key) {
            return Ok(record.supersedes(existing));
        }
        let snapshot = self.snapshot();
        for segment in snapshot.segments.iter().rev() {
            if let Some(entry) = segment.find(&record.key) {
                if entry.timestamp != record.timestamp {
                    return Ok(record.timestamp > entry.timestamp);
                }
                let existing = segment.read(entry)?;
                return Ok(record.supersedes(&existing));
            }
        }
        Ok(true)
    }

    /// Live records with `start <= key < end` (unbounded when `end` is
    /// `None`), in key order. Tombstoned keys are omitted.
    pub fn scan(&self, start: &[u8], end: Option<&[u8]>) -> Result<Vec<Record>, StorageError> {
        let recent: Vec<Record> = {
            let state = self.state.lock();
            self.ensure_open()?;
            state.memtable.range(start, end).cloned().collect()
        };

        let mut merged = BTreeMap::new();
        let snapshot = self.snapshot();
        for segment in &snapshot.segments {
            for record in segment.scan(start, end)? {
                keep_newest(&mut merged, record);
            }
        }
        for record in recent {
            keep_newest(&mut merged, record);
        }

        Ok(merged
            .into_values()
            .filter(|record| !record.is_tombstone())
            .collect())
    }

    /// Write the memtable out as a segment now.
    pub fn flush(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        self.ensure_open()?;
        self.flush_locked(&mut state)
    }

    fn flush_locked(&self, state: &mut WriteState) -> Result<(), StorageError> {
        if state.memtable.is_empty() {
            return Ok(());
        }
        let _timer = start_storage_timer("flush");

        let gen = self.next_gen.fetch_add(1, Ordering::SeqCst);
        let segment = Arc::new(Segment::write(&self.dir, gen, state.memtable.iter())?);

        let added = segment.clone();
        if let Err(e) = self.publish(move |current| {
            let mut next = current.to_vec();
            next.push(added);
            next
        }) {
            segment.mark_obsolete();
            return Err(e);
        }

        // Only cleared after the segment is visible to readers.
        let keys = state.memtable.len();
        state.memtable.clear();
        state.wal.reset()?;

        metrics().storage_flushes.inc();
        tracing::info!(gen, keys, "memtable flushed to segment");
        Ok(())
    }

    /// Install a new segment list and persist it in the MANIFEST.
    fn publish<F>(&self, update: F) -> Result<(), StorageError>
    where
        F: FnOnce(&[Arc<Segment>]) -> Vec<Arc<Segment>>,
    {
        let _guard = self.manifest_lock.lock();
        let current = self.snapshot();
        let next = update(&current.segments);

        Manifest {
            segments: next.iter().map(|s| s.gen()).collect(),
            next_gen: self.next_gen.load(Ordering::SeqCst),
        }
        .store(&self.dir)?;

        *self.segments.write() = Arc::new(SegmentSet { segments: next });
        Ok(())
    }

    /// Merge every live segment into one, purging expired tombstones.
    ///
    /// Returns `false` when there was nothing to compact. Writes and reads
    /// proceed while the merge runs.
    pub fn compact(&self) -> Result<bool, StorageError> {
        let _guard = self.compaction_lock.lock();
        self.ensure_open()?;

        let inputs = self.snapshot();
        if inputs.segments.is_empty() {
            return Ok(false);
        }
        let _timer = start_storage_timer("compaction");

        let merged = compaction::merge_segments(
            &inputs.segments,
            Timestamp::wall_clock(),
            self.options.tombstone_grace,
        )?;
        let output = if merged.is_empty() {
            None
        } else {
            let gen = self.next_gen.fetch_add(1, Ordering::SeqCst);
            Some(Arc::new(Segment::write(&self.dir, gen, &merged)?))
        };

        let input_gens: HashSet<u64> = inputs.segments.iter().map(|s| s.gen()).collect();
        let replacement = output.clone();
        // Segments flushed during the merge hold newer data than any input,
        // so the merged run goes first.
        if let Err(e) = self.publish(|current| {
            replacement
                .into_iter()
                .chain(
                    current
                        .iter()
                        .filter(|s| !input_gens.contains(&s.gen()))
                        .cloned(),
                )
                .collect()
        }) {
            if let Some(output) = &output {
                output.mark_obsolete();
            }
            return Err(e);
        }

        for segment in &inputs.segments {
            segment.mark_obsolete();
        }

        metrics().storage_compactions.inc();
        tracing::info!(
            inputs = inputs.segments.len(),
            records = merged.len(),
            output = ?output.as_ref().map(|s| s.gen()),
            "compaction finished"
        );
        Ok(true)
    }

    /// Sync the WAL to disk (for batch fsync mode).
    pub fn sync(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        self.ensure_open()?;
        state.wal.sync()?;
        Ok(())
    }

    pub fn stats(&self) -> EngineStats {
        let (memtable_keys, memtable_bytes, wal_entries) = {
            let state = self.state.lock();
            (
                state.memtable.len(),
                state.memtable.size_bytes(),
                state.wal.entries_written(),
            )
        };
        let snapshot = self.snapshot();
        EngineStats {
            memtable_keys,
            memtable_bytes,
            wal_entries,
            segments: snapshot.segments.len(),
            segment_records: snapshot.segments.iter().map(|s| s.len()).sum(),
        }
    }

    /// Flush the memtable, sync, and refuse further operations.
    pub fn close(&self) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if self.is_closed() {
            return Ok(());
        }
        self.flush_locked(&mut state)?;
        state.wal.sync()?;
        self.closed.store(true, Ordering::Release);
        tracing::info!("storage engine at {:?} closed", self.dir);
        Ok(())
    }
}

impl Storage for StorageEngine {
    fn get(&self, key: &[u8]) -> Result<Option<Record>, StorageError> {
        StorageEngine::get(self, key)
    }

    fn put(&self, key: &[u8], value: &[u8], timestamp: Timestamp) -> Result<(), StorageError> {
        StorageEngine::put(self, key, value, timestamp)
    }

    fn delete(&self, key: &[u8], timestamp: Timestamp) -> Result<(), StorageError> {
        StorageEngine::delete(self, key, timestamp)
    }

    fn close(&self) -> Result<(), StorageError> {
        StorageEngine::close(self)
    }
}

/// Delete segment files the MANIFEST does not list, plus any stale
/// temporary manifest.
fn remove_orphans(dir: &Path, live: &HashSet<u64>) -> Result<(), StorageError> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let orphan = match segment::parse_gen(name) {
            Some(gen) => !live.contains(&gen),
            None => name == MANIFEST_TMP_FILE,
        };
        if orphan {
            tracing::warn!("removing orphaned storage file {:?}", path);
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ts(n: u64) -> Timestamp {
        Timestamp::from_nanos(n)
    }

    fn small_memtable() -> EngineOptions {
        EngineOptions {
            fsync: FsyncPolicy::None,
            memtable_flush_bytes: 256,
            ..EngineOptions::default()
        }
    }

    fn value_of(engine: &StorageEngine, key: &[u8]) -> Option<Vec<u8>> {
        engine.get(key).unwrap().and_then(|r| r.value)
    }

    #[test]
    fn test_engine_put_get() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), EngineOptions::default()).unwrap();

        engine.put(b"k1", b"v1", ts(1)).unwrap();
        let record = engine.get(b"k1").unwrap().unwrap();
        assert_eq!(record.value.as_deref(), Some(&b"v1"[..]));
        assert_eq!(record.timestamp, ts(1));
        assert!(engine.get(b"missing").unwrap().is_none());
    }

    #[test]
    fn test_engine_crash_recovery() {
        let dir = TempDir::new().unwrap();

        {
            let engine = StorageEngine::open(
                dir.path(),
                EngineOptions {
                    fsync: FsyncPolicy::Always,
                    ..EngineOptions::default()
                },
            )
            .unwrap();
            engine.put(b"k1", b"v1", ts(1)).unwrap();
            engine.put(b"k2", b"v2", ts(2)).unwrap();
            engine.delete(b"k2", ts(3)).unwrap();
            assert_eq!(engine.stats().memtable_keys, 2);
        }
        // Engine dropped without close (simulating crash)

        let engine = StorageEngine::open(dir.path(), EngineOptions::default()).unwrap();
        assert_eq!(value_of(&engine, b"k1"), Some(b"v1".to_vec()));
        assert!(engine.get(b"k2").unwrap().unwrap().is_tombstone());
    }

    #[test]
    fn test_engine_older_write_is_noop() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), EngineOptions::default()).unwrap();

        engine.put(b"k", b"new", ts(10)).unwrap();
        engine.put(b"k", b"old", ts(5)).unwrap();
        engine.delete(b"k", ts(6)).unwrap();
        assert_eq!(value_of(&engine, b"k"), Some(b"new".to_vec()));
        assert_eq!(engine.stats().wal_entries, 1);
    }

    #[test]
    fn test_engine_older_write_ignored_after_flush() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), EngineOptions::default()).unwrap();

        engine.put(b"k", b"new", ts(10)).unwrap();
        engine.flush().unwrap();
        engine.put(b"k", b"old", ts(5)).unwrap();
        assert_eq!(value_of(&engine, b"k"), Some(b"new".to_vec()));

        // Same timestamp: the tombstone wins the tie.
        engine.delete(b"k", ts(10)).unwrap();
        assert!(engine.get(b"k").unwrap().unwrap().is_tombstone());
    }

    #[test]
    fn test_engine_flush_creates_segment_and_resets_wal() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), EngineOptions::default()).unwrap();

        engine.put(b"a", b"1", ts(1)).unwrap();
        engine.put(b"b", b"2", ts(2)).unwrap();
        engine.flush().unwrap();

        let stats = engine.stats();
        assert_eq!(stats.segments, 1);
        assert_eq!(stats.segment_records, 2);
        assert_eq!(stats.memtable_keys, 0);
        assert_eq!(stats.wal_entries, 0);
        assert_eq!(fs::metadata(dir.path().join(WAL_FILE)).unwrap().len(), 0);
        assert_eq!(value_of(&engine, b"a"), Some(b"1".to_vec()));
    }

    #[test]
    fn test_engine_auto_flush_on_threshold() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), small_memtable()).unwrap();

        for i in 0..20u64 {
            let key = format!("key-{:02}", i);
            engine.put(key.as_bytes(), &[b'x'; 40], ts(i + 1)).unwrap();
        }
        assert!(engine.segment_count() >= 2);
        for i in 0..20u64 {
            let key = format!("key-{:02}", i);
            assert_eq!(value_of(&engine, key.as_bytes()), Some(vec![b'x'; 40]));
        }
    }

    #[test]
    fn test_engine_newest_segment_wins() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), EngineOptions::default()).unwrap();

        engine.put(b"k", b"v1", ts(1)).unwrap();
        engine.flush().unwrap();
        engine.put(b"k", b"v2", ts(2)).unwrap();
        engine.flush().unwrap();
        assert_eq!(engine.segment_count(), 2);
        assert_eq!(value_of(&engine, b"k"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_engine_reopen_after_close_keeps_segments() {
        let dir = TempDir::new().unwrap();
        {
            let engine = StorageEngine::open(dir.path(), EngineOptions::default()).unwrap();
            engine.put(b"k1", b"v1", ts(1)).unwrap();
            engine.flush().unwrap();
            engine.put(b"k2", b"v2", ts(2)).unwrap();
            engine.close().unwrap();
        }

        let engine = StorageEngine::open(dir.path(), EngineOptions::default()).unwrap();
        assert_eq!(engine.segment_count(), 2);
        assert_eq!(engine.stats().memtable_keys, 0);
        assert_eq!(value_of(&engine, b"k1"), Some(b"v1".to_vec()));
        assert_eq!(value_of(&engine, b"k2"), Some(b"v2".to_vec()));

        // New generations never collide with recovered ones.
        engine.put(b"k3", b"v3", ts(3)).unwrap();
        engine.flush().unwrap();
        assert_eq!(engine.segment_count(), 3);
    }

    #[test]
    fn test_engine_closed_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), EngineOptions::default()).unwrap();
        engine.put(b"k", b"v", ts(1)).unwrap();
        engine.close().unwrap();
        engine.close().unwrap();

        assert!(engine.is_closed());
        assert!(matches!(engine.get(b"k"), Err(StorageError::Closed)));
        assert!(matches!(
            engine.put(b"k", b"v", ts(2)),
            Err(StorageError::Closed)
        ));
        assert!(matches!(engine.delete(b"k", ts(2)), Err(StorageError::Closed)));
        assert!(matches!(engine.compact(), Err(StorageError::Closed)));
    }

    #[test]
    fn test_engine_compaction_merges_segments() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), EngineOptions::default()).unwrap();
        // Recent timestamps, so the tombstone is inside its grace period.
        let now = Timestamp::wall_clock().as_nanos();

        engine.put(b"a", b"1", ts(now + 1)).unwrap();
        engine.put(b"b", b"1", ts(now + 1)).unwrap();
        engine.flush().unwrap();
        engine.put(b"b", b"2", ts(now + 2)).unwrap();
        engine.delete(b"a", ts(now + 3)).unwrap();
        engine.flush().unwrap();
        engine.put(b"c", b"3", ts(now + 4)).unwrap();
        engine.flush().unwrap();
        let old_gens: Vec<u64> = engine.snapshot().segments.iter().map(|s| s.gen()).collect();

        assert!(engine.compact().unwrap());
        assert_eq!(engine.segment_count(), 1);
        assert_eq!(value_of(&engine, b"b"), Some(b"2".to_vec()));
        assert_eq!(value_of(&engine, b"c"), Some(b"3".to_vec()));
        assert!(engine.get(b"a").unwrap().unwrap().is_tombstone());

        for gen in old_gens {
            assert!(!segment::data_path(dir.path(), gen).exists());
        }
    }

    #[test]
    fn test_engine_compaction_purges_expired_tombstones() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(
            dir.path(),
            EngineOptions {
                tombstone_grace: Duration::ZERO,
                ..EngineOptions::default()
            },
        )
        .unwrap();

        engine.put(b"gone", b"v", ts(1)).unwrap();
        engine.flush().unwrap();
        engine.delete(b"gone", ts(2)).unwrap();
        engine.flush().unwrap();

        assert!(engine.compact().unwrap());
        assert!(engine.get(b"gone").unwrap().is_none());
        assert_eq!(engine.segment_count(), 0);
    }

    #[test]
    fn test_engine_compaction_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let engine = StorageEngine::open(dir.path(), EngineOptions::default()).unwrap();
            for i in 0..3u64 {
                engine.put(b"k", format!("v{}", i).as_bytes(), ts(i + 1)).unwrap();
                engine.flush().unwrap();
            }
            engine.compact().unwrap();
            engine.close().unwrap();
        }

        let engine = StorageEngine::open(dir.path(), EngineOptions::default()).unwrap();
        assert_eq!(engine.segment_count(), 1);
        assert_eq!(value_of(&engine, b"k"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_engine_compact_without_segments() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), EngineOptions::default()).unwrap();
        assert!(!engine.compact().unwrap());
    }

    #[test]
    fn test_engine_orphan_files_removed_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let engine = StorageEngine::open(dir.path(), EngineOptions::default()).unwrap();
            engine.put(b"k", b"v", ts(1)).unwrap();
            engine.close().unwrap();
        }
        // Leftovers of an interrupted flush
        fs::write(segment::data_path(dir.path(), 99), b"partial").unwrap();
        fs::write(segment::index_path(dir.path(), 99), b"partial").unwrap();
        fs::write(dir.path().join(MANIFEST_TMP_FILE), b"partial").unwrap();

        let engine = StorageEngine::open(dir.path(), EngineOptions::default()).unwrap();
        assert!(!segment::data_path(dir.path(), 99).exists());
        assert!(!segment::index_path(dir.path(), 99).exists());
        assert!(!dir.path().join(MANIFEST_TMP_FILE).exists());
        assert_eq!(value_of(&engine, b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_engine_scan() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), EngineOptions::default()).unwrap();

        engine.put(b"a:1", b"old", ts(1)).unwrap();
        engine.put(b"a:2", b"v2", ts(2)).unwrap();
        engine.put(b"b:1", b"v3", ts(3)).unwrap();
        engine.flush().unwrap();
        engine.put(b"a:1", b"new", ts(4)).unwrap();
        engine.delete(b"a:2", ts(5)).unwrap();
        engine.put(b"a:3", b"v6", ts(6)).unwrap();

        let found: Vec<(Vec<u8>, Vec<u8>)> = engine
            .scan(b"a:", Some(b"a;"))
            .unwrap()
            .into_iter()
            .map(|r| (r.key, r.value.unwrap()))
            .collect();
        assert_eq!(
            found,
            vec![
                (b"a:1".to_vec(), b"new".to_vec()),
                (b"a:3".to_vec(), b"v6".to_vec()),
            ]
        );
        assert_eq!(engine.scan(b"", None).unwrap().len(), 3);
    }

    #[test]
    fn test_engine_scan_reversed_or_empty_range() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), EngineOptions::default()).unwrap();

        engine.put(b"a", b"1", ts(1)).unwrap();
        engine.flush().unwrap();
        engine.put(b"z", b"2", ts(2)).unwrap();

        assert!(engine.scan(b"z", Some(b"a")).unwrap().is_empty());
        assert!(engine.scan(b"a", Some(b"a")).unwrap().is_empty());
        assert_eq!(engine.scan(b"a", Some(b"b")).unwrap().len(), 1);
    }

    #[test]
    fn test_engine_recovers_past_torn_wal_tail() {
        let dir = TempDir::new().unwrap();
        let durable = EngineOptions {
            fsync: FsyncPolicy::Always,
            ..EngineOptions::default()
        };

        {
            let engine = StorageEngine::open(dir.path(), durable.clone()).unwrap();
            engine.put(b"k1", b"v1", ts(1)).unwrap();
        }
        {
            use std::io::Write;
            let mut wal = fs::OpenOptions::new()
                .append(true)
                .open(dir.path().join(WAL_FILE))
                .unwrap();
            wal.write_all(&[1, 2, 3, 4, 5]).unwrap();
        }

        // Crash again after a write acknowledged on top of the torn tail
        {
            let engine = StorageEngine::open(dir.path(), durable.clone()).unwrap();
            assert_eq!(value_of(&engine, b"k1"), Some(b"v1".to_vec()));
            engine.put(b"k2", b"v2", ts(2)).unwrap();
        }

        let engine = StorageEngine::open(dir.path(), durable).unwrap();
        assert_eq!(value_of(&engine, b"k1"), Some(b"v1".to_vec()));
        assert_eq!(value_of(&engine, b"k2"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_engine_concurrent_readers_and_writers() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(StorageEngine::open(dir.path(), small_memtable()).unwrap());

        let writers: Vec<_> = (0..4u64)
            .map(|w| {
                let engine = engine.clone();
                std::thread::spawn(move || {
                    for i in 0..50u64 {
                        let key = format!("w{}-{}", w, i);
                        engine.put(key.as_bytes(), b"value", ts(w * 1000 + i + 1)).unwrap();
                    }
                })
            })
            .collect();
        let compactor = {
            let engine = engine.clone();
            std::thread::spawn(move || {
                for _ in 0..10 {
                    engine.compact().unwrap();
                }
            })
        };

        for h in writers {
            h.join().unwrap();
        }
        compactor.join().unwrap();

        for w in 0..4u64 {
            for i in 0..50u64 {
                let key = format!("w{}-{}", w, i);
                assert_eq!(value_of(&engine, key.as_bytes()), Some(b"value".to_vec()));
            }
        }
    }

    #[test]
    fn test_storage_trait_dispatch() {
        let dir = TempDir::new().unwrap();
        let engine = StorageEngine::open(dir.path(), EngineOptions::default()).unwrap();
        let store: &dyn Storage = &engine;

        store
            .apply(&Record::put(b"k".to_vec(), b"v".to_vec(), ts(1)))
            .unwrap();
        store.delete(b"k", ts(2)).unwrap();
        assert!(store.get(b"k").unwrap().unwrap().is_tombstone());
    }

    #[tokio::test]
    async fn test_compaction_task_compacts_in_background() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(StorageEngine::open(dir.path(), EngineOptions::default()).unwrap());
        for i in 0..3u64 {
            engine.put(b"k", format!("v{}", i).as_bytes(), ts(i + 1)).unwrap();
            engine.flush().unwrap();
        }

        let handle =
            compaction::spawn_compaction_task(engine.clone(), Duration::from_millis(20), 2);
        let mut compacted = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if engine.segment_count() == 1 {
                compacted = true;
                break;
            }
        }
        assert!(compacted, "background task should have compacted");

        engine.close().unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("task exits after close")
            .unwrap();
    }
}
