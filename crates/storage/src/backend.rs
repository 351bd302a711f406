//! The local storage interface the quorum layer writes through.

use crate::engine::StorageError;
use crate::record::Record;
use ringkv_common::Timestamp;

/// A node-local store of timestamped versions.
///
/// Implementations keep at most one visible version per key: a write older
/// than the version already stored is acknowledged but has no effect, so
/// replays and late replica writes cannot roll a key back.
///
/// All methods block. Async callers go through `spawn_blocking`.
pub trait Storage: Send + Sync + 'static {
    /// The stored version for `key`: a value, a tombstone, or `None` when
    /// the key has never been written (or its tombstone has been purged).
    fn get(&self, key: &[u8]) -> Result<Option<Record>, StorageError>;

    fn put(&self, key: &[u8], value: &[u8], timestamp: Timestamp) -> Result<(), StorageError>;

    fn delete(&self, key: &[u8], timestamp: Timestamp) -> Result<(), StorageError>;

    /// Flush buffered state and reject further operations with
    /// [`StorageError::Closed`]. Closing twice is a no-op.
    fn close(&self) -> Result<(), StorageError>;

    /// Store a record as-is, dispatching on whether it is a tombstone.
    fn apply(&self, record: &Record) -> Result<(), StorageError> {
        match &record.value {
            Some(value) => self.put(&record.key, value, record.timestamp),
            None => self.delete(&record.key, record.timestamp),
        }
    }
}
