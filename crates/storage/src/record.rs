//! Storage record format.

use ringkv_common::Timestamp;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The atomic unit of storage: one version of one key.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Record {
    /// The key (opaque bytes).
    pub key: Vec<u8>,
    /// Value bytes; `None` if this is a delete tombstone.
    pub value: Option<Vec<u8>>,
    /// Coordinator-assigned write timestamp.
    pub timestamp: Timestamp,
}

impl Record {
    /// Create a new live record.
    pub fn put(key: Vec<u8>, value: Vec<u8>, timestamp: Timestamp) -> Self {
        Self {
            key,
            value: Some(value),
            timestamp,
        }
    }

    /// Create a tombstone record.
    pub fn tombstone(key: Vec<u8>, timestamp: Timestamp) -> Self {
        Self {
            key,
            value: None,
            timestamp,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Total order between two versions of the same key.
    ///
    /// Later timestamps win. On equal timestamps a tombstone beats a value,
    /// and between two values the greater byte string wins, so every replica
    /// picks the same winner no matter which copies it has seen.
    pub fn version_cmp(&self, other: &Record) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.is_tombstone().cmp(&other.is_tombstone()))
            .then_with(|| self.value.cmp(&other.value))
    }

    /// Whether this version should replace `other`. Identical versions do
    /// not supersede each other, which keeps replays idempotent.
    pub fn supersedes(&self, other: &Record) -> bool {
        self.version_cmp(other) == Ordering::Greater
    }

    /// Rough in-memory footprint, used for memtable flush accounting.
    pub fn approx_size(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, Vec::len) + 32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(n: u64) -> Timestamp {
        Timestamp::from_nanos(n)
    }

    #[test]
    fn test_later_timestamp_supersedes() {
        let old = Record::put(b"k".to_vec(), b"old".to_vec(), ts(1));
        let new = Record::put(b"k".to_vec(), b"new".to_vec(), ts(2));
        assert!(new.supersedes(&old));
        assert!(!old.supersedes(&new));
    }

    #[test]
    fn test_tombstone_beats_value_on_tie() {
        let value = Record::put(b"k".to_vec(), b"v".to_vec(), ts(7));
        let tomb = Record::tombstone(b"k".to_vec(), ts(7));
        assert!(tomb.supersedes(&value));
        assert!(!value.supersedes(&tomb));
    }

    #[test]
    fn test_greater_value_wins_on_tie() {
        let a = Record::put(b"k".to_vec(), b"apple".to_vec(), ts(7));
        let b = Record::put(b"k".to_vec(), b"banana".to_vec(), ts(7));
        assert!(b.supersedes(&a));
        assert!(!a.supersedes(&b));
    }

    #[test]
    fn test_identical_versions_do_not_supersede() {
        let a = Record::put(b"k".to_vec(), b"v".to_vec(), ts(3));
        assert!(!a.supersedes(&a.clone()));
        assert_eq!(a.version_cmp(&a), Ordering::Equal);
    }

    #[test]
    fn test_older_tombstone_loses_to_newer_value() {
        let tomb = Record::tombstone(b"k".to_vec(), ts(1));
        let value = Record::put(b"k".to_vec(), b"v".to_vec(), ts(2));
        assert!(value.supersedes(&tomb));
        assert!(tomb.is_tombstone());
        assert!(!value.is_tombstone());
    }
}
