//! In-memory table holding writes not yet flushed to a segment.
//!
//! Keeps exactly one version per key (the winner under
//! [`Record::supersedes`]) in key order, so a flush can stream it straight
//! into a sorted segment.

use crate::record::Record;
use std::collections::BTreeMap;
use std::ops::Bound;

#[derive(Debug, Default)]
pub struct Memtable {
    data: BTreeMap<Vec<u8>, Record>,
    /// Approximate bytes held, see [`Record::approx_size`].
    size_bytes: usize,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &[u8]) -> Option<&Record> {
        self.data.get(key)
    }

    /// Insert `record` unless the current version for its key supersedes or
    /// equals it. Returns whether the record was stored.
    pub fn put(&mut self, record: Record) -> bool {
        match self.data.get_mut(&record.key) {
            Some(existing) => {
                if !record.supersedes(existing) {
                    return false;
                }
                self.size_bytes = self.size_bytes - existing.approx_size() + record.approx_size();
                *existing = record;
            }
            None => {
                self.size_bytes += record.approx_size();
                self.data.insert(record.key.clone(), record);
            }
        }
        true
    }

    /// Records with `start <= key < end` (unbounded when `end` is `None`),
    /// tombstones included, in key order.
    pub fn range<'a>(
        &'a self,
        start: &'a [u8],
        end: Option<&'a [u8]>,
    ) -> impl Iterator<Item = &'a Record> + 'a {
        // A reversed range is empty, not a panic in `BTreeMap::range`.
        let upper = match end {
            Some(end) if end <= start => Bound::Excluded(start),
            Some(end) => Bound::Excluded(end),
            None => Bound::Unbounded,
        };
        self.data
            .range::<[u8], _>((Bound::Included(start), upper))
            .map(|(_, record)| record)
    }

    /// All records in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.data.values()
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.size_bytes = 0;
    }
}
