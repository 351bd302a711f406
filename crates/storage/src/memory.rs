//! Volatile [`Storage`] backend for tests and throwaway nodes.

use crate::backend::Storage;
use crate::engine::StorageError;
use crate::record::Record;
use parking_lot::RwLock;
use ringkv_common::Timestamp;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct MemoryStorage {
    data: RwLock<BTreeMap<Vec<u8>, Record>>,
    closed: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys held, tombstones included.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn write(&self, record: Record) -> Result<(), StorageError> {
        self.ensure_open()?;
        let mut data = self.data.write();
        match data.get(&record.key) {
            Some(existing) if !record.supersedes(existing) => {}
            _ => {
                data.insert(record.key.clone(), record);
            }
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Record>, StorageError> {
        self.ensure_open()?;
        Ok(self.data.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8], timestamp: Timestamp) -> Result<(), StorageError> {
        self.write(Record::put(key.to_vec(), value.to_vec(), timestamp))
    }

    fn delete(&self, key: &[u8], timestamp: Timestamp) -> Result<(), StorageError> {
        self.write(Record::tombstone(key.to_vec(), timestamp))
    }

    fn close(&self) -> Result<(), StorageError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
