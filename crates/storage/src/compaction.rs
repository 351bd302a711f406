//! Segment compaction.
//!
//! A full compaction merges every live segment into one, keeping only the
//! winning version of each key and dropping tombstones older than the grace
//! period. It runs off the write path: writers keep appending to the
//! memtable and flushing new segments while the merge is in progress, and
//! readers keep using the segment set they already hold.

use crate::engine::{StorageEngine, StorageError};
use crate::record::Record;
use crate::segment::Segment;
use ringkv_common::Timestamp;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Insert `record` into `merged` unless the version already there wins.
pub(crate) fn keep_newest(merged: &mut BTreeMap<Vec<u8>, Record>, record: Record) {
    match merged.get_mut(&record.key) {
        Some(existing) => {
            if record.supersedes(existing) {
                *existing = record;
            }
        }
        None => {
            merged.insert(record.key.clone(), record);
        }
    }
}

/// Merge `segments` into a single sorted run.
///
/// Tombstones written more than `grace` before `now` are dropped. Every
/// older version of their key is in the merged input, so nothing can
/// resurface once they are gone.
pub fn merge_segments(
    segments: &[Arc<Segment>],
    now: Timestamp,
    grace: Duration,
) -> Result<Vec<Record>, StorageError> {
    let mut merged = BTreeMap::new();
    for segment in segments {
        for record in segment.records()? {
            keep_newest(&mut merged, record);
        }
    }

    let grace_nanos = grace.as_nanos().min(u64::MAX as u128) as u64;
    Ok(merged
        .into_values()
        .filter(|record| !(record.is_tombstone() && record.timestamp.nanos_until(now) > grace_nanos))
        .collect())
}

/// Run housekeeping for `engine` every `interval`: fsync the WAL (for the
/// batch policy) and compact once `trigger_segments` segments have piled up.
///
/// The task ends once the engine is closed.
pub fn spawn_compaction_task(
    engine: Arc<StorageEngine>,
    interval: Duration,
    trigger_segments: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if engine.is_closed() {
                tracing::debug!("storage closed; compaction task exiting");
                break;
            }

            let eng = engine.clone();
            let result = tokio::task::spawn_blocking(move || {
                eng.sync()?;
                if eng.segment_count() >= trigger_segments {
                    eng.compact()
                } else {
                    Ok(false)
                }
            })
            .await;

            match result {
                Ok(Ok(_)) => {}
                Ok(Err(StorageError::Closed)) => break,
                Ok(Err(e)) => tracing::warn!("background compaction failed: {}", e),
                Err(e) => tracing::error!("compaction task panicked: {}", e),
            }
        }
    })
}
