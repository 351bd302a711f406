//! Storage engine for ringkv: a log-structured store of timestamped versions.
//!
//! Writes land in a WAL and an in-memory memtable, which is flushed to
//! immutable sorted segments. Background compaction merges segments and
//! purges expired tombstones. [`MemoryStorage`] offers the same [`Storage`]
//! interface without persistence.

pub mod backend;
pub mod codec;
pub mod compaction;
pub mod engine;
pub mod manifest;
pub mod memory;
pub mod memtable;
pub mod record;
pub mod segment;
pub mod wal;

pub use backend::Storage;
pub use compaction::spawn_compaction_task;
pub use engine::{EngineOptions, EngineStats, StorageEngine, StorageError};
pub use memory::MemoryStorage;
pub use record::Record;
pub use wal::FsyncPolicy;
