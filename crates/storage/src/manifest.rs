//! The MANIFEST names the live segments, oldest first.
//!
//! It is rewritten in full whenever the segment set changes: the new
//! contents go to `MANIFEST.tmp`, which is synced and renamed over the old
//! file. A crash leaves either the old or the new list in place, never a mix.
//! Segment files not listed are leftovers of an interrupted flush or
//! compaction and are deleted on open.

use crate::codec;
use crate::engine::StorageError;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

pub const MANIFEST_FILE: &str = "MANIFEST";
pub const MANIFEST_TMP_FILE: &str = "MANIFEST.tmp";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Live segment generations, oldest data first.
    pub segments: Vec<u64>,
    /// Lowest generation not yet handed out.
    pub next_gen: u64,
}

impl Manifest {
    /// Load the manifest, or `None` for a fresh directory.
    pub fn load(dir: &Path) -> Result<Option<Self>, StorageError> {
        let bytes = match fs::read(dir.join(MANIFEST_FILE)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(codec::decode_frame(&bytes)?))
    }

    /// Atomically replace the manifest on disk.
    pub fn store(&self, dir: &Path) -> Result<(), StorageError> {
        let tmp = dir.join(MANIFEST_TMP_FILE);
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&codec::encode_frame(self)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, dir.join(MANIFEST_FILE))?;
        // Persist the rename itself. Not every platform can open a directory.
        if let Ok(d) = File::open(dir) {
            let _ = d.sync_all();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_manifest() {
        let dir = TempDir::new().unwrap();
        assert_eq!(Manifest::load(dir.path()).unwrap(), None);
    }

    #[test]
    fn test_store_and_load() {
        let dir = TempDir::new().unwrap();
        let manifest = Manifest {
            segments: vec![4, 2, 9],
            next_gen: 10,
        };
        manifest.store(dir.path()).unwrap();
        assert_eq!(Manifest::load(dir.path()).unwrap(), Some(manifest));
        assert!(!dir.path().join(MANIFEST_TMP_FILE).exists());
    }

    #[test]
    fn test_store_replaces_previous() {
        let dir = TempDir::new().unwrap();
        Manifest {
            segments: vec![1],
            next_gen: 2,
        }
        .store(dir.path())
        .unwrap();
        let next = Manifest {
            segments: vec![1, 2],
            next_gen: 3,
        };
        next.store(dir.path()).unwrap();
        assert_eq!(Manifest::load(dir.path()).unwrap(), Some(next));
    }

    #[test]
    fn test_corrupt_manifest_is_an_error() {
        let dir = TempDir::new().unwrap();
        Manifest {
            segments: vec![1],
            next_gen: 2,
        }
        .store(dir.path())
        .unwrap();
        let path = dir.path().join(MANIFEST_FILE);
        let mut bytes = fs::read(&path).unwrap();
        bytes[10] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(Manifest::load(dir.path()).is_err());
    }
}
