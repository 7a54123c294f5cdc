//! A single slice database

use crate::engine::{KvEngine, open_engine};
use sliceio_common::{Result, SliceDbId, SliceKey, StorageBackend};
use std::path::{Path, PathBuf};

/// One engine instance holding slice payloads, bound to `<root>/slice-NNN`
pub struct SliceDb {
    id: SliceDbId,
    path: PathBuf,
    engine: Box<dyn KvEngine>,
}

impl SliceDb {
    /// File name of the slice database with the given id
    #[must_use]
    pub fn dbname(id: SliceDbId) -> String {
        format!("slice-{id:03}")
    }

    /// Open (or create) slice database `id` under a bucket root directory
    pub fn open(backend: StorageBackend, root_dir: &Path, id: SliceDbId) -> Result<Self> {
        let path = root_dir.join(Self::dbname(id));
        let engine = open_engine(backend, &path)?;
        Ok(Self { id, path, engine })
    }

    #[must_use]
    pub const fn id(&self) -> SliceDbId {
        self.id
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn put(&self, key: &SliceKey, data: &[u8]) -> Result<()> {
        self.engine.put(&key.to_bytes(), data)
    }

    pub fn get(&self, key: &SliceKey) -> Result<Option<Vec<u8>>> {
        self.engine.get(&key.to_bytes())
    }

    pub fn delete(&self, key: &SliceKey) -> Result<bool> {
        self.engine.delete(&key.to_bytes())
    }

    /// Current size as reported by the engine
    pub fn size(&self) -> Result<u64> {
        self.engine.approx_size()
    }

    pub fn flush(&self) -> Result<()> {
        self.engine.flush()
    }
}

impl std::fmt::Debug for SliceDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SliceDb")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("backend", &self.engine.backend())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_dbname() {
        assert_eq!(SliceDb::dbname(0), "slice-000");
        assert_eq!(SliceDb::dbname(42), "slice-042");
        assert_eq!(SliceDb::dbname(1234), "slice-1234");
    }

    #[test]
    fn test_slices_keyed_by_digest_and_index() {
        let dir = tempdir().unwrap();
        let db = SliceDb::open(StorageBackend::LogFile, dir.path(), 3).unwrap();
        assert_eq!(db.id(), 3);
        assert!(db.path().ends_with("slice-003"));

        let first = SliceKey::for_key(b"alpha", 0);
        let second = SliceKey::for_key(b"alpha", 1);
        db.put(&first, b"head").unwrap();
        db.put(&second, b"tail").unwrap();

        assert_eq!(db.get(&first).unwrap().as_deref(), Some(&b"head"[..]));
        assert_eq!(db.get(&second).unwrap().as_deref(), Some(&b"tail"[..]));
        assert!(db.delete(&first).unwrap());
        assert_eq!(db.get(&first).unwrap(), None);
    }
}
