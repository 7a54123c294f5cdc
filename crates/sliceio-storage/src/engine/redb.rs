//! redb-backed engine
//!
//! Each instance owns one database file with a single byte-keyed table.
//! Every write is its own committed transaction.

use super::KvEngine;
use redb::{Database, ReadableTable, TableDefinition};
use sliceio_common::{Error, Result, StorageBackend};
use std::path::{Path, PathBuf};

const RECORDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("records");

fn engine_err(e: impl Into<redb::Error>) -> Error {
    Error::engine(format!("redb: {}", e.into()))
}

/// Key-value engine backed by a redb database file
pub struct RedbEngine {
    path: PathBuf,
    db: Database,
}

impl RedbEngine {
    /// Open (or create) the database at `path`
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(engine_err)?;

        // Create the table eagerly so read transactions never miss it
        let write_txn = db.begin_write().map_err(engine_err)?;
        {
            let _t = write_txn.open_table(RECORDS).map_err(engine_err)?;
        }
        write_txn.commit().map_err(engine_err)?;

        Ok(Self {
            path: path.to_path_buf(),
            db,
        })
    }
}

impl KvEngine for RedbEngine {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Redb
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let write_txn = self.db.begin_write().map_err(engine_err)?;
        {
            let mut table = write_txn.open_table(RECORDS).map_err(engine_err)?;
            table.insert(key, value).map_err(engine_err)?;
        }
        write_txn.commit().map_err(engine_err)?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read().map_err(engine_err)?;
        let table = read_txn.open_table(RECORDS).map_err(engine_err)?;
        let value = table.get(key).map_err(engine_err)?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        let write_txn = self.db.begin_write().map_err(engine_err)?;
        let existed = {
            let mut table = write_txn.open_table(RECORDS).map_err(engine_err)?;
            let removed = table.remove(key).map_err(engine_err)?;
            removed.is_some()
        };
        write_txn.commit().map_err(engine_err)?;
        Ok(existed)
    }

    fn approx_size(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_reopen_keeps_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("slices.redb");
        {
            let engine = RedbEngine::open(&path).unwrap();
            engine.put(b"alpha", &[1u8; 256]).unwrap();
        }
        let engine = RedbEngine::open(&path).unwrap();
        assert_eq!(engine.get(b"alpha").unwrap(), Some(vec![1u8; 256]));
        assert_eq!(engine.get(b"beta").unwrap(), None);
    }

    #[test]
    fn test_creates_parent_directory() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0001").join("slice-000");
        let engine = RedbEngine::open(&path).unwrap();
        assert!(path.exists());
        assert!(engine.approx_size().unwrap() > 0);
    }
}
