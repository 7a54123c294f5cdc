//! Key-value engine abstraction
//!
//! Slice payloads and bucket metadata both live in instances of an embedded
//! key-value engine. The storage layer needs only byte-keyed get/put/delete
//! and a size estimate used to decide when to rotate.
//!
//! # Backends
//!
//! - `redb`: one redb database file per instance (default)
//! - `logfile`: append-only record file with an in-memory index
//! - `memory`: in-process map, sized by key and value bytes
//! - `none`: accepts writes and forgets them

pub mod logfile;
pub mod memory;
pub mod redb;

use sliceio_common::{Result, StorageBackend};
use std::path::Path;

pub use self::logfile::LogFileEngine;
pub use self::memory::{MemoryEngine, NullEngine};
pub use self::redb::RedbEngine;

/// Core trait for embedded key-value engines
pub trait KvEngine: Send + Sync {
    /// Backend this engine implements
    fn backend(&self) -> StorageBackend;

    /// Insert or replace a value
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Fetch a value, `None` when absent
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Remove a value; returns whether it existed
    fn delete(&self, key: &[u8]) -> Result<bool>;

    /// Approximate bytes the engine occupies
    fn approx_size(&self) -> Result<u64>;

    /// Make previous writes durable
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Open (or create) an engine instance of the given backend at `path`
pub fn open_engine(backend: StorageBackend, path: &Path) -> Result<Box<dyn KvEngine>> {
    let engine: Box<dyn KvEngine> = match backend {
        StorageBackend::None => Box::new(NullEngine),
        StorageBackend::Memory => Box::new(MemoryEngine::new()),
        StorageBackend::LogFile => Box::new(LogFileEngine::open(path)?),
        StorageBackend::Redb => Box::new(RedbEngine::open(path)?),
    };
    Ok(engine)
}
