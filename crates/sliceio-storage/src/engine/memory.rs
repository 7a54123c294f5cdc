//! In-process engines

use super::KvEngine;
use parking_lot::RwLock;
use sliceio_common::{Result, StorageBackend};
use std::collections::HashMap;

/// Map-backed engine; contents vanish with the process
#[derive(Default)]
pub struct MemoryEngine {
    records: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvEngine for MemoryEngine {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.records.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.records.read().get(key).cloned())
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        Ok(self.records.write().remove(key).is_some())
    }

    fn approx_size(&self) -> Result<u64> {
        let records = self.records.read();
        Ok(records
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum())
    }
}

/// Engine that accepts every write and stores nothing
#[derive(Clone, Copy, Debug, Default)]
pub struct NullEngine;

impl KvEngine for NullEngine {
    fn backend(&self) -> StorageBackend {
        StorageBackend::None
    }

    fn put(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
        Ok(())
    }

    fn get(&self, _key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn delete(&self, _key: &[u8]) -> Result<bool> {
        Ok(false)
    }

    fn approx_size(&self) -> Result<u64> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_size_counts_live_bytes() {
        let engine = MemoryEngine::new();
        engine.put(b"ab", &[0u8; 10]).unwrap();
        engine.put(b"cd", &[0u8; 20]).unwrap();
        assert_eq!(engine.approx_size().unwrap(), 34);

        engine.put(b"ab", &[0u8; 1]).unwrap();
        assert_eq!(engine.approx_size().unwrap(), 25);

        engine.delete(b"cd").unwrap();
        assert_eq!(engine.approx_size().unwrap(), 3);
    }
}
