use super::{Storage, StorageError};
use std::{collections::HashMap, sync::RwLock};

// In-memory storage used by tests and light tooling.
// Stores all data in a HashMap behind a RwLock.
#[derive(Default)]
pub struct MemoryStorage {
    data: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.read().expect("memory storage poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self
            .data
            .read()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn del(&self, key: &[u8]) -> Result<(), StorageError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StorageError::Database(e.to_string()))?;
        data.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        storage.put(b"k", b"v").unwrap();
        assert_eq!(storage.get(b"k").unwrap(), Some(b"v".to_vec()));
        storage.del(b"k").unwrap();
        assert!(storage.get(b"k").unwrap().is_none());
        assert!(matches!(
            storage.get_existing(b"k"),
            Err(StorageError::KeyNotFound)
        ));
    }
}
