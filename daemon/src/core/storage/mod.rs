mod memory;
mod sled;

pub use self::sled::SledStorage;
pub use memory::MemoryStorage;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Key not found in storage")]
    KeyNotFound,

    #[error("Database error: {0}")]
    Database(String),
}

// Content-addressed key-value backing store shared by every block and
// trie. Implementations must allow concurrent reads and serialise
// writes per key.
pub trait Storage: Send + Sync + 'static {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;

    fn del(&self, key: &[u8]) -> Result<(), StorageError>;

    // Like get, but a missing key is an error
    fn get_existing(&self, key: &[u8]) -> Result<Vec<u8>, StorageError> {
        self.get(key)?.ok_or(StorageError::KeyNotFound)
    }
}
