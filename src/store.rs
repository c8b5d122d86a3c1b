// src/store.rs

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store: not found")]
    NotFound,
    #[error("store: {0}")]
    Backend(String),
}

/// Byte-keyed, byte-valued storage. Implementations must be internally
/// synchronized and must hand out independent copies on `get`, so callers
/// may freely mutate returned buffers.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError>;
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;
}

/// In-memory reference store.
#[derive(Default)]
pub struct MemoryKv {
    data: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        let data = self.data.read().expect("kv store poisoned");
        data.get(key).cloned().ok_or(StoreError::NotFound)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut data = self.data.write().expect("kv store poisoned");
        data.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        let mut data = self.data.write().expect("kv store poisoned");
        match data.remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound),
        }
    }
}
