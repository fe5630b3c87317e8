use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use dino_lib::{DinoError, DinoResult};

use crate::Store;

/// A `Store` powered by a map, for testing and caches. Values are copied
/// both on put and on get, so callers can never mutate stored bytes.
#[derive(Default)]
pub struct InMemoryStore {
    map: Mutex<HashMap<Vec<u8>, Vec<u8>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every stored pair. Test helper.
    pub fn clear(&self) {
        if let Ok(mut map) = self.map.lock() {
            map.clear();
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put(&self, key: &[u8], value: &[u8]) -> DinoResult<()> {
        let mut map = self
            .map
            .lock()
            .map_err(|_| DinoError::StorageError("in-memory store lock poisoned".to_string()))?;
        map.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> DinoResult<Vec<u8>> {
        let map = self
            .map
            .lock()
            .map_err(|_| DinoError::StorageError("in-memory store lock poisoned".to_string()))?;
        map.get(key)
            .cloned()
            .ok_or_else(|| DinoError::NotFound(hex::encode(key)))
    }
}
