//! In-memory store for tests and ephemeral sessions.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::{LocalStore, StoreError, StoreKey};

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<StoreKey, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl LocalStore for MemoryStore {
    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn set(&self, key: &StoreKey, value: Vec<u8>) -> Result<(), StoreError> {
        self.records.write().await.insert(*key, value);
        Ok(())
    }

    async fn remove(&self, key: &StoreKey) -> Result<(), StoreError> {
        self.records.write().await.remove(key);
        Ok(())
    }
}
