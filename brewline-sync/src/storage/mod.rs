//! Local durable storage.
//!
//! Architecture:
//! ```text
//! ┌────────────────┐  read_record / write_record  ┌──────────────────────┐
//! │ DomainService  │ ───────────────────────────► │ dyn LocalStore       │
//! │ (owns its key) │                              │  ├── RocksStore      │
//! └────────────────┘                              │  └── MemoryStore     │
//! ┌────────────────┐                              │                      │
//! │ SyncQueue      │ ───────────────────────────► │ Collection(kind)     │
//! │ (flags/kind)   │                              │ Flags(kind)          │
//! └────────────────┘                              │ User                 │
//!                                                 └──────────────────────┘
//! ```
//!
//! `set` always overwrites the full value. Records are JSON so the stored
//! shape matches what the server sends and receives.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use async_trait::async_trait;
use brewline_core::EntityKind;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Storage errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error for {key}: {reason}")]
    Deserialization { key: String, reason: String },
    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// A durable key. One key per entity list, one per flag partition, one for
/// the user record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKey {
    Collection(EntityKind),
    Flags(EntityKind),
    User,
}

impl StoreKey {
    /// Namespace the key lives in (a column family for RocksDB).
    pub fn namespace(&self) -> &'static str {
        match self {
            StoreKey::Collection(_) => rocks::CF_COLLECTIONS,
            StoreKey::Flags(_) => rocks::CF_FLAGS,
            StoreKey::User => rocks::CF_USER,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StoreKey::Collection(kind) | StoreKey::Flags(kind) => kind.as_str(),
            StoreKey::User => "profile",
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace(), self.name())
    }
}

/// Key-value storage for structured records.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError>;

    /// Overwrite the full value stored under `key`.
    async fn set(&self, key: &StoreKey, value: Vec<u8>) -> Result<(), StoreError>;

    async fn remove(&self, key: &StoreKey) -> Result<(), StoreError>;
}

/// Load and decode a JSON record.
pub async fn read_record<V: DeserializeOwned>(
    store: &dyn LocalStore,
    key: &StoreKey,
) -> Result<Option<V>, StoreError> {
    match store.get(key).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Deserialization {
                key: key.to_string(),
                reason: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// Encode and store a JSON record.
pub async fn write_record<V: Serialize + ?Sized + Sync>(
    store: &dyn LocalStore,
    key: &StoreKey,
    value: &V,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
    store.set(key, bytes).await
}
