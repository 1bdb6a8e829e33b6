//! RocksDB-backed local store.
//!
//! Column families:
//! - `collections`: entity lists, one key per kind (LZ4 compressed JSON)
//! - `sync_flags`:  pending flags, one key per kind
//! - `user`:        the signed-in user record
//!
//! Values are small and rewritten whole on every `set`, so point lookups
//! dominate. Flags are the only column family that must survive a crash
//! mid-flush; enable `sync_writes` where that matters more than latency.

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Options, SingleThreaded, WriteOptions,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use super::{LocalStore, StoreError, StoreKey};

pub(crate) const CF_COLLECTIONS: &str = "collections";
pub(crate) const CF_FLAGS: &str = "sync_flags";
pub(crate) const CF_USER: &str = "user";

const COLUMN_FAMILIES: &[&str] = &[CF_COLLECTIONS, CF_FLAGS, CF_USER];

/// Store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 8MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: true)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 64)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("brewline_data"),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 64,
        }
    }
}

impl StoreConfig {
    /// Config for tests: small cache, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 32,
        }
    }
}

/// RocksDB-backed implementation of [`LocalStore`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl RocksStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(3);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::debug!("opened local store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed.
        opts.set_compression_type(DBCompressionType::None);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Force memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush().map_err(|e| StoreError::Database(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }
}

#[async_trait]
impl LocalStore for RocksStore {
    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(key.namespace())?;
        match self.db.get_cf(cf, key.name().as_bytes())? {
            Some(compressed) => lz4_flex::decompress_size_prepended(&compressed)
                .map(Some)
                .map_err(|e| StoreError::Compression(e.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &StoreKey, value: Vec<u8>) -> Result<(), StoreError> {
        let cf = self.cf(key.namespace())?;
        let compressed = lz4_flex::compress_prepend_size(&value);
        self.db
            .put_cf_opt(cf, key.name().as_bytes(), compressed, &self.write_options())?;
        Ok(())
    }

    async fn remove(&self, key: &StoreKey) -> Result<(), StoreError> {
        let cf = self.cf(key.namespace())?;
        self.db
            .delete_cf_opt(cf, key.name().as_bytes(), &self.write_options())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use brewline_core::EntityKind;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_set_get_remove() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        let key = StoreKey::Collection(EntityKind::Recipe);

        assert!(store.get(&key).await.unwrap().is_none());

        store.set(&key, b"[1,2,3]".to_vec()).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().unwrap(), b"[1,2,3]");

        store.set(&key, b"[]".to_vec()).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap().unwrap(), b"[]");

        store.remove(&key).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_namespaces_are_isolated() {
        let dir = tempdir().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();

        store.set(&StoreKey::Collection(EntityKind::Batch), b"entities".to_vec()).await.unwrap();
        store.set(&StoreKey::Flags(EntityKind::Batch), b"flags".to_vec()).await.unwrap();

        assert_eq!(
            store.get(&StoreKey::Collection(EntityKind::Batch)).await.unwrap().unwrap(),
            b"entities"
        );
        assert_eq!(
            store.get(&StoreKey::Flags(EntityKind::Batch)).await.unwrap().unwrap(),
            b"flags"
        );
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        {
            let store = RocksStore::open(config.clone()).unwrap();
            store.set(&StoreKey::User, b"{\"username\":\"ana\"}".to_vec()).await.unwrap();
            store.flush().unwrap();
        }
        let store = RocksStore::open(config).unwrap();
        assert_eq!(
            store.get(&StoreKey::User).await.unwrap().unwrap(),
            b"{\"username\":\"ana\"}"
        );
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(config.sync_writes);
    }
}
