//! Engine configuration, loaded from TOML.
//!
//! ```toml
//! api_base_url = "https://api.brewline.example"
//! image_dir = "/var/lib/brewline/images"
//! max_concurrent_requests = 4
//! stuck_after_attempts = 3
//!
//! [store]
//! path = "/var/lib/brewline/db"
//! sync_writes = true
//! ```

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SyncEngineError};
use crate::storage::StoreConfig;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the remote API (no trailing slash needed)
    pub api_base_url: String,
    /// Directory picked images are copied into
    pub image_dir: PathBuf,
    /// Upper bound on concurrent requests per flush (default: 4)
    pub max_concurrent_requests: usize,
    /// Lifecycle bus buffer per subscriber (default: 64)
    pub event_capacity: usize,
    /// Per-request timeout in seconds (default: 30)
    pub request_timeout_secs: u64,
    /// Consecutive failures before a flag is reported as stuck (default: 3)
    pub stuck_after_attempts: u32,
    /// Local database tuning
    pub store: StoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:3000".to_string(),
            image_dir: PathBuf::from("brewline_images"),
            max_concurrent_requests: 4,
            event_capacity: 64,
            request_timeout_secs: 30,
            stuck_after_attempts: 3,
            store: StoreConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Config for tests: everything under `dir`, no fsync.
    pub fn for_testing(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            image_dir: dir.join("images"),
            request_timeout_secs: 2,
            store: StoreConfig::for_testing(dir.join("db")),
            ..Self::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| SyncEngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SyncEngineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn storage_path(&self) -> &Path {
        &self.store.path
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.api_base_url.is_empty() {
            return Err(SyncEngineError::Config("api_base_url must not be empty".into()));
        }
        if self.max_concurrent_requests == 0 {
            return Err(SyncEngineError::Config("max_concurrent_requests must be at least 1".into()));
        }
        if self.event_capacity == 0 {
            return Err(SyncEngineError::Config("event_capacity must be at least 1".into()));
        }
        Ok(())
    }
}
