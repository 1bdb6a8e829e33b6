//! Durable image storage and blob reads.

use async_trait::async_trait;
use brewline_core::ImageAttachment;
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncEngineError};

/// Moves picked images into durable storage and reads them back as bytes.
#[async_trait]
pub trait ImageStore: Send + Sync {
    /// Persist a pending image. Returns metadata with `has_pending_edit`
    /// cleared and `local_path` pointing at the durable copy.
    async fn persist(&self, image: &ImageAttachment) -> Result<ImageAttachment>;

    async fn read_blob(&self, image: &ImageAttachment) -> Result<Vec<u8>>;
}

/// Stores images as files under one directory, named by image client id.
pub struct FsImageStore {
    dir: PathBuf,
}

impl FsImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn durable_path(&self, image: &ImageAttachment, source: &Path) -> PathBuf {
        let name = match source.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}.{ext}", image.cid),
            None => image.cid.to_string(),
        };
        self.dir.join(name)
    }
}

#[async_trait]
impl ImageStore for FsImageStore {
    async fn persist(&self, image: &ImageAttachment) -> Result<ImageAttachment> {
        if !image.has_pending_edit {
            return Ok(image.clone());
        }
        let source = image
            .local_path
            .as_deref()
            .map(PathBuf::from)
            .ok_or_else(|| SyncEngineError::Image(format!("image {} has no local file", image.cid)))?;

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| SyncEngineError::Image(e.to_string()))?;

        let target = self.durable_path(image, &source);
        if target != source {
            tokio::fs::copy(&source, &target)
                .await
                .map_err(|e| SyncEngineError::Image(format!("{}: {e}", source.display())))?;
        }

        let mut stored = image.clone();
        stored.local_path = Some(target.to_string_lossy().into_owned());
        stored.has_pending_edit = false;
        Ok(stored)
    }

    async fn read_blob(&self, image: &ImageAttachment) -> Result<Vec<u8>> {
        let path = image
            .local_path
            .as_deref()
            .ok_or_else(|| SyncEngineError::Image(format!("image {} has no local file", image.cid)))?;
        tokio::fs::read(path)
            .await
            .map_err(|e| SyncEngineError::Image(format!("{path}: {e}")))
    }
}
