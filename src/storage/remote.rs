//! Remote storage tier interface and a directory-backed implementation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::local::storage_file_name;
use super::transfer;
use super::{ProgressCallback, StorageError};
use crate::model::ItemMetadata;

/// Operations the coordinator needs from a remote backend.
///
/// Implementations are expected to be slow and unreliable; the coordinator
/// treats every error as a degraded, not failed, operation.
#[async_trait]
pub trait RemoteStorage: Send + Sync + std::fmt::Debug {
    /// Uploads `source` under `id`. Returns the backend's object identifier.
    async fn upload(
        &self,
        source: &Path,
        id: &str,
        progress: Option<&ProgressCallback>,
        metadata: &ItemMetadata,
    ) -> Result<String, StorageError>;

    /// Downloads `id` into `dest`. `Ok(None)` when the object does not exist.
    async fn download(
        &self,
        id: &str,
        dest: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<Option<PathBuf>, StorageError>;

    /// Returns whether `id` exists remotely.
    async fn exists(&self, id: &str) -> Result<bool, StorageError>;

    /// Deletes `id`. Returns whether anything was removed.
    async fn delete(&self, id: &str) -> Result<bool, StorageError>;

    /// Returns whether the backend is reachable.
    async fn test_connection(&self) -> bool;
}

#[derive(Debug, Serialize, Deserialize)]
struct RemoteMetadata {
    id: String,
    metadata: ItemMetadata,
}

/// Remote tier over a mounted directory (network share, synced folder).
///
/// Objects are stored flat under the root with a `.meta.json` sidecar holding
/// the original id and reporting metadata.
#[derive(Debug, Clone)]
pub struct DirectoryRemote {
    root: PathBuf,
}

impl DirectoryRemote {
    /// Creates a backend rooted at `root`. The directory is not created; an
    /// absent root makes [`RemoteStorage::test_connection`] fail.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, id: &str) -> PathBuf {
        self.root.join(storage_file_name(id))
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.meta.json", storage_file_name(id)))
    }

    fn ensure_online(&self, operation: &'static str, id: &str) -> Result<(), StorageError> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(StorageError::remote(
                operation,
                id,
                format!("{} is not mounted", self.root.display()),
            ))
        }
    }
}

#[async_trait]
impl RemoteStorage for DirectoryRemote {
    #[instrument(level = "debug", skip(self, source, progress, metadata))]
    async fn upload(
        &self,
        source: &Path,
        id: &str,
        progress: Option<&ProgressCallback>,
        metadata: &ItemMetadata,
    ) -> Result<String, StorageError> {
        self.ensure_online("upload", id)?;
        let dest = self.object_path(id);
        transfer::copy_hashed(source, &dest, progress).await?;

        let sidecar = RemoteMetadata {
            id: id.to_string(),
            metadata: metadata.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&sidecar)
            .map_err(|e| StorageError::remote("upload", id, e.to_string()))?;
        let meta_path = self.metadata_path(id);
        tokio::fs::write(&meta_path, bytes)
            .await
            .map_err(|e| StorageError::io(&meta_path, e))?;

        debug!(dest = %dest.display(), "uploaded to directory remote");
        Ok(storage_file_name(id))
    }

    #[instrument(level = "debug", skip(self, dest, progress))]
    async fn download(
        &self,
        id: &str,
        dest: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<Option<PathBuf>, StorageError> {
        self.ensure_online("download", id)?;
        let source = self.object_path(id);
        if !source.is_file() {
            return Ok(None);
        }
        transfer::copy_hashed(&source, dest, progress).await?;
        Ok(Some(dest.to_path_buf()))
    }

    async fn exists(&self, id: &str) -> Result<bool, StorageError> {
        self.ensure_online("exists", id)?;
        Ok(self.object_path(id).is_file())
    }

    async fn delete(&self, id: &str) -> Result<bool, StorageError> {
        self.ensure_online("delete", id)?;
        let path = self.object_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(self.metadata_path(id)).await;
                Ok(true)
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(StorageError::io(path, error)),
        }
    }

    async fn test_connection(&self) -> bool {
        tokio::fs::metadata(&self.root)
            .await
            .is_ok_and(|meta| meta.is_dir())
    }
}
