//! Dual-tier storage: a fast local directory and a slower remote backend.
//!
//! The [`StorageCoordinator`] answers existence queries local-first, stores
//! new content locally (synchronously, hash recorded) and mirrors it to the
//! remote tier best-effort. A remote outage degrades operations but never
//! fails them while the local tier works.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use collector_core::model::ItemMetadata;
//! use collector_core::storage::{DirectoryRemote, LocalTier, StorageCoordinator};
//!
//! # async fn example() -> Result<(), collector_core::storage::StorageError> {
//! let local = LocalTier::open("./papers")?;
//! let remote = Arc::new(DirectoryRemote::new("/mnt/archive"));
//! let storage = StorageCoordinator::new(local, Some(remote));
//!
//! storage
//!     .store("p1", Path::new("/tmp/p1.pdf"), &ItemMetadata::titled("A"), None)
//!     .await;
//! let (present, tier) = storage.exists("p1").await;
//! println!("present={present} tier={tier}");
//! # Ok(())
//! # }
//! ```

mod error;
mod local;
mod remote;
mod transfer;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

pub use error::StorageError;
pub use local::{INDEX_FILE, LocalEntry, LocalTier, storage_file_name};
pub use remote::{DirectoryRemote, RemoteStorage};

use crate::model::ItemMetadata;

/// Transfer progress callback: `(bytes_so_far, total_bytes_if_known)`.
pub type ProgressCallback = dyn Fn(u64, Option<u64>) + Send + Sync;

/// Tier in which an item was found. Always recomputed, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageLocation {
    /// In neither tier.
    None,
    /// In the local tier.
    Local,
    /// Only in the remote tier.
    Remote,
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::None => "none",
            Self::Local => "local",
            Self::Remote => "remote",
        };
        f.write_str(label)
    }
}

/// Counts from [`StorageCoordinator::sync_to_remote`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Entries uploaded by this sync.
    pub uploaded: usize,
    /// Entries found already present remotely.
    pub already_present: usize,
    /// Entries whose upload failed.
    pub failed: usize,
}

/// Existence, retrieval, and storage across the local and remote tiers.
#[derive(Debug)]
pub struct StorageCoordinator {
    local: LocalTier,
    remote: Option<Arc<dyn RemoteStorage>>,
}

impl StorageCoordinator {
    /// Creates a coordinator. `remote` may be absent for local-only runs.
    #[must_use]
    pub fn new(local: LocalTier, remote: Option<Arc<dyn RemoteStorage>>) -> Self {
        Self { local, remote }
    }

    /// Returns the local tier.
    #[must_use]
    pub fn local(&self) -> &LocalTier {
        &self.local
    }

    /// Returns whether a remote tier is configured.
    #[must_use]
    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    /// Returns whether the remote tier is configured and reachable.
    pub async fn remote_online(&self) -> bool {
        match &self.remote {
            Some(remote) => remote.test_connection().await,
            None => false,
        }
    }

    /// Checks the local tier, then the remote tier. Never mutates either.
    #[instrument(level = "debug", skip(self))]
    pub async fn exists(&self, id: &str) -> (bool, StorageLocation) {
        if self.local.contains(id) {
            return (true, StorageLocation::Local);
        }
        if let Some(remote) = &self.remote {
            match remote.exists(id).await {
                Ok(true) => return (true, StorageLocation::Remote),
                Ok(false) => {}
                Err(error) => debug!(item_id = id, %error, "remote existence check failed"),
            }
        }
        (false, StorageLocation::None)
    }

    /// Returns a local path for `id`, pulling it from the remote tier when
    /// only a remote copy exists.
    ///
    /// # Errors
    ///
    /// Returns an error when the remote copy exists but cannot be transferred
    /// or indexed locally.
    #[instrument(level = "debug", skip(self))]
    pub async fn resolve(&self, id: &str) -> Result<Option<PathBuf>, StorageError> {
        if let Some(path) = self.local.path_of(id) {
            return Ok(Some(path));
        }
        let Some(remote) = &self.remote else {
            return Ok(None);
        };

        let staging = transfer::staging_path(&self.local.root().join(storage_file_name(id)));
        let Some(downloaded) = remote.download(id, &staging, None).await? else {
            return Ok(None);
        };

        let metadata = ItemMetadata::titled(id);
        match self.local.adopt(id, &downloaded, &metadata, true).await {
            Ok(path) => {
                info!(item_id = id, "pulled remote copy into local tier");
                Ok(Some(path))
            }
            Err(error) => {
                let _ = tokio::fs::remove_file(&downloaded).await;
                Err(error)
            }
        }
    }

    /// Stores `source` under `id` in both tiers.
    ///
    /// Returns true when at least one tier accepted the content.
    #[instrument(skip(self, source, metadata, progress))]
    pub async fn store(
        &self,
        id: &str,
        source: &std::path::Path,
        metadata: &ItemMetadata,
        progress: Option<&ProgressCallback>,
    ) -> bool {
        let local_ok = match self.local.put(id, source, metadata, progress).await {
            Ok(path) => {
                debug!(item_id = id, path = %path.display(), "stored locally");
                true
            }
            Err(error) => {
                warn!(item_id = id, %error, "local store failed");
                false
            }
        };

        let remote_ok = match &self.remote {
            Some(remote) => match remote.upload(source, id, None, metadata).await {
                Ok(object) => {
                    debug!(item_id = id, object = %object, "mirrored to remote");
                    if local_ok {
                        if let Err(error) = self.local.mark_remote_synced(id).await {
                            warn!(item_id = id, %error, "failed to record remote sync");
                        }
                    }
                    true
                }
                Err(error) => {
                    warn!(item_id = id, %error, "remote mirror failed, continuing with local copy");
                    false
                }
            },
            None => false,
        };

        local_ok || remote_ok
    }

    /// Recomputes the local hash of `id`, or checks remote existence when no
    /// local copy is indexed.
    #[instrument(level = "debug", skip(self))]
    pub async fn verify(&self, id: &str) -> bool {
        if self.local.entry(id).is_some() {
            match self.local.verify(id).await {
                Ok(true) => return true,
                Ok(false) => debug!(item_id = id, "local copy failed verification"),
                Err(error) => warn!(item_id = id, %error, "local verification failed"),
            }
        }
        match &self.remote {
            Some(remote) => remote.exists(id).await.unwrap_or(false),
            None => false,
        }
    }

    /// Uploads local entries not yet mirrored to the remote tier.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Remote`] when no remote tier is configured or
    /// the remote tier is unreachable.
    #[instrument(skip(self))]
    pub async fn sync_to_remote(&self) -> Result<SyncReport, StorageError> {
        let Some(remote) = &self.remote else {
            return Err(StorageError::remote("sync", "*", "no remote tier configured"));
        };
        if !remote.test_connection().await {
            return Err(StorageError::remote("sync", "*", "remote tier unreachable"));
        }

        let mut report = SyncReport::default();
        for (id, entry) in self.local.entries() {
            if entry.remote_synced {
                continue;
            }
            let path = self.local.root().join(&entry.file_name);

            if matches!(remote.exists(&id).await, Ok(true)) {
                self.local.mark_remote_synced(&id).await?;
                report.already_present += 1;
                continue;
            }
            match remote.upload(&path, &id, None, &entry.metadata).await {
                Ok(_) => {
                    self.local.mark_remote_synced(&id).await?;
                    report.uploaded += 1;
                }
                Err(error) => {
                    warn!(item_id = %id, %error, "sync upload failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            uploaded = report.uploaded,
            already_present = report.already_present,
            failed = report.failed,
            "remote sync complete"
        );
        Ok(report)
    }
}
