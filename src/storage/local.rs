//! Local storage tier: a directory of files plus a metadata index.
//!
//! The index (`.metadata.json`) maps item ids to file names, content hashes,
//! and reporting metadata. It is written through [`StatePersistence`], so it
//! is atomic and checksum-verified like any other state file.
//!
//! Both the orchestrator's fetch path and out-of-band callers such as
//! [`StorageCoordinator::sync_to_remote`](super::StorageCoordinator::sync_to_remote)
//! update the index, so it sits behind a re-entrant lock. Each mutation bumps
//! a generation under the lock and saves a snapshot on the blocking pool; a
//! snapshot older than the last one written is dropped.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::transfer::{self, Copied};
use super::{ProgressCallback, StorageError};
use crate::model::ItemMetadata;
use crate::persistence::{StatePersistence, sha256_hex};

/// File name of the local metadata index.
pub const INDEX_FILE: &str = ".metadata.json";

const STORED_EXTENSION: &str = "pdf";

/// One entry of the local index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEntry {
    /// File name relative to the tier root.
    pub file_name: String,
    /// SHA-256 of the content at store time.
    pub sha256: String,
    /// Size in bytes at store time.
    pub size: u64,
    /// When the entry was written.
    pub stored_at: DateTime<Utc>,
    /// Reporting metadata of the item.
    pub metadata: ItemMetadata,
    /// Whether the remote tier is known to hold a copy.
    #[serde(default)]
    pub remote_synced: bool,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct LocalIndex {
    #[serde(default)]
    entries: BTreeMap<String, LocalEntry>,
    #[serde(skip)]
    generation: u64,
}

/// Directory-backed local tier.
#[derive(Debug)]
pub struct LocalTier {
    root: PathBuf,
    index_path: PathBuf,
    persistence: Arc<StatePersistence>,
    index: ReentrantMutex<RefCell<LocalIndex>>,
    saved_generation: Arc<Mutex<u64>>,
}

impl LocalTier {
    /// Opens (or creates) a local tier rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] when the directory cannot be created and
    /// [`StorageError::Index`] when the index is unrecoverably corrupted.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| StorageError::io(&root, e))?;

        let index_path = root.join(INDEX_FILE);
        let persistence = StatePersistence::new(&root);
        let index: LocalIndex = persistence.load(&index_path)?.unwrap_or_default();
        debug!(root = %root.display(), entries = index.entries.len(), "local tier opened");

        Ok(Self {
            root,
            index_path,
            persistence: Arc::new(persistence),
            index: ReentrantMutex::new(RefCell::new(index)),
            saved_generation: Arc::new(Mutex::new(0)),
        })
    }

    /// Returns the tier root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the index entry for `id`, if any.
    #[must_use]
    pub fn entry(&self, id: &str) -> Option<LocalEntry> {
        let guard = self.index.lock();
        let index = guard.borrow();
        index.entries.get(id).cloned()
    }

    /// Returns all indexed entries.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, LocalEntry)> {
        let guard = self.index.lock();
        let index = guard.borrow();
        index
            .entries
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect()
    }

    /// Returns the on-disk path of `id` when indexed and present.
    #[must_use]
    pub fn path_of(&self, id: &str) -> Option<PathBuf> {
        let entry = self.entry(id)?;
        let path = self.root.join(entry.file_name);
        path.is_file().then_some(path)
    }

    /// Returns whether `id` is indexed and its file exists.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.path_of(id).is_some()
    }

    /// Copies `source` into the tier and indexes it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] on copy failure and
    /// [`StorageError::Index`] when the index cannot be saved.
    pub async fn put(
        &self,
        id: &str,
        source: &Path,
        metadata: &ItemMetadata,
        progress: Option<&ProgressCallback>,
    ) -> Result<PathBuf, StorageError> {
        let file_name = storage_file_name(id);
        let dest = self.root.join(&file_name);
        let copied = transfer::copy_hashed(source, &dest, progress).await?;
        self.index_entry(id, file_name, &copied, metadata, false)
            .await?;
        Ok(dest)
    }

    /// Moves a file already inside the tier root into place and indexes it.
    ///
    /// # Errors
    ///
    /// Same as [`LocalTier::put`].
    pub async fn adopt(
        &self,
        id: &str,
        staged: &Path,
        metadata: &ItemMetadata,
        remote_synced: bool,
    ) -> Result<PathBuf, StorageError> {
        let file_name = storage_file_name(id);
        let dest = self.root.join(&file_name);
        let hashed = transfer::hash_file(staged).await?;
        tokio::fs::rename(staged, &dest)
            .await
            .map_err(|e| StorageError::io(&dest, e))?;
        self.index_entry(id, file_name, &hashed, metadata, remote_synced)
            .await?;
        Ok(dest)
    }

    /// Recomputes the content hash of `id` and compares it to the index.
    ///
    /// Returns `Ok(false)` when `id` is not indexed or its file is missing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] when the file exists but cannot be read.
    pub async fn verify(&self, id: &str) -> Result<bool, StorageError> {
        let Some(entry) = self.entry(id) else {
            return Ok(false);
        };
        let path = self.root.join(&entry.file_name);
        if !path.is_file() {
            return Ok(false);
        }
        let hashed = transfer::hash_file(&path).await?;
        let matches = hashed.sha256 == entry.sha256 && hashed.bytes == entry.size;
        if !matches {
            warn!(item_id = id, "local content hash mismatch");
        }
        Ok(matches)
    }

    /// Flags `id` as mirrored to the remote tier.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Index`] when the index cannot be saved.
    pub async fn mark_remote_synced(&self, id: &str) -> Result<(), StorageError> {
        self.mutate(|index| {
            if let Some(entry) = index.entries.get_mut(id) {
                entry.remote_synced = true;
            }
        })
        .await
    }

    /// Removes `id` from the index and deletes its file.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Index`] when the index cannot be saved.
    pub async fn remove(&self, id: &str) -> Result<bool, StorageError> {
        let removed = self.mutate(|index| index.entries.remove(id)).await?;
        if let Some(entry) = &removed {
            let _ = tokio::fs::remove_file(self.root.join(&entry.file_name)).await;
        }
        Ok(removed.is_some())
    }

    async fn index_entry(
        &self,
        id: &str,
        file_name: String,
        content: &Copied,
        metadata: &ItemMetadata,
        remote_synced: bool,
    ) -> Result<(), StorageError> {
        let entry = LocalEntry {
            file_name,
            sha256: content.sha256.clone(),
            size: content.bytes,
            stored_at: Utc::now(),
            metadata: metadata.clone(),
            remote_synced,
        };
        self.mutate(|index| {
            index.entries.insert(id.to_string(), entry);
        })
        .await
    }

    /// Applies `change` and saves a snapshot of the result.
    async fn mutate<R>(
        &self,
        change: impl FnOnce(&mut LocalIndex) -> R,
    ) -> Result<R, StorageError> {
        let (outcome, snapshot) = {
            let guard = self.index.lock();
            let mut index = guard.borrow_mut();
            let outcome = change(&mut index);
            index.generation += 1;
            (outcome, index.clone())
        };
        self.save(snapshot).await?;
        Ok(outcome)
    }

    async fn save(&self, snapshot: LocalIndex) -> Result<(), StorageError> {
        let persistence = Arc::clone(&self.persistence);
        let saved_generation = Arc::clone(&self.saved_generation);
        let path = self.index_path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StorageError> {
            let mut saved = saved_generation.lock();
            if snapshot.generation <= *saved {
                return Ok(());
            }
            persistence.save_atomic(&path, &snapshot)?;
            *saved = snapshot.generation;
            Ok(())
        })
        .await
        .map_err(|error| StorageError::io(&self.index_path, std::io::Error::other(error)))?
    }
}

/// Maps an item id onto a file-system-safe file name.
///
/// Ids that need escaping get a short hash suffix so distinct ids never
/// collide after sanitization.
#[must_use]
pub fn storage_file_name(id: &str) -> String {
    let sanitized: String = id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    let sanitized = sanitized.trim_start_matches('.');
    if sanitized == id && !sanitized.is_empty() {
        format!("{sanitized}.{STORED_EXTENSION}")
    } else {
        let digest = sha256_hex(id.as_bytes());
        format!("{sanitized}-{}.{STORED_EXTENSION}", &digest[..8])
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn write_source(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_storage_file_name() {
        assert_eq!(storage_file_name("2101.00001"), "2101.00001.pdf");
        assert_eq!(storage_file_name("paper_1"), "paper_1.pdf");

        let escaped = storage_file_name("10.1145/abc");
        assert!(escaped.starts_with("10.1145_abc-"));
        assert!(escaped.ends_with(".pdf"));
        assert_ne!(escaped, storage_file_name("10.1145_abc"));

        let hidden = storage_file_name("../etc");
        assert!(!hidden.starts_with('.'));
        assert!(!hidden.contains('/'));
    }

    #[tokio::test]
    async fn test_put_indexes_and_survives_reopen() {
        let work = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let source = write_source(work.path(), "a.pdf", b"%PDF-1.4 body");

        {
            let tier = LocalTier::open(root.path()).unwrap();
            let stored = tier
                .put("p1", &source, &ItemMetadata::titled("A"), None)
                .await
                .unwrap();
            assert_eq!(std::fs::read(&stored).unwrap(), b"%PDF-1.4 body");
            assert!(tier.contains("p1"));
            assert!(source.exists(), "put copies, never moves");
        }

        let reopened = LocalTier::open(root.path()).unwrap();
        let entry = reopened.entry("p1").unwrap();
        assert_eq!(entry.metadata.title, "A");
        assert_eq!(entry.size, 13);
        assert!(!entry.remote_synced);
        assert!(reopened.verify("p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_detects_tampering_and_missing_file() {
        let work = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let source = write_source(work.path(), "a.pdf", b"%PDF-original");
        let tier = LocalTier::open(root.path()).unwrap();
        let stored = tier
            .put("p1", &source, &ItemMetadata::titled("A"), None)
            .await
            .unwrap();

        std::fs::write(&stored, b"%PDF-tampered").unwrap();
        assert!(!tier.verify("p1").await.unwrap());

        std::fs::remove_file(&stored).unwrap();
        assert!(!tier.verify("p1").await.unwrap());
        assert!(!tier.contains("p1"));
        assert!(!tier.verify("unknown").await.unwrap());
    }

    #[tokio::test]
    async fn test_adopt_and_mark_synced() {
        let root = TempDir::new().unwrap();
        let tier = LocalTier::open(root.path()).unwrap();
        let staged = write_source(root.path(), ".incoming", b"%PDF-remote");

        let path = tier
            .adopt("p2", &staged, &ItemMetadata::titled("B"), true)
            .await
            .unwrap();
        assert!(!staged.exists());
        assert_eq!(std::fs::read(path).unwrap(), b"%PDF-remote");
        assert!(tier.entry("p2").unwrap().remote_synced);

        tier.mark_remote_synced("p2").await.unwrap();
        assert!(tier.remove("p2").await.unwrap());
        assert!(!tier.remove("p2").await.unwrap());
        assert!(tier.entries().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_keep_every_entry_in_saved_index() {
        let work = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let tier = Arc::new(LocalTier::open(root.path()).unwrap());

        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..16 {
            let tier = Arc::clone(&tier);
            let source = write_source(work.path(), &format!("{n}.pdf"), b"%PDF-1.4 body");
            tasks.spawn(async move {
                tier.put(&format!("p{n}"), &source, &ItemMetadata::titled("T"), None)
                    .await
                    .unwrap();
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap();
        }

        let reopened = LocalTier::open(root.path()).unwrap();
        assert_eq!(reopened.entries().len(), 16);
    }
}
