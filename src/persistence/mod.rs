//! Atomic, checksum-verified persistence of serializable state.
//!
//! Every save goes through a sibling temp file that is flushed, synced, and
//! renamed over the target, so readers never observe a partial write. A
//! sidecar (`<file>.checksum`) records the SHA-256, size, and write time of
//! the content. When backups are enabled the previous file is copied to
//! `<file>.backup` before the rename.
//!
//! Loading verifies the checksum and parses the content. On failure the
//! backup is restored and the load retried once; only when both are unusable
//! does [`PersistenceError::Corrupted`] reach the caller.
//!
//! # Example
//!
//! ```no_run
//! use collector_core::persistence::StatePersistence;
//! use std::collections::BTreeSet;
//!
//! # fn example() -> Result<(), collector_core::persistence::PersistenceError> {
//! let persistence = StatePersistence::new("./state");
//! let path = persistence.state_dir().join("seen.json");
//! let seen: BTreeSet<String> = ["p1".to_string()].into();
//!
//! persistence.save_atomic(&path, &seen)?;
//! let restored: Option<BTreeSet<String>> = persistence.load(&path)?;
//! assert_eq!(restored, Some(seen));
//! # Ok(())
//! # }
//! ```

mod error;
mod housekeeping;
mod integrity;

use std::ffi::OsString;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

pub use error::PersistenceError;
pub use integrity::{IntegrityResult, IntegrityStatus, check_integrity};

/// Saves slower than this are logged.
pub const SLOW_SAVE_THRESHOLD: Duration = Duration::from_secs(2);

const BACKUP_SUFFIX: &str = ".backup";
const CHECKSUM_SUFFIX: &str = ".checksum";

/// Sidecar record written next to every saved file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ChecksumRecord {
    pub(crate) sha256: String,
    pub(crate) size: u64,
    pub(crate) written_at: DateTime<Utc>,
}

/// Atomic save/load of state files under one state directory.
#[derive(Debug)]
pub struct StatePersistence {
    state_dir: PathBuf,
    backups: bool,
    write_lock: Mutex<()>,
}

impl StatePersistence {
    /// Creates a persistence layer rooted at `state_dir` with backups enabled.
    #[must_use]
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            backups: true,
            write_lock: Mutex::new(()),
        }
    }

    /// Enables or disables `.backup` copies on save.
    #[must_use]
    pub fn with_backups(mut self, backups: bool) -> Self {
        self.backups = backups;
        self
    }

    /// Returns the state directory used by housekeeping.
    #[must_use]
    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Returns whether backups are enabled.
    #[must_use]
    pub fn backups_enabled(&self) -> bool {
        self.backups
    }

    /// Atomically replaces `path` with the JSON encoding of `value`.
    ///
    /// The value is serialized before the file system is touched. Any failure
    /// leaves the previous content of `path` untouched and removes the temp
    /// file.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Serialize`] when `value` cannot be encoded
    /// and [`PersistenceError::Io`] for file system failures.
    #[instrument(skip(self, value), fields(path = %path.display()))]
    pub fn save_atomic<T: Serialize + ?Sized>(
        &self,
        path: &Path,
        value: &T,
    ) -> Result<(), PersistenceError> {
        let started = Instant::now();
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| {
            PersistenceError::Serialize {
                path: path.to_path_buf(),
                source,
            }
        })?;

        let _guard = self.write_lock.lock();

        let staged = stage_temp_file(path, &bytes)?;
        if let Err(error) = before_rename_hook() {
            discard_temp_file(staged);
            return Err(PersistenceError::io(path, error));
        }

        if self.backups && path.exists() {
            self.copy_backup(path);
        }

        staged
            .persist(path)
            .map_err(|error| PersistenceError::io(path, error.error))?;

        let record = ChecksumRecord {
            sha256: sha256_hex(&bytes),
            size: bytes.len() as u64,
            written_at: Utc::now(),
        };
        write_checksum_record(path, &record)?;

        let elapsed = started.elapsed();
        if elapsed > SLOW_SAVE_THRESHOLD {
            warn!(
                elapsed_ms = elapsed.as_millis(),
                bytes = bytes.len(),
                "state save exceeded latency target"
            );
        } else {
            debug!(
                elapsed_ms = elapsed.as_millis(),
                bytes = bytes.len(),
                "state saved"
            );
        }
        Ok(())
    }

    /// Loads and verifies the state at `path`.
    ///
    /// Returns `Ok(None)` when no file exists. A file that fails verification
    /// is replaced by its backup and loaded once more.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Corrupted`] when neither the file nor its
    /// backup can be verified and parsed as `T`.
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn load<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>, PersistenceError> {
        if !path.exists() {
            debug!("no state file present");
            return Ok(None);
        }

        let reason = match read_verified(path) {
            Ok(value) => return Ok(Some(value)),
            Err(reason) => reason,
        };

        let _guard = self.write_lock.lock();
        // A save may have replaced the file while the lock was contended.
        let reason = match read_verified(path) {
            Ok(value) => return Ok(Some(value)),
            Err(_) => reason,
        };

        warn!(%reason, "state file failed verification, attempting backup recovery");
        if let Err(restore_error) = restore_backup(path) {
            return Err(PersistenceError::corrupted(
                path,
                format!("{reason}; backup unavailable: {restore_error}"),
            ));
        }

        match read_verified(path) {
            Ok(value) => {
                info!("state recovered from backup");
                Ok(Some(value))
            }
            Err(backup_reason) => Err(PersistenceError::corrupted(
                path,
                format!("{reason}; backup also invalid: {backup_reason}"),
            )),
        }
    }

    fn copy_backup(&self, path: &Path) {
        let backup = backup_path(path);
        if let Err(error) = std::fs::copy(path, &backup) {
            warn!(backup = %backup.display(), %error, "failed to refresh backup");
            return;
        }
        let sidecar = checksum_path(path);
        if sidecar.exists() {
            if let Err(error) = std::fs::copy(&sidecar, checksum_path(&backup)) {
                warn!(%error, "failed to copy checksum sidecar to backup");
            }
        } else {
            // Stale sidecar from an older backup would mis-verify the new copy.
            let _ = std::fs::remove_file(checksum_path(&backup));
        }
    }
}

/// Returns `<path>.backup`.
#[must_use]
pub fn backup_path(path: &Path) -> PathBuf {
    append_suffix(path, BACKUP_SUFFIX)
}

/// Returns `<path>.checksum`.
#[must_use]
pub fn checksum_path(path: &Path) -> PathBuf {
    append_suffix(path, CHECKSUM_SUFFIX)
}

/// Lowercase hex SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex_digest(&Sha256::digest(bytes))
}

/// Lowercase hex encoding of a finished digest.
#[must_use]
pub fn hex_digest(digest: &[u8]) -> String {
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Writes `bytes` to a synced temp file next to `path`.
fn stage_temp_file(path: &Path, bytes: &[u8]) -> Result<NamedTempFile, PersistenceError> {
    let parent = parent_dir(path);
    std::fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;

    let prefix = format!(
        ".{}.",
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    let mut temp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(parent)
        .map_err(|e| PersistenceError::io(parent, e))?;

    let written = temp
        .write_all(bytes)
        .and_then(|()| temp.flush())
        .and_then(|()| temp.as_file().sync_all());
    if let Err(error) = written {
        let temp_path = temp.path().to_path_buf();
        discard_temp_file(temp);
        return Err(PersistenceError::io(temp_path, error));
    }
    Ok(temp)
}

fn discard_temp_file(temp: NamedTempFile) {
    let temp_path = temp.path().to_path_buf();
    if let Err(error) = temp.close() {
        warn!(path = %temp_path.display(), %error, "failed to remove temp file");
    }
}

fn write_checksum_record(path: &Path, record: &ChecksumRecord) -> Result<(), PersistenceError> {
    let sidecar = checksum_path(path);
    let bytes = serde_json::to_vec(record).map_err(|source| PersistenceError::Serialize {
        path: sidecar.clone(),
        source,
    })?;
    stage_temp_file(&sidecar, &bytes)?
        .persist(&sidecar)
        .map_err(|error| PersistenceError::io(&sidecar, error.error))?;
    Ok(())
}

fn read_verified<T: DeserializeOwned>(path: &Path) -> Result<T, String> {
    let bytes = std::fs::read(path).map_err(|e| format!("unreadable: {e}"))?;
    if integrity::checksum_matches(path, &bytes) == Some(false) {
        return Err("checksum mismatch".to_string());
    }
    serde_json::from_slice(&bytes).map_err(|e| format!("unparsable: {e}"))
}

fn restore_backup(path: &Path) -> Result<(), String> {
    let backup = backup_path(path);
    if !backup.exists() {
        return Err(format!("{} does not exist", backup.display()));
    }

    let bytes = std::fs::read(&backup).map_err(|e| e.to_string())?;
    let staged = stage_temp_file(path, &bytes).map_err(|e| e.to_string())?;
    staged.persist(path).map_err(|e| e.error.to_string())?;

    let backup_sidecar = checksum_path(&backup);
    if backup_sidecar.exists() {
        std::fs::copy(&backup_sidecar, checksum_path(path)).map_err(|e| e.to_string())?;
    } else {
        let _ = std::fs::remove_file(checksum_path(path));
    }
    Ok(())
}

#[cfg(not(test))]
#[allow(clippy::unnecessary_wraps)]
fn before_rename_hook() -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
thread_local! {
    static FAIL_BEFORE_RENAME: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

#[cfg(test)]
fn fail_next_save_before_rename() {
    FAIL_BEFORE_RENAME.with(|flag| flag.set(true));
}

#[cfg(test)]
fn before_rename_hook() -> std::io::Result<()> {
    if FAIL_BEFORE_RENAME.with(|flag| flag.replace(false)) {
        return Err(std::io::Error::new(
            std::io::ErrorKind::Interrupted,
            "injected interruption before rename",
        ));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use serde::Serializer;
    use tempfile::TempDir;

    use super::*;

    fn temp_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.to_string_lossy().ends_with(".tmp"))
            .collect()
    }

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("refuses to serialize"))
        }
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let persistence = StatePersistence::new(dir.path());
        let path = dir.path().join("state.json");

        let mut value = BTreeMap::new();
        value.insert("p1".to_string(), vec!["a".to_string()]);
        value.insert("p2".to_string(), Vec::new());

        persistence.save_atomic(&path, &value).unwrap();
        let loaded: Option<BTreeMap<String, Vec<String>>> = persistence.load(&path).unwrap();
        assert_eq!(loaded, Some(value));
        assert!(checksum_path(&path).exists());
    }

    #[test]
    fn test_load_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let persistence = StatePersistence::new(dir.path());
        let loaded: Option<Vec<u8>> = persistence.load(&dir.path().join("nope.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_save_creates_backup_of_previous_content() {
        let dir = TempDir::new().unwrap();
        let persistence = StatePersistence::new(dir.path());
        let path = dir.path().join("state.json");

        persistence.save_atomic(&path, &vec![1]).unwrap();
        assert!(!backup_path(&path).exists());

        persistence.save_atomic(&path, &vec![2]).unwrap();
        let backup: Vec<u8> = serde_json::from_slice(&std::fs::read(backup_path(&path)).unwrap()).unwrap();
        assert_eq!(backup, vec![1]);
    }

    #[test]
    fn test_backups_disabled() {
        let dir = TempDir::new().unwrap();
        let persistence = StatePersistence::new(dir.path()).with_backups(false);
        let path = dir.path().join("state.json");

        persistence.save_atomic(&path, &vec![1]).unwrap();
        persistence.save_atomic(&path, &vec![2]).unwrap();
        assert!(!backup_path(&path).exists());
    }

    #[test]
    fn test_unserializable_value_never_touches_disk() {
        let dir = TempDir::new().unwrap();
        let persistence = StatePersistence::new(dir.path());
        let path = dir.path().join("state.json");
        persistence.save_atomic(&path, &vec![7]).unwrap();

        let result = persistence.save_atomic(&path, &Unserializable);
        assert!(matches!(result, Err(PersistenceError::Serialize { .. })));

        let loaded: Option<Vec<u8>> = persistence.load(&path).unwrap();
        assert_eq!(loaded, Some(vec![7]));
        assert!(!backup_path(&path).exists());
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn test_interrupted_save_leaves_target_unchanged_and_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let persistence = StatePersistence::new(dir.path());
        let path = dir.path().join("state.json");
        persistence.save_atomic(&path, &vec![1, 2, 3]).unwrap();
        let before = std::fs::read(&path).unwrap();

        fail_next_save_before_rename();
        let result = persistence.save_atomic(&path, &vec![9, 9, 9]);
        assert!(matches!(result, Err(PersistenceError::Io { .. })));

        assert_eq!(std::fs::read(&path).unwrap(), before);
        assert!(temp_files(dir.path()).is_empty());
        let loaded: Option<Vec<u8>> = persistence.load(&path).unwrap();
        assert_eq!(loaded, Some(vec![1, 2, 3]));
    }

    #[test]
    fn test_corrupted_primary_recovers_from_backup() {
        let dir = TempDir::new().unwrap();
        let persistence = StatePersistence::new(dir.path());
        let path = dir.path().join("state.json");

        persistence.save_atomic(&path, &vec![1]).unwrap();
        persistence.save_atomic(&path, &vec![2]).unwrap();
        std::fs::write(&path, b"{ truncated").unwrap();

        let loaded: Option<Vec<u8>> = persistence.load(&path).unwrap();
        assert_eq!(loaded, Some(vec![1]));
        assert!(check_integrity(&path).is_valid());
    }

    #[test]
    fn test_checksum_mismatch_recovers_from_backup() {
        let dir = TempDir::new().unwrap();
        let persistence = StatePersistence::new(dir.path());
        let path = dir.path().join("state.json");

        persistence.save_atomic(&path, &vec![1]).unwrap();
        persistence.save_atomic(&path, &vec![2]).unwrap();
        std::fs::write(&path, b"[3]").unwrap();

        let loaded: Option<Vec<u8>> = persistence.load(&path).unwrap();
        assert_eq!(loaded, Some(vec![1]));
    }

    #[test]
    fn test_recovery_rechecks_after_waiting_for_a_save() {
        let dir = TempDir::new().unwrap();
        let persistence = Arc::new(StatePersistence::new(dir.path()));
        let path = dir.path().join("state.json");

        persistence.save_atomic(&path, &vec![1]).unwrap();
        persistence.save_atomic(&path, &vec![2]).unwrap();
        std::fs::write(&path, b"{ truncated").unwrap();

        let guard = persistence.write_lock.lock();
        let loader = {
            let persistence = Arc::clone(&persistence);
            let path = path.clone();
            std::thread::spawn(move || persistence.load::<Vec<u8>>(&path).unwrap())
        };
        std::thread::sleep(Duration::from_millis(200));
        // Stands in for a save that lands while the loader waits on the lock.
        StatePersistence::new(dir.path())
            .with_backups(false)
            .save_atomic(&path, &vec![3])
            .unwrap();
        drop(guard);

        assert_eq!(loader.join().unwrap(), Some(vec![3]));
        let loaded: Option<Vec<u8>> = persistence.load(&path).unwrap();
        assert_eq!(loaded, Some(vec![3]));
    }

    #[test]
    fn test_corrupted_without_backup_is_hard_error() {
        let dir = TempDir::new().unwrap();
        let persistence = StatePersistence::new(dir.path());
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"not json").unwrap();

        let result: Result<Option<Vec<u8>>, _> = persistence.load(&path);
        let error = result.unwrap_err();
        assert!(error.is_corruption());
        assert!(error.to_string().contains("backup unavailable"));
    }

    #[test]
    fn test_corrupted_primary_and_backup_is_hard_error() {
        let dir = TempDir::new().unwrap();
        let persistence = StatePersistence::new(dir.path());
        let path = dir.path().join("state.json");

        persistence.save_atomic(&path, &vec![1]).unwrap();
        persistence.save_atomic(&path, &vec![2]).unwrap();
        std::fs::write(&path, b"xx").unwrap();
        std::fs::write(backup_path(&path), b"yy").unwrap();

        let result: Result<Option<Vec<u8>>, _> = persistence.load(&path);
        assert!(result.unwrap_err().is_corruption());
    }

    #[test]
    fn test_shape_mismatch_is_treated_as_corruption() {
        let dir = TempDir::new().unwrap();
        let persistence = StatePersistence::new(dir.path());
        let path = dir.path().join("state.json");
        persistence.save_atomic(&path, &"a string").unwrap();

        let result: Result<Option<Vec<u8>>, _> = persistence.load(&path);
        assert!(result.unwrap_err().is_corruption());
    }

    #[test]
    fn test_concurrent_saves_leave_exactly_one_payload() {
        let dir = TempDir::new().unwrap();
        let persistence = Arc::new(StatePersistence::new(dir.path()));
        let path = dir.path().join("state.json");

        let handles: Vec<_> = (0..8u32)
            .map(|n| {
                let persistence = Arc::clone(&persistence);
                let path = path.clone();
                std::thread::spawn(move || {
                    let payload: Vec<u32> = vec![n; 64];
                    persistence.save_atomic(&path, &payload).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let loaded: Vec<u32> = persistence.load(&path).unwrap().unwrap();
        assert_eq!(loaded.len(), 64);
        assert!(loaded.iter().all(|value| *value == loaded[0]));
        assert!(loaded[0] < 8);
        assert!(temp_files(dir.path()).is_empty());
    }

    #[test]
    fn test_suffix_helpers() {
        let path = Path::new("/state/run.json");
        assert_eq!(backup_path(path), PathBuf::from("/state/run.json.backup"));
        assert_eq!(checksum_path(path), PathBuf::from("/state/run.json.checksum"));
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
