//! On-demand integrity classification of persisted state files.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ChecksumRecord, backup_path, checksum_path, sha256_hex};

/// Integrity classification of a state file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    /// Parsable, and the checksum matches when a sidecar exists.
    Valid,
    /// Not parsable.
    Corrupted,
    /// No file at the path.
    Missing,
    /// Parsable, but content disagrees with the recorded checksum.
    Partial,
}

/// Result of [`check_integrity`]. Computed on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityResult {
    /// The inspected path.
    pub path: PathBuf,
    /// Classification.
    pub status: IntegrityStatus,
    /// Whether a checksum sidecar exists and matches the content.
    pub checksum_match: bool,
    /// File size in bytes (0 when missing).
    pub size: u64,
    /// Last modification time, when available.
    pub modified: Option<DateTime<Utc>>,
    /// Suggested operator action.
    pub recovery_action: String,
}

impl IntegrityResult {
    /// Returns whether the file can be loaded as-is.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.status == IntegrityStatus::Valid
    }
}

/// Reads the sidecar record for `path`, if one exists and parses.
pub(super) fn read_checksum_record(path: &Path) -> Option<ChecksumRecord> {
    let raw = std::fs::read(checksum_path(path)).ok()?;
    serde_json::from_slice(&raw).ok()
}

/// Compares `bytes` against the sidecar record. `None` when no sidecar exists.
pub(super) fn checksum_matches(path: &Path, bytes: &[u8]) -> Option<bool> {
    let record = read_checksum_record(path)?;
    Some(record.size == bytes.len() as u64 && record.sha256 == sha256_hex(bytes))
}

/// Classifies the state file at `path`.
#[must_use]
pub fn check_integrity(path: &Path) -> IntegrityResult {
    let backup_available = backup_path(path).exists();
    let restore_hint = |fallback: &str| {
        if backup_available {
            format!("restore from {}", backup_path(path).display())
        } else {
            fallback.to_string()
        }
    };

    let Ok(bytes) = std::fs::read(path) else {
        return IntegrityResult {
            path: path.to_path_buf(),
            status: IntegrityStatus::Missing,
            checksum_match: false,
            size: 0,
            modified: None,
            recovery_action: restore_hint("none; a fresh state will be created"),
        };
    };

    let modified = std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .map(DateTime::<Utc>::from);
    let size = bytes.len() as u64;

    if serde_json::from_slice::<serde_json::Value>(&bytes).is_err() {
        return IntegrityResult {
            path: path.to_path_buf(),
            status: IntegrityStatus::Corrupted,
            checksum_match: false,
            size,
            modified,
            recovery_action: restore_hint("delete the file and rebuild state from storage"),
        };
    }

    match checksum_matches(path, &bytes) {
        Some(false) => IntegrityResult {
            path: path.to_path_buf(),
            status: IntegrityStatus::Partial,
            checksum_match: false,
            size,
            modified,
            recovery_action: restore_hint(
                "inspect the content, then re-save it to refresh the checksum",
            ),
        },
        matched => IntegrityResult {
            path: path.to_path_buf(),
            status: IntegrityStatus::Valid,
            checksum_match: matched.unwrap_or(false),
            size,
            modified,
            recovery_action: "none".to_string(),
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::persistence::StatePersistence;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let result = check_integrity(&dir.path().join("absent.json"));
        assert_eq!(result.status, IntegrityStatus::Missing);
        assert_eq!(result.size, 0);
        assert!(!result.checksum_match);
    }

    #[test]
    fn test_valid_file_with_sidecar() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        StatePersistence::new(dir.path())
            .save_atomic(&path, &vec![1, 2, 3])
            .unwrap();

        let result = check_integrity(&path);
        assert_eq!(result.status, IntegrityStatus::Valid);
        assert!(result.checksum_match);
        assert!(result.size > 0);
        assert!(result.modified.is_some());
        assert_eq!(result.recovery_action, "none");
    }

    #[test]
    fn test_valid_file_without_sidecar() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{\"a\":1}").unwrap();

        let result = check_integrity(&path);
        assert!(result.is_valid());
        assert!(!result.checksum_match);
    }

    #[test]
    fn test_unparsable_file_is_corrupted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{\"completed\": [").unwrap();

        let result = check_integrity(&path);
        assert_eq!(result.status, IntegrityStatus::Corrupted);
        assert!(result.recovery_action.contains("rebuild"));
    }

    #[test]
    fn test_checksum_mismatch_is_partial() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        StatePersistence::new(dir.path())
            .save_atomic(&path, &vec![1, 2, 3])
            .unwrap();
        std::fs::write(&path, b"[1,2]").unwrap();

        let result = check_integrity(&path);
        assert_eq!(result.status, IntegrityStatus::Partial);
        assert!(!result.checksum_match);
    }

    #[test]
    fn test_recovery_action_points_at_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        let persistence = StatePersistence::new(dir.path());
        persistence.save_atomic(&path, &vec![1]).unwrap();
        persistence.save_atomic(&path, &vec![2]).unwrap();
        std::fs::write(&path, b"garbage").unwrap();

        let result = check_integrity(&path);
        assert_eq!(result.status, IntegrityStatus::Corrupted);
        assert!(result.recovery_action.contains(".backup"));
    }
}
