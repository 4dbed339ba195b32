//! Listing and pruning of files under the state directory.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use regex::Regex;
use tracing::{debug, info, warn};

use super::{BACKUP_SUFFIX, PersistenceError, StatePersistence, checksum_path};

const SECONDS_PER_DAY: u64 = 86_400;

impl StatePersistence {
    /// Lists files in the state directory whose name matches `pattern`.
    ///
    /// `pattern` is a shell-style glob over file names (`*`, `?`). Checksum
    /// sidecars and temp files are never returned. Results are sorted.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Pattern`] for an invalid glob and
    /// [`PersistenceError::Io`] when the directory cannot be read. A missing
    /// state directory yields an empty list.
    pub fn list_matching(&self, pattern: &str) -> Result<Vec<PathBuf>, PersistenceError> {
        let matcher = glob_to_regex(pattern)?;
        let mut matches: Vec<PathBuf> = self
            .state_files()?
            .into_iter()
            .filter(|path| file_name(path).is_some_and(|name| matcher.is_match(name)))
            .collect();
        matches.sort();
        Ok(matches)
    }

    /// Removes files matching `pattern`, and stale `.backup` files, last
    /// modified more than `days` days ago. Their checksum sidecars go too.
    ///
    /// Returns the removed primary and backup paths.
    ///
    /// # Errors
    ///
    /// Same as [`StatePersistence::list_matching`]. Individual removal
    /// failures are logged and skipped.
    pub fn purge_older_than(
        &self,
        pattern: &str,
        days: u64,
    ) -> Result<Vec<PathBuf>, PersistenceError> {
        let matcher = glob_to_regex(pattern)?;
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(days.saturating_mul(SECONDS_PER_DAY)))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut removed = Vec::new();
        for path in self.state_files()? {
            let Some(name) = file_name(&path) else {
                continue;
            };
            if !(matcher.is_match(name) || name.ends_with(BACKUP_SUFFIX)) {
                continue;
            }
            let modified = match std::fs::metadata(&path).and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(error) => {
                    warn!(path = %path.display(), %error, "cannot read modification time");
                    continue;
                }
            };
            if modified >= cutoff {
                continue;
            }

            match std::fs::remove_file(&path) {
                Ok(()) => {
                    let _ = std::fs::remove_file(checksum_path(&path));
                    debug!(path = %path.display(), "purged state file");
                    removed.push(path);
                }
                Err(error) => warn!(path = %path.display(), %error, "failed to purge state file"),
            }
        }

        removed.sort();
        info!(count = removed.len(), days, pattern, "purge complete");
        Ok(removed)
    }

    fn state_files(&self) -> Result<Vec<PathBuf>, PersistenceError> {
        let entries = match std::fs::read_dir(self.state_dir()) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(PersistenceError::io(self.state_dir(), error)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| PersistenceError::io(self.state_dir(), e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = file_name(&path) else {
                continue;
            };
            if name.ends_with(".checksum") || name.ends_with(".tmp") {
                continue;
            }
            files.push(path);
        }
        Ok(files)
    }
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}

/// Compiles a file-name glob into an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex, PersistenceError> {
    let mut expr = String::with_capacity(pattern.len() * 2 + 2);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');

    Regex::new(&expr).map_err(|source| PersistenceError::Pattern {
        pattern: pattern.to_string(),
        source,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::fs::File;

    use tempfile::TempDir;

    use super::*;
    use crate::persistence::backup_path;

    fn age(path: &Path, days: u64) {
        let when = SystemTime::now() - Duration::from_secs(days * SECONDS_PER_DAY);
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(when)
            .unwrap();
    }

    #[test]
    fn test_glob_to_regex() {
        let re = glob_to_regex("run_*.json").unwrap();
        assert!(re.is_match("run_2024.json"));
        assert!(re.is_match("run_.json"));
        assert!(!re.is_match("run_2024.json.backup"));
        assert!(!re.is_match("xrun_1.json"));

        let re = glob_to_regex("a?.json").unwrap();
        assert!(re.is_match("ab.json"));
        assert!(!re.is_match("abc.json"));
    }

    #[test]
    fn test_list_matching_skips_sidecars() {
        let dir = TempDir::new().unwrap();
        let persistence = StatePersistence::new(dir.path());
        persistence.save_atomic(&dir.path().join("run_a.json"), &1).unwrap();
        persistence.save_atomic(&dir.path().join("run_b.json"), &2).unwrap();
        persistence.save_atomic(&dir.path().join("other.json"), &3).unwrap();

        let listed = persistence.list_matching("run_*.json").unwrap();
        assert_eq!(
            listed,
            vec![dir.path().join("run_a.json"), dir.path().join("run_b.json")]
        );

        let everything = persistence.list_matching("*").unwrap();
        assert_eq!(everything.len(), 3);
    }

    #[test]
    fn test_list_matching_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let persistence = StatePersistence::new(dir.path().join("nope"));
        assert!(persistence.list_matching("*").unwrap().is_empty());
    }

    #[test]
    fn test_purge_removes_only_old_files_and_sidecars() {
        let dir = TempDir::new().unwrap();
        let persistence = StatePersistence::new(dir.path());
        let old = dir.path().join("run_old.json");
        let fresh = dir.path().join("run_new.json");
        persistence.save_atomic(&old, &1).unwrap();
        persistence.save_atomic(&old, &2).unwrap();
        persistence.save_atomic(&fresh, &3).unwrap();
        age(&old, 10);
        age(&backup_path(&old), 10);

        let removed = persistence.purge_older_than("run_*.json", 7).unwrap();
        assert_eq!(removed, vec![old.clone(), backup_path(&old)]);
        assert!(!old.exists());
        assert!(!checksum_path(&old).exists());
        assert!(!backup_path(&old).exists());
        assert!(fresh.exists());
        assert!(checksum_path(&fresh).exists());
    }

    #[test]
    fn test_purge_keeps_unmatched_old_files() {
        let dir = TempDir::new().unwrap();
        let persistence = StatePersistence::new(dir.path());
        let keep = dir.path().join("config.json");
        persistence.save_atomic(&keep, &1).unwrap();
        age(&keep, 30);

        let removed = persistence.purge_older_than("run_*.json", 7).unwrap();
        assert!(removed.is_empty());
        assert!(keep.exists());
    }
}
