//! Error types for state persistence.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while saving, loading, or housekeeping persisted state.
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// The value could not be serialized; nothing was written.
    #[error("failed to serialize state for {path}: {source}")]
    Serialize {
        /// Target path of the aborted save.
        path: PathBuf,
        /// The underlying serializer error.
        #[source]
        source: serde_json::Error,
    },

    /// File system error.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Both the primary file and its backup are unusable.
    #[error("state file {path} is corrupted and no usable backup exists: {reason}")]
    Corrupted {
        /// The primary state file.
        path: PathBuf,
        /// Why the primary file was rejected.
        reason: String,
    },

    /// A housekeeping glob could not be compiled.
    #[error("invalid file pattern {pattern:?}: {source}")]
    Pattern {
        /// The rejected glob.
        pattern: String,
        /// The underlying regex error.
        #[source]
        source: regex::Error,
    },
}

impl PersistenceError {
    /// Creates an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a corruption error.
    pub fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corrupted {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Returns whether this error means on-disk state is unrecoverable.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupted { .. })
    }
}
