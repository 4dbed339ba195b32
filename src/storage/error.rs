//! Error types for the storage tiers.

use std::path::PathBuf;

use thiserror::Error;

use crate::persistence::PersistenceError;

/// Errors raised by the local tier, a remote backend, or the coordinator.
#[derive(Debug, Error)]
pub enum StorageError {
    /// File system error in the local tier or a directory-backed remote.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A remote backend operation failed.
    #[error("remote {operation} failed for {id}: {message}")]
    Remote {
        /// The backend operation (`upload`, `download`, ...).
        operation: &'static str,
        /// The item identifier, or `*` for backend-wide operations.
        id: String,
        /// Backend-provided detail.
        message: String,
    },

    /// The item is in neither tier.
    #[error("item {id} is not stored in any tier")]
    NotFound {
        /// The missing item identifier.
        id: String,
    },

    /// The local metadata index could not be saved or loaded.
    #[error(transparent)]
    Index(#[from] PersistenceError),
}

impl StorageError {
    /// Creates an IO error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a remote backend error.
    pub fn remote(
        operation: &'static str,
        id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Remote {
            operation,
            id: id.into(),
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }
}
