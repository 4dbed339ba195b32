//! Streaming file copy shared by the storage tiers.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};

use super::{ProgressCallback, StorageError};
use crate::persistence::hex_digest;

const CHUNK_SIZE: usize = 64 * 1024;

/// Result of a completed copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Copied {
    pub(crate) bytes: u64,
    pub(crate) sha256: String,
}

/// Copies `source` to `dest` through a sibling temp file, hashing on the way.
///
/// `dest` only appears once the copy is complete and synced.
pub(crate) async fn copy_hashed(
    source: &Path,
    dest: &Path,
    progress: Option<&ProgressCallback>,
) -> Result<Copied, StorageError> {
    let staging = staging_path(dest);
    let result = copy_into(source, &staging, progress).await;
    match result {
        Ok(copied) => {
            tokio::fs::rename(&staging, dest)
                .await
                .map_err(|e| StorageError::io(dest, e))?;
            Ok(copied)
        }
        Err(error) => {
            let _ = tokio::fs::remove_file(&staging).await;
            Err(error)
        }
    }
}

/// Computes size and SHA-256 of a file without loading it whole.
pub(crate) async fn hash_file(path: &Path) -> Result<Copied, StorageError> {
    let mut file = File::open(path)
        .await
        .map_err(|e| StorageError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut bytes = 0u64;
    loop {
        let read = file
            .read(&mut buffer)
            .await
            .map_err(|e| StorageError::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        bytes += read as u64;
    }
    Ok(Copied {
        bytes,
        sha256: hex_digest(&hasher.finalize()),
    })
}

async fn copy_into(
    source: &Path,
    staging: &Path,
    progress: Option<&ProgressCallback>,
) -> Result<Copied, StorageError> {
    let mut input = File::open(source)
        .await
        .map_err(|e| StorageError::io(source, e))?;
    let total = input.metadata().await.ok().map(|meta| meta.len());
    let output = File::create(staging)
        .await
        .map_err(|e| StorageError::io(staging, e))?;
    let mut writer = BufWriter::new(output);

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut bytes = 0u64;
    loop {
        let read = input
            .read(&mut buffer)
            .await
            .map_err(|e| StorageError::io(source, e))?;
        if read == 0 {
            break;
        }
        writer
            .write_all(&buffer[..read])
            .await
            .map_err(|e| StorageError::io(staging, e))?;
        hasher.update(&buffer[..read]);
        bytes += read as u64;
        if let Some(callback) = progress {
            callback(bytes, total);
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| StorageError::io(staging, e))?;
    writer
        .get_ref()
        .sync_all()
        .await
        .map_err(|e| StorageError::io(staging, e))?;

    Ok(Copied {
        bytes,
        sha256: hex_digest(&hasher.finalize()),
    })
}

/// Returns a unique hidden temp path next to `dest`.
pub(crate) fn staging_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{name}.{}.tmp", rand::random::<u32>()))
}
