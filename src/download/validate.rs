//! Content validation of a completed download.

use std::path::Path;

use tokio::io::AsyncReadExt;

use super::constants::{DEFAULT_MIN_SIZE_BYTES, ERROR_PAGE_MARKERS, PDF_MAGIC, SNIFF_BYTES};

/// Rejects downloads that are too small, lack the expected magic prefix, or
/// look like an error page served with a success status.
///
/// Error-page markers are only scanned when the magic prefix is absent, so
/// document text never triggers them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentValidator {
    min_size: u64,
    magic: Vec<u8>,
}

impl Default for ContentValidator {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_SIZE_BYTES,
            magic: PDF_MAGIC.to_vec(),
        }
    }
}

impl ContentValidator {
    /// Creates a validator. An empty `magic` disables the prefix check.
    #[must_use]
    pub fn new(min_size: u64, magic: impl Into<Vec<u8>>) -> Self {
        Self {
            min_size,
            magic: magic.into(),
        }
    }

    /// Returns the minimum accepted size.
    #[must_use]
    pub fn min_size(&self) -> u64 {
        self.min_size
    }

    /// Validates the file at `path`. `Err` carries the rejection reason.
    ///
    /// # Errors
    ///
    /// Returns the reason the content was rejected. Unreadable files are
    /// reported as rejections too.
    pub async fn validate_file(&self, path: &Path) -> Result<u64, String> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| format!("cannot read download: {e}"))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| format!("cannot stat download: {e}"))?
            .len();

        let mut head = Vec::with_capacity(SNIFF_BYTES);
        (&mut file)
            .take(SNIFF_BYTES as u64)
            .read_to_end(&mut head)
            .await
            .map_err(|e| format!("cannot read download: {e}"))?;

        self.validate_bytes(size, &head)?;
        Ok(size)
    }

    /// Validates a body of `size` bytes whose first bytes are `head`.
    ///
    /// # Errors
    ///
    /// Returns the rejection reason.
    pub fn validate_bytes(&self, size: u64, head: &[u8]) -> Result<(), String> {
        if size < self.min_size {
            return Err(format!(
                "file too small: {size} bytes (minimum {})",
                self.min_size
            ));
        }

        let sniff = &head[..head.len().min(SNIFF_BYTES)];
        let has_magic = !self.magic.is_empty() && sniff.starts_with(&self.magic);
        if has_magic {
            return Ok(());
        }

        let text = String::from_utf8_lossy(sniff).to_lowercase();
        if let Some(marker) = ERROR_PAGE_MARKERS
            .iter()
            .find(|marker| text.contains(*marker))
        {
            return Err(format!("error page detected (found {marker:?})"));
        }

        if !self.magic.is_empty() {
            return Err(format!(
                "unexpected content: missing {:?} header",
                String::from_utf8_lossy(&self.magic)
            ));
        }
        Ok(())
    }
}
