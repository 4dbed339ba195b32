//! HTTP client wrapper for streaming downloads.
//!
//! [`HttpClient`] issues one GET per call and streams the body into a temp
//! file that deletes itself on drop, so callers get always-cleanup for free.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{CONTENT_LENGTH, RETRY_AFTER};
use tempfile::TempPath;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};
use url::Url;

use super::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_USER_AGENT, MAX_ERROR_BODY_CHARS, READ_TIMEOUT_SECS,
};
use super::error::FetchError;
use crate::ratelimit::parse_retry_after;
use crate::storage::ProgressCallback;

/// Body excerpt bytes read from an error response.
const ERROR_BODY_READ_LIMIT: usize = 2048;

/// HTTP client for streaming downloads.
///
/// Create once and share; the underlying connection pool is reused.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

/// A body streamed to a self-deleting temp file.
#[derive(Debug)]
pub struct StagedDownload {
    /// Temp file holding the body. Removed when dropped.
    pub path: TempPath,
    /// Bytes written.
    pub bytes: u64,
}

impl HttpClient {
    /// Creates a client with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::ClientBuild`] when the TLS backend cannot be
    /// initialized.
    pub fn new() -> Result<Self, FetchError> {
        Self::with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
    }

    /// Creates a client with explicit connect and per-request timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::ClientBuild`] when the client cannot be built.
    pub fn with_timeouts(connect: Duration, request: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(connect)
            .timeout(request)
            .gzip(true)
            .user_agent(DEFAULT_USER_AGENT)
            .build()
            .map_err(|source| FetchError::ClientBuild { source })?;
        Ok(Self { client })
    }

    /// Streams `url` into a temp file under `staging_dir`.
    ///
    /// `progress` receives `(bytes_so_far, content_length)` after each chunk.
    ///
    /// # Errors
    ///
    /// - [`FetchError::InvalidUrl`] when `url` does not parse
    /// - [`FetchError::HttpStatus`] for any status other than 200
    /// - [`FetchError::Timeout`] / [`FetchError::Connection`] for transport
    ///   failures, including mid-stream
    /// - [`FetchError::Io`] when the temp file cannot be written
    #[instrument(skip(self, staging_dir, progress), fields(url = %url))]
    pub async fn fetch_to_temp(
        &self,
        url: &str,
        staging_dir: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<StagedDownload, FetchError> {
        Url::parse(url).map_err(|_| FetchError::invalid_url(url))?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::transport(url, e))?;

        let status = response.status().as_u16();
        if status != 200 {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_retry_after);
            let body = read_body_excerpt(response).await;
            debug!(status, "non-200 response");
            return Err(FetchError::http_status_with_retry_after(
                url,
                status,
                body,
                retry_after,
            ));
        }

        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok());

        tokio::fs::create_dir_all(staging_dir)
            .await
            .map_err(|e| FetchError::io(staging_dir, e))?;
        let temp = tempfile::Builder::new()
            .prefix(".fetch-")
            .suffix(".part")
            .tempfile_in(staging_dir)
            .map_err(|e| FetchError::io(staging_dir, e))?;
        let (file, path) = temp.into_parts();

        let bytes = stream_to_file(
            tokio::fs::File::from_std(file),
            response,
            url,
            &path,
            content_length,
            progress,
        )
        .await?;

        debug!(bytes, "body staged");
        Ok(StagedDownload { path, bytes })
    }
}

/// Streams the response body to `file`, returning bytes written.
async fn stream_to_file(
    file: tokio::fs::File,
    response: reqwest::Response,
    url: &str,
    file_path: &Path,
    content_length: Option<u64>,
    progress: Option<&ProgressCallback>,
) -> Result<u64, FetchError> {
    let mut writer = BufWriter::new(file);
    let mut stream = response.bytes_stream();
    let mut bytes_written: u64 = 0;

    while let Some(chunk_result) = stream.next().await {
        let chunk = chunk_result.map_err(|e| FetchError::transport(url, e))?;

        writer
            .write_all(&chunk)
            .await
            .map_err(|e| FetchError::io(file_path, e))?;

        bytes_written += chunk.len() as u64;
        if let Some(callback) = progress {
            callback(bytes_written, content_length);
        }
    }

    writer
        .flush()
        .await
        .map_err(|e| FetchError::io(file_path, e))?;

    Ok(bytes_written)
}

/// Reads a short, trimmed excerpt of an error body. `None` when empty.
async fn read_body_excerpt(response: reqwest::Response) -> Option<String> {
    let mut stream = response.bytes_stream();
    let mut buffer = Vec::new();
    while buffer.len() < ERROR_BODY_READ_LIMIT {
        match stream.next().await {
            Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
            _ => break,
        }
    }
    buffer.truncate(ERROR_BODY_READ_LIMIT);

    let text = String::from_utf8_lossy(&buffer);
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    Some(collapsed.chars().take(MAX_ERROR_BODY_CHARS).collect())
}
