//! Error types for single-item fetches.
//!
//! Every variant carries the context (URL, path) needed to act on it. There
//! are no blanket `From` conversions; use the constructor helpers.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by one fetch attempt.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Non-200 response.
    #[error("HTTP {status} fetching {url}{}", body_suffix(.body.as_deref()))]
    HttpStatus {
        /// The requested URL.
        url: String,
        /// The response status code.
        status: u16,
        /// Short prefix of the response body, if any.
        body: Option<String>,
        /// Parsed `Retry-After` delay, if the server sent one.
        retry_after: Option<Duration>,
    },

    /// The request or body stream timed out.
    #[error("timeout fetching {url}")]
    Timeout {
        /// The requested URL.
        url: String,
    },

    /// Connection-level failure (DNS, refused, reset, TLS).
    #[error("connection error fetching {url}: {source}")]
    Connection {
        /// The requested URL.
        url: String,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// The body arrived but is not the expected content.
    #[error("validation failed for {url}: {reason}")]
    Validation {
        /// The requested URL.
        url: String,
        /// What the validator rejected.
        reason: String,
    },

    /// Neither storage tier accepted the validated content.
    #[error("no storage tier accepted item {id}")]
    Storage {
        /// The item identifier.
        id: String,
    },

    /// Local file system error while staging the download.
    #[error("IO error on {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The URL could not be parsed.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {source}")]
    ClientBuild {
        /// The underlying builder error.
        #[source]
        source: reqwest::Error,
    },
}

fn body_suffix(body: Option<&str>) -> String {
    body.map(|text| format!(": {text}")).unwrap_or_default()
}

impl FetchError {
    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16, body: Option<String>) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            body,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error carrying a server-requested delay.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        body: Option<String>,
        retry_after: Option<Duration>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            body,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Maps a client error onto [`FetchError::Timeout`] or
    /// [`FetchError::Connection`].
    pub fn transport(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::timeout(url)
        } else {
            Self::Connection {
                url: url.into(),
                source,
            }
        }
    }

    /// Creates a validation error.
    pub fn validation(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a storage error.
    pub fn storage(id: impl Into<String>) -> Self {
        Self::Storage { id: id.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Returns the server-requested delay, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::HttpStatus { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_status_display_includes_body() {
        let error = FetchError::http_status(
            "https://example.com/a.pdf",
            404,
            Some("no such paper".to_string()),
        );
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected status in: {msg}");
        assert!(msg.contains("https://example.com/a.pdf"), "Expected URL in: {msg}");
        assert!(msg.ends_with(": no such paper"), "Expected body in: {msg}");
    }

    #[test]
    fn test_http_status_display_without_body() {
        let msg = FetchError::http_status("https://example.com/a.pdf", 503, None).to_string();
        assert!(msg.ends_with("https://example.com/a.pdf"), "Unexpected suffix in: {msg}");
    }

    #[test]
    fn test_retry_after_only_on_http_status() {
        let delayed = FetchError::http_status_with_retry_after(
            "https://example.com",
            503,
            None,
            Some(Duration::from_secs(5)),
        );
        assert_eq!(delayed.retry_after(), Some(Duration::from_secs(5)));
        assert_eq!(FetchError::timeout("https://example.com").retry_after(), None);
    }

    #[test]
    fn test_validation_display() {
        let msg = FetchError::validation("https://example.com", "missing %PDF header").to_string();
        assert!(msg.contains("validation failed"));
        assert!(msg.contains("missing %PDF header"));
    }
}
