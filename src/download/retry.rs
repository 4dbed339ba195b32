//! Failure classification and retry policy.
//!
//! [`classify_error`] is the only place a [`FetchError`] is mapped onto an
//! [`ErrorKind`]. Permanence is decided from the kind by a [`FailurePolicy`],
//! and the same decision feeds the retry loop, the checkpoint's
//! `permanent_failure` flag, and the `retry_failed` filter.
//!
//! # Example
//!
//! ```
//! use collector_core::download::{
//!     ErrorKind, FailurePolicy, FetchError, RetryDecision, RetryPolicy, classify_error,
//! };
//!
//! let error = FetchError::http_status("https://example.com/a.pdf", 503, None);
//! let kind = classify_error(&error);
//! assert_eq!(kind, ErrorKind::HttpServerError);
//!
//! let permanent = FailurePolicy::default().is_permanent(kind);
//! match RetryPolicy::default().decide(permanent, 1, error.retry_after()) {
//!     RetryDecision::Retry { delay, attempt } => println!("attempt {attempt} in {delay:?}"),
//!     RetryDecision::DoNotRetry { reason } => println!("giving up: {reason}"),
//! }
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::FetchError;

/// Default attempts per item, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Classified failure kind, persisted as `error_type` in checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    /// HTTP 404.
    #[serde(rename = "http_404")]
    Http404,
    /// HTTP 403.
    #[serde(rename = "http_403")]
    Http403,
    /// HTTP 401.
    #[serde(rename = "http_401")]
    Http401,
    /// Any HTTP 5xx.
    #[serde(rename = "http_server_error")]
    HttpServerError,
    /// Request or stream timeout.
    #[serde(rename = "timeout")]
    Timeout,
    /// Connection-level failure.
    #[serde(rename = "connection_error")]
    ConnectionError,
    /// Content is provably not the expected format.
    #[serde(rename = "validation_error")]
    ValidationError,
    /// Neither storage tier accepted the content, or staging failed.
    #[serde(rename = "storage_error")]
    StorageError,
    /// Anything else, including HTTP 429 and unlisted statuses.
    #[serde(rename = "other")]
    Other,
}

impl ErrorKind {
    /// All kinds, in report order.
    pub const ALL: [Self; 9] = [
        Self::Http404,
        Self::Http403,
        Self::Http401,
        Self::HttpServerError,
        Self::Timeout,
        Self::ConnectionError,
        Self::ValidationError,
        Self::StorageError,
        Self::Other,
    ];

    /// Returns the persisted label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http404 => "http_404",
            Self::Http403 => "http_403",
            Self::Http401 => "http_401",
            Self::HttpServerError => "http_server_error",
            Self::Timeout => "timeout",
            Self::ConnectionError => "connection_error",
            Self::ValidationError => "validation_error",
            Self::StorageError => "storage_error",
            Self::Other => "other",
        }
    }

    /// Kinds that can never succeed on retry, independent of policy.
    #[must_use]
    pub fn is_inherently_permanent(self) -> bool {
        matches!(
            self,
            Self::Http404 | Self::Http403 | Self::Http401 | Self::ValidationError
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decides which kinds are permanent.
///
/// `other` is transient unless `unknown_is_permanent` is set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePolicy {
    /// Treat [`ErrorKind::Other`] as permanent.
    #[serde(default)]
    pub unknown_is_permanent: bool,
}

impl FailurePolicy {
    /// Returns whether a failure of `kind` must never be retried.
    #[must_use]
    pub fn is_permanent(&self, kind: ErrorKind) -> bool {
        match kind {
            ErrorKind::Other => self.unknown_is_permanent,
            kind => kind.is_inherently_permanent(),
        }
    }
}

/// Maps a fetch error onto its [`ErrorKind`].
#[must_use]
pub fn classify_error(error: &FetchError) -> ErrorKind {
    match error {
        FetchError::HttpStatus { status, .. } => classify_http_status(*status),
        FetchError::Timeout { .. } => ErrorKind::Timeout,
        FetchError::Connection { .. } => ErrorKind::ConnectionError,
        FetchError::Validation { .. } => ErrorKind::ValidationError,
        FetchError::Storage { .. } | FetchError::Io { .. } => ErrorKind::StorageError,
        FetchError::InvalidUrl { .. } | FetchError::ClientBuild { .. } => ErrorKind::Other,
    }
}

fn classify_http_status(status: u16) -> ErrorKind {
    match status {
        401 => ErrorKind::Http401,
        403 => ErrorKind::Http403,
        404 => ErrorKind::Http404,
        500..=599 => ErrorKind::HttpServerError,
        _ => ErrorKind::Other,
    }
}

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry.
    Fixed,
    /// `retry_delay * 2^n` where `n` counts earlier retries.
    #[default]
    Exponential,
}

/// Decision after a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after `delay`.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// The upcoming attempt number (1-indexed).
        attempt: u32,
    },
    /// Stop retrying.
    DoNotRetry {
        /// Human-readable reason.
        reason: String,
    },
}

/// Bounded retry with fixed or exponential backoff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    retry_delay: Duration,
    backoff: Backoff,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            backoff: Backoff::Exponential,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy. `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        retry_delay: Duration,
        backoff: Backoff,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_delay,
            backoff,
            max_delay,
        }
    }

    /// Returns the attempt limit.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides what follows the failure of `attempt` (1-indexed).
    ///
    /// Permanent failures stop immediately. A server-provided `retry_after`
    /// replaces the computed delay.
    #[must_use]
    pub fn decide(
        &self,
        permanent: bool,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> RetryDecision {
        if permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure".to_string(),
            };
        }
        if attempt >= self.max_attempts {
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = retry_after.unwrap_or_else(|| self.delay_after(attempt));
        debug!(
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            server_requested = retry_after.is_some(),
            "will retry"
        );
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Computed delay after the failure of `attempt` (1-indexed).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.retry_delay,
            Backoff::Exponential => {
                let exponent = attempt.saturating_sub(1).min(31);
                self.retry_delay
                    .saturating_mul(1u32 << exponent)
                    .min(self.max_delay)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_http_statuses() {
        let kind = |status| classify_error(&FetchError::http_status("u", status, None));
        assert_eq!(kind(404), ErrorKind::Http404);
        assert_eq!(kind(403), ErrorKind::Http403);
        assert_eq!(kind(401), ErrorKind::Http401);
        assert_eq!(kind(500), ErrorKind::HttpServerError);
        assert_eq!(kind(503), ErrorKind::HttpServerError);
        assert_eq!(kind(599), ErrorKind::HttpServerError);
        assert_eq!(kind(429), ErrorKind::Other);
        assert_eq!(kind(410), ErrorKind::Other);
        assert_eq!(kind(302), ErrorKind::Other);
    }

    #[test]
    fn test_classify_non_http_errors() {
        assert_eq!(classify_error(&FetchError::timeout("u")), ErrorKind::Timeout);
        assert_eq!(
            classify_error(&FetchError::validation("u", "bad magic")),
            ErrorKind::ValidationError
        );
        assert_eq!(classify_error(&FetchError::storage("p1")), ErrorKind::StorageError);
        assert_eq!(
            classify_error(&FetchError::io("/tmp/x", std::io::Error::other("disk"))),
            ErrorKind::StorageError
        );
        assert_eq!(classify_error(&FetchError::invalid_url("::")), ErrorKind::Other);
    }

    #[test]
    fn test_permanence_table() {
        let policy = FailurePolicy::default();
        let permanent: Vec<ErrorKind> = ErrorKind::ALL
            .into_iter()
            .filter(|kind| policy.is_permanent(*kind))
            .collect();
        assert_eq!(
            permanent,
            vec![
                ErrorKind::Http404,
                ErrorKind::Http403,
                ErrorKind::Http401,
                ErrorKind::ValidationError
            ]
        );
    }

    #[test]
    fn test_unknown_is_permanent_policy() {
        let strict = FailurePolicy {
            unknown_is_permanent: true,
        };
        assert!(strict.is_permanent(ErrorKind::Other));
        assert!(!strict.is_permanent(ErrorKind::Timeout));
        assert!(!FailurePolicy::default().is_permanent(ErrorKind::Other));
    }

    #[test]
    fn test_error_kind_serde_labels() {
        for kind in ErrorKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        let parsed: ErrorKind = serde_json::from_str("\"http_server_error\"").unwrap();
        assert_eq!(parsed, ErrorKind::HttpServerError);
    }

    #[test]
    fn test_permanent_failure_never_retries() {
        let policy = RetryPolicy::default();
        assert!(matches!(
            policy.decide(true, 1, None),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    #[test]
    fn test_attempts_exhausted() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10), Backoff::Fixed, Duration::from_secs(1));
        assert_eq!(
            policy.decide(false, 1, None),
            RetryDecision::Retry {
                delay: Duration::from_millis(10),
                attempt: 2
            }
        );
        assert!(matches!(
            policy.decide(false, 2, None),
            RetryDecision::DoNotRetry { reason } if reason.contains("exhausted")
        ));
    }

    #[test]
    fn test_exponential_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(
            10,
            Duration::from_millis(100),
            Backoff::Exponential,
            Duration::from_millis(500),
        );
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
        assert_eq!(policy.delay_after(4), Duration::from_millis(500));
        assert_eq!(policy.delay_after(60), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_after_overrides_computed_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.decide(false, 1, Some(Duration::from_secs(7))),
            RetryDecision::Retry {
                delay: Duration::from_secs(7),
                attempt: 2
            }
        );
    }

    #[test]
    fn test_max_attempts_minimum_is_one() {
        let policy = RetryPolicy::new(0, Duration::ZERO, Backoff::Fixed, Duration::ZERO);
        assert_eq!(policy.max_attempts(), 1);
        assert!(matches!(
            policy.decide(false, 1, None),
            RetryDecision::DoNotRetry { .. }
        ));
    }
}
