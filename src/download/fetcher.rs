//! Single-item fetch with validation, storage hand-off, and bounded retry.
//!
//! Per attempt: `start -> streaming -> {validated, rejected}`. Per item:
//! `pending -> attempt(1..N) -> {stored, permanent failure, exhausted}`.
//! The staged temp file is removed after every attempt whatever the outcome.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use super::client::HttpClient;
use super::error::FetchError;
use super::retry::{ErrorKind, FailurePolicy, RetryDecision, RetryPolicy, classify_error};
use super::validate::ContentValidator;
use crate::model::WorkItem;
use crate::ratelimit::IntervalLimiter;
use crate::storage::{ProgressCallback, StorageCoordinator};

/// Directory under the local tier root used for in-flight downloads.
pub const STAGING_DIR_NAME: &str = ".partial";

/// Final result of fetching one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Content validated and accepted by at least one storage tier.
    Stored {
        /// Attempts made, including the successful one.
        attempts: u32,
        /// Size of the stored content.
        bytes: u64,
    },
    /// Gave up on the item.
    Failed {
        /// Attempts made.
        attempts: u32,
        /// Classified kind of the last error.
        kind: ErrorKind,
        /// Whether the failure must never be retried.
        permanent: bool,
        /// Display text of the last error.
        message: String,
    },
}

impl FetchOutcome {
    /// Returns whether the item was stored.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Stored { .. })
    }

    /// Returns the number of attempts made.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Stored { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }
}

/// Fetches work items into a [`StorageCoordinator`].
#[derive(Debug, Clone)]
pub struct ResilientFetcher {
    client: HttpClient,
    storage: Arc<StorageCoordinator>,
    limiter: Arc<IntervalLimiter>,
    retry: RetryPolicy,
    failure_policy: FailurePolicy,
    validator: ContentValidator,
    staging_dir: PathBuf,
}

impl ResilientFetcher {
    /// Creates a fetcher with default retry, validation, and no host spacing.
    #[must_use]
    pub fn new(client: HttpClient, storage: Arc<StorageCoordinator>) -> Self {
        let staging_dir = storage.local().root().join(STAGING_DIR_NAME);
        Self {
            client,
            storage,
            limiter: Arc::new(IntervalLimiter::disabled()),
            retry: RetryPolicy::default(),
            failure_policy: FailurePolicy::default(),
            validator: ContentValidator::default(),
            staging_dir,
        }
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the permanence policy.
    #[must_use]
    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Sets the content validator.
    #[must_use]
    pub fn with_validator(mut self, validator: ContentValidator) -> Self {
        self.validator = validator;
        self
    }

    /// Sets the per-host interval limiter consulted before each attempt.
    #[must_use]
    pub fn with_interval_limiter(mut self, limiter: Arc<IntervalLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Sets the directory for in-flight downloads.
    #[must_use]
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    /// Returns the permanence policy.
    #[must_use]
    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Returns the storage coordinator.
    #[must_use]
    pub fn storage(&self) -> &Arc<StorageCoordinator> {
        &self.storage
    }

    /// Fetches `item`, retrying transient failures per the retry policy.
    ///
    /// Never returns an error: every failure is classified into the outcome.
    #[instrument(skip(self, item, progress), fields(item_id = %item.id, url = %item.url))]
    pub async fn fetch(&self, item: &WorkItem, progress: Option<&ProgressCallback>) -> FetchOutcome {
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(attempt, "attempting fetch");

            self.limiter.acquire(&item.url).await;

            let error = match self.attempt(item, progress).await {
                Ok(bytes) => {
                    info!(attempts = attempt, bytes, "item stored");
                    return FetchOutcome::Stored {
                        attempts: attempt,
                        bytes,
                    };
                }
                Err(error) => error,
            };

            let kind = classify_error(&error);
            let permanent = self.failure_policy.is_permanent(kind);
            let retry_after = error.retry_after();
            if let Some(delay) = retry_after {
                self.limiter.hold(&item.url, delay).await;
            }

            match self.retry.decide(permanent, attempt, retry_after) {
                RetryDecision::Retry {
                    delay,
                    attempt: next_attempt,
                } => {
                    info!(
                        attempt = next_attempt,
                        max_attempts = self.retry.max_attempts(),
                        delay_ms = delay.as_millis(),
                        error_kind = %kind,
                        error = %error,
                        "retrying fetch"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::DoNotRetry { reason } => {
                    warn!(
                        attempts = attempt,
                        error_kind = %kind,
                        permanent,
                        %reason,
                        error = %error,
                        "fetch failed"
                    );
                    return FetchOutcome::Failed {
                        attempts: attempt,
                        kind,
                        permanent,
                        message: error.to_string(),
                    };
                }
            }
        }
    }

    /// One attempt: stream, validate, store. The staged file is dropped (and
    /// thereby deleted) on every path out of this function.
    async fn attempt(
        &self,
        item: &WorkItem,
        progress: Option<&ProgressCallback>,
    ) -> Result<u64, FetchError> {
        let staged = self
            .client
            .fetch_to_temp(&item.url, &self.staging_dir, progress)
            .await?;

        let bytes = self
            .validator
            .validate_file(&staged.path)
            .await
            .map_err(|reason| FetchError::validation(&item.url, reason))?;

        if !self
            .storage
            .store(&item.id, &staged.path, &item.metadata, None)
            .await
        {
            return Err(FetchError::storage(&item.id));
        }
        Ok(bytes)
    }
}
