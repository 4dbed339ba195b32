//! Resilient single-item fetching.
//!
//! This module streams a remote PDF to a staged temp file, validates it,
//! hands it to the [`StorageCoordinator`](crate::storage::StorageCoordinator),
//! and retries transient failures.
//!
//! # Features
//!
//! - Streaming downloads with progress callbacks
//! - Size, magic-number, and error-page validation
//! - One classification function ([`classify_error`]) feeding retry and
//!   checkpoint decisions
//! - Fixed or exponential backoff, with `Retry-After` honored
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use collector_core::download::{HttpClient, ResilientFetcher};
//! use collector_core::model::WorkItem;
//! use collector_core::storage::{LocalTier, StorageCoordinator};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Arc::new(StorageCoordinator::new(LocalTier::open("./papers")?, None));
//! let fetcher = ResilientFetcher::new(HttpClient::new()?, storage);
//! let item = WorkItem::new("p1", "https://arxiv.org/pdf/2101.00001", "A paper");
//! let outcome = fetcher.fetch(&item, None).await;
//! println!("stored={} attempts={}", outcome.is_success(), outcome.attempts());
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod error;
mod fetcher;
mod retry;
mod validate;

pub use client::{HttpClient, StagedDownload};
pub use error::FetchError;
pub use fetcher::{FetchOutcome, ResilientFetcher, STAGING_DIR_NAME};
pub use retry::{
    Backoff, DEFAULT_MAX_ATTEMPTS, ErrorKind, FailurePolicy, RetryDecision, RetryPolicy,
    classify_error,
};
pub use validate::ContentValidator;
