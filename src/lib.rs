//! Collector Core Library
//!
//! This library fetches large batches of remote PDFs resiliently and keeps a
//! checkpoint of every outcome, so interrupted runs resume without repeating
//! finished work or retrying what can never succeed.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`model`] - Work items and their reporting metadata
//! - [`ratelimit`] - Adaptive per-endpoint limits and per-host spacing
//! - [`persistence`] - Atomic, checksum-verified JSON state files
//! - [`storage`] - Local and remote storage tiers behind one coordinator
//! - [`download`] - Streaming fetch, validation, classification, and retry
//! - [`orchestrator`] - Worker pool, single-writer consumer, and checkpoints
//! - [`config`] - File configuration with defaults and validation

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;
pub mod model;
pub mod orchestrator;
pub mod persistence;
pub mod ratelimit;
pub mod storage;

// Re-export commonly used types
pub use config::{CollectorConfig, ConfigError};
pub use download::{
    ErrorKind, FailurePolicy, FetchError, FetchOutcome, HttpClient, ResilientFetcher,
    RetryPolicy, classify_error,
};
pub use model::{ItemMetadata, WorkItem};
pub use orchestrator::{
    DownloadOrchestrator, DownloadState, FailedRecord, FailureReport, OrchestratorConfig,
    OrchestratorError, RunSummary,
};
pub use persistence::{PersistenceError, StatePersistence};
pub use ratelimit::{AdaptiveRateLimiter, IntervalLimiter, RateLimitConfig, RateLimitError};
pub use storage::{DirectoryRemote, LocalTier, RemoteStorage, StorageCoordinator, StorageError};
