//! Batch orchestration over a bounded worker pool.
//!
//! The [`DownloadOrchestrator`] filters a work list against the checkpointed
//! [`DownloadState`], submits what remains to a semaphore-bounded set of
//! tasks, and funnels every result through one consumer task. The consumer is
//! the only writer of the state and the only periodic checkpoint writer;
//! workers talk to it exclusively through [`QueueMessage`]s.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use collector_core::download::{HttpClient, ResilientFetcher};
//! use collector_core::model::WorkItem;
//! use collector_core::orchestrator::{DownloadOrchestrator, OrchestratorConfig};
//! use collector_core::persistence::StatePersistence;
//! use collector_core::ratelimit::{AdaptiveRateLimiter, RateLimitConfig};
//! use collector_core::storage::{LocalTier, StorageCoordinator};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = Arc::new(StorageCoordinator::new(LocalTier::open("./papers")?, None));
//! let fetcher = Arc::new(ResilientFetcher::new(HttpClient::new()?, storage));
//! let limiter = Arc::new(AdaptiveRateLimiter::new(HashMap::from([(
//!     "default".to_string(),
//!     RateLimitConfig::default(),
//! )])));
//! let persistence = Arc::new(StatePersistence::new("./state"));
//! let mut orchestrator = DownloadOrchestrator::new(
//!     OrchestratorConfig::default(),
//!     fetcher,
//!     limiter,
//!     persistence,
//!     "checkpoint.json",
//! )?;
//!
//! let items = vec![WorkItem::new("p1", "https://arxiv.org/pdf/2101.00001", "A paper")];
//! let work = orchestrator.filter_work(items, false, true).await?;
//! let summary = orchestrator.run(work, None).await?;
//! println!("succeeded={} failed={}", summary.succeeded, summary.failed);
//! # Ok(())
//! # }
//! ```

mod consumer;
mod message;
mod report;
mod state;
mod status;
mod worker;

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use rand::seq::SliceRandom;
use tokio::sync::{Semaphore, mpsc, watch};
use tracing::{debug, info, instrument, warn};

pub use consumer::BatchSavedCallback;
pub use message::{ProgressPhase, QueueMessage};
pub use report::{FailureReport, KindSummary};
pub use state::{DownloadState, FailedRecord, FailureUpdate};
pub use status::{RunStatus, StatusHandle};

use consumer::Consumer;
use worker::Worker;

use crate::download::{ErrorKind, ResilientFetcher};
use crate::model::WorkItem;
use crate::persistence::{PersistenceError, StatePersistence};
use crate::ratelimit::{AdaptiveRateLimiter, RateLimitError};

/// Minimum allowed concurrency value.
pub const MIN_CONCURRENCY: usize = 1;

/// Maximum allowed concurrency value.
pub const MAX_CONCURRENCY: usize = 100;

/// Default concurrency if not specified.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default endpoint name for items that do not name one.
pub const DEFAULT_ENDPOINT: &str = "default";

/// Error type for orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Invalid concurrency value provided.
    #[error("concurrency must be between 1 and 100, got {value}")]
    InvalidConcurrency {
        /// The invalid value that was provided.
        value: usize,
    },

    /// A numeric setting that must be positive was zero.
    #[error("{field} must be at least 1")]
    ZeroSetting {
        /// The offending setting.
        field: &'static str,
    },

    /// A work item names an endpoint the limiter does not know.
    #[error(transparent)]
    RateLimit(#[from] RateLimitError),

    /// The checkpoint could not be loaded or written.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The consumer did not finish within the join timeout.
    #[error("consumer did not finish within {timeout:?}")]
    ConsumerTimeout {
        /// The configured join timeout.
        timeout: Duration,
    },

    /// The consumer task panicked.
    #[error("consumer task failed: {message}")]
    ConsumerPanicked {
        /// Join error text.
        message: String,
    },

    /// Semaphore was closed unexpectedly.
    #[error("worker semaphore closed unexpectedly")]
    SemaphoreClosed,
}

/// Tuning for [`DownloadOrchestrator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Worker pool size (1-100).
    pub concurrency: usize,
    /// Settled messages between periodic checkpoint saves.
    pub save_every: usize,
    /// How long the consumer waits on the queue before re-checking the
    /// shutdown flag.
    pub poll_interval: Duration,
    /// Bound on joining the consumer after the last worker finishes.
    pub join_timeout: Duration,
    /// Message queue capacity.
    pub channel_capacity: usize,
    /// Limiter endpoint for items without one.
    pub default_endpoint: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            save_every: 10,
            poll_interval: Duration::from_millis(100),
            join_timeout: Duration::from_secs(30),
            channel_capacity: 256,
            default_endpoint: DEFAULT_ENDPOINT.to_string(),
        }
    }
}

/// Outcome of one [`DownloadOrchestrator::run`], read from settled state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Items of this run now in `completed`.
    pub succeeded: usize,
    /// Items of this run now in `failed`.
    pub failed: usize,
    /// Of the failed items, those flagged permanent.
    pub permanent_failures: usize,
    /// Items dropped by the last [`DownloadOrchestrator::filter_work`].
    pub skipped: usize,
    /// Items never submitted because the run was cancelled.
    pub cancelled: usize,
    /// Whether the final checkpoint save succeeded.
    pub checkpoint_saved: bool,
}

/// Coordinates filtering, fetching, and checkpointing of a work list.
pub struct DownloadOrchestrator {
    config: OrchestratorConfig,
    fetcher: Arc<ResilientFetcher>,
    limiter: Arc<AdaptiveRateLimiter>,
    persistence: Arc<StatePersistence>,
    checkpoint: PathBuf,
    state: DownloadState,
    cancel: Arc<AtomicBool>,
    status: Arc<watch::Sender<RunStatus>>,
    skipped: usize,
}

impl std::fmt::Debug for DownloadOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOrchestrator")
            .field("config", &self.config)
            .field("checkpoint", &self.checkpoint)
            .field("completed", &self.state.completed().len())
            .field("failed", &self.state.failed().len())
            .finish_non_exhaustive()
    }
}

impl DownloadOrchestrator {
    /// Creates an orchestrator. `checkpoint` is resolved against the
    /// persistence state directory unless absolute.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::InvalidConcurrency`] if the value is
    /// outside 1-100, and [`OrchestratorError::ZeroSetting`] for a zero
    /// `save_every` or `channel_capacity`.
    #[instrument(level = "debug", skip(fetcher, limiter, persistence, checkpoint))]
    pub fn new(
        config: OrchestratorConfig,
        fetcher: Arc<ResilientFetcher>,
        limiter: Arc<AdaptiveRateLimiter>,
        persistence: Arc<StatePersistence>,
        checkpoint: impl AsRef<Path>,
    ) -> Result<Self, OrchestratorError> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&config.concurrency) {
            return Err(OrchestratorError::InvalidConcurrency {
                value: config.concurrency,
            });
        }
        if config.save_every == 0 {
            return Err(OrchestratorError::ZeroSetting {
                field: "save_every",
            });
        }
        if config.channel_capacity == 0 {
            return Err(OrchestratorError::ZeroSetting {
                field: "channel_capacity",
            });
        }

        let checkpoint = persistence.state_dir().join(checkpoint.as_ref());
        let (status, _) = watch::channel(RunStatus::default());
        Ok(Self {
            config,
            fetcher,
            limiter,
            persistence,
            checkpoint,
            state: DownloadState::new(),
            cancel: Arc::new(AtomicBool::new(false)),
            status: Arc::new(status),
            skipped: 0,
        })
    }

    /// Returns the checkpoint path.
    #[must_use]
    pub fn checkpoint_path(&self) -> &Path {
        &self.checkpoint
    }

    /// Returns the in-memory state. Settled between runs.
    #[must_use]
    pub fn state(&self) -> &DownloadState {
        &self.state
    }

    /// Returns a flag that stops submission when set. In-flight items finish.
    ///
    /// A flag set before [`Self::run`] starts cancels that run. It is cleared
    /// once the run stops submitting.
    #[must_use]
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Returns a reader of the live run status.
    #[must_use]
    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle::new(self.status.subscribe())
    }

    /// Reads the persisted checkpoint, recovering from backup if needed.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Corrupted`] when neither the checkpoint
    /// nor its backup is usable.
    pub fn load_checkpoint(&self) -> Result<Option<DownloadState>, OrchestratorError> {
        Ok(self.persistence.load(&self.checkpoint)?)
    }

    /// Merges the persisted checkpoint into the in-memory state and returns
    /// ids left `in_progress` by an interrupted run to pending.
    ///
    /// Returns whether a checkpoint existed.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Corrupted`] when neither the checkpoint
    /// nor its backup is usable.
    pub fn restore_checkpoint(&mut self) -> Result<bool, OrchestratorError> {
        let saved = self.load_checkpoint()?;
        let found = saved.is_some();
        if let Some(saved) = saved {
            debug!(
                completed = saved.completed().len(),
                failed = saved.failed().len(),
                "merging checkpoint"
            );
            self.state.merge(saved);
        }
        let recovered = self.state.recover_interrupted();
        if !recovered.is_empty() {
            info!(count = recovered.len(), "recovered items from interrupted run");
        }
        Ok(found)
    }

    /// Writes the in-memory state to the checkpoint.
    ///
    /// # Errors
    ///
    /// Returns the persistence error of a failed save.
    pub fn save_checkpoint(&mut self) -> Result<(), OrchestratorError> {
        self.state.touch(Utc::now());
        self.persistence.save_atomic(&self.checkpoint, &self.state)?;
        Ok(())
    }

    /// Drops items that need no work this run.
    ///
    /// The checkpoint is always read first. With `resume` it is merged in
    /// whole and ids left in `in_progress` by an interrupted run return to
    /// pending. Without `resume` only its failure history is merged; its
    /// completed ids are carried so the next save keeps them, but listed
    /// items are checked against storage afresh. Then:
    ///
    /// - permanent failures are always dropped, even with `retry_failed`
    /// - completed items are dropped if storage verifies them, re-queued
    ///   otherwise
    /// - failed items are dropped unless `retry_failed`
    /// - unseen items already present in storage are marked completed and
    ///   dropped
    /// - repeated ids are dropped
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Corrupted`] when the checkpoint and its
    /// backup are both unusable.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn filter_work(
        &mut self,
        items: Vec<WorkItem>,
        retry_failed: bool,
        resume: bool,
    ) -> Result<Vec<WorkItem>, OrchestratorError> {
        let mut carried = BTreeSet::new();
        if resume {
            self.restore_checkpoint()?;
        } else if let Some(saved) = self.load_checkpoint()? {
            let (history, completed) = saved.split_completed();
            debug!(
                failed = history.failed().len(),
                completed = completed.len(),
                "merging failure history"
            );
            self.state.merge(history);
            carried = completed;
        }

        let storage = Arc::clone(self.fetcher.storage());
        let mut seen = HashSet::new();
        let mut work = Vec::with_capacity(items.len());
        let mut skipped = 0usize;

        for item in items {
            if !seen.insert(item.id.clone()) {
                debug!(item_id = %item.id, "duplicate item dropped");
                skipped += 1;
                continue;
            }
            if self.state.is_permanent(&item.id) {
                debug!(item_id = %item.id, "permanent failure skipped");
                skipped += 1;
                continue;
            }
            if self.state.completed().contains(&item.id) {
                if storage.verify(&item.id).await {
                    skipped += 1;
                } else {
                    warn!(item_id = %item.id, "completed item missing from storage, re-queueing");
                    self.state.requeue(&item.id);
                    work.push(item);
                }
                continue;
            }
            if self.state.failed().contains_key(&item.id) {
                if retry_failed {
                    work.push(item);
                } else {
                    skipped += 1;
                }
                continue;
            }

            let (present, location) = storage.exists(&item.id).await;
            if present {
                debug!(item_id = %item.id, %location, "already stored, marking completed");
                self.state.mark_completed(&item.id);
                skipped += 1;
                continue;
            }
            work.push(item);
        }

        for id in carried {
            if !seen.contains(&id)
                && !self.state.failed().contains_key(&id)
                && !self.state.in_progress().contains(&id)
            {
                self.state.mark_completed(&id);
            }
        }

        self.skipped = skipped;
        info!(work = work.len(), skipped, retry_failed, "filtered work list");
        Ok(work)
    }

    /// Fetches `items` and returns counts read from the settled state.
    ///
    /// Items are shuffled, then submitted one by one after sleeping the
    /// limiter's wait time for their endpoint. `on_batch_saved` runs after
    /// each periodic checkpoint. A failed final save is logged and reported
    /// through [`RunSummary::checkpoint_saved`].
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::RateLimit`] before any work starts if an
    /// item names an unknown endpoint, and [`OrchestratorError::ConsumerTimeout`]
    /// or [`OrchestratorError::ConsumerPanicked`] if the consumer cannot be
    /// joined. In those two cases the in-memory state is reloaded from the
    /// last checkpoint.
    #[instrument(skip(self, items, on_batch_saved), fields(items = items.len()))]
    pub async fn run(
        &mut self,
        items: Vec<WorkItem>,
        on_batch_saved: Option<BatchSavedCallback>,
    ) -> Result<RunSummary, OrchestratorError> {
        for item in &items {
            let endpoint = self.endpoint_for(item);
            if !self.limiter.has_endpoint(endpoint) {
                return Err(RateLimitError::UnknownEndpoint {
                    name: endpoint.to_string(),
                }
                .into());
            }
        }

        let mut work = items;
        work.shuffle(&mut rand::thread_rng());
        let run_ids: Vec<String> = work.iter().map(|item| item.id.clone()).collect();

        info!(
            items = work.len(),
            concurrency = self.config.concurrency,
            "starting run"
        );

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let consumer = Consumer {
            state: std::mem::take(&mut self.state),
            rx,
            persistence: Arc::clone(&self.persistence),
            checkpoint: self.checkpoint.clone(),
            save_every: self.config.save_every,
            poll_interval: self.config.poll_interval,
            shutdown: Arc::clone(&shutdown),
            status: Arc::clone(&self.status),
            on_batch_saved,
            total: work.len(),
        };
        let mut consumer_handle = tokio::spawn(consumer.run());

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut handles = Vec::with_capacity(work.len());
        let mut cancelled = 0usize;
        let mut submit_error = None;

        let mut pending = work.into_iter();
        while let Some(item) = pending.next() {
            if self.cancel.load(Ordering::SeqCst) {
                cancelled = 1 + pending.len();
                info!(cancelled, "run cancelled, no further submissions");
                break;
            }

            let endpoint = self.endpoint_for(&item).to_string();
            match self.limiter.wait_time(&endpoint, 1) {
                Ok(wait) if !wait.is_zero() => {
                    debug!(
                        item_id = %item.id,
                        %endpoint,
                        delay_ms = wait.as_millis(),
                        "rate limit wait"
                    );
                    tokio::time::sleep(wait).await;
                }
                Ok(_) => {}
                Err(error) => warn!(%error, "rate limiter lookup failed"),
            }

            let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                cancelled = 1 + pending.len();
                submit_error = Some(OrchestratorError::SemaphoreClosed);
                break;
            };

            let fallback = FailureUpdate {
                id: item.id.clone(),
                title: item.title().to_string(),
                url: item.url.clone(),
                message: String::new(),
                kind: ErrorKind::Other,
                attempts: 1,
                permanent: self.fetcher.failure_policy().is_permanent(ErrorKind::Other),
            };
            let worker = Worker {
                fetcher: Arc::clone(&self.fetcher),
                limiter: Arc::clone(&self.limiter),
                tx: tx.clone(),
            };
            handles.push((
                fallback,
                tokio::spawn(worker.process(item, endpoint, permit)),
            ));
        }

        // Submission is over; a later request applies to the next run.
        self.cancel.store(false, Ordering::SeqCst);

        debug!(task_count = handles.len(), "waiting for workers");
        for (mut fallback, handle) in handles {
            if let Err(error) = handle.await {
                warn!(item_id = %fallback.id, %error, "worker task panicked");
                fallback.message = format!("worker task failed: {error}");
                if tx.send(QueueMessage::Failed(fallback)).await.is_err() {
                    warn!("consumer gone, worker failure not recorded");
                }
            }
        }

        shutdown.store(true, Ordering::SeqCst);
        // The consumer may already have exited on the flag.
        let _ = tx.send(QueueMessage::Stop).await;
        drop(tx);

        let timeout = self.config.join_timeout;
        let joined = tokio::time::timeout(timeout, &mut consumer_handle).await;
        let state = match joined {
            Ok(Ok(state)) => state,
            Ok(Err(error)) => {
                self.reload_after_consumer_loss();
                return Err(OrchestratorError::ConsumerPanicked {
                    message: error.to_string(),
                });
            }
            Err(_elapsed) => {
                consumer_handle.abort();
                self.reload_after_consumer_loss();
                return Err(OrchestratorError::ConsumerTimeout { timeout });
            }
        };
        self.state = state;

        let checkpoint_saved = self.final_save().await;
        if let Some(error) = submit_error {
            return Err(error);
        }

        let summary = self.summarize(&run_ids, cancelled, checkpoint_saved);
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            permanent = summary.permanent_failures,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            "run complete"
        );
        Ok(summary)
    }

    /// Writes the failure report as pretty JSON.
    ///
    /// Defaults to `failed_papers_<timestamp>.json` in the state directory.
    /// Returns `None` without writing when there are no failures.
    ///
    /// # Errors
    ///
    /// Returns the persistence error of a failed write.
    #[instrument(skip(self))]
    pub fn export_failures(
        &self,
        path: Option<&Path>,
    ) -> Result<Option<PathBuf>, OrchestratorError> {
        let report = FailureReport::from_state(&self.state, Utc::now());
        if report.is_empty() {
            debug!("no failures to export");
            return Ok(None);
        }

        let path = match path {
            Some(path) => path.to_path_buf(),
            None => self.persistence.state_dir().join(format!(
                "failed_papers_{}.json",
                report.generated_at.format("%Y%m%d_%H%M%S")
            )),
        };
        self.persistence.save_atomic(&path, &report)?;
        info!(
            path = %path.display(),
            total = report.total_failures,
            permanent = report.permanent_failures,
            "exported failure report"
        );
        Ok(Some(path))
    }

    /// Drops the permanent failure record of `id` and saves the checkpoint.
    /// Returns whether a permanent record existed.
    ///
    /// # Errors
    ///
    /// Returns the persistence error of a failed save.
    #[instrument(skip(self))]
    pub fn clear_permanent_failure(&mut self, id: &str) -> Result<bool, OrchestratorError> {
        if !self.state.clear_permanent(id) {
            return Ok(false);
        }
        info!(item_id = id, "cleared permanent failure");
        self.save_checkpoint()?;
        Ok(true)
    }

    fn endpoint_for<'a>(&'a self, item: &'a WorkItem) -> &'a str {
        item.endpoint
            .as_deref()
            .unwrap_or(&self.config.default_endpoint)
    }

    async fn final_save(&mut self) -> bool {
        self.state.touch(Utc::now());
        let snapshot = self.state.clone();
        let persistence = Arc::clone(&self.persistence);
        let path = self.checkpoint.clone();

        match tokio::task::spawn_blocking(move || persistence.save_atomic(&path, &snapshot)).await
        {
            Ok(Ok(())) => true,
            Ok(Err(error)) => {
                warn!(%error, "final checkpoint save failed");
                false
            }
            Err(error) => {
                warn!(%error, "final checkpoint save task failed");
                false
            }
        }
    }

    fn reload_after_consumer_loss(&mut self) {
        self.state = match self.persistence.load(&self.checkpoint) {
            Ok(Some(state)) => state,
            Ok(None) => DownloadState::new(),
            Err(error) => {
                warn!(%error, "could not reload checkpoint after consumer loss");
                DownloadState::new()
            }
        };
    }

    fn summarize(
        &self,
        run_ids: &[String],
        cancelled: usize,
        checkpoint_saved: bool,
    ) -> RunSummary {
        let mut summary = RunSummary {
            skipped: self.skipped,
            cancelled,
            checkpoint_saved,
            ..RunSummary::default()
        };
        for id in run_ids {
            if self.state.completed().contains(id) {
                summary.succeeded += 1;
            } else if self.state.failed().contains_key(id) {
                summary.failed += 1;
                if self.state.is_permanent(id) {
                    summary.permanent_failures += 1;
                }
            }
        }
        summary
    }
}
