//! The single consumer task: sole mutator of [`DownloadState`] and sole
//! checkpoint writer while a run is active.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use super::message::{ProgressPhase, QueueMessage};
use super::state::DownloadState;
use super::status::RunStatus;
use crate::persistence::StatePersistence;

/// Callback invoked with the state after each successful periodic save.
pub type BatchSavedCallback = Arc<dyn Fn(&DownloadState) + Send + Sync>;

pub(crate) struct Consumer {
    pub(crate) state: DownloadState,
    pub(crate) rx: mpsc::Receiver<QueueMessage>,
    pub(crate) persistence: Arc<StatePersistence>,
    pub(crate) checkpoint: PathBuf,
    pub(crate) save_every: usize,
    pub(crate) poll_interval: Duration,
    pub(crate) shutdown: Arc<AtomicBool>,
    pub(crate) status: Arc<watch::Sender<RunStatus>>,
    pub(crate) on_batch_saved: Option<BatchSavedCallback>,
    pub(crate) total: usize,
}

struct Progress {
    status: RunStatus,
    unsaved: usize,
}

impl Consumer {
    /// Drains messages until `Stop`, the shutdown flag, or channel closure,
    /// then returns the settled state.
    pub(crate) async fn run(mut self) -> DownloadState {
        let mut progress = Progress {
            status: RunStatus {
                total: self.total,
                running: true,
                ..RunStatus::default()
            },
            unsaved: 0,
        };
        self.status.send_replace(progress.status);
        debug!(total = self.total, "consumer started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                debug!("shutdown flag observed");
                break;
            }
            match tokio::time::timeout(self.poll_interval, self.rx.recv()).await {
                Ok(Some(QueueMessage::Stop)) => {
                    debug!("stop message received");
                    break;
                }
                Ok(Some(message)) => self.apply(message, &mut progress).await,
                Ok(None) => {
                    debug!("all senders dropped");
                    break;
                }
                Err(_elapsed) => {}
            }
        }

        self.drain(&mut progress).await;

        progress.status.running = false;
        self.status.send_replace(progress.status);
        info!(
            processed = progress.status.processed,
            succeeded = progress.status.succeeded,
            failed = progress.status.failed,
            "consumer finished"
        );
        self.state
    }

    /// Applies everything still buffered so no completion is lost.
    async fn drain(&mut self, progress: &mut Progress) {
        let mut drained = 0usize;
        while let Ok(message) = self.rx.try_recv() {
            if matches!(message, QueueMessage::Stop) {
                continue;
            }
            drained += 1;
            self.apply(message, progress).await;
        }
        if drained > 0 {
            debug!(drained, "applied buffered messages after stop");
        }
    }

    async fn apply(&mut self, message: QueueMessage, progress: &mut Progress) {
        let settles = message.is_terminal();
        match message {
            QueueMessage::Progress {
                id,
                phase: ProgressPhase::Started,
                ..
            } => {
                self.state.mark_in_progress(&id);
                trace!(item_id = %id, "item started");
            }
            QueueMessage::Progress {
                id, bytes, rate, ..
            } => {
                trace!(item_id = %id, bytes, rate, "item progress");
            }
            QueueMessage::Completed { id, attempts, bytes } => {
                self.state.mark_completed(&id);
                progress.status.succeeded += 1;
                progress.status.bytes_received += bytes;
                debug!(item_id = %id, attempts, bytes, "item completed");
            }
            QueueMessage::Failed(update) => {
                debug!(
                    item_id = %update.id,
                    error_kind = %update.kind,
                    permanent = update.permanent,
                    "item failed"
                );
                self.state.mark_failed(update, Utc::now());
                progress.status.failed += 1;
            }
            QueueMessage::Stop => {}
        }
        if settles {
            progress.status.processed += 1;
            progress.unsaved += 1;
        }

        progress.status.in_progress = self.state.in_progress().len();
        self.status.send_replace(progress.status);

        if progress.unsaved >= self.save_every && self.save().await {
            progress.unsaved = 0;
            if let Some(callback) = &self.on_batch_saved {
                callback(&self.state);
            }
        }
    }

    /// Saves a checkpoint. Failures are logged; the next periodic save retries.
    async fn save(&mut self) -> bool {
        self.state.touch(Utc::now());
        let snapshot = self.state.clone();
        let persistence = Arc::clone(&self.persistence);
        let path = self.checkpoint.clone();

        let result =
            tokio::task::spawn_blocking(move || persistence.save_atomic(&path, &snapshot)).await;
        match result {
            Ok(Ok(())) => {
                debug!(path = %self.checkpoint.display(), "checkpoint saved");
                true
            }
            Ok(Err(error)) => {
                warn!(%error, "checkpoint save failed, will retry on next save");
                false
            }
            Err(error) => {
                warn!(%error, "checkpoint save task failed, will retry on next save");
                false
            }
        }
    }
}
