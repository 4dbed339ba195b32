//! One work item, end to end, on a pooled task.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tracing::{debug, instrument, warn};

use super::message::{ProgressPhase, QueueMessage};
use super::state::FailureUpdate;
use crate::download::{FetchOutcome, ResilientFetcher};
use crate::model::WorkItem;
use crate::ratelimit::AdaptiveRateLimiter;
use crate::storage::ProgressCallback;

/// Minimum byte distance between two `Downloading` progress messages.
const PROGRESS_STEP_BYTES: u64 = 1024 * 1024;

pub(crate) struct Worker {
    pub(crate) fetcher: Arc<ResilientFetcher>,
    pub(crate) limiter: Arc<AdaptiveRateLimiter>,
    pub(crate) tx: mpsc::Sender<QueueMessage>,
}

impl Worker {
    /// Fetches `item` and reports the result to the consumer.
    ///
    /// The permit is held until the terminal message is queued.
    #[instrument(skip_all, fields(item_id = %item.id, endpoint = %endpoint))]
    pub(crate) async fn process(
        self,
        item: WorkItem,
        endpoint: String,
        permit: OwnedSemaphorePermit,
    ) {
        let _permit = permit;

        if self.tx.send(QueueMessage::started(&item.id)).await.is_err() {
            warn!("consumer gone before item started");
            return;
        }

        let started = Instant::now();
        let last_reported = AtomicU64::new(0);
        let tx = self.tx.clone();
        let id = item.id.clone();
        let report = move |bytes: u64, _total: Option<u64>| {
            let previous = last_reported.load(Ordering::Relaxed);
            if bytes < previous.saturating_add(PROGRESS_STEP_BYTES) {
                return;
            }
            last_reported.store(bytes, Ordering::Relaxed);
            let elapsed = started.elapsed().as_secs_f64();
            #[allow(clippy::cast_precision_loss)]
            let rate = (elapsed > 0.0).then(|| bytes as f64 / elapsed);
            // Byte progress is diagnostic; a full channel drops it.
            let _ = tx.try_send(QueueMessage::Progress {
                id: id.clone(),
                bytes,
                phase: ProgressPhase::Downloading,
                rate,
            });
        };

        let on_progress: &ProgressCallback = &report;
        let outcome = self.fetcher.fetch(&item, Some(on_progress)).await;
        let latency = started.elapsed();

        // A permanent item failure still means the endpoint answered.
        let endpoint_ok = match &outcome {
            FetchOutcome::Stored { .. } => true,
            FetchOutcome::Failed { permanent, .. } => *permanent,
        };
        if let Err(error) = self.limiter.record(&endpoint, endpoint_ok, latency, 1) {
            warn!(%error, "failed to record outcome with rate limiter");
        }

        let message = match outcome {
            FetchOutcome::Stored { attempts, bytes } => QueueMessage::Completed {
                id: item.id.clone(),
                attempts,
                bytes,
            },
            FetchOutcome::Failed {
                attempts,
                kind,
                permanent,
                message,
            } => QueueMessage::Failed(FailureUpdate {
                id: item.id.clone(),
                title: item.title().to_string(),
                url: item.url.clone(),
                message,
                kind,
                attempts,
                permanent,
            }),
        };

        debug!(latency_ms = latency.as_millis(), "item settled");
        if self.tx.send(message).await.is_err() {
            warn!("consumer gone, result not recorded");
        }
    }
}
