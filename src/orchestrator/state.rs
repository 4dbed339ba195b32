//! The checkpointed download state and its failure records.
//!
//! An id lives in at most one of `completed`, `in_progress`, and `failed`.
//! Every transition removes the id from the other sets first.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::download::ErrorKind;

/// Persistent record of an item's failures.
///
/// Field names match the checkpoint format consumed by existing tooling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedRecord {
    /// Item identifier.
    #[serde(rename = "paper_id")]
    pub id: String,
    /// Item title, for reports.
    pub title: String,
    /// Item URL.
    #[serde(rename = "pdf_url")]
    pub url: String,
    /// Display text of the latest error.
    pub error_message: String,
    /// Classified kind of the latest error.
    #[serde(rename = "error_type")]
    pub kind: ErrorKind,
    /// Fetch attempts across all runs.
    pub attempts: u32,
    /// When the latest attempt failed.
    pub last_attempt: DateTime<Utc>,
    /// Never retried automatically once set.
    #[serde(rename = "permanent_failure")]
    pub permanent: bool,
}

/// One failure to fold into the state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureUpdate {
    /// Item identifier.
    pub id: String,
    /// Item title.
    pub title: String,
    /// Item URL.
    pub url: String,
    /// Display text of the error.
    pub message: String,
    /// Classified kind.
    pub kind: ErrorKind,
    /// Attempts made in this run.
    pub attempts: u32,
    /// Whether the failure is permanent.
    pub permanent: bool,
}

/// The single mutable aggregate of a collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadState {
    #[serde(default)]
    completed: BTreeSet<String>,
    #[serde(default)]
    failed: BTreeMap<String, String>,
    #[serde(default)]
    in_progress: BTreeSet<String>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    failed_papers: Vec<FailedRecord>,
}

impl DownloadState {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed ids.
    #[must_use]
    pub fn completed(&self) -> &BTreeSet<String> {
        &self.completed
    }

    /// Failed ids mapped to their last error message.
    #[must_use]
    pub fn failed(&self) -> &BTreeMap<String, String> {
        &self.failed
    }

    /// Ids currently being fetched.
    #[must_use]
    pub fn in_progress(&self) -> &BTreeSet<String> {
        &self.in_progress
    }

    /// All failure records.
    #[must_use]
    pub fn failed_records(&self) -> &[FailedRecord] {
        &self.failed_papers
    }

    /// Time of the last checkpoint.
    #[must_use]
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    /// Returns the failure record for `id`.
    #[must_use]
    pub fn failed_record(&self, id: &str) -> Option<&FailedRecord> {
        self.failed_papers.iter().find(|record| record.id == id)
    }

    /// Returns whether `id` has a permanent failure record.
    #[must_use]
    pub fn is_permanent(&self, id: &str) -> bool {
        self.failed_record(id).is_some_and(|record| record.permanent)
    }

    /// Number of permanent failure records.
    #[must_use]
    pub fn permanent_count(&self) -> usize {
        self.failed_papers.iter().filter(|record| record.permanent).count()
    }

    /// Moves `id` into `in_progress`.
    pub fn mark_in_progress(&mut self, id: &str) {
        self.completed.remove(id);
        self.failed.remove(id);
        self.in_progress.insert(id.to_string());
    }

    /// Moves `id` into `completed` and drops its failure record.
    pub fn mark_completed(&mut self, id: &str) {
        self.in_progress.remove(id);
        self.failed.remove(id);
        self.failed_papers.retain(|record| record.id != id);
        self.completed.insert(id.to_string());
    }

    /// Moves the id into `failed` and upserts its record.
    ///
    /// Attempts accumulate and a permanent flag, once set, stays set.
    pub fn mark_failed(&mut self, update: FailureUpdate, at: DateTime<Utc>) {
        self.in_progress.remove(&update.id);
        self.completed.remove(&update.id);
        self.failed.insert(update.id.clone(), update.message.clone());

        if let Some(record) = self
            .failed_papers
            .iter_mut()
            .find(|record| record.id == update.id)
        {
            record.title = update.title;
            record.url = update.url;
            record.error_message = update.message;
            record.kind = update.kind;
            record.attempts = record.attempts.saturating_add(update.attempts.max(1));
            record.last_attempt = at;
            record.permanent |= update.permanent;
        } else {
            self.failed_papers.push(FailedRecord {
                id: update.id,
                title: update.title,
                url: update.url,
                error_message: update.message,
                kind: update.kind,
                attempts: update.attempts.max(1),
                last_attempt: at,
                permanent: update.permanent,
            });
        }
    }

    /// Returns a completed id to pending so it can be fetched again.
    pub fn requeue(&mut self, id: &str) {
        self.completed.remove(id);
    }

    /// Operator action: drops the permanent record for `id` so it can be
    /// retried. Returns whether a permanent record existed.
    pub fn clear_permanent(&mut self, id: &str) -> bool {
        let before = self.failed_papers.len();
        self.failed_papers
            .retain(|record| !(record.id == id && record.permanent));
        let cleared = self.failed_papers.len() != before;
        if cleared {
            self.failed.remove(id);
        }
        cleared
    }

    /// Clears ids left in `in_progress` by an interrupted run back to pending.
    pub fn recover_interrupted(&mut self) -> Vec<String> {
        std::mem::take(&mut self.in_progress).into_iter().collect()
    }

    /// Splits off the completed ids, keeping only failure history.
    ///
    /// The `in_progress` set is discarded.
    #[must_use]
    pub fn split_completed(mut self) -> (DownloadState, BTreeSet<String>) {
        let completed = std::mem::take(&mut self.completed);
        self.in_progress.clear();
        (self, completed)
    }

    /// Folds a persisted state into this one.
    ///
    /// Completion wins over failure. Failure records are merged per id,
    /// keeping the higher attempt count, the later attempt, and a permanent
    /// flag from either side.
    pub fn merge(&mut self, other: DownloadState) {
        for id in other.completed {
            self.mark_completed(&id);
        }
        for (id, message) in other.failed {
            if !self.completed.contains(&id) && !self.in_progress.contains(&id) {
                self.failed.entry(id).or_insert(message);
            }
        }
        for id in other.in_progress {
            if !self.completed.contains(&id) && !self.failed.contains_key(&id) {
                self.in_progress.insert(id);
            }
        }
        for incoming in other.failed_papers {
            if self.completed.contains(&incoming.id) {
                continue;
            }
            match self
                .failed_papers
                .iter_mut()
                .find(|record| record.id == incoming.id)
            {
                Some(record) => {
                    record.permanent |= incoming.permanent;
                    record.attempts = record.attempts.max(incoming.attempts);
                    if incoming.last_attempt > record.last_attempt {
                        record.last_attempt = incoming.last_attempt;
                        record.error_message = incoming.error_message;
                        record.kind = incoming.kind;
                    }
                }
                None => self.failed_papers.push(incoming),
            }
        }
        self.last_updated = match (self.last_updated, other.last_updated) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }

    /// Stamps the checkpoint time.
    pub fn touch(&mut self, at: DateTime<Utc>) {
        self.last_updated = Some(at);
    }
}
