//! Messages from workers to the state-owning consumer.

use super::state::FailureUpdate;

/// Stage of an item reported through [`QueueMessage::Progress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    /// The worker picked the item up. Moves it to `in_progress`.
    Started,
    /// Body bytes are arriving.
    Downloading,
}

/// The only channel from workers to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueMessage {
    /// The item was fetched, validated, and stored.
    Completed {
        /// Item identifier.
        id: String,
        /// Attempts made.
        attempts: u32,
        /// Stored size in bytes.
        bytes: u64,
    },
    /// The item failed for this run.
    Failed(FailureUpdate),
    /// Diagnostic progress. May be dropped under back-pressure, except
    /// [`ProgressPhase::Started`].
    Progress {
        /// Item identifier.
        id: String,
        /// Bytes received so far.
        bytes: u64,
        /// Stage.
        phase: ProgressPhase,
        /// Transfer rate in bytes per second, when known.
        rate: Option<f64>,
    },
    /// No more messages will follow.
    Stop,
}

impl QueueMessage {
    /// Creates the message that moves `id` into `in_progress`.
    #[must_use]
    pub fn started(id: impl Into<String>) -> Self {
        Self::Progress {
            id: id.into(),
            bytes: 0,
            phase: ProgressPhase::Started,
            rate: None,
        }
    }

    /// Returns whether this message settles an item.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed(_))
    }
}
