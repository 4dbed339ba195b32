//! Read-only run status published by the consumer.

use tokio::sync::watch;

/// Snapshot of a run, published after every applied message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStatus {
    /// Items submitted in this run.
    pub total: usize,
    /// Items settled (completed or failed) in this run.
    pub processed: usize,
    /// Items completed in this run.
    pub succeeded: usize,
    /// Items failed in this run.
    pub failed: usize,
    /// Items currently in flight.
    pub in_progress: usize,
    /// Body bytes reported so far.
    pub bytes_received: u64,
    /// Whether the consumer is still running.
    pub running: bool,
}

/// Cloneable reader of the latest [`RunStatus`].
#[derive(Debug, Clone)]
pub struct StatusHandle {
    rx: watch::Receiver<RunStatus>,
}

impl StatusHandle {
    pub(crate) fn new(rx: watch::Receiver<RunStatus>) -> Self {
        Self { rx }
    }

    /// Returns the latest snapshot.
    #[must_use]
    pub fn current(&self) -> RunStatus {
        *self.rx.borrow()
    }

    /// Waits for the next snapshot. Returns `None` once the orchestrator is
    /// gone.
    pub async fn changed(&mut self) -> Option<RunStatus> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }
}
