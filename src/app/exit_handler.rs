//! Maps a run summary onto the process exit outcome.

use collector_core::RunSummary;

use crate::ProcessExit;

/// An interrupted run is a failure even when every submitted item succeeded,
/// since part of the work list was never attempted.
pub(crate) fn determine_exit_outcome(summary: &RunSummary) -> ProcessExit {
    if summary.cancelled > 0 {
        return ProcessExit::Failure;
    }
    match (summary.succeeded, summary.failed) {
        (_, 0) => ProcessExit::Success,
        (0, _) => ProcessExit::Failure,
        _ => ProcessExit::Partial,
    }
}

#[cfg(test)]
mod tests {
    use super::determine_exit_outcome;
    use crate::ProcessExit;
    use collector_core::RunSummary;

    fn summary(succeeded: usize, failed: usize, cancelled: usize) -> RunSummary {
        RunSummary {
            succeeded,
            failed,
            cancelled,
            checkpoint_saved: true,
            ..RunSummary::default()
        }
    }

    #[test]
    fn test_nothing_to_do_is_success() {
        assert_eq!(determine_exit_outcome(&summary(0, 0, 0)), ProcessExit::Success);
    }

    #[test]
    fn test_mixed_outcomes_are_partial() {
        assert_eq!(determine_exit_outcome(&summary(2, 1, 0)), ProcessExit::Partial);
    }

    #[test]
    fn test_all_failed_is_failure() {
        assert_eq!(determine_exit_outcome(&summary(0, 2, 0)), ProcessExit::Failure);
    }

    #[test]
    fn test_cancellation_overrides_success() {
        assert_eq!(determine_exit_outcome(&summary(5, 0, 3)), ProcessExit::Failure);
    }
}
