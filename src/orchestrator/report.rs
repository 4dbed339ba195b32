//! Failure report export.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::state::{DownloadState, FailedRecord};

/// Per-kind failure counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindSummary {
    /// Records of this kind.
    pub total: usize,
    /// Of which permanent.
    pub permanent: usize,
    /// Of which temporary.
    pub temporary: usize,
}

/// Exported failure report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReport {
    /// When the report was built.
    pub generated_at: DateTime<Utc>,
    /// All failure records.
    pub total_failures: usize,
    /// Records flagged permanent.
    pub permanent_failures: usize,
    /// Records eligible for `retry_failed`.
    pub temporary_failures: usize,
    /// Full records, permanent first, then by id.
    pub failures: Vec<FailedRecord>,
    /// Counts keyed by `error_type`.
    pub summary_by_type: BTreeMap<String, KindSummary>,
}

impl FailureReport {
    /// Builds a report from the failure records of `state`.
    #[must_use]
    pub fn from_state(state: &DownloadState, generated_at: DateTime<Utc>) -> Self {
        let mut failures = state.failed_records().to_vec();
        failures.sort_by(|a, b| b.permanent.cmp(&a.permanent).then_with(|| a.id.cmp(&b.id)));

        let mut summary_by_type: BTreeMap<String, KindSummary> = BTreeMap::new();
        for record in &failures {
            let entry = summary_by_type
                .entry(record.kind.as_str().to_string())
                .or_default();
            entry.total += 1;
            if record.permanent {
                entry.permanent += 1;
            } else {
                entry.temporary += 1;
            }
        }

        let permanent_failures = failures.iter().filter(|record| record.permanent).count();
        Self {
            generated_at,
            total_failures: failures.len(),
            permanent_failures,
            temporary_failures: failures.len() - permanent_failures,
            failures,
            summary_by_type,
        }
    }

    /// Returns whether there is nothing to report.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}
