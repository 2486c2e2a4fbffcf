//! Cycle-level result types.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::ErrorKind;

/// Outcome of one cycle. `Partial` is success-with-per-op-failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    Success,
    Partial,
    Failed,
    Cancelled,
}

/// A terminal per-operation failure surfaced in the report (and on the
/// event stream). Carries enough to diagnose without a throw path.
#[derive(Debug, Clone)]
pub struct OpFailure {
    pub operation_id: Option<String>,
    pub record_id: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

/// Per-collection result of one cycle.
#[derive(Debug, Clone)]
pub struct CollectionReport {
    pub collection: String,
    pub outcome: SyncOutcome,
    pub uploaded: usize,
    pub downloaded: usize,
    pub conflicts_detected: usize,
    pub conflicts_resolved: usize,
    /// Rows cleared by the reconciliation pass (acknowledged in transit).
    pub reconciled: usize,
    pub failures: Vec<OpFailure>,
    pub duration: Duration,
}

impl CollectionReport {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            outcome: SyncOutcome::Success,
            uploaded: 0,
            downloaded: 0,
            conflicts_detected: 0,
            conflicts_resolved: 0,
            reconciled: 0,
            failures: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn affected_records(&self) -> usize {
        self.uploaded + self.downloaded
    }
}

/// Aggregated result of a multi-collection sweep.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub outcome: SyncOutcome,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub collections: Vec<CollectionReport>,
}

impl SyncReport {
    /// Worst-of: any failure degrades the sweep outcome.
    pub fn combine_outcomes(collections: &[CollectionReport]) -> SyncOutcome {
        let mut outcome = SyncOutcome::Success;
        for report in collections {
            outcome = match (outcome, report.outcome) {
                (_, SyncOutcome::Cancelled) | (SyncOutcome::Cancelled, _) => SyncOutcome::Cancelled,
                (SyncOutcome::Failed, _) | (_, SyncOutcome::Failed) => SyncOutcome::Failed,
                (SyncOutcome::Partial, _) | (_, SyncOutcome::Partial) => SyncOutcome::Partial,
                _ => SyncOutcome::Success,
            };
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_combination_is_worst_of() {
        let mut a = CollectionReport::new("a");
        let mut b = CollectionReport::new("b");
        assert_eq!(
            SyncReport::combine_outcomes(&[a.clone(), b.clone()]),
            SyncOutcome::Success
        );

        b.outcome = SyncOutcome::Partial;
        assert_eq!(
            SyncReport::combine_outcomes(&[a.clone(), b.clone()]),
            SyncOutcome::Partial
        );

        a.outcome = SyncOutcome::Cancelled;
        assert_eq!(
            SyncReport::combine_outcomes(&[a, b]),
            SyncOutcome::Cancelled
        );
    }
}
