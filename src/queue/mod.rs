//! The operation model: a single unit of sync work flowing through the
//! priority queue.

pub mod dispatcher;
pub mod queue;

pub use dispatcher::{CancelFlag, Dispatcher, DrainStats, OperationHandler};
pub use queue::OperationQueue;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

// ============================================================================
// Priority
// ============================================================================

/// Four-level dispatch priority. Within a level, FIFO by enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// Band index: lower dispatches first.
    pub fn rank(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    /// Whether enqueues at this priority bypass the queue size bound.
    pub fn bypasses_backpressure(self) -> bool {
        matches!(self, Priority::Critical | Priority::High)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Create,
    Read,
    Update,
    Delete,
    Query,
    Subscribe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    InFlight,
    Succeeded,
    Failed,
    Abandoned,
}

// ============================================================================
// Operation
// ============================================================================

/// A queue entry. Serializable so pending operations survive restart.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Operation {
    pub operation_id: String,
    pub op_type: OperationType,
    pub collection: String,
    pub record_id: Option<String>,
    pub priority: Priority,
    pub payload: Value,
    /// Retries consumed so far (0 on the first execution).
    pub attempt_count: u32,
    /// Earliest instant the next execution may start; None = immediately.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub max_retries: u32,
    pub retry_delays: Vec<Duration>,
    /// The context this operation was enqueued under. Dispatch rejects
    /// the operation if that context is no longer current.
    pub auth_context_id: String,
    pub enqueued_at: DateTime<Utc>,
    pub state: OperationState,
}

impl Operation {
    pub fn new(
        op_type: OperationType,
        collection: impl Into<String>,
        payload: Value,
        auth_context_id: impl Into<String>,
    ) -> Self {
        Self {
            operation_id: uuid::Uuid::new_v4().to_string(),
            op_type,
            collection: collection.into(),
            record_id: None,
            priority: Priority::Normal,
            payload,
            attempt_count: 0,
            next_attempt_at: None,
            max_retries: 3,
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(9),
            ],
            auth_context_id: auth_context_id.into(),
            enqueued_at: Utc::now(),
            state: OperationState::Pending,
        }
    }

    pub fn with_record(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retry(mut self, max_retries: u32, retry_delays: Vec<Duration>) -> Self {
        self.max_retries = max_retries;
        self.retry_delays = retry_delays;
        self
    }

    /// Delay before retry number `attempt` (1-based). Past the end of the
    /// table the last entry repeats; an empty table means no delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.retry_delays.is_empty() {
            return Duration::ZERO;
        }
        let idx = (attempt.max(1) as usize - 1).min(self.retry_delays.len() - 1);
        self.retry_delays[idx]
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }

    pub fn retries_remaining(&self) -> bool {
        self.attempt_count < self.max_retries
    }
}

/// Exponential delay table: `base · multiplier^(n-1)`, capped.
pub fn exponential_delays(base: Duration, multiplier: u32, count: usize, cap: Duration) -> Vec<Duration> {
    let mut delays = Vec::with_capacity(count);
    let mut current = base;
    for _ in 0..count {
        delays.push(current.min(cap));
        current = current.saturating_mul(multiplier);
    }
    delays
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn priority_ranks_order_dispatch() {
        assert!(Priority::Critical.rank() < Priority::High.rank());
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
        assert!(Priority::Critical.bypasses_backpressure());
        assert!(!Priority::Normal.bypasses_backpressure());
    }

    #[test]
    fn delay_table_lookup_clamps_to_last() {
        let op = Operation::new(OperationType::Update, "notes", json!({}), "ctx");
        assert_eq!(op.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(op.delay_for_attempt(3), Duration::from_secs(9));
        assert_eq!(op.delay_for_attempt(7), Duration::from_secs(9));
    }

    #[test]
    fn exponential_table() {
        let delays = exponential_delays(
            Duration::from_secs(1),
            3,
            4,
            Duration::from_secs(10),
        );
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(9),
                Duration::from_secs(10), // capped
            ]
        );
    }

    #[test]
    fn operation_snapshot_round_trips_through_json() {
        let op = Operation::new(OperationType::Create, "notes", json!({"x": 1}), "ctx-1")
            .with_record("r1")
            .with_priority(Priority::High);
        let encoded = serde_json::to_string(&op).unwrap();
        let back: Operation = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back.operation_id, op.operation_id);
        assert_eq!(back.priority, Priority::High);
        assert_eq!(back.record_id.as_deref(), Some("r1"));
        assert_eq!(back.retry_delays, op.retry_delays);
    }
}
