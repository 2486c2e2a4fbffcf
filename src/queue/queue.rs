//! Four-band priority queue with stable FIFO order, retry scheduling,
//! backpressure, and snapshot/restore persistence.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::{ErrorKind, Result, SyncError};
use crate::events::{EventBus, EventType, SyncEvent};

use super::{Operation, OperationState, Priority};

const BAND_COUNT: usize = 4;

/// What became of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Returned to pending with a `next_attempt_at` in the future.
    RetryScheduled,
    /// Out of retries or non-retryable: terminal.
    Abandoned,
}

#[derive(Default)]
struct Inner {
    bands: [VecDeque<Operation>; BAND_COUNT],
    in_flight: HashMap<String, Operation>,
    /// Terminal failures since the last `take_abandoned`, for cycle
    /// reports.
    abandoned: Vec<(Operation, ErrorKind, String)>,
}

impl Inner {
    fn pending_len(&self) -> usize {
        self.bands.iter().map(VecDeque::len).sum()
    }
}

/// Shared, internally synchronized operation queue.
pub struct OperationQueue {
    inner: Mutex<Inner>,
    bus: Arc<EventBus>,
    max_size: usize,
}

impl OperationQueue {
    pub fn new(bus: Arc<EventBus>, max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            bus,
            max_size: max_size.max(1),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending_len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        let inner = self.inner.lock();
        inner.pending_len() == 0 && inner.in_flight.is_empty()
    }

    /// Enqueue at the operation's priority band (stable insert). Normal
    /// and low priorities are rejected with `queue_full` at the size
    /// bound; critical and high always land, temporarily exceeding it.
    pub fn enqueue(&self, mut op: Operation) -> Result<String> {
        let op_id = op.operation_id.clone();
        let size = {
            let mut inner = self.inner.lock();
            let pending = inner.pending_len();
            if pending >= self.max_size && !op.priority.bypasses_backpressure() {
                return Err(SyncError::QueueFull { size: pending });
            }
            op.state = OperationState::Pending;
            inner.bands[op.priority.rank()].push_back(op.clone());
            inner.pending_len()
        };

        tracing::debug!(operation_id = %op_id, priority = ?op.priority, "operation enqueued");
        self.bus.emit(
            SyncEvent::new(EventType::OperationEnqueued)
                .collection(op.collection.clone())
                .operation(op_id.clone()),
        );
        self.emit_size(size);
        Ok(op_id)
    }

    /// Pull the next dispatchable operation: highest band first, FIFO
    /// within a band, skipping operations whose `next_attempt_at` is in
    /// the future. The operation transitions to in-flight.
    pub fn next_ready(&self, now: DateTime<Utc>) -> Option<Operation> {
        let mut inner = self.inner.lock();
        let (band, idx) = inner.bands.iter().enumerate().find_map(|(b, band)| {
            band.iter().position(|op| op.is_due(now)).map(|idx| (b, idx))
        })?;

        let mut op = inner.bands[band].remove(idx)?;
        op.state = OperationState::InFlight;
        inner.in_flight.insert(op.operation_id.clone(), op.clone());
        drop(inner);

        self.bus.emit(
            SyncEvent::new(EventType::OperationStarted)
                .collection(op.collection.clone())
                .operation(op.operation_id.clone()),
        );
        Some(op)
    }

    /// The earliest instant any pending operation becomes due, if the
    /// queue is non-empty.
    pub fn earliest_due(&self) -> Option<DateTime<Utc>> {
        let inner = self.inner.lock();
        inner
            .bands
            .iter()
            .flatten()
            .map(|op| op.next_attempt_at.unwrap_or_else(Utc::now))
            .min()
    }

    /// Settle an in-flight operation as succeeded.
    pub fn complete_success(&self, operation_id: &str) {
        let op = self.inner.lock().in_flight.remove(operation_id);
        if let Some(op) = op {
            self.bus.emit(
                SyncEvent::new(EventType::OperationCompleted)
                    .collection(op.collection)
                    .operation(operation_id.to_string()),
            );
            self.emit_size(self.pending_len());
        }
    }

    /// Settle an in-flight operation as failed. A retryable failure with
    /// retries remaining schedules the next attempt (honoring a
    /// `retry_after` hint) and returns the operation to pending; anything
    /// else abandons it and emits `operation_failed` exactly once.
    pub fn complete_failure(&self, operation_id: &str, error: &SyncError) -> FailureDisposition {
        let mut inner = self.inner.lock();
        let Some(mut op) = inner.in_flight.remove(operation_id) else {
            return FailureDisposition::Abandoned;
        };

        if error.is_retryable() && op.retries_remaining() {
            op.attempt_count += 1;
            let mut delay = op.delay_for_attempt(op.attempt_count);
            if let Some(hint) = error.retry_after() {
                delay = delay.max(hint);
            }
            op.next_attempt_at =
                Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
            op.state = OperationState::Pending;
            let collection = op.collection.clone();
            let attempt = op.attempt_count;
            inner.bands[op.priority.rank()].push_back(op);
            drop(inner);

            tracing::warn!(
                operation_id,
                attempt,
                ?delay,
                error = %error,
                "operation failed, retry scheduled"
            );
            self.bus.emit(
                SyncEvent::new(EventType::OperationRetryScheduled)
                    .collection(collection)
                    .operation(operation_id.to_string())
                    .payload(Value::from(attempt)),
            );
            FailureDisposition::RetryScheduled
        } else {
            op.state = OperationState::Abandoned;
            let collection = op.collection.clone();
            inner
                .abandoned
                .push((op, error.kind(), error.to_string()));
            drop(inner);

            tracing::warn!(operation_id, error = %error, "operation abandoned");
            let mut payload = Map::new();
            payload.insert("kind".into(), Value::String(error.kind().as_str().into()));
            payload.insert("message".into(), Value::String(error.to_string()));
            self.bus.emit(
                SyncEvent::new(EventType::OperationFailed)
                    .collection(collection)
                    .operation(operation_id.to_string())
                    .payload(Value::Object(payload)),
            );
            self.emit_size(self.pending_len());
            FailureDisposition::Abandoned
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Pending operations in dispatch order. In-flight operations are
    /// excluded: they are reconstructed from dirty rows on the next cycle.
    pub fn snapshot(&self) -> Vec<Operation> {
        let inner = self.inner.lock();
        inner.bands.iter().flatten().cloned().collect()
    }

    /// Restore a snapshot, keeping only operations `accept` approves
    /// (stale auth contexts, unregistered collections). Returns how many
    /// were restored.
    pub fn restore<F>(&self, operations: Vec<Operation>, accept: F) -> usize
    where
        F: Fn(&Operation) -> bool,
    {
        let mut restored = 0;
        {
            let mut inner = self.inner.lock();
            for mut op in operations {
                if !accept(&op) {
                    tracing::debug!(operation_id = %op.operation_id, "discarding stale operation");
                    continue;
                }
                op.state = OperationState::Pending;
                inner.bands[op.priority.rank()].push_back(op);
                restored += 1;
            }
        }
        if restored > 0 {
            self.emit_size(self.pending_len());
        }
        restored
    }

    /// Drain the terminal-failure log for one collection.
    pub fn take_abandoned(&self, collection: &str) -> Vec<(Operation, ErrorKind, String)> {
        let mut inner = self.inner.lock();
        let (matching, rest): (Vec<_>, Vec<_>) = inner
            .abandoned
            .drain(..)
            .partition(|(op, _, _)| op.collection == collection);
        inner.abandoned = rest;
        matching
    }

    /// Drop all pending operations (shutdown after snapshot).
    pub fn clear_pending(&self) {
        let mut inner = self.inner.lock();
        for band in inner.bands.iter_mut() {
            band.clear();
        }
    }

    fn emit_size(&self, size: usize) {
        self.bus.emit(
            SyncEvent::new(EventType::QueueSizeChanged).payload(Value::from(size)),
        );
    }
}

// ============================================================================
// Tests
// ============================================================================
