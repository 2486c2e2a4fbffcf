//! Typed event broadcast.
//!
//! Emission is synchronous for the emitter and buffered per subscriber so
//! a slow consumer never blocks the orchestrator. A subscriber whose
//! buffer overflows loses events and receives an `events_dropped` marker
//! carrying the count before its next delivered event. The bus holds only
//! channel senders; subscribers own their receivers, and closed receivers
//! are pruned on the next emission.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

// ============================================================================
// Event types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    // Cycle lifecycle
    SyncStarted,
    SyncProgress,
    SyncCompleted,
    SyncError,
    // Conflicts
    ConflictDetected,
    ConflictResolved,
    // Data changes applied to the local store
    DataCreated,
    DataUpdated,
    DataDeleted,
    // Queue lifecycle
    OperationEnqueued,
    OperationStarted,
    OperationCompleted,
    OperationFailed,
    OperationRetryScheduled,
    QueueSizeChanged,
    // Auth lifecycle
    AuthLogin,
    AuthLogout,
    AuthRefreshed,
    AuthFailed,
    // Recovery
    CheckpointCreated,
    RollbackCompleted,
    // Bus backpressure marker
    EventsDropped,
}

/// One event on the stream.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub event_type: EventType,
    pub collection: Option<String>,
    pub record_id: Option<String>,
    pub operation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
}

impl SyncEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            collection: None,
            record_id: None,
            operation_id: None,
            timestamp: Utc::now(),
            payload: Value::Null,
        }
    }

    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    pub fn record(mut self, record_id: impl Into<String>) -> Self {
        self.record_id = Some(record_id.into());
        self
    }

    pub fn operation(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

// ============================================================================
// Filter
// ============================================================================

/// Subscriber-side filter. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_types: Option<HashSet<EventType>>,
    pub collection: Option<String>,
    pub operation_id: Option<String>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn for_types<I: IntoIterator<Item = EventType>>(types: I) -> Self {
        Self {
            event_types: Some(types.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn for_collection(collection: impl Into<String>) -> Self {
        Self {
            collection: Some(collection.into()),
            ..Self::default()
        }
    }

    fn matches(&self, event: &SyncEvent) -> bool {
        // The drop marker bypasses type filters so consumers always learn
        // about gaps in their stream.
        if event.event_type == EventType::EventsDropped {
            return true;
        }
        if let Some(ref types) = self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(ref collection) = self.collection {
            if event.collection.as_deref() != Some(collection.as_str()) {
                return false;
            }
        }
        if let Some(ref operation_id) = self.operation_id {
            if event.operation_id.as_deref() != Some(operation_id.as_str()) {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// EventBus
// ============================================================================

struct Subscriber {
    filter: EventFilter,
    tx: mpsc::Sender<SyncEvent>,
    /// Events lost to a full buffer since the last delivered marker.
    dropped: u64,
}

/// Broadcast hub for [`SyncEvent`]s.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    default_buffer: usize,
}

impl EventBus {
    pub fn new(default_buffer: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            default_buffer: default_buffer.max(1),
        }
    }

    /// Attach a subscriber with the default buffer size.
    pub fn subscribe(&self, filter: EventFilter) -> mpsc::Receiver<SyncEvent> {
        self.subscribe_with_buffer(filter, self.default_buffer)
    }

    /// Attach a subscriber with an explicit buffer size.
    pub fn subscribe_with_buffer(
        &self,
        filter: EventFilter,
        buffer: usize,
    ) -> mpsc::Receiver<SyncEvent> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.subscribers.lock().push(Subscriber {
            filter,
            tx,
            dropped: 0,
        });
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Emit an event to all matching subscribers. Never blocks: full
    /// buffers count drops, closed receivers are removed.
    pub fn emit(&self, event: SyncEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain_mut(|sub| {
            if !sub.filter.matches(&event) {
                return true;
            }

            // Deliver a pending drop marker before the next event so the
            // consumer sees the gap in order.
            if sub.dropped > 0 {
                let mut payload = Map::new();
                payload.insert("dropped".into(), Value::from(sub.dropped));
                let marker =
                    SyncEvent::new(EventType::EventsDropped).payload(Value::Object(payload));
                match sub.tx.try_send(marker) {
                    Ok(()) => sub.dropped = 0,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        sub.dropped += 1;
                        return true;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }

            match sub.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sub.dropped += 1;
                    tracing::warn!(event_type = ?event.event_type, "slow event subscriber, dropping");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_matching_events() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe(EventFilter::for_types([EventType::SyncStarted]));

        bus.emit(SyncEvent::new(EventType::SyncStarted).collection("notes"));
        bus.emit(SyncEvent::new(EventType::SyncCompleted).collection("notes"));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_type, EventType::SyncStarted);
        assert!(rx.try_recv().is_err(), "filtered event must not arrive");
    }

    #[tokio::test]
    async fn collection_filter_applies() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe(EventFilter::for_collection("notes"));

        bus.emit(SyncEvent::new(EventType::DataCreated).collection("other"));
        bus.emit(SyncEvent::new(EventType::DataCreated).collection("notes"));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.collection.as_deref(), Some("notes"));
    }

    #[tokio::test]
    async fn overflow_yields_drop_marker_then_continues() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe_with_buffer(EventFilter::all(), 2);

        // Fill the buffer, then overflow by two.
        for i in 0..4 {
            bus.emit(SyncEvent::new(EventType::QueueSizeChanged).payload(Value::from(i)));
        }

        // Consume the two buffered events.
        assert_eq!(rx.recv().await.unwrap().payload, Value::from(0));
        assert_eq!(rx.recv().await.unwrap().payload, Value::from(1));

        // Next emission is preceded by the drop marker.
        bus.emit(SyncEvent::new(EventType::QueueSizeChanged).payload(Value::from(4)));
        let marker = rx.recv().await.unwrap();
        assert_eq!(marker.event_type, EventType::EventsDropped);
        assert_eq!(marker.payload["dropped"], Value::from(2u64));

        let next = rx.recv().await.unwrap();
        assert_eq!(next.payload, Value::from(4));
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned() {
        let bus = EventBus::new(8);
        let rx = bus.subscribe(EventFilter::all());
        assert_eq!(bus.subscriber_count(), 1);

        drop(rx);
        bus.emit(SyncEvent::new(EventType::SyncStarted));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn emit_without_runtime_is_fine() {
        // try_send never needs a reactor; emission must work from sync code.
        let bus = EventBus::new(8);
        let _rx = bus.subscribe(EventFilter::all());
        bus.emit(SyncEvent::new(EventType::SyncStarted));
    }
}
