//! Trigger scheduling.
//!
//! Three trigger sources feed the queue: manual calls on the manager,
//! a fixed-interval timer running low-priority full sweeps, and local
//! change events enqueueing uploads for the affected rows. [`SyncMode`]
//! selects the combination; `Realtime` additionally opens the adapter's
//! change streams.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::config::SyncMode;
use crate::events::{EventFilter, EventType};
use crate::queue::{Operation, OperationType, Priority};

use super::manager::SyncManager;

pub struct SyncScheduler {
    manager: Arc<SyncManager>,
    mode: SyncMode,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncScheduler {
    pub fn new(manager: Arc<SyncManager>) -> Self {
        let mode = manager.config().sync_mode;
        Self {
            manager,
            mode,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    /// Spawn the trigger tasks for the configured mode. Idempotent.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        match self.mode {
            SyncMode::Manual => {}
            SyncMode::Automatic => {
                tasks.push(self.spawn_change_listener());
            }
            SyncMode::Scheduled => {
                tasks.push(self.spawn_change_listener());
                tasks.push(self.spawn_interval_sweep());
            }
            SyncMode::Realtime => {
                tasks.push(self.spawn_change_listener());
                self.manager.start_subscriptions();
            }
        }
        tracing::info!(mode = ?self.mode, "scheduler started");
    }

    pub fn stop(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.manager.stop_subscriptions();
    }

    /// Local change events enqueue a normal-priority upload for the
    /// affected row. Rows that are no longer dirty (e.g. the event came
    /// from a download write) are skipped.
    fn spawn_change_listener(&self) -> JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        // Subscribe before spawning so no change emitted after `start`
        // returns can be missed.
        let mut events = manager.bus().subscribe(EventFilter::for_types([
            EventType::DataCreated,
            EventType::DataUpdated,
            EventType::DataDeleted,
        ]));
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if manager.cancel_flag().is_cancelled() {
                    break;
                }
                let (Some(collection), Some(record_id)) = (event.collection, event.record_id)
                else {
                    continue;
                };
                let Some(def) = manager
                    .collections()
                    .iter()
                    .find(|d| d.name == collection)
                    .cloned()
                else {
                    continue;
                };
                if !def.direction.uploads() {
                    continue;
                }

                let row = match manager.store().get(&collection, &record_id) {
                    Ok(Some(row)) if row.is_dirty => row,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!(collection = %collection, error = %e, "change lookup failed");
                        continue;
                    }
                };

                let op_type = if row.is_deleted {
                    OperationType::Delete
                } else if row.last_synced_at.is_none() {
                    OperationType::Create
                } else {
                    OperationType::Update
                };
                let op = Operation::new(
                    op_type,
                    &collection,
                    json!({"record": Value::Object(row.to_map())}),
                    &manager.auth().current().context_id,
                )
                .with_record(&record_id)
                .with_priority(Priority::Normal)
                .with_retry(
                    manager.config().max_retries,
                    manager.config().retry_delays.clone(),
                );
                match manager.queue().enqueue(op) {
                    Ok(_) => manager.kick_dispatcher(),
                    Err(e) => {
                        tracing::warn!(collection = %collection, error = %e, "change upload rejected")
                    }
                }
            }
        })
    }

    /// Fixed-interval low-priority full sweeps, plus a periodic queue
    /// snapshot so pending work survives an ungraceful exit.
    fn spawn_interval_sweep(&self) -> JoinHandle<()> {
        let manager = Arc::clone(&self.manager);
        let interval = manager.config().sync_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if manager.cancel_flag().is_cancelled() {
                    break;
                }
                if let Err(e) = manager.sweep(Priority::Low).await {
                    tracing::warn!(error = %e, "scheduled sweep failed");
                }
                if let Err(e) = manager.persist_queue() {
                    tracing::warn!(error = %e, "periodic queue snapshot failed");
                }
            }
        })
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
