//! Recovery and inspection: checkpoints, rollback, event replay, and the
//! read-only state report.
//!
//! Checkpoints snapshot the dirty-row set and the pending queue. Rollback
//! restores the dirty set. Advisory only: it cannot recall records the
//! remote has since propagated further, and versions never move backward.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;

use crate::collection::CollectionDef;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, EventFilter, EventType, SyncEvent};
use crate::queue::OperationQueue;
use crate::record::SyncRecord;
use crate::storage::{CheckpointRecord, FieldFilter, FilterOp, LocalStore, LogEntry, Query};

/// Dirty rows older than this suggest a stuck pipeline.
const STALE_DIRTY_HOURS: i64 = 24;

// ============================================================================
// Report types
// ============================================================================

#[derive(Debug, Clone)]
pub struct RollbackSummary {
    pub checkpoint_id: String,
    pub restored_rows: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ReplayReport {
    pub total: usize,
    pub by_type: HashMap<String, usize>,
    /// Rows written back to the store (zero in dry-run mode).
    pub applied: usize,
}

/// Per-collection slice of the state report.
#[derive(Debug, Clone)]
pub struct CollectionState {
    pub collection: String,
    pub total: usize,
    pub synced: usize,
    pub dirty: usize,
    pub tombstones: usize,
    pub stale_dirty: usize,
    /// 0..1; degraded by dirty backlog and stale rows.
    pub health: f64,
    pub remediations: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct EngineStateReport {
    pub collections: Vec<CollectionState>,
    pub overall_health: f64,
    pub queue_pending: usize,
    pub queue_in_flight: usize,
}

// ============================================================================
// RecoveryManager
// ============================================================================

pub struct RecoveryManager {
    store: Arc<dyn LocalStore>,
    queue: Arc<OperationQueue>,
    bus: Arc<EventBus>,
    collections: Vec<Arc<CollectionDef>>,
    log_cap: usize,
    recorder: Mutex<Option<JoinHandle<()>>>,
}

impl RecoveryManager {
    pub fn new(
        store: Arc<dyn LocalStore>,
        queue: Arc<OperationQueue>,
        bus: Arc<EventBus>,
        collections: Vec<Arc<CollectionDef>>,
        log_cap: usize,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            collections,
            log_cap: log_cap.max(1),
            recorder: Mutex::new(None),
        }
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Snapshot the dirty-row set and pending queue.
    pub fn create_checkpoint(&self, description: &str) -> Result<CheckpointRecord> {
        let mut dirty = Map::new();
        for def in &self.collections {
            let rows = self.store.list_dirty(&def.name, None)?;
            let maps: Vec<Value> = rows.iter().map(|r| Value::Object(r.to_map())).collect();
            dirty.insert(def.name.clone(), Value::Array(maps));
        }
        let queue = serde_json::to_value(self.queue.snapshot())?;

        let checkpoint = CheckpointRecord {
            checkpoint_id: uuid::Uuid::new_v4().to_string(),
            description: description.to_string(),
            created_at: Utc::now(),
            state: json!({"dirty": Value::Object(dirty), "queue": queue}),
        };
        self.store.save_checkpoint(&checkpoint)?;

        tracing::info!(checkpoint_id = %checkpoint.checkpoint_id, description, "checkpoint created");
        self.bus.emit(
            SyncEvent::new(EventType::CheckpointCreated)
                .payload(json!({"checkpoint_id": checkpoint.checkpoint_id, "description": description})),
        );
        Ok(checkpoint)
    }

    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointRecord>> {
        self.store.list_checkpoints()
    }

    /// Restore the dirty-row set from a checkpoint. An automatic
    /// checkpoint of the current state is taken first. Versions never
    /// regress: a row the store has advanced past keeps its version and
    /// only takes the snapshot's fields and dirty flag.
    pub fn rollback(&self, checkpoint_id: &str) -> Result<RollbackSummary> {
        let checkpoint = self
            .store
            .load_checkpoint(checkpoint_id)?
            .ok_or_else(|| SyncError::NotFound {
                collection: "__usm_checkpoints".to_string(),
                id: checkpoint_id.to_string(),
            })?;

        self.create_checkpoint(&format!("auto before rollback to {checkpoint_id}"))?;

        let mut restored = 0;
        if let Some(dirty) = checkpoint.state.get("dirty").and_then(Value::as_object) {
            for (collection, rows) in dirty {
                let Some(rows) = rows.as_array() else { continue };
                for row in rows.iter().filter_map(Value::as_object) {
                    let mut record = SyncRecord::from_map(row)?;
                    if let Some(stored) = self.store.get(collection, &record.id)? {
                        record.sync_version = record.sync_version.max(stored.sync_version);
                    }
                    record.is_dirty = true;
                    self.store.put(collection, &record)?;
                    restored += 1;
                }
            }
        }

        tracing::info!(checkpoint_id, restored, "rollback completed");
        self.bus.emit(
            SyncEvent::new(EventType::RollbackCompleted)
                .payload(json!({"checkpoint_id": checkpoint_id, "restored_rows": restored})),
        );
        Ok(RollbackSummary {
            checkpoint_id: checkpoint_id.to_string(),
            restored_rows: restored,
        })
    }

    // ------------------------------------------------------------------
    // Replay
    // ------------------------------------------------------------------

    /// Record sync events into the diagnostic log until stopped. Data
    /// events capture the row at recording time so replay can re-execute
    /// them.
    pub fn start_recording(&self) {
        let mut slot = self.recorder.lock();
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let store = Arc::clone(&self.store);
        let cap = self.log_cap;
        let mut events = self.bus.subscribe(EventFilter::for_types([
            EventType::DataCreated,
            EventType::DataUpdated,
            EventType::DataDeleted,
            EventType::ConflictDetected,
            EventType::ConflictResolved,
            EventType::SyncError,
        ]));
        *slot = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let detail = match (&event.collection, &event.record_id) {
                    (Some(collection), Some(id)) => {
                        // Capture the row as it stands for re-execution.
                        match store.get(collection, id) {
                            Ok(Some(row)) => json!({"record": Value::Object(row.to_map())}),
                            _ => event.payload.clone(),
                        }
                    }
                    _ => event.payload.clone(),
                };
                let entry = LogEntry {
                    at: event.timestamp,
                    event_type: format!("{:?}", event.event_type),
                    collection: event.collection.clone(),
                    record_id: event.record_id.clone(),
                    detail,
                };
                if let Err(e) = store.append_log(&entry) {
                    tracing::warn!(error = %e, "event recording failed");
                }
                let _ = store.prune_logs(cap);
            }
        }));
    }

    pub fn stop_recording(&self) {
        if let Some(task) = self.recorder.lock().take() {
            task.abort();
        }
    }

    /// Re-examine recorded events. Dry-run summarizes without mutation;
    /// otherwise data events with a captured row are written back.
    pub fn replay(&self, since: Option<DateTime<Utc>>, dry_run: bool) -> Result<ReplayReport> {
        let entries = self.store.list_logs(since, None)?;
        let mut report = ReplayReport {
            total: entries.len(),
            ..ReplayReport::default()
        };

        for entry in &entries {
            *report.by_type.entry(entry.event_type.clone()).or_insert(0) += 1;
            if dry_run {
                continue;
            }
            let (Some(collection), Some(row)) = (
                entry.collection.as_deref(),
                entry.detail.get("record").and_then(Value::as_object),
            ) else {
                continue;
            };
            let mut record = SyncRecord::from_map(row)?;
            if let Some(stored) = self.store.get(collection, &record.id)? {
                record.sync_version = record.sync_version.max(stored.sync_version);
            }
            self.store.put(collection, &record)?;
            report.applied += 1;
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // State inspection
    // ------------------------------------------------------------------

    /// Pure read path: per-collection counts, a health score, and
    /// suggested remediations.
    pub fn inspect(&self) -> Result<EngineStateReport> {
        let mut collections = Vec::new();
        for def in &self.collections {
            let counts = self.store.counts(&def.name, None)?;

            let stale_cutoff = Utc::now() - chrono::Duration::hours(STALE_DIRTY_HOURS);
            let stale_dirty = self
                .store
                .query(
                    &def.name,
                    &Query {
                        filters: vec![
                            FieldFilter {
                                field: "is_dirty".into(),
                                op: FilterOp::Eq,
                                value: json!(1),
                            },
                            FieldFilter {
                                field: "updated_at".into(),
                                op: FilterOp::Lt,
                                value: json!(
                                    stale_cutoff.to_rfc3339_opts(SecondsFormat::Millis, true)
                                ),
                            },
                        ],
                        include_deleted: true,
                        ..Query::default()
                    },
                )?
                .len();

            let population = counts.total + counts.tombstones;
            let mut health = if population == 0 {
                1.0
            } else {
                1.0 - counts.dirty as f64 / population as f64
            };
            if stale_dirty > 0 {
                health -= 0.25;
            }
            let health = health.clamp(0.0, 1.0);

            let mut remediations = Vec::new();
            if stale_dirty > 0 {
                remediations.push(format!(
                    "{stale_dirty} rows dirty for more than {STALE_DIRTY_HOURS}h; check network connectivity or authentication"
                ));
            }
            if counts.tombstones > counts.total && counts.tombstones > 0 {
                remediations
                    .push("tombstones outnumber live rows; configure retention and purge".into());
            }

            collections.push(CollectionState {
                collection: def.name.clone(),
                total: counts.total,
                synced: counts.synced,
                dirty: counts.dirty,
                tombstones: counts.tombstones,
                stale_dirty,
                health,
                remediations,
            });
        }

        let overall_health = if collections.is_empty() {
            1.0
        } else {
            collections.iter().map(|c| c.health).sum::<f64>() / collections.len() as f64
        };
        Ok(EngineStateReport {
            collections,
            overall_health,
            queue_pending: self.queue.pending_len(),
            queue_in_flight: self.queue.in_flight_len(),
        })
    }
}

impl Drop for RecoveryManager {
    fn drop(&mut self) {
        if let Some(task) = self.recorder.lock().take() {
            task.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::collection;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    fn setup() -> (RecoveryManager, Arc<dyn LocalStore>, Arc<EventBus>) {
        let store: Arc<dyn LocalStore> = Arc::new(MemoryStore::new());
        let defs = vec![Arc::new(collection("notes").build())];
        store.register_collections(&defs).unwrap();
        let bus = Arc::new(EventBus::new(256));
        let queue = Arc::new(OperationQueue::new(bus.clone(), 100));
        let recovery = RecoveryManager::new(store.clone(), queue, bus.clone(), defs, 100);
        (recovery, store, bus)
    }

    fn dirty_record(id: &str, title: &str) -> SyncRecord {
        let mut fields = Map::new();
        fields.insert("title".into(), json!(title));
        let mut record = SyncRecord::new_local(fields, None, None);
        record.id = id.to_string();
        record
    }

    #[test]
    fn checkpoint_captures_dirty_rows() {
        let (recovery, store, _bus) = setup();
        store.put("notes", &dirty_record("a", "one")).unwrap();

        let checkpoint = recovery.create_checkpoint("before risky change").unwrap();
        let rows = checkpoint.state["dirty"]["notes"].as_array().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["id"], json!("a"));

        assert_eq!(recovery.list_checkpoints().unwrap().len(), 1);
    }

    #[test]
    fn rollback_restores_dirty_fields_and_auto_checkpoints() {
        let (recovery, store, _bus) = setup();
        let record = dirty_record("a", "original");
        store.put("notes", &record).unwrap();
        let checkpoint = recovery.create_checkpoint("baseline").unwrap();

        // Mutate past the checkpoint.
        let mut mutated = store.get("notes", "a").unwrap().unwrap();
        mutated.fields.insert("title".into(), json!("mutated"));
        mutated.touch(None);
        store.put("notes", &mutated).unwrap();

        let summary = recovery.rollback(&checkpoint.checkpoint_id).unwrap();
        assert_eq!(summary.restored_rows, 1);

        let restored = store.get("notes", "a").unwrap().unwrap();
        assert_eq!(restored.fields["title"], json!("original"));
        assert!(restored.is_dirty);
        // Versions never regress.
        assert!(restored.sync_version >= mutated.sync_version);

        // Baseline + automatic pre-rollback checkpoint.
        assert_eq!(recovery.list_checkpoints().unwrap().len(), 2);
    }

    #[test]
    fn rollback_of_unknown_checkpoint_fails() {
        let (recovery, _store, _bus) = setup();
        assert!(matches!(
            recovery.rollback("nope").unwrap_err(),
            SyncError::NotFound { .. }
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn recording_and_dry_run_replay() {
        let (recovery, store, bus) = setup();
        recovery.start_recording();
        // Let the recorder subscribe.
        tokio::time::sleep(Duration::from_millis(20)).await;

        store.put("notes", &dirty_record("a", "one")).unwrap();
        bus.emit(
            SyncEvent::new(EventType::DataCreated)
                .collection("notes")
                .record("a"),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        recovery.stop_recording();

        let report = recovery.replay(None, true).unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.by_type.get("DataCreated"), Some(&1));
        assert_eq!(report.applied, 0, "dry run must not mutate");
    }

    #[test]
    fn inspect_reports_health_and_remediations() {
        let (recovery, store, _bus) = setup();

        // A synced row, a fresh dirty row, and a stale dirty row.
        let mut clean = dirty_record("clean", "ok");
        clean.is_dirty = false;
        clean.last_synced_at = Some(Utc::now());
        store.put("notes", &clean).unwrap();

        store.put("notes", &dirty_record("fresh", "pending")).unwrap();

        let mut stale = dirty_record("stale", "stuck");
        stale.updated_at = Utc::now() - chrono::Duration::hours(48);
        store.put("notes", &stale).unwrap();

        let report = recovery.inspect().unwrap();
        assert_eq!(report.collections.len(), 1);
        let state = &report.collections[0];
        assert_eq!(state.total, 3);
        assert_eq!(state.dirty, 2);
        assert_eq!(state.stale_dirty, 1);
        assert!(state.health < 1.0);
        assert!(!state.remediations.is_empty());
        assert!(report.overall_health < 1.0);
    }

    #[test]
    fn empty_store_is_perfectly_healthy() {
        let (recovery, _store, _bus) = setup();
        let report = recovery.inspect().unwrap();
        assert_eq!(report.collections[0].health, 1.0);
        assert_eq!(report.overall_health, 1.0);
        assert_eq!(report.queue_pending, 0);
    }
}
