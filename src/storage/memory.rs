//! In-memory [`LocalStore`] with the same semantics as the SQLite store.
//!
//! Backs unit tests and short-lived engines; nothing survives the
//! process. Interior mutability via `parking_lot::Mutex`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::collection::CollectionDef;
use crate::error::{Result, SyncError};
use crate::queue::Operation;
use crate::record::{
    SyncRecord, FIELD_CREATED_AT, FIELD_DELETED_AT, FIELD_ID, FIELD_IS_DELETED, FIELD_IS_DIRTY,
    FIELD_LAST_SYNCED_AT, FIELD_ORGANIZATION_ID, FIELD_SYNC_VERSION, FIELD_UPDATED_AT,
};

use super::traits::{
    CheckpointRecord, CollectionCounts, FilterOp, LocalStore, LogEntry, Query,
};

#[derive(Default)]
struct Inner {
    registered: HashSet<String>,
    /// collection → (record id → record). BTreeMap keeps iteration
    /// deterministic for pagination.
    records: HashMap<String, BTreeMap<String, SyncRecord>>,
    watermarks: HashMap<(String, String), DateTime<Utc>>,
    queue: Vec<Operation>,
    checkpoints: BTreeMap<String, CheckpointRecord>,
    logs: Vec<LogEntry>,
    leases: HashMap<String, (String, DateTime<Utc>)>,
    meta: HashMap<String, String>,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Predicate evaluation
// ============================================================================

/// Canonical timestamp encoding shared with the SQLite store, so text
/// comparison stays chronological.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Pull a filterable value off a record: header fields by name, anything
/// else from the application bag.
fn field_value(record: &SyncRecord, field: &str) -> Value {
    match field {
        FIELD_ID => Value::String(record.id.clone()),
        FIELD_ORGANIZATION_ID => record
            .organization_id
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
        FIELD_SYNC_VERSION => Value::from(record.sync_version),
        FIELD_IS_DIRTY => Value::from(i64::from(record.is_dirty)),
        FIELD_IS_DELETED => Value::from(i64::from(record.is_deleted)),
        FIELD_CREATED_AT => Value::String(ts(record.created_at)),
        FIELD_UPDATED_AT => Value::String(ts(record.updated_at)),
        FIELD_DELETED_AT => record
            .deleted_at
            .map(|t| Value::String(ts(t)))
            .unwrap_or(Value::Null),
        FIELD_LAST_SYNCED_AT => record
            .last_synced_at
            .map(|t| Value::String(ts(t)))
            .unwrap_or(Value::Null),
        other => record.fields.get(other).cloned().unwrap_or(Value::Null),
    }
}

fn value_cmp(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .and_then(|x| y.as_f64().map(|y| (x, y)))
            .and_then(|(x, y)| x.partial_cmp(&y)),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn matches_filter(record: &SyncRecord, filter: &super::traits::FieldFilter) -> bool {
    let actual = field_value(record, &filter.field);
    match filter.op {
        FilterOp::Eq => actual == filter.value,
        FilterOp::Ne => actual != filter.value,
        FilterOp::Gt => matches!(value_cmp(&actual, &filter.value), Some(std::cmp::Ordering::Greater)),
        FilterOp::Gte => matches!(
            value_cmp(&actual, &filter.value),
            Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
        ),
        FilterOp::Lt => matches!(value_cmp(&actual, &filter.value), Some(std::cmp::Ordering::Less)),
        FilterOp::Lte => matches!(
            value_cmp(&actual, &filter.value),
            Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
        ),
        FilterOp::Like => match (&actual, &filter.value) {
            (Value::String(s), Value::String(pattern)) => {
                s.contains(pattern.trim_matches('%'))
            }
            _ => false,
        },
    }
}

impl Inner {
    fn table(&self, collection: &str) -> Result<&BTreeMap<String, SyncRecord>> {
        if !self.registered.contains(collection) {
            return Err(SyncError::UnknownCollection(collection.to_string()));
        }
        Ok(self
            .records
            .get(collection)
            .unwrap_or(&EMPTY_TABLE))
    }

    fn table_mut(&mut self, collection: &str) -> Result<&mut BTreeMap<String, SyncRecord>> {
        if !self.registered.contains(collection) {
            return Err(SyncError::UnknownCollection(collection.to_string()));
        }
        Ok(self.records.entry(collection.to_string()).or_default())
    }
}

static EMPTY_TABLE: BTreeMap<String, SyncRecord> = BTreeMap::new();

// ============================================================================
// LocalStore implementation
// ============================================================================

impl LocalStore for MemoryStore {
    fn register_collections(&self, defs: &[Arc<CollectionDef>]) -> Result<()> {
        let mut inner = self.inner.lock();
        for def in defs {
            if def.name.starts_with("__usm_") {
                return Err(SyncError::validation(format!(
                    "invalid collection name '{}'",
                    def.name
                )));
            }
            inner.registered.insert(def.name.clone());
            inner.records.entry(def.name.clone()).or_default();
        }
        Ok(())
    }

    fn put(&self, collection: &str, record: &SyncRecord) -> Result<SyncRecord> {
        if record.sync_version < 0 {
            return Err(SyncError::validation(format!(
                "negative sync_version for {}/{}",
                collection, record.id
            )));
        }
        let mut inner = self.inner.lock();
        let table = inner.table_mut(collection)?;
        if let Some(existing) = table.get(&record.id) {
            if existing.organization_id.is_some()
                && existing.organization_id != record.organization_id
            {
                return Err(SyncError::validation(format!(
                    "organization_id is immutable for {}/{}",
                    collection, record.id
                )));
            }
            if record.sync_version < existing.sync_version {
                return Err(SyncError::validation(format!(
                    "sync_version may not decrease for {}/{} ({} -> {})",
                    collection, record.id, existing.sync_version, record.sync_version
                )));
            }
        }
        table.insert(record.id.clone(), record.clone());
        Ok(record.clone())
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<SyncRecord>> {
        let inner = self.inner.lock();
        Ok(inner.table(collection)?.get(id).cloned())
    }

    fn query(&self, collection: &str, query: &Query) -> Result<Vec<SyncRecord>> {
        let inner = self.inner.lock();
        let mut hits: Vec<SyncRecord> = inner
            .table(collection)?
            .values()
            .filter(|r| query.include_deleted || !r.is_deleted)
            .filter(|r| query.filters.iter().all(|f| matches_filter(r, f)))
            .cloned()
            .collect();

        if let Some(ref order) = query.order_by {
            hits.sort_by(|a, b| {
                let ord = value_cmp(&field_value(a, &order.field), &field_value(b, &order.field))
                    .unwrap_or(std::cmp::Ordering::Equal);
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }

        let offset = query.offset.unwrap_or(0);
        let mut hits: Vec<SyncRecord> = hits.into_iter().skip(offset).collect();
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        Ok(hits)
    }

    fn list_dirty(&self, collection: &str, org: Option<&str>) -> Result<Vec<SyncRecord>> {
        let inner = self.inner.lock();
        let mut rows: Vec<SyncRecord> = inner
            .table(collection)?
            .values()
            .filter(|r| r.is_dirty)
            .filter(|r| org.is_none() || r.organization_id.as_deref() == org)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.updated_at);
        Ok(rows)
    }

    fn list_changed_since(
        &self,
        collection: &str,
        watermark: DateTime<Utc>,
        org: Option<&str>,
    ) -> Result<Vec<SyncRecord>> {
        let inner = self.inner.lock();
        let mut rows: Vec<SyncRecord> = inner
            .table(collection)?
            .values()
            .filter(|r| r.updated_at > watermark)
            .filter(|r| org.is_none() || r.organization_id.as_deref() == org)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.updated_at);
        Ok(rows)
    }

    fn mark_synced(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let table = inner.table_mut(collection)?;
        match table.get_mut(id) {
            None => Err(SyncError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            }),
            Some(record) if record.sync_version != expected_version => {
                Err(SyncError::VersionMismatch {
                    collection: collection.to_string(),
                    id: id.to_string(),
                    expected: expected_version,
                })
            }
            Some(record) => {
                record.is_dirty = false;
                record.last_synced_at = Some(at);
                Ok(())
            }
        }
    }

    fn soft_delete(&self, collection: &str, id: &str, by: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock();
        let table = inner.table_mut(collection)?;
        match table.get_mut(id) {
            None => Err(SyncError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            }),
            Some(record) => {
                record.mark_deleted(by);
                Ok(())
            }
        }
    }

    fn purge_tombstones(
        &self,
        collection: &str,
        before: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<usize> {
        let mut inner = self.inner.lock();
        let table = inner.table_mut(collection)?;
        let purgeable: Vec<String> = table
            .values()
            .filter(|r| r.deletion_acknowledged())
            .filter(|r| r.deleted_at.is_some_and(|d| d <= before))
            .map(|r| r.id.clone())
            .collect();
        if !dry_run {
            for id in &purgeable {
                table.remove(id);
            }
        }
        Ok(purgeable.len())
    }

    fn counts(&self, collection: &str, org: Option<&str>) -> Result<CollectionCounts> {
        let inner = self.inner.lock();
        let mut counts = CollectionCounts::default();
        for record in inner.table(collection)?.values() {
            if org.is_some() && record.organization_id.as_deref() != org {
                continue;
            }
            if record.is_deleted {
                counts.tombstones += 1;
            } else {
                counts.total += 1;
                if !record.is_dirty && record.last_synced_at.is_some() {
                    counts.synced += 1;
                }
            }
            if record.is_dirty {
                counts.dirty += 1;
            }
        }
        Ok(counts)
    }

    fn get_watermark(&self, collection: &str, org: Option<&str>) -> Result<Option<DateTime<Utc>>> {
        let inner = self.inner.lock();
        Ok(inner
            .watermarks
            .get(&(collection.to_string(), org.unwrap_or("").to_string()))
            .copied())
    }

    fn set_watermark(&self, collection: &str, org: Option<&str>, at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        let key = (collection.to_string(), org.unwrap_or("").to_string());
        let entry = inner.watermarks.entry(key).or_insert(at);
        if at > *entry {
            *entry = at;
        }
        Ok(())
    }

    fn save_queue_snapshot(&self, operations: &[Operation]) -> Result<()> {
        self.inner.lock().queue = operations.to_vec();
        Ok(())
    }

    fn load_queue_snapshot(&self) -> Result<Vec<Operation>> {
        Ok(self.inner.lock().queue.clone())
    }

    fn save_checkpoint(&self, checkpoint: &CheckpointRecord) -> Result<()> {
        self.inner
            .lock()
            .checkpoints
            .insert(checkpoint.checkpoint_id.clone(), checkpoint.clone());
        Ok(())
    }

    fn load_checkpoint(&self, checkpoint_id: &str) -> Result<Option<CheckpointRecord>> {
        Ok(self.inner.lock().checkpoints.get(checkpoint_id).cloned())
    }

    fn list_checkpoints(&self) -> Result<Vec<CheckpointRecord>> {
        let inner = self.inner.lock();
        let mut all: Vec<CheckpointRecord> = inner.checkpoints.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(all)
    }

    fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<()> {
        self.inner.lock().checkpoints.remove(checkpoint_id);
        Ok(())
    }

    fn append_log(&self, entry: &LogEntry) -> Result<()> {
        self.inner.lock().logs.push(entry.clone());
        Ok(())
    }

    fn list_logs(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<LogEntry>> {
        let inner = self.inner.lock();
        let mut entries: Vec<LogEntry> = inner
            .logs
            .iter()
            .filter(|e| since.is_none_or(|s| e.at >= s))
            .cloned()
            .collect();
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    fn prune_logs(&self, cap: usize) -> Result<usize> {
        let mut inner = self.inner.lock();
        let len = inner.logs.len();
        if len <= cap {
            return Ok(0);
        }
        let removed = len - cap;
        inner.logs.drain(..removed);
        Ok(removed)
    }

    fn acquire_lease(&self, collection: &str, owner: &str, ttl: Duration) -> Result<()> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        if let Some((holder, expires_at)) = inner.leases.get(collection) {
            if holder != owner && *expires_at > now {
                return Err(SyncError::LeaseHeld {
                    collection: collection.to_string(),
                    holder: holder.clone(),
                });
            }
        }
        let expires = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| SyncError::Internal(format!("lease ttl out of range: {e}")))?;
        inner
            .leases
            .insert(collection.to_string(), (owner.to_string(), expires));
        Ok(())
    }

    fn release_lease(&self, collection: &str, owner: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner
            .leases
            .get(collection)
            .is_some_and(|(holder, _)| holder == owner)
        {
            inner.leases.remove(collection);
        }
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().meta.get(key).cloned())
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        self.inner
            .lock()
            .meta
            .insert(key.to_string(), value.to_string());
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::collection;
    use serde_json::json;

    fn setup() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .register_collections(&[Arc::new(collection("notes").build())])
            .unwrap();
        store
    }

    fn make_record(id: &str) -> SyncRecord {
        let mut fields = serde_json::Map::new();
        fields.insert("title".into(), json!("hello"));
        let mut r = SyncRecord::new_local(fields, Some("org1".into()), None);
        r.id = id.to_string();
        r
    }

    #[test]
    fn unknown_collection_is_an_error() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get("nope", "x").unwrap_err(),
            SyncError::UnknownCollection(_)
        ));
    }

    #[test]
    fn cas_mark_synced_matches_sqlite_semantics() {
        let store = setup();
        let mut record = make_record("n1");
        store.put("notes", &record).unwrap();
        record.touch(None);
        store.put("notes", &record).unwrap();

        assert!(matches!(
            store.mark_synced("notes", "n1", 1, Utc::now()).unwrap_err(),
            SyncError::VersionMismatch { .. }
        ));
        store
            .mark_synced("notes", "n1", record.sync_version, Utc::now())
            .unwrap();
        assert!(!store.get("notes", "n1").unwrap().unwrap().is_dirty);
    }

    #[test]
    fn query_orders_and_paginates() {
        let store = setup();
        for (id, n) in [("a", 3), ("b", 1), ("c", 2)] {
            let mut r = make_record(id);
            r.fields.insert("rank".into(), json!(n));
            store.put("notes", &r).unwrap();
        }
        let q = Query {
            order_by: Some(super::super::traits::OrderBy {
                field: "rank".into(),
                descending: false,
            }),
            limit: Some(2),
            ..Query::default()
        };
        let hits = store.query("notes", &q).unwrap();
        let ids: Vec<&str> = hits.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn watermark_is_monotone() {
        let store = setup();
        let late = Utc::now();
        let early = late - chrono::Duration::minutes(5);
        store.set_watermark("notes", None, late).unwrap();
        store.set_watermark("notes", None, early).unwrap();
        assert_eq!(store.get_watermark("notes", None).unwrap(), Some(late));
    }
}
