//! SQLite-backed [`LocalStore`].
//!
//! One table per collection carrying the sync header columns plus a JSON
//! `fields` column for the application field bag. Booleans are 0/1
//! INTEGERs and timestamps ISO 8601 TEXT (a fixed millisecond format, so
//! lexicographic comparison matches chronological order). Reserved engine
//! state lives in `__usm_*` tables.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::Value;

use crate::collection::CollectionDef;
use crate::error::{Result, SyncError};
use crate::queue::Operation;
use crate::record::{is_header_field, SyncRecord};

use super::traits::{
    CheckpointRecord, CollectionCounts, FilterOp, LocalStore, LogEntry, Query,
};

const RESERVED_PREFIX: &str = "__usm_";

const RECORD_COLUMNS: &str = "id, organization_id, created_at, updated_at, deleted_at, \
     created_by, updated_by, sync_version, is_dirty, last_synced_at, is_deleted, fields";

// ============================================================================
// SqliteStore
// ============================================================================

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at `path` and create the reserved tables.
    pub fn open(path: &std::path::Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        // journal_mode returns a row, so it cannot go through execute_batch.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS __usm_watermarks (
                 collection     TEXT NOT NULL,
                 org            TEXT NOT NULL DEFAULT '',
                 last_synced_at TEXT NOT NULL,
                 PRIMARY KEY (collection, org)
             );

             CREATE TABLE IF NOT EXISTS __usm_queue (
                 operation_id TEXT PRIMARY KEY,
                 priority     INTEGER NOT NULL,
                 enqueued_at  TEXT NOT NULL,
                 data         TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS __usm_checkpoints (
                 checkpoint_id TEXT PRIMARY KEY,
                 description   TEXT NOT NULL,
                 created_at    TEXT NOT NULL,
                 state         TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS __usm_logs (
                 seq        INTEGER PRIMARY KEY AUTOINCREMENT,
                 at         TEXT NOT NULL,
                 event_type TEXT NOT NULL,
                 collection TEXT,
                 record_id  TEXT,
                 detail     TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS __usm_leases (
                 collection TEXT PRIMARY KEY,
                 owner      TEXT NOT NULL,
                 expires_at TEXT NOT NULL
             );

             CREATE TABLE IF NOT EXISTS __usm_meta (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

// ============================================================================
// Encoding helpers
// ============================================================================

/// Canonical timestamp encoding. Millisecond precision with a `Z` suffix
/// keeps TEXT comparison chronological.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::Internal(format!("corrupt timestamp '{s}': {e}")))
}

fn opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

/// Collection and field names are interpolated into SQL; restrict them to
/// identifier characters.
fn valid_ident(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_collection(name: &str) -> Result<()> {
    if !valid_ident(name) || name.starts_with(RESERVED_PREFIX) {
        return Err(SyncError::validation(format!(
            "invalid collection name '{name}'"
        )));
    }
    Ok(())
}

fn sql_value(v: &Value) -> rusqlite::types::Value {
    use rusqlite::types::Value as Sql;
    match v {
        Value::Null => Sql::Null,
        Value::Bool(b) => Sql::Integer(i64::from(*b)),
        Value::Number(n) => n
            .as_i64()
            .map(Sql::Integer)
            .unwrap_or_else(|| Sql::Real(n.as_f64().unwrap_or(0.0))),
        Value::String(s) => Sql::Text(s.clone()),
        other => Sql::Text(other.to_string()),
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        created_at: row.get(2)?,
        updated_at: row.get(3)?,
        deleted_at: row.get(4)?,
        created_by: row.get(5)?,
        updated_by: row.get(6)?,
        sync_version: row.get(7)?,
        is_dirty: row.get::<_, i64>(8)? != 0,
        last_synced_at: row.get(9)?,
        is_deleted: row.get::<_, i64>(10)? != 0,
        fields: row.get(11)?,
    })
}

struct RawRow {
    id: String,
    organization_id: Option<String>,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
    created_by: Option<String>,
    updated_by: Option<String>,
    sync_version: i64,
    is_dirty: bool,
    last_synced_at: Option<String>,
    is_deleted: bool,
    fields: String,
}

impl RawRow {
    fn into_record(self) -> Result<SyncRecord> {
        let fields: Value = serde_json::from_str(&self.fields)?;
        Ok(SyncRecord {
            id: self.id,
            organization_id: self.organization_id,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            deleted_at: opt_ts(self.deleted_at)?,
            created_by: self.created_by,
            updated_by: self.updated_by,
            sync_version: self.sync_version,
            is_dirty: self.is_dirty,
            last_synced_at: opt_ts(self.last_synced_at)?,
            is_deleted: self.is_deleted,
            fields: fields.as_object().cloned().unwrap_or_default(),
        })
    }
}

/// SQL expression addressing a filter field: header fields hit their
/// column, anything else goes through the JSON field bag.
fn field_expr(field: &str) -> Result<String> {
    if !valid_ident(field) {
        return Err(SyncError::validation(format!(
            "invalid predicate field '{field}'"
        )));
    }
    if is_header_field(field) {
        Ok(format!("\"{field}\""))
    } else {
        Ok(format!("json_extract(fields, '$.{field}')"))
    }
}

fn op_sql(op: FilterOp) -> &'static str {
    match op {
        FilterOp::Eq => "=",
        FilterOp::Ne => "<>",
        FilterOp::Gt => ">",
        FilterOp::Gte => ">=",
        FilterOp::Lt => "<",
        FilterOp::Lte => "<=",
        FilterOp::Like => "LIKE",
    }
}

// ============================================================================
// LocalStore implementation
// ============================================================================

impl LocalStore for SqliteStore {
    fn register_collections(&self, defs: &[Arc<CollectionDef>]) -> Result<()> {
        let conn = self.conn.lock();
        for def in defs {
            check_collection(&def.name)?;
            let name = &def.name;
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS \"{name}\" (
                     id             TEXT PRIMARY KEY,
                     organization_id TEXT,
                     created_at     TEXT NOT NULL,
                     updated_at     TEXT NOT NULL,
                     deleted_at     TEXT,
                     created_by     TEXT,
                     updated_by     TEXT,
                     sync_version   INTEGER NOT NULL DEFAULT 0,
                     is_dirty       INTEGER NOT NULL DEFAULT 0,
                     last_synced_at TEXT,
                     is_deleted     INTEGER NOT NULL DEFAULT 0,
                     fields         TEXT NOT NULL DEFAULT '{{}}'
                 );
                 CREATE INDEX IF NOT EXISTS \"idx_{name}_org\" ON \"{name}\" (organization_id);
                 CREATE INDEX IF NOT EXISTS \"idx_{name}_dirty\" ON \"{name}\" (is_dirty);
                 CREATE INDEX IF NOT EXISTS \"idx_{name}_deleted\" ON \"{name}\" (is_deleted, is_dirty);
                 CREATE INDEX IF NOT EXISTS \"idx_{name}_updated\" ON \"{name}\" (updated_at);"
            ))?;
        }
        Ok(())
    }

    fn put(&self, collection: &str, record: &SyncRecord) -> Result<SyncRecord> {
        check_collection(collection)?;
        if record.sync_version < 0 {
            return Err(SyncError::validation(format!(
                "negative sync_version for {}/{}",
                collection, record.id
            )));
        }

        let conn = self.conn.lock();
        let existing: Option<(Option<String>, i64)> = conn
            .query_row(
                &format!(
                    "SELECT organization_id, sync_version FROM \"{collection}\" WHERE id = ?1"
                ),
                params![record.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((ref org, version)) = existing {
            if org.is_some() && *org != record.organization_id {
                return Err(SyncError::validation(format!(
                    "organization_id is immutable for {}/{}",
                    collection, record.id
                )));
            }
            if record.sync_version < version {
                return Err(SyncError::validation(format!(
                    "sync_version may not decrease for {}/{} ({} -> {})",
                    collection, record.id, version, record.sync_version
                )));
            }
        }

        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO \"{collection}\" ({RECORD_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                record.id,
                record.organization_id,
                ts(record.created_at),
                ts(record.updated_at),
                record.deleted_at.map(ts),
                record.created_by,
                record.updated_by,
                record.sync_version,
                i64::from(record.is_dirty),
                record.last_synced_at.map(ts),
                i64::from(record.is_deleted),
                Value::Object(record.fields.clone()).to_string(),
            ],
        )?;
        Ok(record.clone())
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<SyncRecord>> {
        check_collection(collection)?;
        let conn = self.conn.lock();
        let raw = conn
            .query_row(
                &format!("SELECT {RECORD_COLUMNS} FROM \"{collection}\" WHERE id = ?1"),
                params![id],
                row_to_record,
            )
            .optional()?;
        raw.map(RawRow::into_record).transpose()
    }

    fn query(&self, collection: &str, query: &Query) -> Result<Vec<SyncRecord>> {
        check_collection(collection)?;

        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM \"{collection}\" WHERE 1 = 1");
        let mut bind: Vec<rusqlite::types::Value> = Vec::new();

        if !query.include_deleted {
            sql.push_str(" AND is_deleted = 0");
        }
        for filter in &query.filters {
            let expr = field_expr(&filter.field)?;
            sql.push_str(&format!(" AND {expr} {} ?", op_sql(filter.op)));
            bind.push(sql_value(&filter.value));
        }
        if let Some(ref order) = query.order_by {
            let expr = field_expr(&order.field)?;
            sql.push_str(&format!(
                " ORDER BY {expr} {}",
                if order.descending { "DESC" } else { "ASC" }
            ));
        } else {
            sql.push_str(" ORDER BY id ASC");
        }
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
            if let Some(offset) = query.offset {
                sql.push_str(&format!(" OFFSET {offset}"));
            }
        } else if let Some(offset) = query.offset {
            sql.push_str(&format!(" LIMIT -1 OFFSET {offset}"));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bind), row_to_record)?;
        let mut records = Vec::new();
        for raw in rows {
            records.push(raw?.into_record()?);
        }
        Ok(records)
    }

    fn list_dirty(&self, collection: &str, org: Option<&str>) -> Result<Vec<SyncRecord>> {
        check_collection(collection)?;
        let conn = self.conn.lock();
        let mut sql =
            format!("SELECT {RECORD_COLUMNS} FROM \"{collection}\" WHERE is_dirty = 1");
        let mut bind: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(org) = org {
            sql.push_str(" AND organization_id = ?");
            bind.push(rusqlite::types::Value::Text(org.to_string()));
        }
        sql.push_str(" ORDER BY updated_at ASC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bind), row_to_record)?;
        let mut records = Vec::new();
        for raw in rows {
            records.push(raw?.into_record()?);
        }
        Ok(records)
    }

    fn list_changed_since(
        &self,
        collection: &str,
        watermark: DateTime<Utc>,
        org: Option<&str>,
    ) -> Result<Vec<SyncRecord>> {
        check_collection(collection)?;
        let conn = self.conn.lock();
        let mut sql =
            format!("SELECT {RECORD_COLUMNS} FROM \"{collection}\" WHERE updated_at > ?");
        let mut bind: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(ts(watermark))];
        if let Some(org) = org {
            sql.push_str(" AND organization_id = ?");
            bind.push(rusqlite::types::Value::Text(org.to_string()));
        }
        sql.push_str(" ORDER BY updated_at ASC");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bind), row_to_record)?;
        let mut records = Vec::new();
        for raw in rows {
            records.push(raw?.into_record()?);
        }
        Ok(records)
    }

    fn mark_synced(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        check_collection(collection)?;
        let conn = self.conn.lock();
        let changed = conn.execute(
            &format!(
                "UPDATE \"{collection}\" SET is_dirty = 0, last_synced_at = ?1
                 WHERE id = ?2 AND sync_version = ?3"
            ),
            params![ts(at), id, expected_version],
        )?;
        if changed > 0 {
            return Ok(());
        }

        // Distinguish a CAS loss from a missing row.
        let exists: Option<i64> = conn
            .query_row(
                &format!("SELECT sync_version FROM \"{collection}\" WHERE id = ?1"),
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        match exists {
            Some(_) => Err(SyncError::VersionMismatch {
                collection: collection.to_string(),
                id: id.to_string(),
                expected: expected_version,
            }),
            None => Err(SyncError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            }),
        }
    }

    fn soft_delete(&self, collection: &str, id: &str, by: Option<&str>) -> Result<()> {
        check_collection(collection)?;
        let now = ts(Utc::now());
        let conn = self.conn.lock();
        let changed = conn.execute(
            &format!(
                "UPDATE \"{collection}\" SET
                     is_deleted = 1,
                     deleted_at = ?1,
                     is_dirty = 1,
                     sync_version = sync_version + 1,
                     updated_at = ?1,
                     updated_by = COALESCE(?2, updated_by)
                 WHERE id = ?3"
            ),
            params![now, by, id],
        )?;
        if changed == 0 {
            return Err(SyncError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    fn purge_tombstones(
        &self,
        collection: &str,
        before: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<usize> {
        check_collection(collection)?;
        let conn = self.conn.lock();
        let predicate = "is_deleted = 1
             AND deleted_at IS NOT NULL
             AND last_synced_at IS NOT NULL
             AND last_synced_at >= deleted_at
             AND deleted_at <= ?1";
        if dry_run {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM \"{collection}\" WHERE {predicate}"),
                params![ts(before)],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        } else {
            let removed = conn.execute(
                &format!("DELETE FROM \"{collection}\" WHERE {predicate}"),
                params![ts(before)],
            )?;
            Ok(removed)
        }
    }

    fn counts(&self, collection: &str, org: Option<&str>) -> Result<CollectionCounts> {
        check_collection(collection)?;
        let conn = self.conn.lock();
        let mut sql = format!(
            "SELECT
                 COALESCE(SUM(CASE WHEN is_deleted = 0 THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN is_deleted = 0 AND is_dirty = 0
                                    AND last_synced_at IS NOT NULL THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN is_dirty = 1 THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN is_deleted = 1 THEN 1 ELSE 0 END), 0)
             FROM \"{collection}\""
        );
        let mut bind: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(org) = org {
            sql.push_str(" WHERE organization_id = ?");
            bind.push(rusqlite::types::Value::Text(org.to_string()));
        }
        let (total, synced, dirty, tombstones): (i64, i64, i64, i64) =
            conn.query_row(&sql, params_from_iter(bind), |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?;
        Ok(CollectionCounts {
            total: total as usize,
            synced: synced as usize,
            dirty: dirty as usize,
            tombstones: tombstones as usize,
        })
    }

    // ------------------------------------------------------------------
    // Watermarks
    // ------------------------------------------------------------------

    fn get_watermark(&self, collection: &str, org: Option<&str>) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT last_synced_at FROM __usm_watermarks WHERE collection = ?1 AND org = ?2",
                params![collection, org.unwrap_or("")],
                |row| row.get(0),
            )
            .optional()?;
        opt_ts(raw)
    }

    fn set_watermark(&self, collection: &str, org: Option<&str>, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO __usm_watermarks (collection, org, last_synced_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (collection, org) DO UPDATE SET
                 last_synced_at = excluded.last_synced_at
             WHERE excluded.last_synced_at > last_synced_at",
            params![collection, org.unwrap_or(""), ts(at)],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queue persistence
    // ------------------------------------------------------------------

    fn save_queue_snapshot(&self, operations: &[Operation]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM __usm_queue", [])?;
        for op in operations {
            tx.execute(
                "INSERT INTO __usm_queue (operation_id, priority, enqueued_at, data)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    op.operation_id,
                    op.priority.rank() as i64,
                    ts(op.enqueued_at),
                    serde_json::to_string(op)?,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn load_queue_snapshot(&self) -> Result<Vec<Operation>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT data FROM __usm_queue ORDER BY priority ASC, enqueued_at ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut operations = Vec::new();
        for raw in rows {
            operations.push(serde_json::from_str(&raw?)?);
        }
        Ok(operations)
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    fn save_checkpoint(&self, checkpoint: &CheckpointRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO __usm_checkpoints (checkpoint_id, description, created_at, state)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                checkpoint.checkpoint_id,
                checkpoint.description,
                ts(checkpoint.created_at),
                checkpoint.state.to_string(),
            ],
        )?;
        Ok(())
    }

    fn load_checkpoint(&self, checkpoint_id: &str) -> Result<Option<CheckpointRecord>> {
        let conn = self.conn.lock();
        let row: Option<(String, String, String, String)> = conn
            .query_row(
                "SELECT checkpoint_id, description, created_at, state
                 FROM __usm_checkpoints WHERE checkpoint_id = ?1",
                params![checkpoint_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        row.map(|(id, description, created_at, state)| {
            Ok(CheckpointRecord {
                checkpoint_id: id,
                description,
                created_at: parse_ts(&created_at)?,
                state: serde_json::from_str(&state)?,
            })
        })
        .transpose()
    }

    fn list_checkpoints(&self) -> Result<Vec<CheckpointRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT checkpoint_id, description, created_at, state
             FROM __usm_checkpoints ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;
        let mut checkpoints = Vec::new();
        for raw in rows {
            let (id, description, created_at, state) = raw?;
            checkpoints.push(CheckpointRecord {
                checkpoint_id: id,
                description,
                created_at: parse_ts(&created_at)?,
                state: serde_json::from_str(&state)?,
            });
        }
        Ok(checkpoints)
    }

    fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM __usm_checkpoints WHERE checkpoint_id = ?1",
            params![checkpoint_id],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    fn append_log(&self, entry: &LogEntry) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO __usm_logs (at, event_type, collection, record_id, detail)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                ts(entry.at),
                entry.event_type,
                entry.collection,
                entry.record_id,
                entry.detail.to_string(),
            ],
        )?;
        Ok(())
    }

    fn list_logs(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<LogEntry>> {
        let conn = self.conn.lock();
        let mut sql =
            String::from("SELECT at, event_type, collection, record_id, detail FROM __usm_logs");
        let mut bind: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(since) = since {
            sql.push_str(" WHERE at >= ?");
            bind.push(rusqlite::types::Value::Text(ts(since)));
        }
        sql.push_str(" ORDER BY seq ASC");
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(bind), |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut entries = Vec::new();
        for raw in rows {
            let (at, event_type, collection, record_id, detail) = raw?;
            entries.push(LogEntry {
                at: parse_ts(&at)?,
                event_type,
                collection,
                record_id,
                detail: serde_json::from_str(&detail)?,
            });
        }
        Ok(entries)
    }

    fn prune_logs(&self, cap: usize) -> Result<usize> {
        let conn = self.conn.lock();
        let removed = conn.execute(
            "DELETE FROM __usm_logs WHERE seq NOT IN
                 (SELECT seq FROM __usm_logs ORDER BY seq DESC LIMIT ?1)",
            params![cap as i64],
        )?;
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Leases
    // ------------------------------------------------------------------

    fn acquire_lease(&self, collection: &str, owner: &str, ttl: Duration) -> Result<()> {
        let now = Utc::now();
        let conn = self.conn.lock();
        let current: Option<(String, String)> = conn
            .query_row(
                "SELECT owner, expires_at FROM __usm_leases WHERE collection = ?1",
                params![collection],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((holder, expires_at)) = current {
            if holder != owner && parse_ts(&expires_at)? > now {
                return Err(SyncError::LeaseHeld {
                    collection: collection.to_string(),
                    holder,
                });
            }
        }

        let expires = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| SyncError::Internal(format!("lease ttl out of range: {e}")))?;
        conn.execute(
            "INSERT OR REPLACE INTO __usm_leases (collection, owner, expires_at)
             VALUES (?1, ?2, ?3)",
            params![collection, owner, ts(expires)],
        )?;
        Ok(())
    }

    fn release_lease(&self, collection: &str, owner: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "DELETE FROM __usm_leases WHERE collection = ?1 AND owner = ?2",
            params![collection, owner],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Ok(conn
            .query_row(
                "SELECT value FROM __usm_meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn set_meta(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO __usm_meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
