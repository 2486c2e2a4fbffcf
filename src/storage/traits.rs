//! The local store gateway: the single point of shared mutable state.
//!
//! All record mutation flows through [`LocalStore`]. Single-row updates
//! are atomic; `mark_synced` is a compare-and-swap on `sync_version` so a
//! slow acknowledgment racing a newer local mutation loses and the row
//! stays dirty.
//!
//! # Threading
//! All methods are synchronous. The SQLite implementation blocks on disk
//! I/O; async callers should expect these calls to block the current
//! thread briefly.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::collection::CollectionDef;
use crate::error::Result;
use crate::queue::Operation;
use crate::record::SyncRecord;

// ============================================================================
// Query types
// ============================================================================

/// Comparison operator for a field predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
}

/// One field predicate. Header fields address their columns directly;
/// any other name addresses an application field.
#[derive(Debug, Clone)]
pub struct FieldFilter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl FieldFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

/// A semantic predicate forwarded to the store. Not a query language:
/// conjunctive filters, one ordering, offset/limit pagination.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<FieldFilter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub include_deleted: bool,
}

// ============================================================================
// Aggregates and reserved-state types
// ============================================================================

/// Per-collection row counts, the raw material for state inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectionCounts {
    /// Live rows (tombstones excluded).
    pub total: usize,
    /// Rows acknowledged at their current version.
    pub synced: usize,
    pub dirty: usize,
    pub tombstones: usize,
}

/// A persisted checkpoint: dirty-row set plus queue snapshot, opaque to
/// the store.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CheckpointRecord {
    pub checkpoint_id: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub state: Value,
}

/// One diagnostic log row (`__usm_logs`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub event_type: String,
    pub collection: Option<String>,
    pub record_id: Option<String>,
    pub detail: Value,
}

// ============================================================================
// LocalStore
// ============================================================================

pub trait LocalStore: Send + Sync {
    /// Create backing tables for the given collections (idempotent).
    /// Reserved state tables are created on construction.
    fn register_collections(&self, defs: &[Arc<CollectionDef>]) -> Result<()>;

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    /// Persist a row with its full sync header. Fails validation when the
    /// version is negative or an existing row's `organization_id` would
    /// change.
    fn put(&self, collection: &str, record: &SyncRecord) -> Result<SyncRecord>;

    fn get(&self, collection: &str, id: &str) -> Result<Option<SyncRecord>>;

    fn query(&self, collection: &str, query: &Query) -> Result<Vec<SyncRecord>>;

    /// All rows with `is_dirty = 1`, optionally tenant-scoped.
    fn list_dirty(&self, collection: &str, org: Option<&str>) -> Result<Vec<SyncRecord>>;

    /// Rows with `updated_at` strictly after the watermark.
    fn list_changed_since(
        &self,
        collection: &str,
        watermark: DateTime<Utc>,
        org: Option<&str>,
    ) -> Result<Vec<SyncRecord>>;

    /// Acknowledge an upload: clear dirty and stamp `last_synced_at`,
    /// but only if `sync_version` still equals `expected_version`.
    /// A mismatch returns [`crate::error::SyncError::VersionMismatch`]
    /// and leaves the row dirty. Idempotent for the same version.
    fn mark_synced(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Tombstone a row: `is_deleted = 1`, `deleted_at = now`, dirty, with
    /// the usual version bump.
    fn soft_delete(&self, collection: &str, id: &str, by: Option<&str>) -> Result<()>;

    /// Remove acknowledged tombstones deleted at or before `before`.
    /// Unacknowledged tombstones are never purged. Returns the count;
    /// with `dry_run` nothing is removed.
    fn purge_tombstones(&self, collection: &str, before: DateTime<Utc>, dry_run: bool)
        -> Result<usize>;

    fn counts(&self, collection: &str, org: Option<&str>) -> Result<CollectionCounts>;

    // ------------------------------------------------------------------
    // Watermarks (__usm_watermarks)
    // ------------------------------------------------------------------

    fn get_watermark(&self, collection: &str, org: Option<&str>) -> Result<Option<DateTime<Utc>>>;

    /// Watermarks only move forward; an earlier instant is ignored.
    fn set_watermark(&self, collection: &str, org: Option<&str>, at: DateTime<Utc>) -> Result<()>;

    // ------------------------------------------------------------------
    // Queue persistence (__usm_queue)
    // ------------------------------------------------------------------

    /// Replace the persisted pending-operation snapshot.
    fn save_queue_snapshot(&self, operations: &[Operation]) -> Result<()>;

    fn load_queue_snapshot(&self) -> Result<Vec<Operation>>;

    // ------------------------------------------------------------------
    // Checkpoints (__usm_checkpoints)
    // ------------------------------------------------------------------

    fn save_checkpoint(&self, checkpoint: &CheckpointRecord) -> Result<()>;

    fn load_checkpoint(&self, checkpoint_id: &str) -> Result<Option<CheckpointRecord>>;

    /// Newest first.
    fn list_checkpoints(&self) -> Result<Vec<CheckpointRecord>>;

    fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Diagnostics (__usm_logs)
    // ------------------------------------------------------------------

    fn append_log(&self, entry: &LogEntry) -> Result<()>;

    /// Oldest first, optionally bounded.
    fn list_logs(&self, since: Option<DateTime<Utc>>, limit: Option<usize>) -> Result<Vec<LogEntry>>;

    /// Keep at most `cap` newest rows; returns the number removed.
    fn prune_logs(&self, cap: usize) -> Result<usize>;

    // ------------------------------------------------------------------
    // Orchestration leases (__usm_leases)
    // ------------------------------------------------------------------

    /// Take (or re-take, or steal-if-expired) the per-collection sync
    /// lease. Fails with `LeaseHeld` while another owner's lease is live.
    fn acquire_lease(&self, collection: &str, owner: &str, ttl: Duration) -> Result<()>;

    /// Release only if held by `owner`; releasing a foreign or absent
    /// lease is a no-op.
    fn release_lease(&self, collection: &str, owner: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // String metadata (__usm_meta)
    // ------------------------------------------------------------------

    fn get_meta(&self, key: &str) -> Result<Option<String>>;

    fn set_meta(&self, key: &str, value: &str) -> Result<()>;
}
