//! Syncable record model: application fields plus the fixed sync header.
//!
//! Every record converts to and from a neutral key-value map. Dates cross
//! the boundary as ISO 8601 strings and booleans as 0/1 integers so the
//! same map works against relational and document backends. Keys that are
//! not part of the sync header round-trip untouched.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::{Result, SyncError};

// ============================================================================
// Sync header field names
// ============================================================================

pub const FIELD_ID: &str = "id";
pub const FIELD_ORGANIZATION_ID: &str = "organization_id";
pub const FIELD_CREATED_AT: &str = "created_at";
pub const FIELD_UPDATED_AT: &str = "updated_at";
pub const FIELD_DELETED_AT: &str = "deleted_at";
pub const FIELD_CREATED_BY: &str = "created_by";
pub const FIELD_UPDATED_BY: &str = "updated_by";
pub const FIELD_SYNC_VERSION: &str = "sync_version";
pub const FIELD_IS_DIRTY: &str = "is_dirty";
pub const FIELD_LAST_SYNCED_AT: &str = "last_synced_at";
pub const FIELD_IS_DELETED: &str = "is_deleted";

const HEADER_FIELDS: &[&str] = &[
    FIELD_ID,
    FIELD_ORGANIZATION_ID,
    FIELD_CREATED_AT,
    FIELD_UPDATED_AT,
    FIELD_DELETED_AT,
    FIELD_CREATED_BY,
    FIELD_UPDATED_BY,
    FIELD_SYNC_VERSION,
    FIELD_IS_DIRTY,
    FIELD_LAST_SYNCED_AT,
    FIELD_IS_DELETED,
];

/// Whether a map key belongs to the sync header.
pub fn is_header_field(name: &str) -> bool {
    HEADER_FIELDS.contains(&name)
}

// ============================================================================
// SyncRecord
// ============================================================================

/// A row participating in sync: application fields plus the sync header.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRecord {
    /// Primary identity. Generated locally on create, never reassigned.
    pub id: String,
    /// Multi-tenant scope. Immutable after create.
    pub organization_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    /// Monotone, non-negative. Incremented on every local mutation.
    pub sync_version: i64,
    /// True iff the row has local changes not yet acknowledged remotely.
    pub is_dirty: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Soft-delete flag. Tombstones still sync until acknowledged.
    pub is_deleted: bool,
    /// Application fields, header keys excluded. Unknown remote fields
    /// land here verbatim.
    pub fields: Map<String, Value>,
}

impl SyncRecord {
    /// Create a locally-authored record: version 1, dirty.
    pub fn new_local(
        fields: Map<String, Value>,
        organization_id: Option<String>,
        created_by: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            organization_id,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            created_by: created_by.clone(),
            updated_by: created_by,
            sync_version: 1,
            is_dirty: true,
            last_synced_at: None,
            is_deleted: false,
            fields,
        }
    }

    /// Build a record from a remote map: clean, remote version preserved.
    pub fn from_remote(map: &Map<String, Value>) -> Result<Self> {
        let mut record = Self::from_map(map)?;
        record.is_dirty = false;
        Ok(record)
    }

    /// Apply a local mutation: bump version, set dirty, stamp audit fields.
    pub fn touch(&mut self, by: Option<&str>) {
        self.sync_version += 1;
        self.is_dirty = true;
        self.updated_at = Utc::now();
        if let Some(by) = by {
            self.updated_by = Some(by.to_string());
        }
    }

    /// Soft-delete: tombstone the record and mark it for upload.
    pub fn mark_deleted(&mut self, by: Option<&str>) {
        self.is_deleted = true;
        self.deleted_at = Some(Utc::now());
        self.touch(by);
    }

    /// Whether this tombstone's deletion has been acknowledged remotely,
    /// making it eligible for purge once retention elapses.
    pub fn deletion_acknowledged(&self) -> bool {
        match (self.is_deleted, self.deleted_at, self.last_synced_at) {
            (true, Some(deleted), Some(synced)) => synced >= deleted,
            _ => false,
        }
    }

    // ------------------------------------------------------------------------
    // Neutral map conversion
    // ------------------------------------------------------------------------

    /// Serialize to the neutral key-value map: header first, then
    /// application fields. Dates become ISO 8601 strings, booleans 0/1.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(FIELD_ID.into(), Value::String(self.id.clone()));
        if let Some(ref org) = self.organization_id {
            map.insert(FIELD_ORGANIZATION_ID.into(), Value::String(org.clone()));
        }
        map.insert(FIELD_CREATED_AT.into(), iso(self.created_at));
        map.insert(FIELD_UPDATED_AT.into(), iso(self.updated_at));
        if let Some(at) = self.deleted_at {
            map.insert(FIELD_DELETED_AT.into(), iso(at));
        }
        if let Some(ref by) = self.created_by {
            map.insert(FIELD_CREATED_BY.into(), Value::String(by.clone()));
        }
        if let Some(ref by) = self.updated_by {
            map.insert(FIELD_UPDATED_BY.into(), Value::String(by.clone()));
        }
        map.insert(FIELD_SYNC_VERSION.into(), Value::from(self.sync_version));
        map.insert(FIELD_IS_DIRTY.into(), bool_int(self.is_dirty));
        if let Some(at) = self.last_synced_at {
            map.insert(FIELD_LAST_SYNCED_AT.into(), iso(at));
        }
        map.insert(FIELD_IS_DELETED.into(), bool_int(self.is_deleted));
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.clone());
        }
        map
    }

    /// Parse from a neutral key-value map. Header fields are validated;
    /// everything else is carried as an application field.
    pub fn from_map(map: &Map<String, Value>) -> Result<Self> {
        let id = map
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| SyncError::validation("record map missing 'id'"))?
            .to_string();

        let sync_version = match map.get(FIELD_SYNC_VERSION) {
            Some(v) => v.as_i64().ok_or_else(|| {
                SyncError::validation(format!("'{FIELD_SYNC_VERSION}' must be an integer"))
            })?,
            None => 0,
        };
        if sync_version < 0 {
            return Err(SyncError::validation(format!(
                "'{FIELD_SYNC_VERSION}' must be non-negative, got {sync_version}"
            )));
        }

        let now = Utc::now();
        let created_at = parse_instant(map.get(FIELD_CREATED_AT), FIELD_CREATED_AT)?.unwrap_or(now);
        let updated_at = parse_instant(map.get(FIELD_UPDATED_AT), FIELD_UPDATED_AT)?.unwrap_or(now);

        let mut fields = Map::new();
        for (k, v) in map {
            if !is_header_field(k) {
                fields.insert(k.clone(), v.clone());
            }
        }

        Ok(Self {
            id,
            organization_id: opt_string(map.get(FIELD_ORGANIZATION_ID)),
            created_at,
            updated_at,
            deleted_at: parse_instant(map.get(FIELD_DELETED_AT), FIELD_DELETED_AT)?,
            created_by: opt_string(map.get(FIELD_CREATED_BY)),
            updated_by: opt_string(map.get(FIELD_UPDATED_BY)),
            sync_version,
            is_dirty: parse_bool(map.get(FIELD_IS_DIRTY)),
            last_synced_at: parse_instant(map.get(FIELD_LAST_SYNCED_AT), FIELD_LAST_SYNCED_AT)?,
            is_deleted: parse_bool(map.get(FIELD_IS_DELETED)),
            fields,
        })
    }

    /// Application fields plus `id`: the payload adapters send upstream
    /// when the backend manages its own metadata columns.
    pub fn app_fields(&self) -> &Map<String, Value> {
        &self.fields
    }
}

// ============================================================================
// Wire encoding helpers
// ============================================================================

fn iso(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn bool_int(b: bool) -> Value {
    Value::from(if b { 1 } else { 0 })
}

fn opt_string(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str).map(str::to_string)
}

/// Accepts 0/1 integers (canonical) or JSON booleans (lenient, for
/// adapters that decode into native types). Missing or null means false.
fn parse_bool(v: Option<&Value>) -> bool {
    match v {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    }
}

fn parse_instant(v: Option<&Value>, field: &str) -> Result<Option<DateTime<Utc>>> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(|e| SyncError::validation(format!("invalid '{field}' timestamp: {e}"))),
        Some(other) => Err(SyncError::validation(format!(
            "'{field}' must be an ISO 8601 string, got {other}"
        ))),
    }
}

// ============================================================================
// Tests
// ============================================================================
