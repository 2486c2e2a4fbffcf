//! Backend adapter contract: the polymorphic boundary over heterogeneous
//! remote services.
//!
//! Adapters translate the neutral record map to their transport encoding,
//! carry the auth context as credentials, and inject tenant predicates
//! when the backend lacks row-level security. The orchestrator consults
//! the capability descriptor before choosing a code path; `batch_*` and
//! `subscribe` are never called on adapters that do not declare support.

pub mod memory;

pub use memory::MemoryAdapter;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use crate::auth::AuthContext;
use crate::collection::FieldNameStyle;
use crate::error::ErrorKind;
use crate::storage::{FieldFilter, OrderBy};

/// The neutral record encoding crossing the adapter boundary.
pub type RecordMap = Map<String, Value>;

// ============================================================================
// Result union
// ============================================================================

/// Success payload plus backend-specific metadata (server timestamps,
/// request ids, pagination cursors).
#[derive(Debug, Clone)]
pub struct AdapterResponse<T> {
    pub data: T,
    pub metadata: Option<Value>,
}

impl<T> AdapterResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

pub type AdapterResult<T> = std::result::Result<AdapterResponse<T>, AdapterError>;

/// Normalized adapter failure. `retryable` defaults from the kind but can
/// be overridden per error (e.g. a 4xx backend response).
#[derive(Debug, Clone)]
pub struct AdapterError {
    pub kind: ErrorKind,
    pub message: String,
    pub details: Option<Value>,
    pub status: Option<u16>,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
}

impl AdapterError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            status: None,
            retryable: kind.retryable_by_default(),
            retry_after: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization, message)
    }

    pub fn not_found(collection: &str, id: &str) -> Self {
        Self::new(ErrorKind::NotFound, format!("{collection}/{id} not found"))
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn rate_limit(message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let mut e = Self::new(ErrorKind::RateLimit, message);
        e.retry_after = retry_after;
        e
    }

    /// Backend failure with an HTTP-like status; retryable iff 5xx.
    pub fn backend(message: impl Into<String>, status: u16) -> Self {
        let mut e = Self::new(ErrorKind::Backend, message);
        e.status = Some(status);
        e.retryable = status >= 500;
        e
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for AdapterError {}

// ============================================================================
// Capabilities
// ============================================================================

/// Self-description published by an adapter at connect time. The
/// orchestrator branches on these flags; they are the canonical truth,
/// not the adapter's willingness to accept a call.
#[derive(Debug, Clone, Copy)]
pub struct AdapterCapabilities {
    pub batch: bool,
    pub subscriptions: bool,
    pub transactions: bool,
    pub full_text_search: bool,
    pub authentication: bool,
    pub delta_sync: bool,
    pub max_batch_size: usize,
    pub max_query_page: usize,
}

impl Default for AdapterCapabilities {
    fn default() -> Self {
        Self {
            batch: false,
            subscriptions: false,
            transactions: false,
            full_text_search: false,
            authentication: false,
            delta_sync: false,
            max_batch_size: 100,
            max_query_page: 100,
        }
    }
}

// ============================================================================
// Queries and change streams
// ============================================================================

/// Predicates forwarded to the backend. The engine defines no query
/// language; filters and ordering pass through untouched.
#[derive(Debug, Clone, Default)]
pub struct RemoteQuery {
    /// Server-side update time must be strictly after this instant.
    pub updated_since: Option<DateTime<Utc>>,
    pub filters: Vec<FieldFilter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub include_deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One event on a subscription stream.
#[derive(Debug, Clone)]
pub struct RemoteChange {
    pub kind: ChangeKind,
    pub collection: String,
    pub record: RecordMap,
}

pub type ChangeStream = mpsc::Receiver<RemoteChange>;

// ============================================================================
// BackendAdapter
// ============================================================================

#[async_trait]
pub trait BackendAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> AdapterCapabilities;

    async fn connect(&self, ctx: &AuthContext) -> AdapterResult<()>;

    async fn disconnect(&self) -> AdapterResult<()>;

    async fn create(
        &self,
        ctx: &AuthContext,
        collection: &str,
        record: &RecordMap,
    ) -> AdapterResult<RecordMap>;

    async fn read(
        &self,
        ctx: &AuthContext,
        collection: &str,
        id: &str,
    ) -> AdapterResult<Option<RecordMap>>;

    async fn update(
        &self,
        ctx: &AuthContext,
        collection: &str,
        id: &str,
        record: &RecordMap,
    ) -> AdapterResult<RecordMap>;

    async fn delete(&self, ctx: &AuthContext, collection: &str, id: &str) -> AdapterResult<()>;

    async fn query(
        &self,
        ctx: &AuthContext,
        collection: &str,
        query: &RemoteQuery,
    ) -> AdapterResult<Vec<RecordMap>>;

    async fn batch_create(
        &self,
        _ctx: &AuthContext,
        _collection: &str,
        _records: &[RecordMap],
    ) -> AdapterResult<Vec<RecordMap>> {
        Err(AdapterError::validation("batch operations not supported"))
    }

    async fn batch_update(
        &self,
        _ctx: &AuthContext,
        _collection: &str,
        _records: &[RecordMap],
    ) -> AdapterResult<Vec<RecordMap>> {
        Err(AdapterError::validation("batch operations not supported"))
    }

    async fn batch_delete(
        &self,
        _ctx: &AuthContext,
        _collection: &str,
        _ids: &[String],
    ) -> AdapterResult<()> {
        Err(AdapterError::validation("batch operations not supported"))
    }

    async fn subscribe(&self, _ctx: &AuthContext, _collection: &str) -> AdapterResult<ChangeStream> {
        Err(AdapterError::validation("subscriptions not supported"))
    }

    async fn unsubscribe(&self, _collection: &str) -> AdapterResult<()> {
        Ok(AdapterResponse::new(()))
    }
}

// ============================================================================
// Field-name style mapping
// ============================================================================

/// `organization_id` → `organizationId`.
pub fn snake_to_camel(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper_next = false;
    for c in name.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// `organizationId` → `organization_id`.
pub fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for c in name.chars() {
        if c.is_ascii_uppercase() {
            out.push('_');
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// Re-key a neutral map into the collection's remote naming convention.
pub fn keys_to_remote(map: &RecordMap, style: FieldNameStyle) -> RecordMap {
    match style {
        FieldNameStyle::Snake => map.clone(),
        FieldNameStyle::Camel => map
            .iter()
            .map(|(k, v)| (snake_to_camel(k), v.clone()))
            .collect(),
    }
}

/// Re-key a remote map back into the engine's snake_case convention.
pub fn keys_from_remote(map: &RecordMap, style: FieldNameStyle) -> RecordMap {
    match style {
        FieldNameStyle::Snake => map.clone(),
        FieldNameStyle::Camel => map
            .iter()
            .map(|(k, v)| (camel_to_snake(k), v.clone()))
            .collect(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn backend_error_retryability_follows_status() {
        assert!(AdapterError::backend("oops", 503).retryable);
        assert!(!AdapterError::backend("bad", 422).retryable);
        assert!(AdapterError::network("down").retryable);
        assert!(!AdapterError::validation("bad field").retryable);
    }

    #[test]
    fn rate_limit_carries_retry_hint() {
        let e = AdapterError::rate_limit("slow down", Some(Duration::from_secs(30)));
        assert_eq!(e.retry_after, Some(Duration::from_secs(30)));
        assert!(e.retryable);
    }

    #[test]
    fn case_conversion_round_trips_header_names() {
        assert_eq!(snake_to_camel("organization_id"), "organizationId");
        assert_eq!(camel_to_snake("organizationId"), "organization_id");
        assert_eq!(snake_to_camel("id"), "id");
        assert_eq!(camel_to_snake(&snake_to_camel("last_synced_at")), "last_synced_at");
    }

    #[test]
    fn key_mapping_applies_per_style() {
        let mut map = RecordMap::new();
        map.insert("sync_version".into(), json!(3));
        map.insert("id".into(), json!("x"));

        let camel = keys_to_remote(&map, FieldNameStyle::Camel);
        assert!(camel.contains_key("syncVersion"));
        assert!(camel.contains_key("id"));

        let back = keys_from_remote(&camel, FieldNameStyle::Camel);
        assert_eq!(back, map);

        assert_eq!(keys_to_remote(&map, FieldNameStyle::Snake), map);
    }
}
