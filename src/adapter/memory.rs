//! In-memory [`BackendAdapter`]: a HashMap-backed remote with scriptable
//! failures and a broadcast change feed.
//!
//! Serves tests and demos as the reference adapter. Semantics mirror a
//! typical CRUD backend: create rejects duplicates, update rejects writes
//! older than the stored version (surfacing the stored record in the
//! error details), delete is a server-side hard delete, and query scopes
//! rows to the caller's tenant.

use std::collections::{BTreeMap, HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::auth::AuthContext;
use crate::record::{FIELD_ID, FIELD_ORGANIZATION_ID, FIELD_SYNC_VERSION, FIELD_UPDATED_AT};

use super::{
    AdapterCapabilities, AdapterError, AdapterResponse, AdapterResult, BackendAdapter,
    ChangeKind, ChangeStream, RecordMap, RemoteChange, RemoteQuery,
};

#[derive(Default)]
struct Inner {
    records: HashMap<String, BTreeMap<String, RecordMap>>,
    /// Scripted failures, consumed one per data operation.
    fail_queue: VecDeque<AdapterError>,
    connected: bool,
}

pub struct MemoryAdapter {
    caps: AdapterCapabilities,
    inner: Mutex<Inner>,
    changes: broadcast::Sender<RemoteChange>,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self::with_capabilities(AdapterCapabilities {
            batch: true,
            subscriptions: true,
            transactions: false,
            full_text_search: false,
            authentication: true,
            delta_sync: true,
            max_batch_size: 100,
            max_query_page: 100,
        })
    }

    pub fn with_capabilities(caps: AdapterCapabilities) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            caps,
            inner: Mutex::new(Inner::default()),
            changes,
        }
    }

    /// Script the next data operation to fail with `error`.
    pub fn fail_next(&self, error: AdapterError) {
        self.inner.lock().fail_queue.push_back(error);
    }

    /// Insert a record server-side without emitting a change event.
    pub fn seed(&self, collection: &str, record: RecordMap) {
        let id = record
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.inner
            .lock()
            .records
            .entry(collection.to_string())
            .or_default()
            .insert(id, record);
    }

    /// Read a record server-side, bypassing auth (test inspection).
    pub fn stored(&self, collection: &str, id: &str) -> Option<RecordMap> {
        self.inner
            .lock()
            .records
            .get(collection)
            .and_then(|t| t.get(id))
            .cloned()
    }

    pub fn stored_count(&self, collection: &str) -> usize {
        self.inner
            .lock()
            .records
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    fn check(&self, ctx: &AuthContext) -> std::result::Result<(), AdapterError> {
        if let Some(error) = self.inner.lock().fail_queue.pop_front() {
            return Err(error);
        }
        if !self.inner.lock().connected {
            return Err(AdapterError::network("adapter not connected"));
        }
        if self.caps.authentication {
            if !ctx.is_authenticated() {
                return Err(AdapterError::authentication("no credentials"));
            }
            if !ctx.is_valid() {
                return Err(AdapterError::authentication("context expired"));
            }
        }
        Ok(())
    }

    /// Tenant predicate injection: this backend has no row-level
    /// security, so records outside the caller's org are invisible.
    fn in_scope(ctx: &AuthContext, record: &RecordMap) -> bool {
        match (&ctx.organization_id, record.get(FIELD_ORGANIZATION_ID)) {
            (Some(org), Some(Value::String(record_org))) => org == record_org,
            (Some(_), _) => false,
            (None, _) => true,
        }
    }

    fn emit(&self, kind: ChangeKind, collection: &str, record: RecordMap) {
        // No receivers is fine; ignore the error.
        let _ = self.changes.send(RemoteChange {
            kind,
            collection: collection.to_string(),
            record,
        });
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn record_version(record: &RecordMap) -> i64 {
    record
        .get(FIELD_SYNC_VERSION)
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

fn record_updated_at(record: &RecordMap) -> Option<DateTime<Utc>> {
    record
        .get(FIELD_UPDATED_AT)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

// ============================================================================
// BackendAdapter implementation
// ============================================================================

#[async_trait]
impl BackendAdapter for MemoryAdapter {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        self.caps
    }

    async fn connect(&self, _ctx: &AuthContext) -> AdapterResult<()> {
        self.inner.lock().connected = true;
        Ok(AdapterResponse::new(()))
    }

    async fn disconnect(&self) -> AdapterResult<()> {
        self.inner.lock().connected = false;
        Ok(AdapterResponse::new(()))
    }

    async fn create(
        &self,
        ctx: &AuthContext,
        collection: &str,
        record: &RecordMap,
    ) -> AdapterResult<RecordMap> {
        self.check(ctx)?;
        let id = record
            .get(FIELD_ID)
            .and_then(Value::as_str)
            .ok_or_else(|| AdapterError::validation("record missing 'id'"))?
            .to_string();

        let mut inner = self.inner.lock();
        let table = inner.records.entry(collection.to_string()).or_default();
        if table.contains_key(&id) {
            return Err(AdapterError::conflict(format!(
                "{collection}/{id} already exists"
            ))
            .with_details(Value::Object(table[&id].clone())));
        }
        table.insert(id, record.clone());
        drop(inner);

        self.emit(ChangeKind::Created, collection, record.clone());
        Ok(AdapterResponse::new(record.clone()))
    }

    async fn read(
        &self,
        ctx: &AuthContext,
        collection: &str,
        id: &str,
    ) -> AdapterResult<Option<RecordMap>> {
        self.check(ctx)?;
        let inner = self.inner.lock();
        let record = inner
            .records
            .get(collection)
            .and_then(|t| t.get(id))
            .cloned();
        Ok(AdapterResponse::new(
            record.filter(|r| Self::in_scope(ctx, r)),
        ))
    }

    async fn update(
        &self,
        ctx: &AuthContext,
        collection: &str,
        id: &str,
        record: &RecordMap,
    ) -> AdapterResult<RecordMap> {
        self.check(ctx)?;
        let mut inner = self.inner.lock();
        let table = inner.records.entry(collection.to_string()).or_default();
        match table.get(id) {
            None => Err(AdapterError::not_found(collection, id)),
            // Stale write: the stored row is newer than what the client
            // saw. Reject with the stored record so the caller can build
            // a conflict descriptor.
            Some(stored) if record_version(stored) > record_version(record) => {
                Err(AdapterError::conflict(format!(
                    "{collection}/{id} version {} is behind stored {}",
                    record_version(record),
                    record_version(stored)
                ))
                .with_details(Value::Object(stored.clone())))
            }
            Some(_) => {
                table.insert(id.to_string(), record.clone());
                drop(inner);
                self.emit(ChangeKind::Updated, collection, record.clone());
                Ok(AdapterResponse::new(record.clone()))
            }
        }
    }

    async fn delete(&self, ctx: &AuthContext, collection: &str, id: &str) -> AdapterResult<()> {
        self.check(ctx)?;
        let removed = self
            .inner
            .lock()
            .records
            .get_mut(collection)
            .and_then(|t| t.remove(id));
        match removed {
            None => Err(AdapterError::not_found(collection, id)),
            Some(record) => {
                self.emit(ChangeKind::Deleted, collection, record);
                Ok(AdapterResponse::new(()))
            }
        }
    }

    async fn query(
        &self,
        ctx: &AuthContext,
        collection: &str,
        query: &RemoteQuery,
    ) -> AdapterResult<Vec<RecordMap>> {
        self.check(ctx)?;
        let inner = self.inner.lock();
        let mut hits: Vec<RecordMap> = inner
            .records
            .get(collection)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        drop(inner);

        hits.retain(|r| Self::in_scope(ctx, r));
        if let Some(since) = query.updated_since {
            hits.retain(|r| record_updated_at(r).is_some_and(|at| at > since));
        }

        // Deterministic delta pagination: server update time, then id.
        hits.sort_by(|a, b| {
            record_updated_at(a)
                .cmp(&record_updated_at(b))
                .then_with(|| {
                    a.get(FIELD_ID)
                        .and_then(Value::as_str)
                        .cmp(&b.get(FIELD_ID).and_then(Value::as_str))
                })
        });

        let offset = query.offset.unwrap_or(0);
        let page = self.caps.max_query_page;
        let limit = query.limit.unwrap_or(page).min(page);
        let hits: Vec<RecordMap> = hits.into_iter().skip(offset).take(limit).collect();
        Ok(AdapterResponse::new(hits))
    }

    async fn batch_create(
        &self,
        ctx: &AuthContext,
        collection: &str,
        records: &[RecordMap],
    ) -> AdapterResult<Vec<RecordMap>> {
        if records.len() > self.caps.max_batch_size {
            return Err(AdapterError::validation(format!(
                "batch of {} exceeds max {}",
                records.len(),
                self.caps.max_batch_size
            )));
        }
        let mut created = Vec::with_capacity(records.len());
        for record in records {
            created.push(self.create(ctx, collection, record).await?.data);
        }
        Ok(AdapterResponse::new(created))
    }

    async fn batch_update(
        &self,
        ctx: &AuthContext,
        collection: &str,
        records: &[RecordMap],
    ) -> AdapterResult<Vec<RecordMap>> {
        if records.len() > self.caps.max_batch_size {
            return Err(AdapterError::validation(format!(
                "batch of {} exceeds max {}",
                records.len(),
                self.caps.max_batch_size
            )));
        }
        let mut updated = Vec::with_capacity(records.len());
        for record in records {
            let id = record
                .get(FIELD_ID)
                .and_then(Value::as_str)
                .ok_or_else(|| AdapterError::validation("record missing 'id'"))?
                .to_string();
            updated.push(self.update(ctx, collection, &id, record).await?.data);
        }
        Ok(AdapterResponse::new(updated))
    }

    async fn batch_delete(
        &self,
        ctx: &AuthContext,
        collection: &str,
        ids: &[String],
    ) -> AdapterResult<()> {
        for id in ids {
            self.delete(ctx, collection, id).await?;
        }
        Ok(AdapterResponse::new(()))
    }

    async fn subscribe(&self, ctx: &AuthContext, collection: &str) -> AdapterResult<ChangeStream> {
        self.check(ctx)?;
        let mut feed = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(32);
        let wanted = collection.to_string();
        tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(change) if change.collection == wanted => {
                        if tx.send(change).await.is_err() {
                            break; // consumer gone
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(lagged = n, collection = %wanted, "change stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(AdapterResponse::new(rx))
    }

    async fn unsubscribe(&self, _collection: &str) -> AdapterResult<()> {
        Ok(AdapterResponse::new(()))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    fn ctx() -> AuthContext {
        AuthContext::authenticated("token", Some("u1".into()), Some("org1".into()), None, None)
    }

    fn map(pairs: Value) -> RecordMap {
        pairs.as_object().cloned().unwrap()
    }

    async fn connected() -> MemoryAdapter {
        let adapter = MemoryAdapter::new();
        adapter.connect(&ctx()).await.unwrap();
        adapter
    }

    #[tokio::test]
    async fn create_read_round_trip() {
        let adapter = connected().await;
        let record = map(json!({"id": "r1", "organization_id": "org1", "sync_version": 1}));
        adapter.create(&ctx(), "notes", &record).await.unwrap();

        let got = adapter.read(&ctx(), "notes", "r1").await.unwrap().data;
        assert_eq!(got, Some(record));
    }

    #[tokio::test]
    async fn unauthenticated_context_rejected() {
        let adapter = connected().await;
        let err = adapter
            .read(&AuthContext::public(), "notes", "r1")
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Authentication);
    }

    #[tokio::test]
    async fn stale_update_returns_conflict_with_stored_record() {
        let adapter = connected().await;
        adapter.seed(
            "notes",
            map(json!({"id": "r1", "organization_id": "org1", "sync_version": 5})),
        );

        let stale = map(json!({"id": "r1", "organization_id": "org1", "sync_version": 3}));
        let err = adapter.update(&ctx(), "notes", "r1", &stale).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
        let stored = err.details.unwrap();
        assert_eq!(stored["sync_version"], json!(5));
    }

    #[tokio::test]
    async fn query_scopes_to_tenant_and_watermark() {
        let adapter = connected().await;
        adapter.seed(
            "notes",
            map(json!({
                "id": "mine",
                "organization_id": "org1",
                "updated_at": "2025-06-01T10:00:00Z"
            })),
        );
        adapter.seed(
            "notes",
            map(json!({
                "id": "theirs",
                "organization_id": "org2",
                "updated_at": "2025-06-01T10:00:00Z"
            })),
        );

        let all = adapter
            .query(&ctx(), "notes", &RemoteQuery::default())
            .await
            .unwrap()
            .data;
        assert_eq!(all.len(), 1, "foreign-tenant rows must be invisible");
        assert_eq!(all[0]["id"], json!("mine"));

        let since = DateTime::parse_from_rfc3339("2025-06-01T11:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let newer = adapter
            .query(
                &ctx(),
                "notes",
                &RemoteQuery {
                    updated_since: Some(since),
                    ..RemoteQuery::default()
                },
            )
            .await
            .unwrap()
            .data;
        assert!(newer.is_empty());
    }

    #[tokio::test]
    async fn scripted_failure_consumed_once() {
        let adapter = connected().await;
        adapter.fail_next(AdapterError::network("flaky"));

        let record = map(json!({"id": "r1", "organization_id": "org1"}));
        let err = adapter.create(&ctx(), "notes", &record).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Network);

        adapter.create(&ctx(), "notes", &record).await.unwrap();
    }

    #[tokio::test]
    async fn subscription_receives_changes_for_its_collection() {
        let adapter = connected().await;
        let mut stream = adapter.subscribe(&ctx(), "notes").await.unwrap().data;

        adapter
            .create(&ctx(), "other", &map(json!({"id": "o1", "organization_id": "org1"})))
            .await
            .unwrap();
        adapter
            .create(&ctx(), "notes", &map(json!({"id": "n1", "organization_id": "org1"})))
            .await
            .unwrap();

        let change = stream.recv().await.unwrap();
        assert_eq!(change.kind, ChangeKind::Created);
        assert_eq!(change.record["id"], json!("n1"));
    }

    #[tokio::test]
    async fn delete_removes_server_side() {
        let adapter = connected().await;
        adapter.seed("notes", map(json!({"id": "r1", "organization_id": "org1"})));
        adapter.delete(&ctx(), "notes", "r1").await.unwrap();
        assert_eq!(
            adapter.read(&ctx(), "notes", "r1").await.unwrap().data,
            None
        );
    }
}
