//! The sync orchestrator.
//!
//! One `SyncManager` owns the store, the adapter, the queue, and the
//! per-collection conflict resolvers, and drives the three cycle shapes:
//! upload (dirty rows out), download (remote changes in, bounded by the
//! watermark), and bidirectional (upload, download, then a
//! reconciliation pass that clears rows acknowledged in transit).
//!
//! A cycle never throws past its boundary: per-operation failures retry
//! or land in the report, and the cycle always completes with an outcome.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;

use crate::adapter::{BackendAdapter, RecordMap, RemoteQuery};
use crate::auth::{AuthContext, AuthManager};
use crate::collection::CollectionDef;
use crate::config::SyncConfig;
use crate::conflict::{
    ConflictDescriptor, ConflictResolver, ConflictStrategyName, CustomResolveFn, Resolution,
    ResolutionSide,
};
use crate::error::{ErrorKind, Result, SyncError};
use crate::events::{EventBus, EventType, SyncEvent};
use crate::queue::{
    CancelFlag, Dispatcher, Operation, OperationHandler, OperationQueue, OperationType, Priority,
};
use crate::record::SyncRecord;
use crate::storage::LocalStore;

use super::types::{CollectionReport, OpFailure, SyncOutcome, SyncReport};

// ============================================================================
// Options
// ============================================================================

/// Configuration for [`SyncManager::new`].
pub struct SyncManagerOptions {
    pub config: SyncConfig,
    pub store: Arc<dyn LocalStore>,
    pub adapter: Arc<dyn BackendAdapter>,
    pub auth: Arc<AuthManager>,
    pub bus: Arc<EventBus>,
    pub collections: Vec<Arc<CollectionDef>>,
    /// Resolution functions for collections using the Custom or
    /// FieldLevelDetection strategies, keyed by collection name.
    pub custom_resolvers: HashMap<String, CustomResolveFn>,
}

// ============================================================================
// Per-collection cycle activity
// ============================================================================

/// Counters accumulated by operation execution, folded into the report at
/// cycle end.
#[derive(Default, Clone)]
struct CollectionActivity {
    uploaded: usize,
    conflicts_detected: usize,
    conflicts_resolved: usize,
    /// record id → most recent remote `sync_version` observed this cycle.
    observed_remote_versions: HashMap<String, i64>,
}

/// What applying one remote record did locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Inserted,
    Updated,
    Deleted,
    ConflictResolved,
    Skipped,
}

/// Where a conflict was noticed, which decides how a local-side
/// resolution is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConflictOrigin {
    /// Local must outrun the remote version to win the next push.
    Upload,
    /// The row just stays dirty; the next upload cycle pushes it.
    Download,
}

// ============================================================================
// SyncManager
// ============================================================================

pub struct SyncManager {
    config: SyncConfig,
    store: Arc<dyn LocalStore>,
    adapter: Arc<dyn BackendAdapter>,
    auth: Arc<AuthManager>,
    bus: Arc<EventBus>,
    queue: Arc<OperationQueue>,
    dispatcher: Dispatcher,
    collections: Vec<Arc<CollectionDef>>,
    resolvers: HashMap<String, ConflictResolver>,
    /// In-process advisory lock: collections with a cycle in progress.
    active: Mutex<HashSet<String>>,
    activity: Mutex<HashMap<String, CollectionActivity>>,
    /// Lease owner identity for the multi-process guard.
    instance_id: String,
    cancel: CancelFlag,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncManager {
    pub fn new(options: SyncManagerOptions) -> Result<Arc<Self>> {
        let SyncManagerOptions {
            config,
            store,
            adapter,
            auth,
            bus,
            collections,
            custom_resolvers,
        } = options;

        store.register_collections(&collections)?;

        let mut resolvers = HashMap::new();
        for def in &collections {
            let strategy = def.strategy;
            let mut resolver =
                ConflictResolver::new(strategy).with_hints(def.merge_hints.clone());
            if let Some(custom) = custom_resolvers.get(&def.name) {
                resolver = resolver.with_custom(Arc::clone(custom));
            } else if matches!(
                strategy,
                ConflictStrategyName::Custom | ConflictStrategyName::FieldLevelDetection
            ) {
                tracing::warn!(
                    collection = %def.name,
                    strategy = strategy.as_str(),
                    "delegating strategy without a resolution function, fallback applies"
                );
            }
            resolvers.insert(def.name.clone(), resolver);
        }

        let queue = Arc::new(OperationQueue::new(bus.clone(), config.queue_max_size));
        let dispatcher = Dispatcher::new(
            queue.clone(),
            auth.clone(),
            config.max_concurrent_operations,
        );

        Ok(Arc::new(Self {
            config,
            store,
            adapter,
            auth,
            bus,
            queue,
            dispatcher,
            collections,
            resolvers,
            active: Mutex::new(HashSet::new()),
            activity: Mutex::new(HashMap::new()),
            instance_id: uuid::Uuid::new_v4().to_string(),
            cancel: CancelFlag::new(),
            subscriptions: Mutex::new(Vec::new()),
        }))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LocalStore> {
        &self.store
    }

    pub fn auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn collections(&self) -> &[Arc<CollectionDef>] {
        &self.collections
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    fn def(&self, name: &str) -> Result<Arc<CollectionDef>> {
        self.collections
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| SyncError::UnknownCollection(name.to_string()))
    }

    fn resolver(&self, name: &str) -> ConflictResolver {
        self.resolvers
            .get(name)
            .cloned()
            .unwrap_or_else(|| ConflictResolver::new(self.config.default_conflict_strategy))
    }

    /// Connect the adapter under the current context.
    pub async fn connect(&self) -> Result<()> {
        let ctx = self.auth.current();
        self.adapter.connect(&ctx).await?;
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.adapter.disconnect().await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queue persistence
    // ------------------------------------------------------------------

    /// Restore the persisted queue snapshot. Operations are kept when
    /// their context is still current; otherwise they are rebound to the
    /// current authenticated context (restore runs after login) or
    /// discarded under a public context. Unregistered collections are
    /// always discarded.
    pub fn restore_queue(&self) -> Result<usize> {
        let snapshot = self.store.load_queue_snapshot()?;
        if snapshot.is_empty() {
            return Ok(0);
        }
        let ctx = self.auth.current();
        let registered: HashSet<&str> =
            self.collections.iter().map(|d| d.name.as_str()).collect();

        let restored = self.queue.restore(
            snapshot
                .into_iter()
                .map(|mut op| {
                    if op.auth_context_id != ctx.context_id && ctx.is_authenticated() {
                        op.auth_context_id = ctx.context_id.clone();
                    }
                    op
                })
                .collect(),
            |op| {
                registered.contains(op.collection.as_str())
                    && op.auth_context_id == ctx.context_id
            },
        );
        tracing::info!(restored, "queue snapshot restored");
        Ok(restored)
    }

    /// Snapshot pending operations to the store (shutdown and periodic).
    pub fn persist_queue(&self) -> Result<()> {
        self.store.save_queue_snapshot(&self.queue.snapshot())
    }

    // ------------------------------------------------------------------
    // Application-facing record writes
    // ------------------------------------------------------------------

    /// Create a record under the current context: dirty, version 1.
    pub fn create_record(&self, collection: &str, fields: Map<String, Value>) -> Result<SyncRecord> {
        let def = self.def(collection)?;
        let ctx = self.auth.current();
        let record = SyncRecord::new_local(
            fields,
            ctx.organization_id.clone(),
            ctx.user_id.clone(),
        );
        let record = self.store.put(&def.name, &record)?;
        self.emit_data(EventType::DataCreated, &def.name, &record.id);
        Ok(record)
    }

    /// Replace a record's application fields: bump version, set dirty.
    pub fn update_record(
        &self,
        collection: &str,
        id: &str,
        fields: Map<String, Value>,
    ) -> Result<SyncRecord> {
        let def = self.def(collection)?;
        let ctx = self.auth.current();
        let mut record = self
            .store
            .get(&def.name, id)?
            .ok_or_else(|| SyncError::NotFound {
                collection: collection.to_string(),
                id: id.to_string(),
            })?;
        record.fields = fields;
        record.touch(ctx.user_id.as_deref());
        let record = self.store.put(&def.name, &record)?;
        self.emit_data(EventType::DataUpdated, &def.name, id);
        Ok(record)
    }

    /// Soft-delete: the tombstone syncs like any other dirty row.
    pub fn delete_record(&self, collection: &str, id: &str) -> Result<()> {
        let def = self.def(collection)?;
        let ctx = self.auth.current();
        self.store
            .soft_delete(&def.name, id, ctx.user_id.as_deref())?;
        self.emit_data(EventType::DataDeleted, &def.name, id);
        Ok(())
    }

    pub fn get_record(&self, collection: &str, id: &str) -> Result<Option<SyncRecord>> {
        let def = self.def(collection)?;
        self.store.get(&def.name, id)
    }

    /// Remove acknowledged tombstones older than the configured
    /// retention. A no-op (returning 0) until `retention` is set.
    pub fn purge_tombstones(&self) -> Result<usize> {
        let Some(retention) = self.config.retention else {
            return Ok(0);
        };
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention)
                .map_err(|e| SyncError::Internal(format!("retention out of range: {e}")))?;
        let mut removed = 0;
        for def in &self.collections {
            removed += self.store.purge_tombstones(&def.name, cutoff, false)?;
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Cycles
    // ------------------------------------------------------------------

    /// Run one cycle for a collection, honoring its direction.
    pub async fn sync_collection(self: &Arc<Self>, name: &str) -> Result<CollectionReport> {
        self.sync_collection_with_priority(name, Priority::Normal)
            .await
    }

    /// Sweep every registered collection.
    pub async fn sync_all(self: &Arc<Self>) -> Result<SyncReport> {
        self.sweep(Priority::Normal).await
    }

    pub(crate) async fn sweep(self: &Arc<Self>, priority: Priority) -> Result<SyncReport> {
        let started_at = Utc::now();
        let started = Instant::now();
        let mut collections = Vec::new();
        for def in self.collections.clone() {
            match self.sync_collection_with_priority(&def.name, priority).await {
                Ok(report) => collections.push(report),
                Err(e) => {
                    tracing::warn!(collection = %def.name, error = %e, "collection cycle failed");
                    let mut report = CollectionReport::new(&def.name);
                    report.outcome = SyncOutcome::Failed;
                    report.failures.push(OpFailure {
                        operation_id: None,
                        record_id: None,
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                    collections.push(report);
                }
            }
        }
        Ok(SyncReport {
            outcome: SyncReport::combine_outcomes(&collections),
            started_at,
            duration: started.elapsed(),
            collections,
        })
    }

    pub(crate) async fn sync_collection_with_priority(
        self: &Arc<Self>,
        name: &str,
        priority: Priority,
    ) -> Result<CollectionReport> {
        let def = self.def(name)?;

        if !self.active.lock().insert(def.name.clone()) {
            return Err(SyncError::LeaseHeld {
                collection: def.name.clone(),
                holder: "in-process cycle".to_string(),
            });
        }
        let result = self.run_cycle(&def, priority).await;
        self.active.lock().remove(&def.name);
        result
    }

    async fn run_cycle(
        self: &Arc<Self>,
        def: &Arc<CollectionDef>,
        priority: Priority,
    ) -> Result<CollectionReport> {
        let ctx = self.auth.current();
        if !ctx.is_valid() {
            return Err(SyncError::authentication("context expired before cycle"));
        }

        // Multi-process guard on top of the in-process lock.
        self.store
            .acquire_lease(&def.name, &self.instance_id, self.config.lease_ttl)?;

        let started = Instant::now();
        self.reset_activity(&def.name);
        self.bus.emit(SyncEvent::new(EventType::SyncStarted).collection(def.name.clone()));
        tracing::info!(collection = %def.name, direction = ?def.direction, "sync cycle started");

        let mut report = CollectionReport::new(&def.name);
        let phases: Result<()> = async {
            if def.direction.uploads() {
                self.upload_phase(def, &ctx, priority).await?;
            }
            if def.direction.downloads() {
                self.download_phase(def, &ctx, &mut report).await?;
            }
            if def.direction.uploads() && def.direction.downloads() {
                self.reconcile_phase(def, &ctx, &mut report)?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = self.store.release_lease(&def.name, &self.instance_id) {
            tracing::warn!(collection = %def.name, error = %e, "lease release failed");
        }

        // Fold executor activity into the report.
        let activity = self.take_activity(&def.name);
        report.uploaded += activity.uploaded;
        report.conflicts_detected += activity.conflicts_detected;
        report.conflicts_resolved += activity.conflicts_resolved;
        for (op, kind, message) in self.queue.take_abandoned(&def.name) {
            report.failures.push(OpFailure {
                operation_id: Some(op.operation_id),
                record_id: op.record_id,
                kind,
                message,
            });
        }
        report.duration = started.elapsed();

        report.outcome = match &phases {
            Ok(()) if self.cancel.is_cancelled() => SyncOutcome::Cancelled,
            Ok(()) if report.failures.is_empty() => SyncOutcome::Success,
            Ok(()) => SyncOutcome::Partial,
            Err(e) if e.kind() == ErrorKind::Cancelled => SyncOutcome::Cancelled,
            // Auth failures abort the cycle but completed work stands.
            Err(e) if e.kind() == ErrorKind::Authentication => SyncOutcome::Partial,
            Err(_) => SyncOutcome::Failed,
        };
        if let Err(e) = phases {
            if e.kind() == ErrorKind::Authentication {
                self.bus.emit(
                    SyncEvent::new(EventType::AuthFailed)
                        .collection(def.name.clone())
                        .payload(Value::String(e.to_string())),
                );
            }
            report.failures.push(OpFailure {
                operation_id: None,
                record_id: None,
                kind: e.kind(),
                message: e.to_string(),
            });
            self.bus.emit(
                SyncEvent::new(EventType::SyncError)
                    .collection(def.name.clone())
                    .payload(json!({"kind": e.kind().as_str(), "message": e.to_string()})),
            );
        }

        self.bus.emit(
            SyncEvent::new(EventType::SyncCompleted)
                .collection(def.name.clone())
                .payload(json!({
                    "outcome": report.outcome,
                    "affected_records": report.affected_records(),
                    "duration_ms": report.duration.as_millis() as u64,
                })),
        );
        tracing::info!(
            collection = %def.name,
            outcome = ?report.outcome,
            uploaded = report.uploaded,
            downloaded = report.downloaded,
            "sync cycle completed"
        );
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Upload phase
    // ------------------------------------------------------------------

    async fn upload_phase(
        self: &Arc<Self>,
        def: &Arc<CollectionDef>,
        ctx: &AuthContext,
        priority: Priority,
    ) -> Result<()> {
        let dirty = self
            .store
            .list_dirty(&def.name, ctx.organization_id.as_deref())?;
        if dirty.is_empty() {
            // O(1) completion, zero adapter calls.
            return Ok(());
        }
        let total = dirty.len();
        self.emit_progress(&def.name, 0, total);

        let caps = self.adapter.capabilities();
        if caps.batch && total > self.config.batch_size {
            self.enqueue_batched(def, ctx, priority, &dirty, caps.max_batch_size)?;
        } else {
            for record in &dirty {
                self.enqueue_single_upload(def, ctx, priority, record)?;
            }
        }

        let stats = self
            .dispatcher
            .drain(self.handler(), &self.cancel, self.config.cycle_budget)
            .await;
        self.emit_progress(&def.name, total, total);

        if stats.auth_aborted {
            return Err(SyncError::authentication(
                "upload aborted: operation context no longer valid",
            ));
        }
        if stats.cancelled {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    fn enqueue_single_upload(
        &self,
        def: &CollectionDef,
        ctx: &AuthContext,
        priority: Priority,
        record: &SyncRecord,
    ) -> Result<()> {
        let op_type = if record.is_deleted {
            OperationType::Delete
        } else if record.last_synced_at.is_none() {
            OperationType::Create
        } else {
            OperationType::Update
        };
        let op = Operation::new(
            op_type,
            &def.name,
            json!({"record": Value::Object(record.to_map())}),
            &ctx.context_id,
        )
        .with_record(&record.id)
        .with_priority(priority)
        .with_retry(self.config.max_retries, self.config.retry_delays.clone());
        self.queue.enqueue(op)?;
        Ok(())
    }

    fn enqueue_batched(
        &self,
        def: &CollectionDef,
        ctx: &AuthContext,
        priority: Priority,
        dirty: &[SyncRecord],
        max_batch_size: usize,
    ) -> Result<()> {
        let chunk_size = self.config.batch_size.min(max_batch_size).max(1);
        let mut creates = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();
        for record in dirty {
            if record.is_deleted {
                deletes.push(record);
            } else if record.last_synced_at.is_none() {
                creates.push(record);
            } else {
                updates.push(record);
            }
        }

        for (op_type, group) in [
            (OperationType::Create, creates),
            (OperationType::Update, updates),
            (OperationType::Delete, deletes),
        ] {
            for chunk in group.chunks(chunk_size) {
                let records: Vec<Value> =
                    chunk.iter().map(|r| Value::Object(r.to_map())).collect();
                let op = Operation::new(
                    op_type,
                    &def.name,
                    json!({"batch": true, "records": records}),
                    &ctx.context_id,
                )
                .with_priority(priority)
                .with_retry(self.config.max_retries, self.config.retry_delays.clone());
                self.queue.enqueue(op)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Download phase
    // ------------------------------------------------------------------

    async fn download_phase(
        self: &Arc<Self>,
        def: &Arc<CollectionDef>,
        ctx: &AuthContext,
        report: &mut CollectionReport,
    ) -> Result<()> {
        let org = ctx.organization_id.as_deref();
        let since = self
            .store
            .get_watermark(&def.name, org)?
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

        let caps = self.adapter.capabilities();
        let page_size = self.config.page_size.min(caps.max_query_page).max(1);
        let mut offset = 0usize;

        loop {
            if self.cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let query = RemoteQuery {
                updated_since: Some(since),
                limit: Some(page_size),
                offset: Some(offset),
                include_deleted: true,
                ..RemoteQuery::default()
            };
            let page = self.adapter.query(ctx, &def.name, &query).await?.data;
            if page.is_empty() {
                break;
            }

            let mut page_watermark: Option<DateTime<Utc>> = None;
            for map in &page {
                match self.apply_remote_map(def, ctx, map)? {
                    Applied::Inserted | Applied::Updated | Applied::Deleted => {
                        report.downloaded += 1;
                    }
                    Applied::ConflictResolved => {
                        report.downloaded += 1;
                    }
                    Applied::Skipped => {}
                }
                if let Some(at) = map
                    .get(crate::record::FIELD_UPDATED_AT)
                    .and_then(Value::as_str)
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                {
                    let at = at.with_timezone(&Utc);
                    page_watermark =
                        Some(page_watermark.map_or(at, |current| current.max(at)));
                }
            }

            // Watermark advances only after the page committed.
            if let Some(at) = page_watermark {
                self.store.set_watermark(&def.name, org, at)?;
            }
            self.emit_progress(&def.name, offset + page.len(), offset + page.len());

            if page.len() < page_size {
                break;
            }
            offset += page.len();
        }
        Ok(())
    }

    /// Merge one remote record into the local store.
    fn apply_remote_map(
        &self,
        def: &Arc<CollectionDef>,
        ctx: &AuthContext,
        map: &RecordMap,
    ) -> Result<Applied> {
        let remote = SyncRecord::from_remote(map)?;
        self.observe_remote_version(&def.name, &remote.id, remote.sync_version);

        let Some(local) = self.store.get(&def.name, &remote.id)? else {
            if remote.is_deleted {
                // A tombstone for a row we never had.
                return Ok(Applied::Skipped);
            }
            let mut record = remote;
            record.last_synced_at = Some(Utc::now());
            self.store.put(&def.name, &record)?;
            self.emit_data(EventType::DataCreated, &def.name, &record.id);
            return Ok(Applied::Inserted);
        };

        // Remote tombstone: delete wins unless LocalWins holds a newer row.
        if remote.is_deleted && !local.is_deleted {
            let resolver = self.resolver(&def.name);
            if resolver.strategy() == ConflictStrategyName::LocalWins
                && local.sync_version > remote.sync_version
            {
                return Ok(Applied::Skipped);
            }
            let mut record = local.clone();
            record.is_deleted = true;
            record.deleted_at = remote.deleted_at.or_else(|| Some(Utc::now()));
            record.sync_version = record.sync_version.max(remote.sync_version);
            record.is_dirty = false;
            record.last_synced_at = Some(Utc::now());
            self.store.put(&def.name, &record)?;
            self.emit_data(EventType::DataDeleted, &def.name, &record.id);
            return Ok(Applied::Deleted);
        }

        if !local.is_dirty {
            if remote.sync_version >= local.sync_version {
                let mut record = remote;
                record.last_synced_at = Some(Utc::now());
                self.store.put(&def.name, &record)?;
                self.emit_data(EventType::DataUpdated, &def.name, &record.id);
                return Ok(Applied::Updated);
            }
            // Remote is behind what we already acknowledged.
            return Ok(Applied::Skipped);
        }

        // Local dirty: a genuine divergence.
        if remote.sync_version == local.sync_version && remote.fields == local.fields {
            return Ok(Applied::Skipped);
        }
        let _ = self.run_conflict(def, ctx, local, remote, ConflictOrigin::Download)?;
        Ok(Applied::ConflictResolved)
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Any row still dirty after both phases whose version equals the
    /// most recent remote version observed this cycle was acknowledged
    /// in transit; clear it. Everything else stays dirty for next cycle.
    fn reconcile_phase(
        &self,
        def: &Arc<CollectionDef>,
        ctx: &AuthContext,
        report: &mut CollectionReport,
    ) -> Result<()> {
        let observed = self
            .activity
            .lock()
            .get(&def.name)
            .map(|a| a.observed_remote_versions.clone())
            .unwrap_or_default();
        if observed.is_empty() {
            return Ok(());
        }

        let dirty = self
            .store
            .list_dirty(&def.name, ctx.organization_id.as_deref())?;
        for row in dirty {
            if observed.get(&row.id) == Some(&row.sync_version) {
                match self
                    .store
                    .mark_synced(&def.name, &row.id, row.sync_version, Utc::now())
                {
                    Ok(()) => report.reconciled += 1,
                    Err(SyncError::VersionMismatch { .. }) => {} // raced a newer write
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Upload acknowledgment and conflicts
    // ------------------------------------------------------------------

    /// Handle an upload success: CAS-acknowledge, or resolve when the
    /// returned remote snapshot has advanced past the uploaded version.
    fn ack_upload(
        &self,
        def: &Arc<CollectionDef>,
        ctx: &AuthContext,
        id: &str,
        version_at_upload: i64,
        remote_map: Option<&RecordMap>,
    ) -> Result<()> {
        if let Some(map) = remote_map {
            let remote = SyncRecord::from_remote(map)?;
            self.observe_remote_version(&def.name, &remote.id, remote.sync_version);
            if remote.sync_version > version_at_upload {
                if let Some(local) = self.store.get(&def.name, id)? {
                    let _ = self.run_conflict(def, ctx, local, remote, ConflictOrigin::Upload)?;
                    return Ok(());
                }
            }
        }

        match self
            .store
            .mark_synced(&def.name, id, version_at_upload, Utc::now())
        {
            Ok(()) => {
                self.with_activity(&def.name, |a| a.uploaded += 1);
                Ok(())
            }
            // CAS lost: the row advanced while the op was in flight. It
            // stays dirty and re-uploads next cycle; not an error.
            Err(SyncError::VersionMismatch { .. }) => {
                tracing::debug!(collection = %def.name, id, "acknowledgment lost CAS, row stays dirty");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn run_conflict(
        &self,
        def: &Arc<CollectionDef>,
        _ctx: &AuthContext,
        local: SyncRecord,
        remote: SyncRecord,
        origin: ConflictOrigin,
    ) -> Result<Resolution> {
        let descriptor = ConflictDescriptor::new(&def.name, local, remote);
        self.with_activity(&def.name, |a| a.conflicts_detected += 1);
        self.bus.emit(
            SyncEvent::new(EventType::ConflictDetected)
                .collection(def.name.clone())
                .record(descriptor.record_id.clone())
                .payload(descriptor.to_value()),
        );

        let resolution = self.resolver(&def.name).resolve(&descriptor);
        self.apply_resolution(def, &descriptor, &resolution, origin)?;

        self.with_activity(&def.name, |a| a.conflicts_resolved += 1);
        self.bus.emit(
            SyncEvent::new(EventType::ConflictResolved)
                .collection(def.name.clone())
                .record(descriptor.record_id.clone())
                .payload(json!({
                    "strategy": resolution.strategy.as_str(),
                    "side": resolution.side,
                    "metadata": Value::Object(resolution.metadata.clone()),
                })),
        );
        Ok(resolution)
    }

    fn apply_resolution(
        &self,
        def: &Arc<CollectionDef>,
        descriptor: &ConflictDescriptor,
        resolution: &Resolution,
        origin: ConflictOrigin,
    ) -> Result<()> {
        let stored_version = self
            .store
            .get(&def.name, &descriptor.record_id)?
            .map(|r| r.sync_version)
            .unwrap_or(0);

        match resolution.side {
            ResolutionSide::Remote => {
                let mut record = resolution.record.clone();
                record.sync_version = record.sync_version.max(stored_version);
                record.is_dirty = false;
                record.last_synced_at = Some(Utc::now());
                self.store.put(&def.name, &record)?;
            }
            ResolutionSide::Merged => {
                let mut record = resolution.record.clone();
                record.sync_version = record
                    .sync_version
                    .max(stored_version + 1)
                    .max(descriptor.remote.sync_version + 1);
                record.is_dirty = true;
                self.store.put(&def.name, &record)?;
            }
            ResolutionSide::Local => match origin {
                // The local row must outrun the remote version or the
                // next push is rejected again.
                ConflictOrigin::Upload => {
                    let mut record = resolution.record.clone();
                    record.sync_version = record
                        .sync_version
                        .max(stored_version)
                        .max(descriptor.remote.sync_version)
                        + 1;
                    record.is_dirty = true;
                    record.updated_at = Utc::now();
                    self.store.put(&def.name, &record)?;
                }
                // Leave the dirty row as-is; the upload cycle pushes it.
                ConflictOrigin::Download => {}
            },
        }
        Ok(())
    }

    /// A dirty local update whose remote row is gone: delete wins unless
    /// the collection strategy is LocalWins, which re-creates upstream.
    async fn handle_remote_deleted(
        &self,
        def: &Arc<CollectionDef>,
        ctx: &AuthContext,
        record: &SyncRecord,
        version_at_upload: i64,
    ) -> Result<()> {
        if self.resolver(&def.name).strategy() == ConflictStrategyName::LocalWins {
            let map = record.to_map();
            let resp = self.adapter.create(ctx, &def.name, &map).await?;
            return self.ack_upload(def, ctx, &record.id, version_at_upload, Some(&resp.data));
        }

        let mut tombstone = record.clone();
        tombstone.is_deleted = true;
        tombstone.deleted_at = Some(Utc::now());
        tombstone.is_dirty = false;
        tombstone.last_synced_at = Some(Utc::now());
        self.store.put(&def.name, &tombstone)?;
        self.emit_data(EventType::DataDeleted, &def.name, &record.id);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Realtime subscriptions
    // ------------------------------------------------------------------

    /// Open a change stream per subscribable collection. Each event
    /// enqueues a high-priority download for the affected record; stream
    /// loss reconnects with capped backoff and closes the gap with a
    /// bounded cycle.
    pub fn start_subscriptions(self: &Arc<Self>) {
        if !self.adapter.capabilities().subscriptions {
            tracing::debug!("adapter has no subscription support, realtime disabled");
            return;
        }
        let mut tasks = self.subscriptions.lock();
        if !tasks.is_empty() {
            return;
        }
        for def in &self.collections {
            if !def.direction.downloads() {
                continue;
            }
            let manager = Arc::clone(self);
            let def = Arc::clone(def);
            tasks.push(tokio::spawn(async move {
                manager.subscription_loop(def).await;
            }));
        }
    }

    pub fn stop_subscriptions(&self) {
        for task in self.subscriptions.lock().drain(..) {
            task.abort();
        }
    }

    async fn subscription_loop(self: Arc<Self>, def: Arc<CollectionDef>) {
        let mut backoff = Duration::from_secs(1);
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let ctx = self.auth.current();
            match self.adapter.subscribe(&ctx, &def.name).await {
                Ok(resp) => {
                    backoff = Duration::from_secs(1);
                    // Close the gap accumulated while disconnected.
                    if let Err(e) = self.sync_collection(&def.name).await {
                        tracing::warn!(collection = %def.name, error = %e, "gap-close cycle failed");
                    }

                    let mut stream = resp.data;
                    while let Some(change) = stream.recv().await {
                        if self.cancel.is_cancelled() {
                            return;
                        }
                        let Some(id) = change
                            .record
                            .get(crate::record::FIELD_ID)
                            .and_then(Value::as_str)
                        else {
                            continue;
                        };
                        let op = Operation::new(
                            OperationType::Read,
                            &def.name,
                            json!({"download": true}),
                            &self.auth.current().context_id,
                        )
                        .with_record(id)
                        .with_priority(Priority::High)
                        .with_retry(
                            self.config.max_retries,
                            self.config.retry_delays.clone(),
                        );
                        if self.queue.enqueue(op).is_ok() {
                            self.kick_dispatcher();
                        }
                    }
                    tracing::warn!(collection = %def.name, "change stream closed, reconnecting");
                }
                Err(e) => {
                    tracing::warn!(collection = %def.name, error = %e, "subscribe failed, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                }
            }
        }
    }

    /// Fire-and-forget drain. The dispatcher serializes drains, so this
    /// is safe to call whenever work lands in the queue.
    pub(crate) fn kick_dispatcher(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager
                .dispatcher
                .drain(manager.handler(), &manager.cancel, None)
                .await;
        });
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop background work and persist pending operations. In-flight
    /// operations finish their current step via cancellation.
    pub fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        self.stop_subscriptions();
        self.persist_queue()?;
        tracing::info!("sync manager shut down");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn handler(self: &Arc<Self>) -> Arc<dyn OperationHandler> {
        Arc::new(OpExecutor {
            manager: Arc::clone(self),
        })
    }

    fn reset_activity(&self, collection: &str) {
        self.activity
            .lock()
            .insert(collection.to_string(), CollectionActivity::default());
    }

    fn take_activity(&self, collection: &str) -> CollectionActivity {
        self.activity.lock().remove(collection).unwrap_or_default()
    }

    fn with_activity<F: FnOnce(&mut CollectionActivity)>(&self, collection: &str, f: F) {
        let mut activity = self.activity.lock();
        f(activity.entry(collection.to_string()).or_default());
    }

    fn observe_remote_version(&self, collection: &str, id: &str, version: i64) {
        self.with_activity(collection, |a| {
            a.observed_remote_versions.insert(id.to_string(), version);
        });
    }

    fn emit_progress(&self, collection: &str, processed: usize, total: usize) {
        self.bus.emit(
            SyncEvent::new(EventType::SyncProgress)
                .collection(collection.to_string())
                .payload(json!({"processed": processed, "total": total})),
        );
    }

    fn emit_data(&self, event_type: EventType, collection: &str, id: &str) {
        self.bus.emit(
            SyncEvent::new(event_type)
                .collection(collection.to_string())
                .record(id.to_string()),
        );
    }
}

// ============================================================================
// Operation executor
// ============================================================================

/// Executes queue operations against the adapter on behalf of the
/// manager. Conflict-kind adapter errors are resolved here, not bubbled.
struct OpExecutor {
    manager: Arc<SyncManager>,
}

#[async_trait]
impl OperationHandler for OpExecutor {
    async fn execute(&self, op: &Operation) -> Result<Value> {
        let m = &self.manager;
        if m.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        let ctx = m.auth.current();
        let def = m.def(&op.collection)?;

        if op.payload.get("batch").and_then(Value::as_bool) == Some(true) {
            return self.execute_batch(&def, &ctx, op).await;
        }
        match op.op_type {
            OperationType::Create | OperationType::Update | OperationType::Delete => {
                self.execute_upload(&def, &ctx, op).await
            }
            OperationType::Read => self.execute_download(&def, &ctx, op).await,
            OperationType::Query | OperationType::Subscribe => Ok(Value::Null),
        }
    }
}

impl OpExecutor {
    async fn execute_upload(
        &self,
        def: &Arc<CollectionDef>,
        ctx: &AuthContext,
        op: &Operation,
    ) -> Result<Value> {
        let m = &self.manager;
        let map = op
            .payload
            .get("record")
            .and_then(Value::as_object)
            .ok_or_else(|| SyncError::validation("upload operation missing record payload"))?
            .clone();
        let record = SyncRecord::from_map(&map)?;
        let version_at_upload = record.sync_version;

        match op.op_type {
            OperationType::Delete => {
                match m.adapter.delete(ctx, &def.name, &record.id).await {
                    Ok(_) => m.ack_upload(def, ctx, &record.id, version_at_upload, None)?,
                    // Already gone remotely: the tombstone is acknowledged.
                    Err(e) if e.kind == ErrorKind::NotFound => {
                        m.ack_upload(def, ctx, &record.id, version_at_upload, None)?
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            OperationType::Create => match m.adapter.create(ctx, &def.name, &map).await {
                Ok(resp) => {
                    m.ack_upload(def, ctx, &record.id, version_at_upload, Some(&resp.data))?
                }
                Err(e) if e.kind == ErrorKind::Conflict => {
                    // The record already exists upstream. Resolve, and if
                    // the resolved state is ours to push, push it as an
                    // update now; a re-enqueued create would only
                    // conflict again.
                    let resolution =
                        self.resolve_rejected_write(def, ctx, &record, e.details).await?;
                    if matches!(
                        resolution.side,
                        ResolutionSide::Local | ResolutionSide::Merged
                    ) {
                        if let Some(current) = m.store.get(&def.name, &record.id)? {
                            if current.is_dirty {
                                let resolved_map = current.to_map();
                                let resp = m
                                    .adapter
                                    .update(ctx, &def.name, &current.id, &resolved_map)
                                    .await?;
                                m.ack_upload(
                                    def,
                                    ctx,
                                    &current.id,
                                    current.sync_version,
                                    Some(&resp.data),
                                )?;
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            },
            OperationType::Update => {
                match m.adapter.update(ctx, &def.name, &record.id, &map).await {
                    Ok(resp) => {
                        m.ack_upload(def, ctx, &record.id, version_at_upload, Some(&resp.data))?
                    }
                    Err(e) if e.kind == ErrorKind::Conflict => {
                        // Resolved locally; the next cycle pushes the
                        // resolved (now higher-versioned) state.
                        let _ = self.resolve_rejected_write(def, ctx, &record, e.details).await?;
                    }
                    Err(e) if e.kind == ErrorKind::NotFound => {
                        m.handle_remote_deleted(def, ctx, &record, version_at_upload)
                            .await?
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ => {}
        }
        Ok(Value::Null)
    }

    /// The remote rejected a write for version divergence. Build a
    /// descriptor from the stored record it reported (or fetch it) and
    /// resolve.
    async fn resolve_rejected_write(
        &self,
        def: &Arc<CollectionDef>,
        ctx: &AuthContext,
        uploaded: &SyncRecord,
        details: Option<Value>,
    ) -> Result<Resolution> {
        let m = &self.manager;
        let remote_map = match details.as_ref().and_then(Value::as_object) {
            Some(map) => Some(map.clone()),
            None => m.adapter.read(ctx, &def.name, &uploaded.id).await?.data,
        };
        let Some(remote_map) = remote_map else {
            return Err(SyncError::Conflict {
                collection: def.name.clone(),
                id: uploaded.id.clone(),
                message: "remote rejected write but no remote record available".to_string(),
            });
        };
        let remote = SyncRecord::from_remote(&remote_map)?;
        m.observe_remote_version(&def.name, &remote.id, remote.sync_version);

        let local = m
            .store
            .get(&def.name, &uploaded.id)?
            .unwrap_or_else(|| uploaded.clone());
        m.run_conflict(def, ctx, local, remote, ConflictOrigin::Upload)
    }

    async fn execute_download(
        &self,
        def: &Arc<CollectionDef>,
        ctx: &AuthContext,
        op: &Operation,
    ) -> Result<Value> {
        let m = &self.manager;
        let id = op
            .record_id
            .as_deref()
            .ok_or_else(|| SyncError::validation("download operation missing record id"))?;

        match m.adapter.read(ctx, &def.name, id).await?.data {
            Some(map) => {
                m.apply_remote_map(def, ctx, &map)?;
            }
            None => {
                // Deleted remotely.
                if let Some(local) = m.store.get(&def.name, id)? {
                    if !local.is_deleted {
                        let version = local.sync_version;
                        m.handle_remote_deleted(def, ctx, &local, version).await?;
                    }
                }
            }
        }
        Ok(Value::Null)
    }

    async fn execute_batch(
        &self,
        def: &Arc<CollectionDef>,
        ctx: &AuthContext,
        op: &Operation,
    ) -> Result<Value> {
        let m = &self.manager;
        let records: Vec<RecordMap> = op
            .payload
            .get("records")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_object)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if records.is_empty() {
            return Ok(Value::Null);
        }
        let versions: HashMap<String, i64> = records
            .iter()
            .filter_map(|map| {
                let record = SyncRecord::from_map(map).ok()?;
                Some((record.id, record.sync_version))
            })
            .collect();

        match op.op_type {
            OperationType::Create => {
                let resp = m.adapter.batch_create(ctx, &def.name, &records).await?;
                for remote_map in &resp.data {
                    let remote = SyncRecord::from_remote(remote_map)?;
                    let version = versions.get(&remote.id).copied().unwrap_or(0);
                    m.ack_upload(def, ctx, &remote.id, version, Some(remote_map))?;
                }
            }
            OperationType::Update => {
                let resp = m.adapter.batch_update(ctx, &def.name, &records).await?;
                for remote_map in &resp.data {
                    let remote = SyncRecord::from_remote(remote_map)?;
                    let version = versions.get(&remote.id).copied().unwrap_or(0);
                    m.ack_upload(def, ctx, &remote.id, version, Some(remote_map))?;
                }
            }
            OperationType::Delete => {
                let ids: Vec<String> = versions.keys().cloned().collect();
                m.adapter.batch_delete(ctx, &def.name, &ids).await?;
                for (id, version) in &versions {
                    m.ack_upload(def, ctx, id, *version, None)?;
                }
            }
            _ => {}
        }
        Ok(Value::Null)
    }
}

// ============================================================================
// Tests
// ============================================================================
