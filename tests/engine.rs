//! End-to-end engine scenarios over `SqliteStore` + `MemoryAdapter`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{json, Map, Value};

use unisync::adapter::{AdapterError, BackendAdapter, MemoryAdapter};
use unisync::auth::{AuthManager, Login};
use unisync::collection::{collection, CollectionDef, SyncDirection};
use unisync::config::SyncConfig;
use unisync::conflict::ConflictStrategyName;
use unisync::error::SyncError;
use unisync::events::{EventBus, EventFilter, EventType};
use unisync::queue::{
    CancelFlag, Dispatcher, Operation, OperationHandler, OperationQueue, OperationType, Priority,
};
use unisync::storage::SqliteStore;
use unisync::sync::{SyncManager, SyncManagerOptions, SyncOutcome};

// ============================================================================
// Helpers
// ============================================================================

struct Harness {
    manager: Arc<SyncManager>,
    adapter: Arc<MemoryAdapter>,
    auth: Arc<AuthManager>,
    bus: Arc<EventBus>,
    _dir: tempfile::TempDir,
}

async fn harness_with(
    defs: Vec<CollectionDef>,
    tweak: impl FnOnce(&mut SyncConfig),
) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(SqliteStore::open(&dir.path().join("local.db")).expect("open store"));
    harness_on(store, Arc::new(MemoryAdapter::new()), defs, tweak, dir).await
}

async fn harness_on(
    store: Arc<SqliteStore>,
    adapter: Arc<MemoryAdapter>,
    defs: Vec<CollectionDef>,
    tweak: impl FnOnce(&mut SyncConfig),
    dir: tempfile::TempDir,
) -> Harness {
    let bus = Arc::new(EventBus::new(512));
    let auth = Arc::new(AuthManager::new(bus.clone(), None));
    auth.login(Login {
        token: "token".into(),
        user_id: Some("u1".into()),
        organization_id: Some("org1".into()),
        ..Login::default()
    })
    .unwrap();

    let mut config = SyncConfig {
        retry_delays: vec![Duration::from_millis(10), Duration::from_millis(30)],
        ..SyncConfig::default()
    };
    tweak(&mut config);

    let manager = SyncManager::new(SyncManagerOptions {
        config,
        store,
        adapter: adapter.clone(),
        auth: auth.clone(),
        bus: bus.clone(),
        collections: defs.into_iter().map(Arc::new).collect(),
        custom_resolvers: HashMap::new(),
    })
    .unwrap();
    manager.connect().await.unwrap();

    Harness {
        manager,
        adapter,
        auth,
        bus,
        _dir: dir,
    }
}

async fn harness(defs: Vec<CollectionDef>) -> Harness {
    harness_with(defs, |_| {}).await
}

fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

// ============================================================================
// Scenario: priority dispatch
// ============================================================================

struct OrderLog(parking_lot::Mutex<Vec<String>>);

#[async_trait::async_trait]
impl OperationHandler for OrderLog {
    async fn execute(&self, op: &Operation) -> unisync::Result<Value> {
        self.0.lock().push(op.operation_id.clone());
        Ok(Value::Null)
    }
}

#[tokio::test]
async fn priority_dispatch_order_with_single_concurrency() {
    let bus = Arc::new(EventBus::new(256));
    let auth = Arc::new(AuthManager::new(bus.clone(), None));
    let ctx = auth.login(Login::new("token")).unwrap();

    let queue = Arc::new(OperationQueue::new(bus, 100));
    let dispatcher = Dispatcher::new(queue.clone(), auth, 1);

    let enqueue = |priority: Priority| {
        queue
            .enqueue(
                Operation::new(OperationType::Update, "notes", json!({}), &ctx.context_id)
                    .with_priority(priority)
                    .with_retry(0, vec![]),
            )
            .unwrap()
    };
    // op_L, op_C1, op_N, op_H, op_C2
    let op_l = enqueue(Priority::Low);
    let op_c1 = enqueue(Priority::Critical);
    let op_n = enqueue(Priority::Normal);
    let op_h = enqueue(Priority::High);
    let op_c2 = enqueue(Priority::Critical);

    let log = Arc::new(OrderLog(parking_lot::Mutex::new(Vec::new())));
    dispatcher.drain(log.clone(), &CancelFlag::new(), None).await;

    assert_eq!(log.0.lock().clone(), vec![op_c1, op_c2, op_h, op_n, op_l]);
}

// ============================================================================
// Scenario: retry with exponential backoff
// ============================================================================

struct AlwaysFail;

#[async_trait::async_trait]
impl OperationHandler for AlwaysFail {
    async fn execute(&self, _op: &Operation) -> unisync::Result<Value> {
        Err(SyncError::Network {
            message: "unreachable".into(),
        })
    }
}

#[tokio::test]
async fn retry_backoff_then_abandoned_with_single_failure_event() {
    let bus = Arc::new(EventBus::new(256));
    let mut failed_events = bus.subscribe(EventFilter::for_types([EventType::OperationFailed]));
    let auth = Arc::new(AuthManager::new(bus.clone(), None));
    let ctx = auth.login(Login::new("token")).unwrap();

    let queue = Arc::new(OperationQueue::new(bus, 100));
    let dispatcher = Dispatcher::new(queue.clone(), auth, 1);

    // Millisecond-scale stand-ins for the documented 1s/3s/9s table.
    let delays = vec![
        Duration::from_millis(10),
        Duration::from_millis(30),
        Duration::from_millis(90),
    ];
    queue
        .enqueue(
            Operation::new(OperationType::Update, "notes", json!({}), &ctx.context_id)
                .with_retry(3, delays.clone()),
        )
        .unwrap();

    let started = Instant::now();
    let stats = dispatcher
        .drain(Arc::new(AlwaysFail), &CancelFlag::new(), None)
        .await;
    let elapsed = started.elapsed();

    // Initial attempt plus three retries, then abandoned.
    assert_eq!(stats.retries_scheduled, 3);
    assert_eq!(stats.abandoned, 1);
    let total_delay: Duration = delays.iter().sum();
    assert!(elapsed >= total_delay, "attempts must respect the delays");

    let event = failed_events.try_recv().unwrap();
    assert_eq!(event.event_type, EventType::OperationFailed);
    assert!(
        failed_events.try_recv().is_err(),
        "operation_failed must fire exactly once"
    );
}

// ============================================================================
// Scenario: IntelligentMerge through a full cycle
// ============================================================================

#[tokio::test]
async fn intelligent_merge_conflict_end_to_end() {
    let h = harness(vec![collection("people")
        .strategy(ConflictStrategyName::IntelligentMerge)
        .build()])
    .await;

    // Local: created dirty, then remote diverges with a newer snapshot.
    let record = h
        .manager
        .create_record(
            "people",
            fields(json!({"name": "Alice", "age": 30, "tags": ["a", "b"]})),
        )
        .unwrap();
    h.adapter.seed(
        "people",
        fields(json!({
            "id": record.id,
            "organization_id": "org1",
            "sync_version": 4,
            "updated_at": "2025-01-01T10:05:00Z",
            "name": "Alice",
            "age": 31,
            "tags": ["b", "c"]
        })),
    );

    let report = h.manager.sync_collection("people").await.unwrap();
    assert!(report.conflicts_detected >= 1);

    let merged = h.manager.get_record("people", &record.id).unwrap().unwrap();
    assert_eq!(merged.fields["name"], json!("Alice"));
    assert_eq!(merged.fields["age"], json!(31), "larger number wins");
    assert_eq!(
        merged.fields["tags"],
        json!(["a", "b", "c"]),
        "union preserving local order"
    );
    assert!(merged.sync_version >= 5, "merged version is max(local, remote) + 1");

    // The merged row pushes on the next cycle and converges.
    let report = h.manager.sync_collection("people").await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Success);
    let row = h.manager.get_record("people", &record.id).unwrap().unwrap();
    assert!(!row.is_dirty);
    let remote = h.adapter.stored("people", &record.id).unwrap();
    assert_eq!(remote["age"], json!(31));
}

// ============================================================================
// Scenario: CAS on mark_synced
// ============================================================================

#[tokio::test]
async fn cas_rejects_stale_acknowledgment_and_next_cycle_reuploads() {
    let h = harness(vec![collection("notes").build()]).await;
    let record = h
        .manager
        .create_record("notes", fields(json!({"title": "v1"})))
        .unwrap();

    // The row advances while an upload for the old version is in flight.
    h.manager
        .update_record("notes", &record.id, fields(json!({"title": "v2"})))
        .unwrap();

    // Stale acknowledgment for the superseded version fails the CAS and
    // surfaces no exception path: the row simply stays dirty.
    let err = h
        .manager
        .store()
        .mark_synced("notes", &record.id, record.sync_version, Utc::now())
        .unwrap_err();
    assert!(matches!(err, SyncError::VersionMismatch { .. }));
    let row = h.manager.get_record("notes", &record.id).unwrap().unwrap();
    assert!(row.is_dirty);

    // The next cycle pushes the newer version and converges.
    let report = h.manager.sync_collection("notes").await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Success);
    let row = h.manager.get_record("notes", &record.id).unwrap().unwrap();
    assert!(!row.is_dirty);
    assert_eq!(
        h.adapter.stored("notes", &record.id).unwrap()["title"],
        json!("v2")
    );
}

// ============================================================================
// Scenario: tombstone propagation and retention purge
// ============================================================================

#[tokio::test]
async fn tombstone_uploads_then_purges_after_retention() {
    let h = harness_with(vec![collection("notes").build()], |config| {
        config.retention = Some(Duration::ZERO);
    })
    .await;

    let record = h
        .manager
        .create_record("notes", fields(json!({"title": "doomed"})))
        .unwrap();
    h.manager.sync_collection("notes").await.unwrap();

    h.manager.delete_record("notes", &record.id).unwrap();
    h.manager.sync_collection("notes").await.unwrap();

    // Remote copy gone; a later download returns nothing for it.
    assert!(h.adapter.stored("notes", &record.id).is_none());

    // Locally tombstoned and acknowledged until retention elapses.
    let row = h.manager.get_record("notes", &record.id).unwrap().unwrap();
    assert!(row.is_deleted);
    assert!(!row.is_dirty);
    assert!(row.deletion_acknowledged());

    assert_eq!(h.manager.purge_tombstones().unwrap(), 1);
    assert!(h.manager.get_record("notes", &record.id).unwrap().is_none());
}

// ============================================================================
// Scenario: restart persistence
// ============================================================================

#[tokio::test]
async fn pending_queue_survives_restart_in_priority_order() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("local.db");

    let bus = Arc::new(EventBus::new(256));
    let auth = Arc::new(AuthManager::new(bus.clone(), None));
    auth.login(Login::new("token")).unwrap();

    let build = |store: Arc<SqliteStore>, bus: Arc<EventBus>, auth: Arc<AuthManager>| {
        SyncManager::new(SyncManagerOptions {
            config: SyncConfig::default(),
            store,
            adapter: Arc::new(MemoryAdapter::new()),
            auth,
            bus,
            collections: vec![Arc::new(collection("notes").build())],
            custom_resolvers: HashMap::new(),
        })
        .unwrap()
    };

    let ids: Vec<String> = {
        let store = Arc::new(SqliteStore::open(&db_path).unwrap());
        let manager = build(store, bus.clone(), auth.clone());
        let ctx = auth.current();
        let ids = [Priority::Critical, Priority::Normal, Priority::Low]
            .into_iter()
            .map(|priority| {
                manager
                    .queue()
                    .enqueue(
                        Operation::new(
                            OperationType::Update,
                            "notes",
                            json!({}),
                            &ctx.context_id,
                        )
                        .with_priority(priority),
                    )
                    .unwrap()
            })
            .collect();
        manager.shutdown().unwrap();
        ids
    };

    // "Restart": a fresh manager over the same database file.
    let store = Arc::new(SqliteStore::open(&db_path).unwrap());
    let manager = build(store, bus, auth);
    assert_eq!(manager.restore_queue().unwrap(), 3);

    let mut order = Vec::new();
    while let Some(op) = manager.queue().next_ready(Utc::now()) {
        order.push(op.operation_id.clone());
        manager.queue().complete_success(&op.operation_id);
    }
    assert_eq!(order, ids, "same operations, same priority order");
}

// ============================================================================
// Two-device convergence
// ============================================================================

#[tokio::test]
async fn two_stores_converge_through_a_shared_backend() {
    let adapter = Arc::new(MemoryAdapter::new());

    let dir_a = tempfile::tempdir().unwrap();
    let store_a = Arc::new(SqliteStore::open(&dir_a.path().join("a.db")).unwrap());
    let a = harness_on(
        store_a,
        adapter.clone(),
        vec![collection("notes").build()],
        |_| {},
        dir_a,
    )
    .await;

    let dir_b = tempfile::tempdir().unwrap();
    let store_b = Arc::new(SqliteStore::open(&dir_b.path().join("b.db")).unwrap());
    let b = harness_on(
        store_b,
        adapter,
        vec![collection("notes").build()],
        |_| {},
        dir_b,
    )
    .await;

    // Device A authors a record; device B picks it up.
    let record = a
        .manager
        .create_record("notes", fields(json!({"title": "shared", "count": 1})))
        .unwrap();
    a.manager.sync_collection("notes").await.unwrap();
    b.manager.sync_collection("notes").await.unwrap();

    let on_b = b.manager.get_record("notes", &record.id).unwrap().unwrap();
    assert_eq!(on_b.fields["title"], json!("shared"));
    assert!(!on_b.is_dirty);

    // Device B edits; device A converges.
    b.manager
        .update_record(
            "notes",
            &record.id,
            fields(json!({"title": "shared", "count": 2})),
        )
        .unwrap();
    b.manager.sync_collection("notes").await.unwrap();
    a.manager.sync_collection("notes").await.unwrap();

    let on_a = a.manager.get_record("notes", &record.id).unwrap().unwrap();
    assert_eq!(on_a.fields["count"], json!(2));
    assert!(!on_a.is_dirty);
}

// ============================================================================
// Boundary behaviors
// ============================================================================

#[tokio::test]
async fn queue_full_rejects_low_but_accepts_critical() {
    let h = harness_with(vec![collection("notes").build()], |config| {
        config.queue_max_size = 2;
    })
    .await;
    let ctx = h.auth.current();

    let make = |priority: Priority| {
        Operation::new(OperationType::Update, "notes", json!({}), &ctx.context_id)
            .with_priority(priority)
    };
    h.manager.queue().enqueue(make(Priority::Normal)).unwrap();
    h.manager.queue().enqueue(make(Priority::Normal)).unwrap();

    assert!(matches!(
        h.manager.queue().enqueue(make(Priority::Low)).unwrap_err(),
        SyncError::QueueFull { .. }
    ));
    // Critical exceeds the bound rather than being rejected.
    h.manager.queue().enqueue(make(Priority::Critical)).unwrap();
    assert_eq!(h.manager.queue().pending_len(), 3);
}

#[tokio::test]
async fn rate_limit_hint_delays_the_retry() {
    let h = harness(vec![collection("notes").build()]).await;
    h.manager
        .create_record("notes", fields(json!({"title": "x"})))
        .unwrap();

    h.adapter.fail_next(AdapterError::rate_limit(
        "slow down",
        Some(Duration::from_millis(80)),
    ));

    let started = Instant::now();
    let report = h.manager.sync_collection("notes").await.unwrap();
    assert_eq!(report.outcome, SyncOutcome::Success);
    assert!(
        started.elapsed() >= Duration::from_millis(80),
        "retry must wait at least the server hint"
    );
}

#[tokio::test]
async fn context_switch_mid_queue_fails_dispatch_with_authentication() {
    let h = harness(vec![collection("notes").build()]).await;
    h.manager
        .create_record("notes", fields(json!({"title": "mine"})))
        .unwrap();

    // The enqueue-time context is invalidated before the cycle runs the
    // queue; dispatch must reject rather than run under the new
    // principal. The cycle enqueues under the *current* context though,
    // so simulate by switching right before a manual drain of stale ops.
    let old_ctx = h.auth.current();
    h.manager
        .queue()
        .enqueue(Operation::new(
            OperationType::Update,
            "notes",
            json!({"record": {"id": "ghost", "sync_version": 1}}),
            &old_ctx.context_id,
        ))
        .unwrap();
    h.auth.switch_user(Login::new("other-token")).unwrap();

    let report = h.manager.sync_collection("notes").await.unwrap();
    assert_eq!(
        report.outcome,
        SyncOutcome::Partial,
        "auth rejection makes the cycle partial"
    );
}

#[tokio::test]
async fn download_only_collections_skip_upload_entirely() {
    let h = harness(vec![collection("feed")
        .direction(SyncDirection::DownloadOnly)
        .build()])
    .await;

    h.adapter.seed(
        "feed",
        fields(json!({
            "id": "item1",
            "organization_id": "org1",
            "sync_version": 1,
            "updated_at": "2025-06-01T09:00:00Z",
            "headline": "hello"
        })),
    );

    let report = h.manager.sync_collection("feed").await.unwrap();
    assert_eq!(report.downloaded, 1);
    assert_eq!(report.uploaded, 0);
    assert!(h.manager.get_record("feed", "item1").unwrap().is_some());
}

// ============================================================================
// Realtime change streams
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn realtime_subscription_applies_remote_changes() {
    let h = harness(vec![collection("notes").build()]).await;
    h.manager.start_subscriptions();
    // Let the stream task connect.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // A change arrives from elsewhere through the backend.
    h.adapter
        .create(
            &h.auth.current(),
            "notes",
            &fields(json!({
                "id": "from-elsewhere",
                "organization_id": "org1",
                "sync_version": 1,
                "updated_at": "2025-06-01T12:00:00Z",
                "title": "pushed"
            })),
        )
        .await
        .unwrap();

    let mut found = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if h.manager
            .get_record("notes", "from-elsewhere")
            .unwrap()
            .is_some()
        {
            found = true;
            break;
        }
    }
    assert!(found, "subscription must pull the changed record down");
    h.manager.stop_subscriptions();
}

// ============================================================================
// Event stream visibility
// ============================================================================

#[tokio::test]
async fn cycle_emits_started_progress_completed() {
    let h = harness(vec![collection("notes").build()]).await;
    let mut events = h.bus.subscribe(EventFilter::for_types([
        EventType::SyncStarted,
        EventType::SyncProgress,
        EventType::SyncCompleted,
    ]));

    h.manager
        .create_record("notes", fields(json!({"title": "x"})))
        .unwrap();
    h.manager.sync_collection("notes").await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.event_type);
    }
    assert_eq!(seen.first(), Some(&EventType::SyncStarted));
    assert!(seen.contains(&EventType::SyncProgress));
    assert_eq!(seen.last(), Some(&EventType::SyncCompleted));
}
