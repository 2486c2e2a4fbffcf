//! Offline-first bidirectional sync engine.
//!
//! The local store is the store of record: applications write there and
//! the engine propagates mutations upstream through pluggable backend
//! adapters, pulls remote changes down past a per-collection watermark,
//! resolves conflicts with per-collection strategies, and survives
//! network failure, restart, and partial upload via a persistent
//! priority operation queue.

pub mod adapter;
pub mod auth;
pub mod collection;
pub mod config;
pub mod conflict;
pub mod error;
pub mod events;
pub mod queue;
pub mod record;
pub mod recovery;
pub mod storage;
pub mod sync;

pub use adapter::{
    AdapterCapabilities, AdapterError, AdapterResponse, AdapterResult, BackendAdapter,
    MemoryAdapter, RecordMap, RemoteChange, RemoteQuery,
};
pub use auth::{AuthContext, AuthManager, Credentials, Login, TokenManager};
pub use collection::{collection, CollectionDef, FieldNameStyle, SyncDirection};
pub use config::{SyncConfig, SyncMode};
pub use conflict::{
    ConflictDescriptor, ConflictResolver, ConflictStrategyName, MergeHints, Resolution,
    ResolutionSide,
};
pub use error::{ErrorKind, Result, SyncError};
pub use events::{EventBus, EventFilter, EventType, SyncEvent};
pub use queue::{Operation, OperationQueue, OperationType, Priority};
pub use record::SyncRecord;
pub use recovery::RecoveryManager;
pub use storage::{LocalStore, MemoryStore, SqliteStore};
pub use sync::{
    CollectionReport, SyncManager, SyncManagerOptions, SyncOutcome, SyncReport, SyncScheduler,
};

use std::sync::Arc;

use parking_lot::Mutex;

// ============================================================================
// Process-wide engine lifecycle
// ============================================================================

/// The initialized engine: orchestrator, trigger scheduler, and the
/// recovery/inspection surface.
#[derive(Clone)]
pub struct Engine {
    pub manager: Arc<SyncManager>,
    pub scheduler: Arc<SyncScheduler>,
    pub recovery: Arc<RecoveryManager>,
}

static ENGINE: Mutex<Option<Engine>> = Mutex::new(None);

/// Initialize the process-wide engine: connect the adapter, restore the
/// persisted queue, and start the configured triggers. Guarded against
/// re-initialization; call [`shutdown`] first to replace it.
pub async fn initialize(options: SyncManagerOptions) -> Result<Engine> {
    if ENGINE.lock().is_some() {
        return Err(SyncError::AlreadyInitialized);
    }

    let manager = SyncManager::new(options)?;
    manager.connect().await?;
    manager.restore_queue()?;

    let scheduler = Arc::new(SyncScheduler::new(manager.clone()));
    scheduler.start();

    let recovery = Arc::new(RecoveryManager::new(
        manager.store().clone(),
        manager.queue().clone(),
        manager.bus().clone(),
        manager.collections().to_vec(),
        manager.config().log_retention_cap,
    ));

    let engine = Engine {
        manager,
        scheduler,
        recovery,
    };
    let mut slot = ENGINE.lock();
    if slot.is_some() {
        // Lost an initialization race; unwind this instance.
        engine.scheduler.stop();
        let _ = engine.manager.shutdown();
        return Err(SyncError::AlreadyInitialized);
    }
    *slot = Some(engine.clone());
    Ok(engine)
}

/// The current engine, if initialized.
pub fn engine() -> Result<Engine> {
    ENGINE.lock().clone().ok_or(SyncError::NotInitialized)
}

/// Stop triggers and subscriptions, snapshot the queue, and clear the
/// process-wide slot.
pub fn shutdown() -> Result<()> {
    let engine = ENGINE.lock().take().ok_or(SyncError::NotInitialized)?;
    engine.scheduler.stop();
    engine.manager.shutdown()
}

// ============================================================================
// Tests
// ============================================================================
