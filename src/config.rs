//! Engine configuration accepted at startup.

use std::time::Duration;

use crate::conflict::ConflictStrategyName;

/// Which trigger sources the scheduler enables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Caller-initiated cycles only.
    Manual,
    /// Local change events enqueue uploads for the affected rows.
    Automatic,
    /// Periodic low-priority full sweeps, plus change-event uploads.
    Scheduled,
    /// Change-event uploads plus adapter change-stream subscriptions.
    Realtime,
}

/// Engine configuration. `Default` matches the documented defaults;
/// `retention` has no default and must be set before tombstone GC runs.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub sync_mode: SyncMode,
    /// Period for scheduled sweeps.
    pub sync_interval: Duration,
    /// Max items per batched adapter call (further capped by the
    /// adapter's declared `max_batch_size`).
    pub batch_size: usize,
    /// Queue dispatch bound: max in-flight operations.
    pub max_concurrent_operations: usize,
    pub max_retries: u32,
    pub retry_delays: Vec<Duration>,
    /// Strategy for collections that don't set their own.
    pub default_conflict_strategy: ConflictStrategyName,
    /// Auto-logout after this long in a session, if set.
    pub session_duration: Option<Duration>,
    /// Refresh tokens this long before expiry.
    pub token_refresh_threshold: Duration,
    /// Tombstone GC cutoff. No default: purge is a no-op until configured.
    pub retention: Option<Duration>,
    /// Backpressure threshold: normal/low enqueues are rejected beyond
    /// this; critical/high always land.
    pub queue_max_size: usize,
    /// Download pagination size.
    pub page_size: usize,
    /// TTL of the per-collection orchestration lease.
    pub lease_ttl: Duration,
    /// Max diagnostic log rows retained in the store.
    pub log_retention_cap: usize,
    /// Default per-subscriber event buffer.
    pub event_buffer: usize,
    /// Optional wall-clock bound for one cycle.
    pub cycle_budget: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::Manual,
            sync_interval: Duration::from_secs(300),
            batch_size: 50,
            max_concurrent_operations: 3,
            max_retries: 3,
            retry_delays: vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(9),
            ],
            default_conflict_strategy: ConflictStrategyName::RemoteWins,
            session_duration: None,
            token_refresh_threshold: Duration::from_secs(300),
            retention: None,
            queue_max_size: 1000,
            page_size: 100,
            lease_ttl: Duration::from_secs(300),
            log_retention_cap: 1000,
            event_buffer: 256,
            cycle_budget: None,
        }
    }
}
