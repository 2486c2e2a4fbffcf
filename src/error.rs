//! Crate-wide error type and the normalized error-kind taxonomy shared
//! between the engine and backend adapters.

use std::time::Duration;

use thiserror::Error;

use crate::adapter::AdapterError;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SyncError>;

// ============================================================================
// ErrorKind: normalized taxonomy
// ============================================================================

/// Normalized error classification, uniform across backends.
///
/// Adapters translate their transport-specific failures into one of these
/// kinds; the queue consults [`ErrorKind::retryable_by_default`] when
/// deciding whether a failed operation goes back to pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Authentication,
    Authorization,
    NotFound,
    Conflict,
    RateLimit,
    Network,
    Timeout,
    Backend,
    Cancelled,
}

impl ErrorKind {
    /// Whether failures of this kind are retried by default.
    ///
    /// Backend errors are retryable only for 5xx-class statuses; callers
    /// with a status should prefer [`SyncError::is_retryable`].
    pub fn retryable_by_default(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::RateLimit | ErrorKind::Timeout | ErrorKind::Backend
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Authorization => "authorization",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Backend => "backend",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

// ============================================================================
// SyncError
// ============================================================================

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Authentication error: {message}")]
    Authentication { message: String },

    #[error("Authorization error: {message}")]
    Authorization { message: String },

    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// CAS failure on `mark_synced`: the local row advanced past the
    /// version the acknowledgment was issued for. The row stays dirty.
    #[error("Version mismatch for {collection}/{id}: expected {expected}")]
    VersionMismatch {
        collection: String,
        id: String,
        expected: i64,
    },

    #[error("Conflict on {collection}/{id}: {message}")]
    Conflict {
        collection: String,
        id: String,
        message: String,
    },

    #[error("Rate limited: {message}")]
    RateLimit {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Timed out: {message}")]
    Timeout { message: String },

    #[error("Backend error{}: {message}", status.map(|s| format!(" ({s})")).unwrap_or_default())]
    Backend {
        message: String,
        status: Option<u16>,
    },

    #[error("Operation cancelled")]
    Cancelled,

    /// Backpressure: the queue is at `queue_max_size` and the operation's
    /// priority does not bypass the bound.
    #[error("Queue full ({size} operations)")]
    QueueFull { size: usize },

    /// Another process (or this one) holds the per-collection sync lease.
    #[error("Sync lease for '{collection}' held by {holder}")]
    LeaseHeld { collection: String, holder: String },

    #[error("Unknown collection '{0}'")]
    UnknownCollection(String),

    #[error("Engine already initialized")]
    AlreadyInitialized,

    #[error("Engine not initialized")]
    NotInitialized,

    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl SyncError {
    pub fn validation(message: impl Into<String>) -> Self {
        SyncError::Validation {
            message: message.into(),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        SyncError::Authentication {
            message: message.into(),
        }
    }

    /// The normalized kind for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Validation { .. } | SyncError::UnknownCollection(_) => ErrorKind::Validation,
            SyncError::Authentication { .. } => ErrorKind::Authentication,
            SyncError::Authorization { .. } => ErrorKind::Authorization,
            SyncError::NotFound { .. } => ErrorKind::NotFound,
            SyncError::VersionMismatch { .. }
            | SyncError::Conflict { .. }
            | SyncError::LeaseHeld { .. } => ErrorKind::Conflict,
            SyncError::RateLimit { .. } => ErrorKind::RateLimit,
            SyncError::Network { .. } => ErrorKind::Network,
            SyncError::Timeout { .. } => ErrorKind::Timeout,
            SyncError::Cancelled => ErrorKind::Cancelled,
            SyncError::Adapter(e) => e.kind,
            _ => ErrorKind::Backend,
        }
    }

    /// Whether the queue should retry an operation that failed with this
    /// error. Adapters can override their kind's default per error.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Adapter(e) => e.retryable,
            SyncError::Backend { status, .. } => status.map_or(true, |s| s >= 500),
            SyncError::Cancelled => false,
            other => other.kind().retryable_by_default(),
        }
    }

    /// Server-provided retry hint, if any (`rate_limit` responses).
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimit { retry_after, .. } => *retry_after,
            SyncError::Adapter(e) => e.retry_after,
            _ => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
