//! Authentication context and lifecycle.
//!
//! An [`AuthContext`] is an immutable snapshot scoping every operation to
//! a tenant and principal. The [`AuthManager`] is the process-wide
//! single-writer slot holding the current context; transitions replace
//! the whole snapshot and broadcast on the event bus. The optional
//! [`TokenManager`] keeps credentials fresh ahead of expiry.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;

use crate::error::{Result, SyncError};
use crate::events::{EventBus, EventType, SyncEvent};

// ============================================================================
// Credentials and AuthContext
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Immutable tenant-and-user snapshot. Derived children are
/// self-contained; the parent's `context_id` is not referenced again.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub context_id: String,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    pub credentials: Option<Credentials>,
    /// Arbitrary caller metadata (roles, feature flags).
    pub user_context: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthContext {
    /// The unauthenticated context in effect before login and after
    /// logout. Never expires.
    pub fn public() -> Self {
        Self {
            context_id: "public".to_string(),
            user_id: None,
            organization_id: None,
            credentials: None,
            user_context: Map::new(),
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn authenticated(
        token: impl Into<String>,
        user_id: Option<String>,
        organization_id: Option<String>,
        user_context: Option<Map<String, Value>>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            context_id: uuid::Uuid::new_v4().to_string(),
            user_id,
            organization_id,
            credentials: Some(Credentials {
                token: token.into(),
                refresh_token: None,
                expires_at,
            }),
            user_context: user_context.unwrap_or_default(),
            created_at: Utc::now(),
            expires_at,
        }
    }

    /// Valid iff unexpired.
    pub fn is_valid(&self) -> bool {
        self.expires_at.is_none_or(|at| at > Utc::now())
    }

    pub fn is_authenticated(&self) -> bool {
        self.credentials.is_some()
    }

    /// Derive a self-contained child with additional metadata. The child
    /// gets its own `context_id`; existing keys are overridden by `extra`.
    pub fn derive_child(&self, extra: Map<String, Value>) -> Self {
        let mut user_context = self.user_context.clone();
        for (k, v) in extra {
            user_context.insert(k, v);
        }
        Self {
            context_id: uuid::Uuid::new_v4().to_string(),
            user_context,
            created_at: Utc::now(),
            ..self.clone()
        }
    }
}

// ============================================================================
// Login parameters
// ============================================================================

/// Parameters for [`AuthManager::login`].
#[derive(Debug, Clone, Default)]
pub struct Login {
    pub token: String,
    pub refresh_token: Option<String>,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    pub user_context: Option<Map<String, Value>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Login {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Self::default()
        }
    }
}

// ============================================================================
// AuthManager
// ============================================================================

pub struct AuthManager {
    current: RwLock<Arc<AuthContext>>,
    bus: Arc<EventBus>,
    /// Hard cap on any session's lifetime, applied at login and re-applied
    /// on refresh. None means sessions last as long as their tokens.
    session_duration: Option<Duration>,
    session_deadline: RwLock<Option<DateTime<Utc>>>,
}

impl AuthManager {
    pub fn new(bus: Arc<EventBus>, session_duration: Option<Duration>) -> Self {
        Self {
            current: RwLock::new(Arc::new(AuthContext::public())),
            bus,
            session_duration,
            session_deadline: RwLock::new(None),
        }
    }

    pub fn current(&self) -> Arc<AuthContext> {
        self.current.read().clone()
    }

    pub fn login(&self, login: Login) -> Result<Arc<AuthContext>> {
        if login.token.is_empty() {
            return Err(SyncError::authentication("empty token"));
        }
        let now = Utc::now();
        let session_deadline = self
            .session_duration
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| now + d);
        let expires_at = clamp_expiry(login.expires_at, session_deadline);
        if expires_at.is_some_and(|at| at <= now) {
            return Err(SyncError::authentication("token already expired"));
        }

        let ctx = Arc::new(AuthContext {
            context_id: uuid::Uuid::new_v4().to_string(),
            user_id: login.user_id,
            organization_id: login.organization_id,
            credentials: Some(Credentials {
                token: login.token,
                refresh_token: login.refresh_token,
                expires_at: login.expires_at,
            }),
            user_context: login.user_context.unwrap_or_default(),
            created_at: now,
            expires_at,
        });

        *self.session_deadline.write() = session_deadline;
        *self.current.write() = ctx.clone();

        tracing::info!(context_id = %ctx.context_id, user_id = ?ctx.user_id, "logged in");
        self.bus.emit(
            SyncEvent::new(EventType::AuthLogin).payload(context_payload(&ctx)),
        );
        Ok(ctx)
    }

    pub fn logout(&self) {
        let previous = {
            let mut slot = self.current.write();
            *self.session_deadline.write() = None;
            std::mem::replace(&mut *slot, Arc::new(AuthContext::public()))
        };
        if previous.is_authenticated() {
            tracing::info!(context_id = %previous.context_id, "logged out");
            self.bus.emit(
                SyncEvent::new(EventType::AuthLogout).payload(context_payload(&previous)),
            );
        }
    }

    /// Logout + login as an atomic pair. Observers see the public context
    /// and then the new authenticated one; nothing in between.
    pub fn switch_user(&self, login: Login) -> Result<Arc<AuthContext>> {
        self.logout();
        self.login(login)
    }

    /// Replace the current credentials, preserving `context_id` so
    /// operations enqueued under this context stay dispatchable. Expiry
    /// never extends past the session deadline.
    pub fn refresh(
        &self,
        new_token: impl Into<String>,
        new_expires_at: Option<DateTime<Utc>>,
    ) -> Result<Arc<AuthContext>> {
        let mut creds = {
            let current = self.current.read();
            current
                .credentials
                .clone()
                .ok_or_else(|| SyncError::authentication("not logged in"))?
        };
        creds.token = new_token.into();
        creds.expires_at = new_expires_at;
        self.apply_refresh(creds)
    }

    /// Credential replacement used by both [`AuthManager::refresh`] and
    /// the token manager's background refresh.
    pub fn apply_refresh(&self, credentials: Credentials) -> Result<Arc<AuthContext>> {
        let mut slot = self.current.write();
        if !slot.is_authenticated() {
            return Err(SyncError::authentication("not logged in"));
        }
        let session_deadline = *self.session_deadline.read();
        let expires_at = clamp_expiry(credentials.expires_at, session_deadline);

        let mut ctx = (**slot).clone();
        ctx.credentials = Some(credentials);
        ctx.expires_at = expires_at;
        let ctx = Arc::new(ctx);
        *slot = ctx.clone();
        drop(slot);

        tracing::debug!(context_id = %ctx.context_id, "credentials refreshed");
        self.bus.emit(
            SyncEvent::new(EventType::AuthRefreshed).payload(context_payload(&ctx)),
        );
        Ok(ctx)
    }

    /// Gate an operation at dispatch time: its remembered context must
    /// still be the current one and unexpired. A replaced or invalidated
    /// context is an authentication failure, never a silent run under the
    /// new principal.
    pub fn validate_for_dispatch(&self, context_id: &str) -> Result<()> {
        let current = self.current.read();
        if current.context_id != context_id {
            return Err(SyncError::authentication(format!(
                "operation context {context_id} is no longer current"
            )));
        }
        if !current.is_valid() {
            return Err(SyncError::authentication(format!(
                "context {context_id} has expired"
            )));
        }
        Ok(())
    }
}

fn clamp_expiry(
    token_expiry: Option<DateTime<Utc>>,
    session_deadline: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (token_expiry, session_deadline) {
        (Some(t), Some(s)) => Some(t.min(s)),
        (Some(t), None) => Some(t),
        (None, Some(s)) => Some(s),
        (None, None) => None,
    }
}

fn context_payload(ctx: &AuthContext) -> Value {
    let mut map = Map::new();
    map.insert("context_id".into(), Value::String(ctx.context_id.clone()));
    if let Some(ref user) = ctx.user_id {
        map.insert("user_id".into(), Value::String(user.clone()));
    }
    if let Some(ref org) = ctx.organization_id {
        map.insert("organization_id".into(), Value::String(org.clone()));
    }
    Value::Object(map)
}

// ============================================================================
// TokenManager
// ============================================================================

pub type RefreshFuture =
    Pin<Box<dyn Future<Output = std::result::Result<Credentials, String>> + Send>>;

/// Caller-supplied refresh call. Receives the current credentials (with
/// the refresh token) and returns the replacement set.
pub type RefreshFn = Arc<dyn Fn(Credentials) -> RefreshFuture + Send + Sync>;

/// Background refresh scheduling: refresh at `expiry − threshold`, retry
/// with bounded exponential backoff, and surface exhaustion as a logout.
pub struct TokenManager {
    auth: Arc<AuthManager>,
    bus: Arc<EventBus>,
    refresh_fn: RefreshFn,
    threshold: Duration,
    max_attempts: u32,
    base_delay: Duration,
    /// Poll interval when the current credentials carry no expiry.
    nominal_cycle: Duration,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl TokenManager {
    pub fn new(auth: Arc<AuthManager>, bus: Arc<EventBus>, refresh_fn: RefreshFn) -> Self {
        Self {
            auth,
            bus,
            refresh_fn,
            threshold: Duration::from_secs(300),
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            nominal_cycle: Duration::from_secs(45 * 60),
            task: parking_lot::Mutex::new(None),
        }
    }

    pub fn with_threshold(mut self, threshold: Duration) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_backoff(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.base_delay = base_delay;
        self
    }

    pub fn with_nominal_cycle(mut self, cycle: Duration) -> Self {
        self.nominal_cycle = cycle;
        self
    }

    /// Spawn the refresh loop. Idempotent: a running loop is kept.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.task.lock();
        if slot.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let manager = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            manager.run().await;
        }));
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    async fn run(&self) {
        loop {
            let ctx = self.auth.current();
            let expiry = ctx
                .credentials
                .as_ref()
                .and_then(|c| c.expires_at)
                .or(ctx.expires_at);

            let Some(expiry) = expiry else {
                tokio::time::sleep(self.nominal_cycle).await;
                continue;
            };

            let refresh_at = expiry
                - chrono::Duration::from_std(self.threshold).unwrap_or_default();
            let wait = (refresh_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            // The context may have been replaced while we slept.
            let current = self.auth.current();
            if current.context_id != ctx.context_id || !current.is_authenticated() {
                continue;
            }

            if !self.refresh_with_backoff(&current).await {
                tracing::warn!(context_id = %current.context_id, "token refresh exhausted, logging out");
                self.bus.emit(
                    SyncEvent::new(EventType::AuthFailed)
                        .payload(Value::String("token refresh failed".into())),
                );
                self.auth.logout();
            }
        }
    }

    async fn refresh_with_backoff(&self, ctx: &AuthContext) -> bool {
        let Some(creds) = ctx.credentials.clone() else {
            return false;
        };
        for attempt in 1..=self.max_attempts {
            match (self.refresh_fn)(creds.clone()).await {
                Ok(new_creds) => {
                    return self.auth.apply_refresh(new_creds).is_ok();
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "token refresh attempt failed");
                    if attempt < self.max_attempts {
                        let delay = self.base_delay * 2u32.saturating_pow(attempt - 1);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        false
    }
}

impl Drop for TokenManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use serde_json::json;

    fn manager() -> (Arc<AuthManager>, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(32));
        (Arc::new(AuthManager::new(bus.clone(), None)), bus)
    }

    #[test]
    fn starts_public() {
        let (auth, _) = manager();
        let ctx = auth.current();
        assert_eq!(ctx.context_id, "public");
        assert!(!ctx.is_authenticated());
        assert!(ctx.is_valid());
    }

    #[tokio::test]
    async fn login_logout_emit_events() {
        let (auth, bus) = manager();
        let mut rx = bus.subscribe(EventFilter::all());

        let ctx = auth
            .login(Login {
                token: "t1".into(),
                user_id: Some("u1".into()),
                organization_id: Some("org1".into()),
                ..Login::default()
            })
            .unwrap();
        assert!(ctx.is_authenticated());

        auth.logout();
        assert_eq!(auth.current().context_id, "public");

        assert_eq!(rx.recv().await.unwrap().event_type, EventType::AuthLogin);
        assert_eq!(rx.recv().await.unwrap().event_type, EventType::AuthLogout);
    }

    #[test]
    fn empty_or_expired_token_rejected() {
        let (auth, _) = manager();
        assert!(auth.login(Login::new("")).is_err());

        let expired = Login {
            token: "t".into(),
            expires_at: Some(Utc::now() - chrono::Duration::minutes(1)),
            ..Login::default()
        };
        assert!(auth.login(expired).is_err());
    }

    #[test]
    fn refresh_preserves_context_id() {
        let (auth, _) = manager();
        let ctx = auth.login(Login::new("t1")).unwrap();

        let refreshed = auth
            .refresh("t2", Some(Utc::now() + chrono::Duration::hours(1)))
            .unwrap();
        assert_eq!(refreshed.context_id, ctx.context_id);
        assert_eq!(
            refreshed.credentials.as_ref().unwrap().token,
            "t2".to_string()
        );
    }

    #[test]
    fn session_duration_caps_expiry() {
        let bus = Arc::new(EventBus::new(8));
        let auth = AuthManager::new(bus, Some(Duration::from_secs(60)));

        let ctx = auth
            .login(Login {
                token: "t".into(),
                expires_at: Some(Utc::now() + chrono::Duration::hours(8)),
                ..Login::default()
            })
            .unwrap();

        let deadline = ctx.expires_at.unwrap();
        assert!(deadline <= Utc::now() + chrono::Duration::seconds(61));
    }

    #[test]
    fn dispatch_validation_rejects_stale_and_expired_contexts() {
        let (auth, _) = manager();
        let old = auth.login(Login::new("t1")).unwrap();
        auth.switch_user(Login::new("t2")).unwrap();

        assert!(auth.validate_for_dispatch(&old.context_id).is_err());
        assert!(auth
            .validate_for_dispatch(&auth.current().context_id)
            .is_ok());
    }

    #[test]
    fn derive_child_is_self_contained() {
        let (auth, _) = manager();
        auth.login(Login {
            token: "t".into(),
            user_context: Some(
                json!({"role": "viewer"}).as_object().cloned().unwrap(),
            ),
            ..Login::default()
        })
        .unwrap();

        let parent = auth.current();
        let child = parent.derive_child(
            json!({"role": "editor", "feature": "beta"})
                .as_object()
                .cloned()
                .unwrap(),
        );

        assert_ne!(child.context_id, parent.context_id);
        assert_eq!(child.user_context["role"], json!("editor"));
        assert_eq!(child.user_context["feature"], json!("beta"));
        assert_eq!(child.credentials, parent.credentials);
    }

    #[tokio::test]
    async fn token_manager_refreshes_before_expiry() {
        let (auth, bus) = manager();
        auth.login(Login {
            token: "old".into(),
            refresh_token: Some("r1".into()),
            expires_at: Some(Utc::now() + chrono::Duration::milliseconds(150)),
            ..Login::default()
        })
        .unwrap();

        let refresh: RefreshFn = Arc::new(|creds| {
            Box::pin(async move {
                assert_eq!(creds.refresh_token.as_deref(), Some("r1"));
                Ok(Credentials {
                    token: "new".into(),
                    refresh_token: creds.refresh_token,
                    expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
                })
            })
        });

        let tm = Arc::new(
            TokenManager::new(auth.clone(), bus, refresh)
                .with_threshold(Duration::from_millis(100)),
        );
        tm.start();

        tokio::time::sleep(Duration::from_millis(300)).await;
        let ctx = auth.current();
        assert_eq!(ctx.credentials.as_ref().unwrap().token, "new");
        tm.stop();
    }

    #[tokio::test]
    async fn token_manager_logs_out_after_exhausted_retries() {
        let (auth, bus) = manager();
        auth.login(Login {
            token: "old".into(),
            expires_at: Some(Utc::now() + chrono::Duration::milliseconds(50)),
            ..Login::default()
        })
        .unwrap();

        let mut rx = bus.subscribe(EventFilter::for_types([EventType::AuthFailed]));
        let refresh: RefreshFn = Arc::new(|_| Box::pin(async { Err("denied".to_string()) }));

        let tm = Arc::new(
            TokenManager::new(auth.clone(), bus.clone(), refresh)
                .with_threshold(Duration::from_millis(10))
                .with_backoff(2, Duration::from_millis(5)),
        );
        tm.start();

        let failed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("auth_failed event")
            .unwrap();
        assert_eq!(failed.event_type, EventType::AuthFailed);
        assert_eq!(auth.current().context_id, "public");
        tm.stop();
    }
}
