//! Concurrency-bounded queue dispatch.
//!
//! The dispatcher pulls ready operations in priority order, gates each on
//! its remembered auth context, and runs up to the configured bound
//! concurrently. Completion routes back through the queue for retry
//! scheduling. Cancellation lets in-flight operations finish their
//! current step and stops pulling new work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::auth::AuthManager;
use crate::error::{ErrorKind, Result, SyncError};

use super::queue::FailureDisposition;
use super::{Operation, OperationQueue};

// ============================================================================
// Cancellation
// ============================================================================

/// Cooperative cancellation signal shared by a cycle and its operations.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

async fn sleep_cancellable(duration: Duration, cancel: &CancelFlag) {
    let deadline = Instant::now() + duration;
    while !cancel.is_cancelled() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        tokio::time::sleep(remaining.min(Duration::from_millis(50))).await;
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Executes one operation against the backend. Implementations observe
/// the cycle's [`CancelFlag`] and return `SyncError::Cancelled` from
/// interrupted work.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn execute(&self, op: &Operation) -> Result<Value>;
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Outcome counters for one drain.
#[derive(Debug, Clone, Copy, Default)]
pub struct DrainStats {
    pub succeeded: usize,
    pub retries_scheduled: usize,
    pub abandoned: usize,
    /// Operations rejected at dispatch because their context was replaced
    /// or expired.
    pub auth_rejected: usize,
    /// The drain stopped pulling work after an authentication rejection.
    pub auth_aborted: bool,
    pub budget_exhausted: bool,
    pub cancelled: bool,
}

pub struct Dispatcher {
    queue: Arc<OperationQueue>,
    auth: Arc<AuthManager>,
    concurrency: usize,
    /// Serializes drains: concurrent callers (a cycle and the background
    /// loop) would otherwise each get their own in-flight budget.
    drain_lock: tokio::sync::Mutex<()>,
}

impl Dispatcher {
    pub fn new(queue: Arc<OperationQueue>, auth: Arc<AuthManager>, concurrency: usize) -> Self {
        Self {
            queue,
            auth,
            concurrency: concurrency.max(1),
            drain_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Process the queue until it is empty (including scheduled retries),
    /// the wall-clock budget expires, cancellation is requested, or an
    /// authentication rejection aborts the drain.
    pub async fn drain(
        &self,
        handler: Arc<dyn OperationHandler>,
        cancel: &CancelFlag,
        budget: Option<Duration>,
    ) -> DrainStats {
        let _guard = self.drain_lock.lock().await;
        let mut stats = DrainStats::default();
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks: JoinSet<(String, Result<Value>)> = JoinSet::new();

        loop {
            // Reap whatever has finished without blocking.
            while let Some(joined) = tasks.try_join_next() {
                self.settle(joined, &mut stats);
            }

            if cancel.is_cancelled() {
                stats.cancelled = true;
                break;
            }
            if budget.is_some_and(|b| started.elapsed() >= b) {
                stats.budget_exhausted = true;
                break;
            }
            if stats.auth_aborted {
                break;
            }

            let now = Utc::now();
            if let Ok(permit) = semaphore.clone().try_acquire_owned() {
                if let Some(op) = self.queue.next_ready(now) {
                    // Invariant: never execute under a replaced or expired
                    // context.
                    if let Err(e) = self.auth.validate_for_dispatch(&op.auth_context_id) {
                        drop(permit);
                        self.queue.complete_failure(&op.operation_id, &e);
                        stats.auth_rejected += 1;
                        stats.abandoned += 1;
                        stats.auth_aborted = true;
                        continue;
                    }

                    let handler = Arc::clone(&handler);
                    tasks.spawn(async move {
                        let result = handler.execute(&op).await;
                        drop(permit);
                        (op.operation_id, result)
                    });
                    continue;
                }
                drop(permit);
            }

            // Nothing startable. Done, or wait for a completion / the next
            // due retry.
            if self.queue.pending_len() == 0 && tasks.is_empty() {
                break;
            }

            let wait = self
                .queue
                .earliest_due()
                .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                .unwrap_or(Duration::from_millis(50))
                .max(Duration::from_millis(1));

            if tasks.is_empty() {
                sleep_cancellable(wait, cancel).await;
            } else {
                tokio::select! {
                    joined = tasks.join_next() => {
                        if let Some(joined) = joined {
                            self.settle(joined, &mut stats);
                        }
                    }
                    _ = sleep_cancellable(wait, cancel) => {}
                }
            }
        }

        // Let in-flight operations finish their current step.
        while let Some(joined) = tasks.join_next().await {
            self.settle(joined, &mut stats);
        }
        stats
    }

    fn settle(
        &self,
        joined: std::result::Result<(String, Result<Value>), tokio::task::JoinError>,
        stats: &mut DrainStats,
    ) {
        match joined {
            Ok((op_id, Ok(_))) => {
                self.queue.complete_success(&op_id);
                stats.succeeded += 1;
            }
            Ok((op_id, Err(error))) => {
                if error.kind() == ErrorKind::Authentication {
                    stats.auth_aborted = true;
                }
                match self.queue.complete_failure(&op_id, &error) {
                    FailureDisposition::RetryScheduled => stats.retries_scheduled += 1,
                    FailureDisposition::Abandoned => stats.abandoned += 1,
                }
            }
            Err(join_error) => {
                // A panicked or aborted task: the queue entry is settled
                // with a terminal internal error.
                tracing::warn!(error = %join_error, "operation task did not complete");
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Login;
    use crate::events::EventBus;
    use crate::queue::{OperationType, Priority};
    use parking_lot::Mutex;
    use serde_json::json;

    struct RecordingHandler {
        log: Mutex<Vec<String>>,
        /// operation_id → failures left to inject
        failures: Mutex<std::collections::HashMap<String, (usize, fn() -> SyncError)>>,
        delay: Duration,
        running: Arc<std::sync::atomic::AtomicUsize>,
        max_running: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl RecordingHandler {
        fn new() -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                failures: Mutex::new(std::collections::HashMap::new()),
                delay: Duration::ZERO,
                running: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
                max_running: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
            }
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn fail_times(&self, op_id: &str, times: usize, make: fn() -> SyncError) {
            self.failures.lock().insert(op_id.to_string(), (times, make));
        }
    }

    #[async_trait]
    impl OperationHandler for RecordingHandler {
        async fn execute(&self, op: &Operation) -> Result<Value> {
            let n = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(n, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.log.lock().push(op.operation_id.clone());
            self.running.fetch_sub(1, Ordering::SeqCst);

            let mut failures = self.failures.lock();
            if let Some((left, make)) = failures.get_mut(&op.operation_id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(make());
                }
            }
            Ok(Value::Null)
        }
    }

    fn setup(concurrency: usize) -> (Arc<OperationQueue>, Dispatcher, Arc<AuthManager>, String) {
        let bus = Arc::new(EventBus::new(256));
        let auth = Arc::new(AuthManager::new(bus.clone(), None));
        let ctx = auth.login(Login::new("token")).unwrap();
        let queue = Arc::new(OperationQueue::new(bus, 1000));
        let dispatcher = Dispatcher::new(queue.clone(), auth.clone(), concurrency);
        (queue, dispatcher, auth, ctx.context_id.clone())
    }

    fn op(ctx: &str, priority: Priority) -> Operation {
        Operation::new(OperationType::Update, "notes", json!({}), ctx).with_priority(priority)
    }

    #[tokio::test]
    async fn serial_dispatch_follows_priority_order() {
        let (queue, dispatcher, _auth, ctx) = setup(1);
        let handler = Arc::new(RecordingHandler::new());

        let ids: Vec<String> = [
            Priority::Low,
            Priority::Critical,
            Priority::Normal,
            Priority::High,
            Priority::Critical,
        ]
        .into_iter()
        .map(|p| queue.enqueue(op(&ctx, p)).unwrap())
        .collect();

        let stats = dispatcher
            .drain(handler.clone(), &CancelFlag::new(), None)
            .await;
        assert_eq!(stats.succeeded, 5);

        let order = handler.log.lock().clone();
        assert_eq!(
            order,
            vec![
                ids[1].clone(),
                ids[4].clone(),
                ids[3].clone(),
                ids[2].clone(),
                ids[0].clone()
            ]
        );
    }

    #[tokio::test]
    async fn concurrency_bound_is_respected() {
        let (queue, dispatcher, _auth, ctx) = setup(3);
        let handler = Arc::new(RecordingHandler::new().with_delay(Duration::from_millis(20)));

        for _ in 0..10 {
            queue.enqueue(op(&ctx, Priority::Normal)).unwrap();
        }
        let stats = dispatcher
            .drain(handler.clone(), &CancelFlag::new(), None)
            .await;
        assert_eq!(stats.succeeded, 10);
        assert!(
            handler.max_running.load(Ordering::SeqCst) <= 3,
            "in-flight bound exceeded"
        );
    }

    #[tokio::test]
    async fn retryable_failures_are_retried_then_succeed() {
        let (queue, dispatcher, _auth, ctx) = setup(1);
        let handler = Arc::new(RecordingHandler::new());

        let mut operation = op(&ctx, Priority::Normal);
        operation.retry_delays = vec![Duration::from_millis(5)];
        operation.max_retries = 3;
        let id = queue.enqueue(operation).unwrap();
        handler.fail_times(&id, 2, || SyncError::Network {
            message: "flaky".into(),
        });

        let stats = dispatcher
            .drain(handler.clone(), &CancelFlag::new(), None)
            .await;
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.retries_scheduled, 2);
        assert_eq!(handler.log.lock().len(), 3, "initial + two retries");
    }

    #[tokio::test]
    async fn exhausted_retries_abandon() {
        let (queue, dispatcher, _auth, ctx) = setup(1);
        let handler = Arc::new(RecordingHandler::new());

        let mut operation = op(&ctx, Priority::Normal);
        operation.retry_delays = vec![Duration::from_millis(2)];
        operation.max_retries = 2;
        let id = queue.enqueue(operation).unwrap();
        handler.fail_times(&id, 10, || SyncError::Network {
            message: "down".into(),
        });

        let stats = dispatcher
            .drain(handler.clone(), &CancelFlag::new(), None)
            .await;
        assert_eq!(stats.abandoned, 1);
        assert_eq!(handler.log.lock().len(), 3, "initial + max_retries executions");
        assert!(queue.is_idle());
    }

    #[tokio::test]
    async fn stale_context_aborts_drain() {
        let (queue, dispatcher, auth, ctx) = setup(1);
        let handler = Arc::new(RecordingHandler::new());

        queue.enqueue(op(&ctx, Priority::Normal)).unwrap();
        queue.enqueue(op(&ctx, Priority::Normal)).unwrap();

        // Replace the context before dispatch.
        auth.switch_user(Login::new("other")).unwrap();

        let stats = dispatcher
            .drain(handler.clone(), &CancelFlag::new(), None)
            .await;
        assert!(stats.auth_aborted);
        assert_eq!(stats.auth_rejected, 1);
        assert!(handler.log.lock().is_empty(), "nothing may execute");
        assert_eq!(queue.pending_len(), 1, "remaining work stays queued");
    }

    #[tokio::test]
    async fn cancellation_stops_pulling_and_preserves_pending() {
        let (queue, dispatcher, _auth, ctx) = setup(1);
        let handler = Arc::new(RecordingHandler::new().with_delay(Duration::from_millis(30)));

        for _ in 0..5 {
            queue.enqueue(op(&ctx, Priority::Normal)).unwrap();
        }

        let cancel = CancelFlag::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            canceller.cancel();
        });

        let stats = dispatcher.drain(handler, &cancel, None).await;
        assert!(stats.cancelled);
        assert!(
            queue.pending_len() > 0,
            "cancelled drain must preserve pending work"
        );
    }

    #[tokio::test]
    async fn budget_expiry_stops_the_drain() {
        let (queue, dispatcher, _auth, ctx) = setup(1);
        let handler = Arc::new(RecordingHandler::new().with_delay(Duration::from_millis(20)));

        for _ in 0..20 {
            queue.enqueue(op(&ctx, Priority::Normal)).unwrap();
        }
        let stats = dispatcher
            .drain(handler, &CancelFlag::new(), Some(Duration::from_millis(50)))
            .await;
        assert!(stats.budget_exhausted);
        assert!(queue.pending_len() > 0);
    }
}
