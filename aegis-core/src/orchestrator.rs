//! Unified recovery facade.
//!
//! `RecoveryOrchestrator` is the single entry point the application calls
//! for guarded operations. One `execute` call composes the whole pipeline:
//! per-dependency circuit breaker admission, retry with backoff, fallback
//! (queue / cache / reject) when the dependency cannot produce a result,
//! error classification, and progressive disclosure. A background sync
//! driver replays the offline queue when connectivity returns or a breaker
//! closes.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::circuit_breaker::{
    Admission, BreakerRegistry, BreakerTransition, CircuitBreaker, CircuitBreakerStatus,
    CircuitState, FallbackStrategy,
};
use crate::classify::{classify, CallContext, ErrorRecord, Severity};
use crate::config::ResilienceConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::disclosure::{DisclosureDecision, ErrorDisclosureController};
use crate::error::{AegisError, AegisResult};
use crate::queue::{ActionRequest, OfflineActionQueue, QueuedAction, SyncReport};
use crate::retry::{RetryOrchestrator, RetryPolicy, RetryStats};
use crate::store::{RedbStore, ResilientStore};

/// Per-call knobs for [`RecoveryOrchestrator::execute`].
#[derive(Default)]
pub struct ExecuteOptions {
    /// Retry policy; the configured default applies when unset.
    pub policy: Option<RetryPolicy>,
    pub cancel: Option<CancelToken>,
    /// How to queue this call if its breaker falls back to the offline
    /// queue. Calls without this are not safely deferrable and surface an
    /// error instead.
    pub queue_as: Option<ActionRequest>,
    /// Response cache slot, for breakers with the cache fallback.
    pub cache_key: Option<String>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn queue_as(mut self, request: ActionRequest) -> Self {
        self.queue_as = Some(request);
        self
    }

    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }
}

/// Terminal outcome of one guarded call.
#[derive(Debug)]
pub enum ExecuteOutcome<T> {
    /// The operation produced a value, live or from the response cache.
    Success(T),
    /// The operation was deferred to the offline queue.
    Queued {
        id: Uuid,
        retry_at: chrono::DateTime<chrono::Utc>,
    },
    /// The operation failed terminally; the record has been disclosed.
    Error(ErrorRecord),
    /// The caller cancelled; nothing was disclosed or recorded.
    Cancelled,
}

impl<T> ExecuteOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecuteOutcome::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            ExecuteOutcome::Success(value) => Some(value),
            _ => None,
        }
    }
}

/// Replays one kind of queued action against its dependency.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn replay(&self, action: &QueuedAction) -> AegisResult<()>;
}

/// Facade over breakers, retry, the offline queue, and disclosure.
pub struct RecoveryOrchestrator {
    default_policy: RetryPolicy,
    breakers: BreakerRegistry,
    retry: RetryOrchestrator,
    queue: Arc<OfflineActionQueue>,
    disclosure: ErrorDisclosureController,
    connectivity: ConnectivityMonitor,
    handlers: DashMap<String, Arc<dyn ActionHandler>>,
    response_cache: DashMap<String, Value>,
    /// Operations paused after a critical failure, until acknowledged.
    locked_operations: DashMap<String, ()>,
}

impl RecoveryOrchestrator {
    pub fn new(config: ResilienceConfig, store: ResilientStore) -> Self {
        let breakers = BreakerRegistry::new(config.breaker.clone());
        for (name, breaker_config) in &config.breakers {
            breakers.set_override(name.clone(), breaker_config.clone());
        }
        Self {
            default_policy: RetryPolicy::from_config(&config.retry),
            breakers,
            retry: RetryOrchestrator::new(),
            queue: Arc::new(OfflineActionQueue::new(store, config.queue.clone())),
            disclosure: ErrorDisclosureController::new(&config.disclosure),
            connectivity: ConnectivityMonitor::new(true),
            handlers: DashMap::new(),
            response_cache: DashMap::new(),
            locked_operations: DashMap::new(),
        }
    }

    /// Orchestrator backed by a redb database at `path`.
    pub fn open(config: ResilienceConfig, path: impl AsRef<Path>) -> AegisResult<Self> {
        let store = ResilientStore::new(Box::new(RedbStore::open(path)?));
        Ok(Self::new(config, store))
    }

    /// Orchestrator with no durable storage (tests, restricted contexts).
    pub fn in_memory(config: ResilienceConfig) -> Self {
        Self::new(config, ResilientStore::memory_only())
    }

    /// Register the replay handler for one action kind.
    pub fn register_handler(&self, kind: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    /// Run one guarded operation against a named dependency.
    ///
    /// The pipeline: breaker admission, then the retry loop; a short-circuit
    /// or terminal failure applies the breaker's fallback strategy. Every
    /// path that surfaces an error classifies and discloses it exactly once.
    pub async fn execute<T, F, Fut>(
        &self,
        dependency: &str,
        context: CallContext,
        options: ExecuteOptions,
        operation: F,
    ) -> ExecuteOutcome<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = AegisResult<T>>,
    {
        if self.locked_operations.contains_key(&context.operation) {
            let error = AegisError::OperationLocked {
                operation: context.operation.clone(),
            };
            let record = self.disclose_failure(dependency, &context, &error);
            return ExecuteOutcome::Error(record);
        }

        let breaker = self.breakers.get(dependency);
        match breaker.try_acquire() {
            Admission::ShortCircuited => {
                let error = AegisError::CircuitOpen {
                    breaker: dependency.to_string(),
                };
                self.apply_fallback(&breaker, &context, &options, error)
            }
            Admission::Admitted => {
                let policy = options
                    .policy
                    .clone()
                    .unwrap_or_else(|| self.default_policy.clone());
                let cancel = options.cancel.clone().unwrap_or_default();

                match self
                    .retry
                    .run(&policy, &cancel, &context.operation, operation)
                    .await
                {
                    Ok(value) => {
                        breaker.on_success();
                        if breaker.fallback() == FallbackStrategy::Cache {
                            self.cache_response(options.cache_key.as_deref(), &value);
                        }
                        ExecuteOutcome::Success(value)
                    }
                    Err(AegisError::Cancelled { operation }) => {
                        debug!(operation = %operation, "guarded call cancelled");
                        breaker.on_abandoned();
                        ExecuteOutcome::Cancelled
                    }
                    Err(error) => {
                        breaker.on_failure();
                        self.apply_fallback(&breaker, &context, &options, error)
                    }
                }
            }
        }
    }

    fn cache_response<T: Serialize>(&self, cache_key: Option<&str>, value: &T) {
        let Some(key) = cache_key else { return };
        match serde_json::to_value(value) {
            Ok(cached) => {
                self.response_cache.insert(key.to_string(), cached);
            }
            Err(e) => debug!(key, error = %e, "response not cacheable"),
        }
    }

    fn apply_fallback<T: DeserializeOwned>(
        &self,
        breaker: &CircuitBreaker,
        context: &CallContext,
        options: &ExecuteOptions,
        error: AegisError,
    ) -> ExecuteOutcome<T> {
        match breaker.fallback() {
            FallbackStrategy::Queue => {
                if let Some(request) = options.queue_as.clone() {
                    let receipt = self.queue.enqueue(breaker.name(), request);
                    // One disclosure so the user knows the action is deferred,
                    // then the queued receipt.
                    let record = classify(&error, Some(breaker.name()), context);
                    self.disclosure.present(record, self.queue.pending_count());
                    return ExecuteOutcome::Queued {
                        id: receipt.id,
                        retry_at: receipt.retry_at,
                    };
                }
                let record = self.disclose_failure(breaker.name(), context, &error);
                ExecuteOutcome::Error(record)
            }
            FallbackStrategy::Cache => {
                if let Some(key) = options.cache_key.as_deref() {
                    if let Some(cached) = self.response_cache.get(key) {
                        match serde_json::from_value(cached.clone()) {
                            Ok(value) => {
                                debug!(key, "serving cached response while dependency is down");
                                return ExecuteOutcome::Success(value);
                            }
                            Err(e) => warn!(key, error = %e, "cached response unreadable"),
                        }
                    }
                }
                let record = self.disclose_failure(breaker.name(), context, &error);
                ExecuteOutcome::Error(record)
            }
            FallbackStrategy::Reject => {
                let record = self.disclose_failure(breaker.name(), context, &error);
                ExecuteOutcome::Error(record)
            }
        }
    }

    /// Classify, lock out on critical failure, and disclose.
    fn disclose_failure(
        &self,
        dependency: &str,
        context: &CallContext,
        error: &AegisError,
    ) -> ErrorRecord {
        let record = classify(error, Some(dependency), context);
        if record.severity == Severity::Critical && !record.recoverable {
            warn!(
                operation = %context.operation,
                "locking operation after critical failure, waiting for acknowledgement"
            );
            self.locked_operations
                .insert(context.operation.clone(), ());
        }
        let decision = self
            .disclosure
            .present(record, self.queue.pending_count());
        decision.record
    }

    /// Unlock an operation paused by a critical failure, re-enabling
    /// explicit retries. Returns false if it was not locked.
    pub fn acknowledge(&self, operation: &str) -> bool {
        self.locked_operations.remove(operation).is_some()
    }

    /// Classify and disclose an error that arose outside a guarded call.
    pub fn capture(&self, error: &AegisError, context: &CallContext) -> ErrorRecord {
        let record = classify(error, None, context);
        let decision = self
            .disclosure
            .present(record, self.queue.pending_count());
        decision.record
    }

    /// Run a future inside a panic boundary: a panic becomes a classified,
    /// disclosed error instead of unwinding into the caller.
    pub async fn fault_boundary<T, Fut>(&self, context: &CallContext, fut: Fut) -> AegisResult<T>
    where
        Fut: Future<Output = AegisResult<T>>,
    {
        match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    (*s).to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "panic with non-string payload".to_string()
                };
                let error = AegisError::Internal {
                    message: format!("panic in '{}': {}", context.operation, message),
                };
                self.capture(&error, context);
                Err(error)
            }
        }
    }

    /// Replay the offline queue once, routing each action through its
    /// registered handler under the breaker guard. The queue's own attempt
    /// accounting bounds replays, so failures here are not re-disclosed.
    pub async fn sync_queue(self: &Arc<Self>) -> SyncReport {
        let this = Arc::clone(self);
        let report = self
            .queue
            .sync(move |action| {
                let this = Arc::clone(&this);
                async move { this.replay_action(action).await }
            })
            .await;
        if report != SyncReport::default() {
            info!(
                replayed = report.replayed,
                requeued = report.requeued,
                expired = report.expired,
                failed = report.failed,
                "offline queue sync pass finished"
            );
        }
        report
    }

    async fn replay_action(&self, action: QueuedAction) -> AegisResult<()> {
        let handler = match self.handlers.get(&action.kind) {
            Some(handler) => handler.clone(),
            None => {
                warn!(kind = %action.kind, "no replay handler registered");
                return Err(AegisError::Internal {
                    message: format!("no replay handler for action kind '{}'", action.kind),
                });
            }
        };

        let breaker = self.breakers.get(&action.dependency);
        match breaker.try_acquire() {
            Admission::ShortCircuited => Err(AegisError::CircuitOpen {
                breaker: action.dependency.clone(),
            }),
            Admission::Admitted => {
                let operation_name = action.kind.clone();
                let result = self
                    .retry
                    .run(
                        &RetryPolicy::for_mutations(),
                        &CancelToken::new(),
                        &operation_name,
                        move || {
                            let handler = handler.clone();
                            let action = action.clone();
                            async move { handler.replay(&action).await }
                        },
                    )
                    .await;
                match result {
                    Ok(()) => {
                        breaker.on_success();
                        Ok(())
                    }
                    Err(error) => {
                        breaker.on_failure();
                        Err(error)
                    }
                }
            }
        }
    }

    /// Spawn the background driver that replays the queue whenever
    /// connectivity returns or a breaker closes while online.
    pub fn spawn_sync_driver(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut connectivity = this.connectivity.subscribe();
            connectivity.borrow_and_update();
            let mut transitions = this.breakers.subscribe_transitions();
            loop {
                tokio::select! {
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *connectivity.borrow_and_update() {
                            this.sync_queue().await;
                        }
                    }
                    transition = transitions.recv() => {
                        match transition {
                            Ok(t) if t.to == CircuitState::Closed && this.connectivity.is_online() => {
                                debug!(breaker = %t.name, "breaker closed, replaying queue");
                                this.sync_queue().await;
                            }
                            Ok(_) => {}
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
        })
    }

    /// Revive failed actions (explicit "retry all") and replay immediately.
    pub async fn retry_failed_actions(self: &Arc<Self>) -> SyncReport {
        self.queue.retry_failed();
        self.sync_queue().await
    }

    pub fn discard_action(&self, id: Uuid) -> bool {
        self.queue.discard(id)
    }

    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers.get(name)
    }

    pub fn breaker_status(&self, name: &str) -> Option<CircuitBreakerStatus> {
        self.breakers.status(name)
    }

    pub fn subscribe_breaker_transitions(&self) -> broadcast::Receiver<BreakerTransition> {
        self.breakers.subscribe_transitions()
    }

    pub fn subscribe_disclosures(&self) -> broadcast::Receiver<DisclosureDecision> {
        self.disclosure.subscribe()
    }

    pub fn pending_action_count(&self) -> usize {
        self.queue.pending_count()
    }

    pub fn pending_actions(&self) -> Vec<QueuedAction> {
        self.queue.pending_snapshot()
    }

    pub fn failed_actions(&self) -> Vec<QueuedAction> {
        self.queue.failed_snapshot()
    }

    pub fn expired_actions(&self) -> Vec<QueuedAction> {
        self.queue.expired_snapshot()
    }

    pub fn retry_stats(&self) -> RetryStats {
        self.retry.stats()
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Reset every breaker (tests, manual recovery surfaces).
    pub fn reset_breakers(&self) {
        self.breakers.reset_all();
    }
}
