//! End-to-end tests for the resilience pipeline: breaker admission, retry
//! with backoff, fallback strategies, offline queue replay, and progressive
//! disclosure, exercised together through the orchestrator facade.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use aegis_core::{
    ActionHandler, ActionPriority, ActionRequest, AegisError, AegisResult, CallContext,
    CancelToken, CircuitBreakerConfig, CircuitState, ExecuteOptions, ExecuteOutcome,
    ExperienceTier, FallbackStrategy, QueuedAction, RecoveryOrchestrator, ResilienceConfig,
    RetryPolicy,
};

/// Route log output through the test harness; `RUST_LOG` filters it.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Mock dependency that can be switched between healthy and failing.
struct MockService {
    failing: AtomicBool,
    call_count: AtomicU32,
}

impl MockService {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            failing: AtomicBool::new(false),
            call_count: AtomicU32::new(0),
        })
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    async fn call(&self) -> AegisResult<String> {
        let count = self.call_count.fetch_add(1, Ordering::Relaxed) + 1;
        if self.failing.load(Ordering::Relaxed) {
            Err(AegisError::NetworkError(format!(
                "simulated failure #{}",
                count
            )))
        } else {
            Ok(format!("response #{}", count))
        }
    }
}

/// Handler that replays queued actions against a mock service and records
/// replay order.
struct ServiceHandler {
    service: Arc<MockService>,
    replayed: Mutex<Vec<String>>,
}

impl ServiceHandler {
    fn new(service: Arc<MockService>) -> Arc<Self> {
        Arc::new(Self {
            service,
            replayed: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ActionHandler for ServiceHandler {
    async fn replay(&self, action: &QueuedAction) -> AegisResult<()> {
        self.service.call().await?;
        self.replayed
            .lock()
            .push(action.payload["label"].as_str().unwrap_or("?").to_string());
        Ok(())
    }
}

fn fast_config(dependency: &str, fallback: FallbackStrategy) -> ResilienceConfig {
    let mut config = ResilienceConfig::default();
    config.retry.base_delay = Duration::from_millis(5);
    config.retry.max_delay = Duration::from_millis(20);
    config.retry.jitter_ratio = 0.0;
    config.breakers.insert(
        dependency.to_string(),
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_timeout: Duration::from_millis(50),
            half_open_max_calls: 1,
            fallback,
        },
    );
    config
}

fn one_shot() -> RetryPolicy {
    RetryPolicy::default().with_max_attempts(1)
}

#[tokio::test]
async fn test_breaker_opens_after_threshold_and_stops_calling() {
    init_tracing();
    let service = MockService::new();
    service.set_failing(true);
    let orchestrator = Arc::new(RecoveryOrchestrator::in_memory(fast_config(
        "ai-api",
        FallbackStrategy::Reject,
    )));

    // Three failing operations open the breaker (single attempt each).
    for _ in 0..3 {
        let service = service.clone();
        let outcome = orchestrator
            .execute::<String, _, _>(
                "ai-api",
                CallContext::new("fetch-effects"),
                ExecuteOptions::new().with_policy(one_shot()),
                move || {
                    let service = service.clone();
                    async move { service.call().await }
                },
            )
            .await;
        assert!(matches!(outcome, ExecuteOutcome::Error(_)));
    }
    assert_eq!(
        orchestrator.breaker_status("ai-api").unwrap().state,
        CircuitState::Open
    );
    assert_eq!(service.call_count(), 3);

    // Further calls short-circuit: the service is not touched again.
    for _ in 0..5 {
        let service = service.clone();
        let outcome = orchestrator
            .execute::<String, _, _>(
                "ai-api",
                CallContext::new("fetch-effects"),
                ExecuteOptions::new(),
                move || {
                    let service = service.clone();
                    async move { service.call().await }
                },
            )
            .await;
        assert!(matches!(outcome, ExecuteOutcome::Error(_)));
    }
    assert_eq!(service.call_count(), 3);
    assert_eq!(
        orchestrator
            .breaker_status("ai-api")
            .unwrap()
            .short_circuited_calls,
        5
    );
}

#[tokio::test]
async fn test_breaker_recovers_through_half_open_probe() {
    init_tracing();
    let service = MockService::new();
    service.set_failing(true);
    let orchestrator = Arc::new(RecoveryOrchestrator::in_memory(fast_config(
        "ai-api",
        FallbackStrategy::Reject,
    )));

    for _ in 0..3 {
        let service = service.clone();
        orchestrator
            .execute::<String, _, _>(
                "ai-api",
                CallContext::new("fetch-effects"),
                ExecuteOptions::new().with_policy(one_shot()),
                move || {
                    let service = service.clone();
                    async move { service.call().await }
                },
            )
            .await;
    }
    assert_eq!(
        orchestrator.breaker_status("ai-api").unwrap().state,
        CircuitState::Open
    );

    // Dependency heals; after the recovery timeout one probe is admitted
    // and closes the breaker (half_open_max_calls = 1).
    service.set_failing(false);
    tokio::time::sleep(Duration::from_millis(70)).await;

    let service_clone = service.clone();
    let outcome = orchestrator
        .execute::<String, _, _>(
            "ai-api",
            CallContext::new("fetch-effects"),
            ExecuteOptions::new().with_policy(one_shot()),
            move || {
                let service = service_clone.clone();
                async move { service.call().await }
            },
        )
        .await;
    assert!(outcome.is_success());
    assert_eq!(
        orchestrator.breaker_status("ai-api").unwrap().state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_retry_recovers_from_transient_failures() {
    init_tracing();
    let orchestrator = Arc::new(RecoveryOrchestrator::in_memory(ResilienceConfig::default()));
    let counter = Arc::new(AtomicU32::new(0));

    let counter_clone = counter.clone();
    let outcome = orchestrator
        .execute(
            "ai-api",
            CallContext::new("fetch-effects"),
            ExecuteOptions::new().with_policy(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(5),
                jitter_ratio: 0.0,
                ..RetryPolicy::default()
            }),
            move || {
                let n = counter_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(AegisError::NetworkError("transient".to_string()))
                    } else {
                        Ok("recovered".to_string())
                    }
                }
            },
        )
        .await;

    assert_eq!(outcome.success().as_deref(), Some("recovered"));
    assert_eq!(counter.load(Ordering::SeqCst), 3);
    // One successful operation, three attempts on average.
    let stats = orchestrator.retry_stats();
    assert_eq!(stats.total_operations, 1);
    assert_eq!(stats.successful_operations, 1);
    assert_eq!(stats.average_attempts, 3.0);
    // Transient failures that ultimately succeed never trip the breaker.
    assert_eq!(
        orchestrator.breaker_status("ai-api").unwrap().state,
        CircuitState::Closed
    );
}

#[tokio::test]
async fn test_client_errors_fail_fast_without_retry() {
    init_tracing();
    let orchestrator = Arc::new(RecoveryOrchestrator::in_memory(ResilienceConfig::default()));
    let counter = Arc::new(AtomicU32::new(0));

    let counter_clone = counter.clone();
    let outcome = orchestrator
        .execute::<(), _, _>(
            "ai-api",
            CallContext::new("upload-image"),
            ExecuteOptions::new(),
            move || {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(AegisError::HttpStatus {
                        status: 400,
                        message: "unsupported image format".to_string(),
                    })
                }
            },
        )
        .await;

    let record = match outcome {
        ExecuteOutcome::Error(record) => record,
        other => panic!("expected error outcome, got {:?}", other),
    };
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(orchestrator.retry_stats().failed_operations, 1);
    assert!(!record.recoverable);
    // Raw server text never reaches the user-facing message.
    assert!(!record.user_message.contains("unsupported image format"));
}

#[tokio::test]
async fn test_offline_mutations_queue_and_replay_in_priority_order() {
    init_tracing();
    let service = MockService::new();
    let orchestrator = Arc::new(RecoveryOrchestrator::in_memory(fast_config(
        "uploads",
        FallbackStrategy::Queue,
    )));
    let handler = ServiceHandler::new(service.clone());
    orchestrator.register_handler("deferred-write", handler.clone());

    // Simulate the outage by forcing the breaker open.
    orchestrator.breaker("uploads").force_open();

    for (label, priority) in [
        ("save-draft", ActionPriority::Normal),
        ("upload-result", ActionPriority::High),
        ("update-settings", ActionPriority::Low),
        ("finish-order", ActionPriority::Critical),
    ] {
        let outcome = orchestrator
            .execute::<(), _, _>(
                "uploads",
                CallContext::new(label),
                ExecuteOptions::new().queue_as(ActionRequest::new(
                    "deferred-write",
                    serde_json::json!({ "label": label }),
                    priority,
                )),
                || async { Ok(()) },
            )
            .await;
        assert!(matches!(outcome, ExecuteOutcome::Queued { .. }));
    }
    assert_eq!(orchestrator.pending_action_count(), 4);
    assert_eq!(service.call_count(), 0);

    // Dependency recovers; replay drains the queue priority-first.
    orchestrator.breaker("uploads").force_close();
    let report = orchestrator.sync_queue().await;
    assert_eq!(report.replayed, 4);
    assert_eq!(orchestrator.pending_action_count(), 0);
    assert_eq!(
        *handler.replayed.lock(),
        vec![
            "finish-order".to_string(),
            "upload-result".to_string(),
            "save-draft".to_string(),
            "update-settings".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_sync_driver_drains_queue_when_connectivity_returns() {
    init_tracing();
    let service = MockService::new();
    let orchestrator = Arc::new(RecoveryOrchestrator::in_memory(fast_config(
        "uploads",
        FallbackStrategy::Queue,
    )));
    let handler = ServiceHandler::new(service.clone());
    orchestrator.register_handler("deferred-write", handler.clone());

    orchestrator.connectivity().set_offline();
    let driver = orchestrator.spawn_sync_driver();

    orchestrator.breaker("uploads").force_open();
    orchestrator
        .execute::<(), _, _>(
            "uploads",
            CallContext::new("save-draft"),
            ExecuteOptions::new().queue_as(ActionRequest::new(
                "deferred-write",
                serde_json::json!({ "label": "save-draft" }),
                ActionPriority::Normal,
            )),
            || async { Ok(()) },
        )
        .await;
    orchestrator.breaker("uploads").force_close();
    assert_eq!(orchestrator.pending_action_count(), 1);

    orchestrator.connectivity().set_online();
    tokio::time::timeout(Duration::from_secs(1), async {
        while orchestrator.pending_action_count() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("queue should drain after connectivity returns");
    assert_eq!(service.call_count(), 1);

    driver.abort();
}

#[tokio::test]
async fn test_queued_actions_survive_process_restart() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("aegis.redb");
    let config = fast_config("uploads", FallbackStrategy::Queue);

    {
        let orchestrator =
            Arc::new(RecoveryOrchestrator::open(config.clone(), &path).unwrap());
        orchestrator.breaker("uploads").force_open();
        orchestrator
            .execute::<(), _, _>(
                "uploads",
                CallContext::new("save-draft"),
                ExecuteOptions::new().queue_as(ActionRequest::new(
                    "deferred-write",
                    serde_json::json!({ "label": "save-draft" }),
                    ActionPriority::Normal,
                )),
                || async { Ok(()) },
            )
            .await;
        assert_eq!(orchestrator.pending_action_count(), 1);
    }

    let service = MockService::new();
    let orchestrator = Arc::new(RecoveryOrchestrator::open(config, &path).unwrap());
    assert_eq!(orchestrator.pending_action_count(), 1);

    let handler = ServiceHandler::new(service.clone());
    orchestrator.register_handler("deferred-write", handler);
    let report = orchestrator.sync_queue().await;
    assert_eq!(report.replayed, 1);
}

#[tokio::test]
async fn test_disclosure_escalates_with_repetition() {
    init_tracing();
    let service = MockService::new();
    service.set_failing(true);
    let mut config = ResilienceConfig::default();
    config.retry.base_delay = Duration::from_millis(5);
    config.retry.jitter_ratio = 0.0;
    let orchestrator = Arc::new(RecoveryOrchestrator::in_memory(config));
    let mut disclosures = orchestrator.subscribe_disclosures();

    let mut levels = Vec::new();
    for _ in 0..3 {
        let service = service.clone();
        orchestrator
            .execute::<String, _, _>(
                "ai-api",
                CallContext::new("fetch-effects").with_tier(ExperienceTier::Intermediate),
                ExecuteOptions::new().with_policy(one_shot()),
                move || {
                    let service = service.clone();
                    async move { service.call().await }
                },
            )
            .await;
        levels.push(disclosures.recv().await.unwrap().level);
    }

    // Same fingerprint: toast first, then modals.
    assert_eq!(levels, vec![1, 2, 2]);
}

#[tokio::test]
async fn test_cancellation_stops_retries_without_disclosure() {
    init_tracing();
    let orchestrator = Arc::new(RecoveryOrchestrator::in_memory(ResilienceConfig::default()));
    let mut disclosures = orchestrator.subscribe_disclosures();
    let cancel = CancelToken::new();
    let counter = Arc::new(AtomicU32::new(0));

    let orchestrator_clone = orchestrator.clone();
    let cancel_clone = cancel.clone();
    let counter_clone = counter.clone();
    let handle = tokio::spawn(async move {
        orchestrator_clone
            .execute::<(), _, _>(
                "ai-api",
                CallContext::new("generate-preview"),
                ExecuteOptions::new()
                    .with_cancel(cancel_clone)
                    .with_policy(RetryPolicy {
                        max_attempts: 5,
                        base_delay: Duration::from_secs(60),
                        jitter_ratio: 0.0,
                        ..RetryPolicy::default()
                    }),
                move || {
                    counter_clone.fetch_add(1, Ordering::SeqCst);
                    async { Err(AegisError::NetworkError("down".to_string())) }
                },
            )
            .await
    });

    // First attempt fails and the long backoff timer starts; cancelling
    // clears it promptly.
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let outcome = tokio::time::timeout(Duration::from_millis(200), handle)
        .await
        .expect("cancellation should settle the call promptly")
        .unwrap();
    assert!(matches!(outcome, ExecuteOutcome::Cancelled));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert!(disclosures.try_recv().is_err());
    assert_eq!(orchestrator.retry_stats().total_operations, 0);
}

#[tokio::test]
async fn test_storage_failure_degrades_without_breaking_the_pipeline() {
    init_tracing();
    // No durable storage at all: queueing and replay still work in memory.
    let service = MockService::new();
    let orchestrator = Arc::new(RecoveryOrchestrator::in_memory(fast_config(
        "uploads",
        FallbackStrategy::Queue,
    )));
    let handler = ServiceHandler::new(service.clone());
    orchestrator.register_handler("deferred-write", handler);

    orchestrator.breaker("uploads").force_open();
    let outcome = orchestrator
        .execute::<(), _, _>(
            "uploads",
            CallContext::new("save-draft"),
            ExecuteOptions::new().queue_as(ActionRequest::new(
                "deferred-write",
                serde_json::json!({ "label": "save-draft" }),
                ActionPriority::Normal,
            )),
            || async { Ok(()) },
        )
        .await;
    assert!(matches!(outcome, ExecuteOutcome::Queued { .. }));

    orchestrator.breaker("uploads").force_close();
    assert_eq!(orchestrator.sync_queue().await.replayed, 1);
}
