//! Client-side resilience core: circuit breakers, retry orchestration, an
//! offline action queue, and progressive error disclosure behind one facade.
//!
//! Applications call [`RecoveryOrchestrator::execute`] for every operation
//! against an external dependency. The orchestrator guards the call with a
//! per-dependency circuit breaker, retries transient failures with capped
//! exponential backoff, and applies the breaker's fallback strategy (defer
//! to the offline queue, serve a cached response, or reject) when the
//! dependency cannot produce a result. Terminal failures are classified into
//! a stable taxonomy and disclosed to the UI with escalation proportional to
//! repetition.
//!
//! ```no_run
//! use std::sync::Arc;
//! use aegis_core::{
//!     CallContext, ExecuteOptions, RecoveryOrchestrator, ResilienceConfig,
//! };
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let orchestrator = Arc::new(RecoveryOrchestrator::open(
//!     ResilienceConfig::default(),
//!     "aegis.redb",
//! )?);
//! orchestrator.spawn_sync_driver();
//!
//! let outcome = orchestrator
//!     .execute(
//!         "ai-api",
//!         CallContext::new("fetch-effects"),
//!         ExecuteOptions::new(),
//!         || async { Ok(vec!["sepia".to_string()]) },
//!     )
//!     .await;
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod circuit_breaker;
pub mod classify;
pub mod config;
pub mod connectivity;
pub mod disclosure;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod retry;
pub mod store;

pub use cancel::CancelToken;
pub use circuit_breaker::{
    BreakerRegistry, BreakerTransition, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerStatus, CircuitState, FallbackStrategy,
};
pub use classify::{classify, CallContext, ErrorKind, ErrorRecord, ExperienceTier, Severity};
pub use config::{DisclosureConfig, QueueConfig, ResilienceConfig, RetryConfig};
pub use connectivity::ConnectivityMonitor;
pub use disclosure::{
    DisclosureChannel, DisclosureDecision, ErrorDisclosureController, RecoveryAction,
};
pub use error::{AegisError, AegisResult};
pub use orchestrator::{
    ActionHandler, ExecuteOptions, ExecuteOutcome, RecoveryOrchestrator,
};
pub use queue::{
    ActionPriority, ActionRequest, ActionStatus, EnqueueReceipt, OfflineActionQueue,
    QueuedAction, SyncReport,
};
pub use retry::{RetryOrchestrator, RetryPolicy, RetryStats};
pub use store::{KvStore, MemoryStore, RedbStore, ResilientStore};
