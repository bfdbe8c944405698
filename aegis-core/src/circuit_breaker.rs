//! Circuit breaker, one instance per named external dependency.
//!
//! The breaker has three states:
//! - **Closed**: calls pass through; consecutive failures are counted.
//! - **Open**: calls short-circuit to the configured fallback without
//!   invoking the operation.
//! - **Half-open**: after the recovery timeout, a bounded number of probe
//!   calls are admitted. One failure reopens the breaker and restarts the
//!   recovery timer; `half_open_max_calls` consecutive successes close it.
//!
//! Every transition is computed and applied inside a single synchronous
//! mutex section, so concurrent completions against the same breaker cannot
//! interleave and double-transition it. The failure counter resets only on
//! transition into Closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Behavior substituted when the guarded operation cannot produce a result.
///
/// Static per-breaker configuration, not chosen per call: `Queue` for
/// safely-deferrable mutations, `Cache` for idempotent reads, `Reject` for
/// operations with no safe default (payments) where the error must surface
/// immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackStrategy {
    Queue,
    Cache,
    Reject,
}

/// Configuration for a single breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Time to wait in Open before admitting half-open probes.
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,
    /// Probe budget in half-open; also the consecutive successes required
    /// to close.
    pub half_open_max_calls: u32,
    pub fallback: FallbackStrategy,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 3,
            fallback: FallbackStrategy::Reject,
        }
    }
}

/// Emitted on every state change; the orchestrator listens for transitions
/// into Closed to trigger offline queue replay.
#[derive(Debug, Clone)]
pub struct BreakerTransition {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Read-only snapshot for the UI boundary.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_successes: u32,
    /// How long the breaker has been open, when it is.
    pub open_for: Option<Duration>,
    pub fallback: FallbackStrategy,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub short_circuited_calls: u64,
}

/// Outcome of asking the breaker to admit a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    ShortCircuited,
}

struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    half_open_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<Instant>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_successes: 0,
            half_open_in_flight: 0,
            opened_at: None,
        }
    }
}

const TRANSITION_EVENT_CAPACITY: usize = 32;

/// Per-dependency circuit breaker.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,

    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    short_circuited_calls: AtomicU64,

    transitions: broadcast::Sender<BreakerTransition>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_EVENT_CAPACITY);
        Self::with_event_sender(name, config, transitions)
    }

    /// Construct with a shared transition channel; used by the registry so
    /// one subscriber observes every breaker.
    pub(crate) fn with_event_sender(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        transitions: broadcast::Sender<BreakerTransition>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            short_circuited_calls: AtomicU64::new(0),
            transitions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fallback(&self) -> FallbackStrategy {
        self.config.fallback
    }

    /// Ask the breaker to admit one call. Admission leases a half-open probe
    /// slot when the breaker is probing; the caller must settle the lease
    /// via `on_success`, `on_failure`, or `on_abandoned`.
    pub fn try_acquire(&self) -> Admission {
        let mut inner = self.inner.lock();

        let admitted = match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let timer_elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if timer_elapsed {
                    inner.half_open_successes = 0;
                    inner.half_open_in_flight = 0;
                    self.set_state(&mut inner, CircuitState::HalfOpen);
                    inner.half_open_in_flight = 1;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_calls {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        };
        drop(inner);

        if admitted {
            self.total_calls.fetch_add(1, Ordering::Relaxed);
            Admission::Admitted
        } else {
            self.short_circuited_calls.fetch_add(1, Ordering::Relaxed);
            debug!(
                breaker = %self.name,
                "short-circuiting call, applying '{:?}' fallback",
                self.config.fallback
            );
            Admission::ShortCircuited
        }
    }

    /// Record a successful admitted call.
    pub fn on_success(&self) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_max_calls {
                    inner.failure_count = 0;
                    inner.half_open_successes = 0;
                    inner.half_open_in_flight = 0;
                    self.set_state(&mut inner, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed admitted call.
    pub fn on_failure(&self) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);

        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.set_state(&mut inner, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // One probe failure reopens; the recovery timer restarts.
                inner.half_open_in_flight = 0;
                inner.half_open_successes = 0;
                self.set_state(&mut inner, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Release an admitted call that settled neither way (cancellation).
    pub fn on_abandoned(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let inner = self.inner.lock();
        CircuitBreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            half_open_successes: inner.half_open_successes,
            open_for: match inner.state {
                CircuitState::Open => inner.opened_at.map(|at| at.elapsed()),
                _ => None,
            },
            fallback: self.config.fallback,
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            short_circuited_calls: self.short_circuited_calls.load(Ordering::Relaxed),
        }
    }

    pub fn subscribe_transitions(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions.subscribe()
    }

    /// Force the breaker open (emergency stop).
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        warn!(breaker = %self.name, "forcibly opened");
        self.set_state(&mut inner, CircuitState::Open);
    }

    /// Force the breaker closed (manual recovery, power-tier action).
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count = 0;
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;
        info!(breaker = %self.name, "forcibly closed");
        self.set_state(&mut inner, CircuitState::Closed);
    }

    /// Reset state and counters without emitting a transition (tests).
    pub fn reset(&self) {
        *self.inner.lock() = BreakerInner::new();
        self.total_calls.store(0, Ordering::Relaxed);
        self.successful_calls.store(0, Ordering::Relaxed);
        self.failed_calls.store(0, Ordering::Relaxed);
        self.short_circuited_calls.store(0, Ordering::Relaxed);
    }

    fn set_state(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                warn!(
                    breaker = %self.name,
                    failures = inner.failure_count,
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, "circuit half-open, probing");
            }
            CircuitState::Closed => {
                info!(breaker = %self.name, "circuit closed");
            }
        }
        let _ = self.transitions.send(BreakerTransition {
            name: self.name.clone(),
            from,
            to,
        });
    }
}

/// Process-wide registry: breaker name → instance, construct-on-first-use.
///
/// Per-dependency overrides must be installed before the breaker is first
/// used; `reset_all` exists for tests.
pub struct BreakerRegistry {
    default_config: CircuitBreakerConfig,
    overrides: DashMap<String, CircuitBreakerConfig>,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    transitions: broadcast::Sender<BreakerTransition>,
}

impl BreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_EVENT_CAPACITY);
        Self {
            default_config,
            overrides: DashMap::new(),
            breakers: DashMap::new(),
            transitions,
        }
    }

    /// Install a per-dependency config override. Takes effect on first use
    /// of that breaker name.
    pub fn set_override(&self, name: impl Into<String>, config: CircuitBreakerConfig) {
        self.overrides.insert(name.into(), config);
    }

    /// Get or create the breaker for a dependency name.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(name)
                    .map(|c| c.clone())
                    .unwrap_or_else(|| self.default_config.clone());
                Arc::new(CircuitBreaker::with_event_sender(
                    name,
                    config,
                    self.transitions.clone(),
                ))
            })
            .clone()
    }

    /// Status for an already-created breaker.
    pub fn status(&self, name: &str) -> Option<CircuitBreakerStatus> {
        self.breakers.get(name).map(|b| b.status())
    }

    pub fn names(&self) -> Vec<String> {
        self.breakers.iter().map(|e| e.key().clone()).collect()
    }

    /// Single subscription covering every breaker in the registry.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<BreakerTransition> {
        self.transitions.subscribe()
    }

    /// Reset every breaker to its initial state (tests).
    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}
