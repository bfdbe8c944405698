//! Retry orchestration for a single guarded call.
//!
//! Attempts are strictly sequential: the next attempt is scheduled only
//! after the previous one settles, with capped exponential backoff and
//! uniform jitter to avoid synchronized retry storms across clients. Backoff
//! uses a non-blocking timer; cancellation clears any pending timer and
//! abandons the call without touching the statistics.

use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::config::RetryConfig;
use crate::error::{AegisError, AegisResult};

/// Runtime retry policy: the configured knobs plus a retryability predicate.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first (>= 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Uniform jitter applied to each delay, in [0, 1].
    pub jitter_ratio: f64,
    pub is_retryable: fn(&AegisError) -> bool,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            multiplier: config.multiplier,
            max_delay: config.max_delay,
            jitter_ratio: config.jitter_ratio,
            is_retryable: default_is_retryable,
        }
    }

    /// Policy tuned for idempotent network reads.
    pub fn for_network() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter_ratio: 0.3,
            is_retryable: default_is_retryable,
        }
    }

    /// Policy tuned for mutations that will be queued on failure anyway:
    /// fewer attempts, give up quickly and defer.
    pub fn for_mutations() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_delay: Duration::from_secs(2),
            jitter_ratio: 0.3,
            is_retryable: default_is_retryable,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_retryable(mut self, predicate: fn(&AegisError) -> bool) -> Self {
        self.is_retryable = predicate;
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter_ratio = 0.0;
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Transient failures retry; validation, auth, and client errors fail fast.
pub fn default_is_retryable(error: &AegisError) -> bool {
    matches!(
        error,
        AegisError::NetworkError(_)
            | AegisError::Timeout { .. }
            | AegisError::Processing { .. }
    ) || matches!(
        error,
        AegisError::HttpStatus { status, .. }
            if *status == 408 || *status == 429 || (500..=599).contains(status)
    )
}

/// Decision for one settled attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

/// Decide whether to schedule another attempt after `attempt` has failed
/// with `error`, and with what delay.
pub fn should_retry(attempt: u32, error: &AegisError, policy: &RetryPolicy) -> RetryDecision {
    if attempt >= policy.max_attempts || !(policy.is_retryable)(error) {
        return RetryDecision {
            retry: false,
            delay: Duration::ZERO,
        };
    }
    RetryDecision {
        retry: true,
        delay: backoff_delay(attempt, policy),
    }
}

fn backoff_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let factor = policy.multiplier.powf(attempt.saturating_sub(1) as f64);
    let raw_ms = (policy.base_delay.as_millis() as f64 * factor) as u64;
    let capped_ms = raw_ms.min(policy.max_delay.as_millis() as u64);
    apply_jitter(Duration::from_millis(capped_ms), policy.jitter_ratio)
}

fn apply_jitter(delay: Duration, ratio: f64) -> Duration {
    if ratio <= 0.0 || delay.is_zero() {
        return delay;
    }
    let mut rng = rand::thread_rng();
    let factor = rng.gen_range((1.0 - ratio)..=(1.0 + ratio));
    Duration::from_millis((delay.as_millis() as f64 * factor) as u64)
}

/// Aggregate statistics across completed operations (not attempts).
///
/// `average_attempts` is defined for every state: it starts at 0.0 with no
/// operations recorded, and the first completed operation sets it exactly to
/// its own attempt count.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetryStats {
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub average_attempts: f64,
}

impl RetryStats {
    fn record(&mut self, attempts: u32, success: bool) {
        self.total_operations += 1;
        if success {
            self.successful_operations += 1;
        } else {
            self.failed_operations += 1;
        }
        let n = self.total_operations as f64;
        self.average_attempts += (f64::from(attempts) - self.average_attempts) / n;
    }
}

/// Drives the attempt loop for guarded calls and tracks aggregate stats.
pub struct RetryOrchestrator {
    stats: Mutex<RetryStats>,
}

impl RetryOrchestrator {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new(RetryStats::default()),
        }
    }

    /// Immutable snapshot of the aggregate statistics.
    pub fn stats(&self) -> RetryStats {
        self.stats.lock().clone()
    }

    /// Run one operation to a terminal outcome under `policy`.
    ///
    /// Stats are updated once per operation on success or give-up; a
    /// cancelled call updates nothing.
    pub async fn run<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        cancel: &CancelToken,
        operation_name: &str,
        mut operation: F,
    ) -> AegisResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AegisResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(AegisError::Cancelled {
                    operation: operation_name.to_string(),
                });
            }

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(AegisError::Cancelled {
                        operation: operation_name.to_string(),
                    });
                }
                result = operation() => result,
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            operation = operation_name,
                            attempts = attempt,
                            "operation succeeded after retries"
                        );
                    }
                    self.stats.lock().record(attempt, true);
                    return Ok(value);
                }
                Err(error) => {
                    let decision = should_retry(attempt, &error, policy);
                    if !decision.retry {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %error,
                            "operation failed terminally"
                        );
                        self.stats.lock().record(attempt, false);
                        return Err(error);
                    }

                    debug!(
                        operation = operation_name,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = decision.delay.as_millis() as u64,
                        error = %error,
                        "scheduling retry"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            return Err(AegisError::Cancelled {
                                operation: operation_name.to_string(),
                            });
                        }
                        _ = tokio::time::sleep(decision.delay) => {}
                    }
                }
            }
        }
    }
}

impl Default for RetryOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}
