//! Typed configuration for the resilience core.
//!
//! Every subsystem gets its own section with conservative defaults; the whole
//! tree loads from TOML and validates before use. Durations are written
//! human-readable ("30s", "15m", "24h").

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{AegisError, AegisResult};

/// Retry policy knobs; converted into a runtime [`crate::retry::RetryPolicy`]
/// together with a retryability predicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts per guarded call, including the first (>= 1).
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    pub multiplier: f64,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Uniform jitter applied to each delay, in [0, 1].
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
            jitter_ratio: 0.3,
        }
    }
}

/// Offline action queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Actions older than this are expired instead of replayed.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// Replay failures beyond this count mark the action as failed.
    pub max_replay_attempts: u32,
    /// Scheduling hint between replay attempts of one action.
    #[serde(with = "humantime_serde")]
    pub replay_delay: Duration,
    /// Key the serialized queue snapshot is persisted under.
    pub storage_key: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_age: Duration::from_secs(24 * 60 * 60),
            max_replay_attempts: 5,
            replay_delay: Duration::from_secs(30),
            storage_key: "aegis.offline-queue".to_string(),
        }
    }
}

/// Progressive disclosure settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisclosureConfig {
    /// Window inside which repeated occurrences of one fingerprint escalate.
    #[serde(with = "humantime_serde")]
    pub observation_window: Duration,
    /// Capacity of the disclosure event stream.
    pub event_capacity: usize,
}

impl Default for DisclosureConfig {
    fn default() -> Self {
        Self {
            observation_window: Duration::from_secs(15 * 60),
            event_capacity: 64,
        }
    }
}

/// Top-level configuration for the resilience core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceConfig {
    /// Defaults for breakers created on first use.
    pub breaker: CircuitBreakerConfig,
    /// Per-dependency overrides, keyed by breaker name.
    pub breakers: HashMap<String, CircuitBreakerConfig>,
    pub retry: RetryConfig,
    pub queue: QueueConfig,
    pub disclosure: DisclosureConfig,
}

impl ResilienceConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> AegisResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| AegisError::ConfigError(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AegisResult<()> {
        validate_breaker("breaker", &self.breaker)?;
        for (name, breaker) in &self.breakers {
            validate_breaker(name, breaker)?;
        }

        if self.retry.max_attempts < 1 {
            return Err(AegisError::ConfigError(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(AegisError::ConfigError(format!(
                "retry.jitter_ratio must be within [0, 1], got {}",
                self.retry.jitter_ratio
            )));
        }
        if self.retry.multiplier < 1.0 {
            return Err(AegisError::ConfigError(format!(
                "retry.multiplier must be at least 1.0, got {}",
                self.retry.multiplier
            )));
        }

        if self.queue.max_replay_attempts == 0 {
            return Err(AegisError::ConfigError(
                "queue.max_replay_attempts must be positive".to_string(),
            ));
        }
        if self.queue.max_age.is_zero() {
            return Err(AegisError::ConfigError(
                "queue.max_age must be positive".to_string(),
            ));
        }

        if self.disclosure.observation_window.is_zero() {
            return Err(AegisError::ConfigError(
                "disclosure.observation_window must be positive".to_string(),
            ));
        }
        if self.disclosure.event_capacity == 0 {
            return Err(AegisError::ConfigError(
                "disclosure.event_capacity must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn validate_breaker(name: &str, config: &CircuitBreakerConfig) -> AegisResult<()> {
    if config.failure_threshold == 0 {
        return Err(AegisError::ConfigError(format!(
            "breaker '{}': failure_threshold must be positive",
            name
        )));
    }
    if config.half_open_max_calls == 0 {
        return Err(AegisError::ConfigError(format!(
            "breaker '{}': half_open_max_calls must be positive",
            name
        )));
    }
    if config.recovery_timeout.is_zero() {
        return Err(AegisError::ConfigError(format!(
            "breaker '{}': recovery_timeout must be positive",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::FallbackStrategy;

    #[test]
    fn test_defaults_are_valid() {
        let config = ResilienceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.queue.max_age, Duration::from_secs(24 * 60 * 60));
        assert_eq!(
            config.disclosure.observation_window,
            Duration::from_secs(15 * 60)
        );
    }

    #[test]
    fn test_parse_toml_with_overrides() {
        let raw = r#"
            [breaker]
            failure_threshold = 3
            recovery_timeout = "5s"

            [breakers.payments]
            failure_threshold = 1
            fallback = "reject"

            [breakers.uploads]
            fallback = "queue"

            [retry]
            max_attempts = 4
            base_delay = "50ms"

            [queue]
            max_age = "1h"

            [disclosure]
            observation_window = "2m"
        "#;
        let config: ResilienceConfig = toml::from_str(raw).unwrap();
        config.validate().unwrap();

        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.recovery_timeout, Duration::from_secs(5));
        assert_eq!(config.breakers["payments"].failure_threshold, 1);
        assert_eq!(config.breakers["uploads"].fallback, FallbackStrategy::Queue);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.queue.max_age, Duration::from_secs(3600));
        assert_eq!(
            config.disclosure.observation_window,
            Duration::from_secs(120)
        );
    }

    #[test]
    fn test_out_of_range_jitter_rejected() {
        let mut config = ResilienceConfig::default();
        config.retry.jitter_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let mut config = ResilienceConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }
}
