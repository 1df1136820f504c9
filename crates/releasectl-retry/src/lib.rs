//! Retry strategy module for configurable backoff behavior.
//!
//! This mirrors the shape of a standard retry layer: a preset policy picks
//! sensible defaults, a strategy type picks the backoff curve, and
//! per-error-class overrides let callers retry transient failures harder
//! than ambiguous ones.

use std::time::Duration;

use releasectl_types::ErrorClass;
use serde::{Deserialize, Serialize};

/// Strategy type for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategyType {
    /// No delay between retries - retry immediately.
    Immediate,
    /// Exponential backoff: delay doubles each attempt (default).
    #[default]
    Exponential,
    /// Linear backoff: delay increases linearly each attempt.
    Linear,
    /// Constant delay: same delay every attempt.
    Constant,
}

/// Predefined retry policies with sensible defaults for different use cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Default balanced retry behavior - good for most scenarios.
    #[default]
    Default,
    /// Aggressive retries - more attempts, faster recovery.
    Aggressive,
    /// Conservative retries - fewer attempts, longer delays.
    Conservative,
    /// Fully custom configuration via explicit strategy settings.
    Custom,
}

impl RetryPolicy {
    /// Get the default retry configuration for this policy.
    pub fn to_config(&self) -> RetryStrategyConfig {
        match self {
            RetryPolicy::Default => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 5,
                base_delay: Duration::from_secs(10),
                max_delay: Duration::from_secs(120),
                jitter: 0.5,
            },
            RetryPolicy::Aggressive => RetryStrategyConfig {
                strategy: RetryStrategyType::Exponential,
                max_attempts: 10,
                base_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(30),
                jitter: 0.3,
            },
            RetryPolicy::Conservative => RetryStrategyConfig {
                strategy: RetryStrategyType::Linear,
                max_attempts: 3,
                base_delay: Duration::from_secs(5),
                max_delay: Duration::from_secs(60),
                jitter: 0.1,
            },
            RetryPolicy::Custom => RetryStrategyConfig::default(),
        }
    }
}

/// Configuration for a retry strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryStrategyConfig {
    /// Strategy type for calculating delay between retries.
    #[serde(default)]
    pub strategy: RetryStrategyType,
    /// Maximum number of retry attempts. Default 5, per SPEC_FULL.md §7.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for backoff calculations.
    #[serde(with = "releasectl_types::duration", default = "default_base_delay")]
    pub base_delay: Duration,
    /// Maximum delay cap for backoff.
    #[serde(with = "releasectl_types::duration", default = "default_max_delay")]
    pub max_delay: Duration,
    /// Jitter factor for randomized delays (0.0 = no jitter, 1.0 = full jitter).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryStrategyConfig {
    fn default() -> Self {
        RetryPolicy::Default.to_config()
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_base_delay() -> Duration {
    Duration::from_secs(10)
}
fn default_max_delay() -> Duration {
    Duration::from_secs(120)
}
fn default_jitter() -> f64 {
    0.5
}

/// Per-error-class retry configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerErrorConfig {
    /// Retry configuration for transient errors (network issues, rate limiting).
    #[serde(default)]
    pub transient: Option<RetryStrategyConfig>,
    /// Retry configuration for ambiguous errors (unknown if the call landed).
    #[serde(default)]
    pub ambiguous: Option<RetryStrategyConfig>,
    /// Retry configuration for permanent errors (auth failure, 404, bad config).
    /// Permanent errors are typically not retried, but this can be customized.
    #[serde(default)]
    pub permanent: Option<RetryStrategyConfig>,
}

/// Calculate the delay for the next retry attempt based on the strategy configuration.
pub fn calculate_delay(config: &RetryStrategyConfig, attempt: u32) -> Duration {
    let delay = match config.strategy {
        RetryStrategyType::Immediate => Duration::ZERO,
        RetryStrategyType::Exponential => {
            let pow = attempt.saturating_sub(1).min(16);
            config.base_delay.saturating_mul(2_u32.saturating_pow(pow))
        }
        RetryStrategyType::Linear => config.base_delay.saturating_mul(attempt),
        RetryStrategyType::Constant => config.base_delay,
    };

    let capped = delay.min(config.max_delay);

    if config.jitter > 0.0 {
        apply_jitter(capped, config.jitter)
    } else {
        capped
    }
}

/// Apply jitter to a delay value. Jitter factor of 0.5 means delay * (0.5 to 1.5).
fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    let jitter_range = 2.0 * jitter;
    let random_factor = 1.0 - jitter + (rand::random::<f64>() * jitter_range);
    let millis = (delay.as_millis() as f64 * random_factor).round() as u64;
    Duration::from_millis(millis)
}

/// Get the retry configuration for a specific error class.
/// Falls back to the default config if no per-class config is specified.
pub fn config_for_error(
    default_config: &RetryStrategyConfig,
    per_error_config: &Option<PerErrorConfig>,
    error_class: ErrorClass,
) -> RetryStrategyConfig {
    if let Some(per_error) = per_error_config {
        let override_config = match error_class {
            ErrorClass::Transient => &per_error.transient,
            ErrorClass::Ambiguous => &per_error.ambiguous,
            ErrorClass::Permanent => &per_error.permanent,
        };
        if let Some(config) = override_config {
            return config.clone();
        }
    }
    default_config.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_to_config_default() {
        let config = RetryPolicy::Default.to_config();
        assert_eq!(config.strategy, RetryStrategyType::Exponential);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay, Duration::from_secs(10));
        assert_eq!(config.max_delay, Duration::from_secs(120));
    }

    #[test]
    fn retry_policy_to_config_aggressive() {
        let config = RetryPolicy::Aggressive.to_config();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.base_delay, Duration::from_millis(500));
    }

    #[test]
    fn calculate_delay_immediate_is_always_zero() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Immediate,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
            max_attempts: 3,
        };
        assert_eq!(calculate_delay(&config, 1), Duration::ZERO);
        assert_eq!(calculate_delay(&config, 5), Duration::ZERO);
    }

    #[test]
    fn calculate_delay_exponential_doubles_and_caps() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Exponential,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(120),
            jitter: 0.0,
            max_attempts: 10,
        };
        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(10));
        assert_eq!(calculate_delay(&config, 2), Duration::from_secs(20));
        assert_eq!(calculate_delay(&config, 3), Duration::from_secs(40));
        assert_eq!(calculate_delay(&config, 4), Duration::from_secs(80));
        // attempt 5 would be 160s, capped at 120s — matches MonitorRun's ~2min cap.
        assert_eq!(calculate_delay(&config, 5), Duration::from_secs(120));
    }

    #[test]
    fn calculate_delay_linear() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Linear,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
            max_attempts: 10,
        };
        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(1));
        assert_eq!(calculate_delay(&config, 5), Duration::from_secs(5));
        assert_eq!(calculate_delay(&config, 15), Duration::from_secs(10));
    }

    #[test]
    fn calculate_delay_constant() {
        let config = RetryStrategyConfig {
            strategy: RetryStrategyType::Constant,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
            max_attempts: 10,
        };
        assert_eq!(calculate_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(calculate_delay(&config, 10), Duration::from_secs(2));
    }

    #[test]
    fn config_for_error_falls_back_to_default() {
        let default_config = RetryStrategyConfig::default();
        let result = config_for_error(&default_config, &None, ErrorClass::Transient);
        assert_eq!(result.max_attempts, default_config.max_attempts);
    }

    #[test]
    fn config_for_error_uses_per_class_override() {
        let default_config = RetryStrategyConfig::default();
        let per_error = PerErrorConfig {
            transient: Some(RetryStrategyConfig {
                strategy: RetryStrategyType::Immediate,
                max_attempts: 10,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
                jitter: 0.0,
            }),
            ambiguous: None,
            permanent: None,
        };

        let result = config_for_error(&default_config, &Some(per_error.clone()), ErrorClass::Transient);
        assert_eq!(result.strategy, RetryStrategyType::Immediate);

        let result = config_for_error(&default_config, &Some(per_error), ErrorClass::Ambiguous);
        assert_eq!(result.strategy, RetryStrategyType::Exponential);
    }

    #[test]
    fn retry_strategy_config_serde_roundtrip() {
        let json = r#"{
            "strategy": "linear",
            "max_attempts": 3,
            "base_delay": "5s",
            "max_delay": "30s",
            "jitter": 0.2
        }"#;
        let config: RetryStrategyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.strategy, RetryStrategyType::Linear);
        assert_eq!(config.base_delay, Duration::from_secs(5));
        assert!((config.jitter - 0.2).abs() < 0.001);
    }
}
