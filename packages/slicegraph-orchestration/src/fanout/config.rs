//! Fanout configuration and presets
//!
//! Presets provide complete configurations for common load profiles;
//! `FanoutOverrides` patches individual fields on top of a preset.

use crate::settings::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do when the candidate count exceeds `max_fanout`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerAction {
    /// Mark the job SKIPPED, recompute nothing
    Skip,
    /// Fail the call, recompute nothing
    Error,
    /// Hand the job to the async fanout queue
    Async,
}

impl CircuitBreakerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "SKIP",
            Self::Error => "ERROR",
            Self::Async => "ASYNC",
        }
    }
}

impl std::fmt::Display for CircuitBreakerAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FanoutPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Per-candidate retry policy (transient errors only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryConfig {
    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1 = first retry)
    ///
    /// `base * multiplier^(attempt-1)`, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let ms = (self.base_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        Duration::from_millis(ms.max(0.0) as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FanoutConfig {
    pub enabled: bool,
    pub batch_size: usize,
    /// Candidate count at which the breaker trips (exclusive)
    pub max_fanout: usize,
    /// In-flight slicing calls across the engine
    pub max_concurrent_fanouts: usize,
    pub circuit_breaker_action: CircuitBreakerAction,
    pub priority: FanoutPriority,
    pub timeout_ms: u64,
    /// 0 disables deduplication
    pub deduplication_window_ms: u64,
    pub batch_delay_ms: u64,
    pub retry: RetryConfig,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 100,
            max_fanout: 10_000,
            max_concurrent_fanouts: 10,
            circuit_breaker_action: CircuitBreakerAction::Skip,
            priority: FanoutPriority::Normal,
            timeout_ms: 300_000,
            deduplication_window_ms: 1_000,
            batch_delay_ms: 100,
            retry: RetryConfig::default(),
        }
    }
}

impl FanoutConfig {
    pub fn preset(preset: FanoutPreset) -> Self {
        match preset {
            FanoutPreset::Default => Self::default(),
            FanoutPreset::HighThroughput => Self {
                batch_size: 500,
                max_fanout: 50_000,
                max_concurrent_fanouts: 50,
                circuit_breaker_action: CircuitBreakerAction::Async,
                timeout_ms: 600_000,
                deduplication_window_ms: 500,
                batch_delay_ms: 10,
                ..Self::default()
            },
            FanoutPreset::Conservative => Self {
                batch_size: 20,
                max_fanout: 1_000,
                max_concurrent_fanouts: 3,
                circuit_breaker_action: CircuitBreakerAction::Error,
                timeout_ms: 60_000,
                deduplication_window_ms: 5_000,
                batch_delay_ms: 500,
                retry: RetryConfig {
                    max_attempts: 5,
                    base_delay_ms: 500,
                    backoff_multiplier: 2.0,
                    max_delay_ms: 30_000,
                },
                ..Self::default()
            },
            FanoutPreset::Disabled => Self {
                enabled: false,
                ..Self::default()
            },
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn deduplication_window(&self) -> Duration {
        Duration::from_millis(self.deduplication_window_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn at_least(field: &str, value: u64, min: u64) -> Result<(), ConfigError> {
            if value < min {
                return Err(ConfigError::Range {
                    field: field.to_string(),
                    value: value.to_string(),
                    min: min.to_string(),
                    max: u64::MAX.to_string(),
                    hint: format!("'{}' must be at least {}", field, min),
                });
            }
            Ok(())
        }

        at_least("fanout.batch_size", self.batch_size as u64, 1)?;
        at_least("fanout.max_fanout", self.max_fanout as u64, 1)?;
        at_least(
            "fanout.max_concurrent_fanouts",
            self.max_concurrent_fanouts as u64,
            1,
        )?;
        at_least("fanout.timeout_ms", self.timeout_ms, 1)?;
        at_least("fanout.retry.max_attempts", self.retry.max_attempts as u64, 1)?;
        if !(self.retry.backoff_multiplier >= 1.0 && self.retry.backoff_multiplier <= 10.0) {
            return Err(ConfigError::Range {
                field: "fanout.retry.backoff_multiplier".to_string(),
                value: self.retry.backoff_multiplier.to_string(),
                min: "1.0".to_string(),
                max: "10.0".to_string(),
                hint: "Use 2.0 for plain exponential backoff".to_string(),
            });
        }
        Ok(())
    }
}

/// Named fanout configurations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanoutPreset {
    #[default]
    Default,
    /// Larger batches and limits, ASYNC on breach
    HighThroughput,
    /// Smaller limits, ERROR on breach
    Conservative,
    Disabled,
}

impl FanoutPreset {
    /// Parse preset from string
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "default" => Ok(Self::Default),
            "high_throughput" => Ok(Self::HighThroughput),
            "conservative" => Ok(Self::Conservative),
            "disabled" => Ok(Self::Disabled),
            _ => Err(format!(
                "Unknown preset '{}'. Valid presets: default, high_throughput, conservative, disabled",
                s
            )),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::HighThroughput => "high_throughput",
            Self::Conservative => "conservative",
            Self::Disabled => "disabled",
        }
    }
}

impl std::fmt::Display for FanoutPreset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Field-level patch applied on top of a preset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FanoutOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_fanout: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_fanouts: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker_action: Option<CircuitBreakerAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<FanoutPriority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deduplication_window_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_delay_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
}

impl FanoutOverrides {
    pub fn apply(&self, config: &mut FanoutConfig) {
        if let Some(v) = self.enabled {
            config.enabled = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.max_fanout {
            config.max_fanout = v;
        }
        if let Some(v) = self.max_concurrent_fanouts {
            config.max_concurrent_fanouts = v;
        }
        if let Some(v) = self.circuit_breaker_action {
            config.circuit_breaker_action = v;
        }
        if let Some(v) = self.priority {
            config.priority = v;
        }
        if let Some(v) = self.timeout_ms {
            config.timeout_ms = v;
        }
        if let Some(v) = self.deduplication_window_ms {
            config.deduplication_window_ms = v;
        }
        if let Some(v) = self.batch_delay_ms {
            config.batch_delay_ms = v;
        }
        if let Some(v) = &self.retry {
            config.retry = v.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets() {
        assert!(FanoutConfig::preset(FanoutPreset::Default).enabled);
        assert!(!FanoutConfig::preset(FanoutPreset::Disabled).enabled);

        let high = FanoutConfig::preset(FanoutPreset::HighThroughput);
        let default = FanoutConfig::default();
        assert!(high.batch_size > default.batch_size);
        assert!(high.max_fanout > default.max_fanout);

        let conservative = FanoutConfig::preset(FanoutPreset::Conservative);
        assert_eq!(conservative.circuit_breaker_action, CircuitBreakerAction::Error);
        assert!(conservative.max_fanout < default.max_fanout);

        for preset in [
            FanoutPreset::Default,
            FanoutPreset::HighThroughput,
            FanoutPreset::Conservative,
            FanoutPreset::Disabled,
        ] {
            assert!(FanoutConfig::preset(preset).validate().is_ok());
            assert_eq!(FanoutPreset::from_str(preset.as_str()).unwrap(), preset);
        }
    }

    #[test]
    fn test_preset_from_str() {
        assert_eq!(
            FanoutPreset::from_str("HIGH-THROUGHPUT").unwrap(),
            FanoutPreset::HighThroughput
        );
        assert!(FanoutPreset::from_str("turbo").is_err());
    }

    #[test]
    fn test_retry_delay_is_exponential_and_capped() {
        let retry = RetryConfig {
            max_attempts: 10,
            base_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 1_000,
        };
        assert_eq!(retry.delay_for(0), Duration::ZERO);
        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(4), Duration::from_millis(800));
        assert_eq!(retry.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(retry.delay_for(30), Duration::from_millis(1_000));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let config = FanoutConfig {
            batch_size: 0,
            ..FanoutConfig::default()
        };
        match config.validate() {
            Err(ConfigError::Range { field, .. }) => assert_eq!(field, "fanout.batch_size"),
            other => panic!("Expected Range error, got {:?}", other),
        }
    }

    #[test]
    fn test_overrides_patch_only_given_fields() {
        let mut config = FanoutConfig::preset(FanoutPreset::Conservative);
        FanoutOverrides {
            batch_size: Some(7),
            ..FanoutOverrides::default()
        }
        .apply(&mut config);

        assert_eq!(config.batch_size, 7);
        assert_eq!(config.circuit_breaker_action, CircuitBreakerAction::Error);
    }
}
