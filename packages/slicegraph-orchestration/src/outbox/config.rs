use crate::settings::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OutboxWorkerConfig {
    pub enabled: bool,
    /// Entries claimed per poll
    pub batch_size: usize,
    /// Sleep after a poll that claimed something
    pub poll_interval_ms: u64,
    /// Sleep after an empty poll
    pub idle_poll_interval_ms: u64,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Multiplicative jitter: backoff × [1 - r, 1 + r]
    pub jitter_ratio: f64,
    /// PROCESSING claims older than this are reclaimable
    pub stale_claim_after_ms: u64,
    pub handler_concurrency: usize,
    pub shutdown_timeout_ms: u64,
    pub worker_id: String,
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: 100,
            poll_interval_ms: 100,
            idle_poll_interval_ms: 1_000,
            base_backoff_ms: 500,
            max_backoff_ms: 30_000,
            jitter_ratio: 0.2,
            stale_claim_after_ms: 300_000,
            handler_concurrency: (num_cpus::get() * 3 / 4).max(1), // 75% of cores
            shutdown_timeout_ms: 10_000,
            worker_id: format!("outbox-worker-{}", Uuid::new_v4()),
        }
    }
}

impl OutboxWorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn idle_poll_interval(&self) -> Duration {
        Duration::from_millis(self.idle_poll_interval_ms)
    }

    pub fn stale_claim_after(&self) -> Duration {
        Duration::from_millis(self.stale_claim_after_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Backoff after `consecutive_failures` loop errors
    ///
    /// `min(max, base * 2^(n-1))` scaled by `1 + jitter_ratio * sample`,
    /// with `sample` in [-1, 1]; the result never exceeds `max_backoff_ms`.
    pub fn backoff_delay(&self, consecutive_failures: u32, sample: f64) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let exp = consecutive_failures.saturating_sub(1).min(32);
        let raw = self
            .base_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms);
        let factor = 1.0 + self.jitter_ratio * sample.clamp(-1.0, 1.0);
        let jittered = (raw as f64 * factor).round().max(0.0) as u64;
        Duration::from_millis(jittered.min(self.max_backoff_ms))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let range = |field: &str, value: String, min: &str, max: &str| ConfigError::Range {
            field: field.to_string(),
            value,
            min: min.to_string(),
            max: max.to_string(),
            hint: String::new(),
        };

        if self.batch_size == 0 || self.batch_size > 10_000 {
            return Err(range("outbox.batch_size", self.batch_size.to_string(), "1", "10000"));
        }
        if self.handler_concurrency == 0 {
            return Err(range(
                "outbox.handler_concurrency",
                "0".to_string(),
                "1",
                &usize::MAX.to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(range("outbox.jitter_ratio", self.jitter_ratio.to_string(), "0.0", "1.0"));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(range(
                "outbox.base_backoff_ms",
                self.base_backoff_ms.to_string(),
                "0",
                &self.max_backoff_ms.to_string(),
            ));
        }
        if self.worker_id.trim().is_empty() {
            return Err(range("outbox.worker_id", "\"\"".to_string(), "1 char", "-"));
        }
        Ok(())
    }
}
