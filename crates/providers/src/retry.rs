//! Jittered exponential backoff for opening provider streams.

use codeloom_core::error::ProviderError;
use rand::Rng;
use std::time::Duration;

/// How often and how patiently a failed stream open is retried.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl From<&codeloom_config::HttpConfig> for RetryPolicy {
    fn from(config: &codeloom_config::HttpConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether another attempt may follow `attempt` (1-based) failing with `error`.
    pub fn should_retry(&self, attempt: u32, error: &ProviderError) -> bool {
        attempt < self.max_attempts && error.is_retryable()
    }

    /// Upper bound of the wait after `attempt` (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Wait before the next attempt: a uniform draw from the upper half of
    /// the ceiling. A server-provided `retry_after` raises the floor, still
    /// bounded by `max_delay`.
    pub fn delay(&self, attempt: u32, error: &ProviderError) -> Duration {
        let ceiling = self.ceiling(attempt);
        let half = ceiling / 2;
        let jitter_ms = rand::rng().random_range(0..=half.as_millis() as u64);
        let jittered = half + Duration::from_millis(jitter_ms);

        match error {
            ProviderError::RateLimited { retry_after_secs } => jittered
                .max(Duration::from_secs(*retry_after_secs))
                .min(self.max_delay),
            _ => jittered,
        }
    }
}
