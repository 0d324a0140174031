//! Exponential backoff retry policy with optional jitter.

use std::time::Duration;

use rand::Rng;

/// Configuration for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    /// Initial backoff delay.
    pub initial_backoff: Duration,
    /// Maximum backoff delay (caps exponential growth).
    pub max_backoff: Duration,
    /// Multiplier applied to backoff on each retry.
    pub multiplier: f64,
    /// Add up to `jitter_fraction * backoff` random jitter (0.0 = no jitter).
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

/// Stateless retry policy: computes the next delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Returns the delay before the `attempt`-th retry (1-based).
    /// Returns `None` if `attempt` exceeds `max_retries`.
    ///
    /// Jitter is drawn from `[backoff, backoff * (1 + jitter_fraction)]`,
    /// clamped to the next attempt's backoff, so delays never decrease with
    /// `attempt` and never exceed `max_backoff`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if !self.should_retry(attempt) {
            return None;
        }
        let capped = self.backoff_ms(attempt);
        let jitter = self.config.jitter_fraction.clamp(0.0, 1.0);
        let upper = ((capped as f64) * (1.0 + jitter)) as u64;
        let upper = upper.min(self.backoff_ms(attempt.saturating_add(1)));

        let total_ms = if upper > capped {
            rand::thread_rng().gen_range(capped..=upper)
        } else {
            capped
        };
        Some(Duration::from_millis(total_ms))
    }

    /// Exponential backoff for `attempt`, capped at `max_backoff`, without jitter.
    fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_ms = self.config.initial_backoff.as_millis() as f64
            * self.config.multiplier.max(1.0).powi(exponent);
        let cap_ms = self.config.max_backoff.as_millis() as f64;
        base_ms.min(cap_ms) as u64
    }

    /// Returns `true` if any retries remain after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        match self.config.max_retries {
            Some(max) => attempt <= max,
            None => true,
        }
    }
}
