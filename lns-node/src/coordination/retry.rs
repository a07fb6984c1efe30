use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

/// Bounded exponential backoff with jitter for coordination retries.
///
/// Retry `n` (1-based) waits `min(initial * 2^(n-1), max)` plus up to
/// `jitter_ratio` of that delay, capped again at `max`. Instances retrying
/// the same failure therefore spread out instead of hitting the endpoint in
/// lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }

    /// Policy without delays, for tests and single-node loops
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter_ratio: 0.0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        let base = self
            .initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);
        if self.jitter_ratio == 0.0 || base.is_zero() {
            return base;
        }

        let jitter = base.mul_f64(self.jitter_ratio * rand::thread_rng().gen::<f64>());
        (base + jitter).min(self.max_delay)
    }

    /// Upper bound of the time spent sleeping across every retry
    pub fn worst_case_backoff(&self) -> Duration {
        (1..=self.max_retries)
            .map(|retry| {
                let exponent = retry.saturating_sub(1).min(31);
                self.initial_delay
                    .saturating_mul(1u32 << exponent)
                    .min(self.max_delay)
                    .mul_f64(1.0 + self.jitter_ratio)
                    .min(self.max_delay)
            })
            .sum()
    }
}
