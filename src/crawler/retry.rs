//! Retry policy with exponential backoff
//!
//! Retries are never slept on by a worker. The policy only computes how long
//! an item must wait; the frontier holds it back until then.

use crate::config::RetryConfig;
use rand::Rng;
use std::time::Duration;

/// Immutable backoff parameters shared by all workers
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub jitter: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            jitter: Duration::from_millis(config.jitter_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// True once `failures` retryable failures mean the item is given up on
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_attempts
    }

    /// Delay before the retry that follows the `failures`-th failure, without jitter
    ///
    /// `base * multiplier^(failures - 1)`, capped at `max_delay`. Non-decreasing
    /// in `failures` for any multiplier >= 1.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let cap_ms = self.max_delay.as_millis() as f64;

        if !delay_ms.is_finite() || delay_ms >= cap_ms {
            self.max_delay
        } else {
            Duration::from_millis(delay_ms as u64)
        }
    }

    /// Backoff plus uniform jitter in `[0, jitter]`, still capped at `max_delay`
    pub fn delay(&self, failures: u32) -> Duration {
        self.delay_with(failures, &mut rand::thread_rng())
    }

    pub fn delay_with<R: Rng + ?Sized>(&self, failures: u32, rng: &mut R) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.gen_range(0..=jitter_ms))
        };
        (self.backoff(failures) + jitter).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}
