//! Retry/backoff policy
//!
//! Exponential, capped backoff. Used by the reserve-mode memory backend
//! for native redelivery and by the federation outbox for re-enqueueing
//! failed deliveries.

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

/// Exponential backoff with a cap and an attempt budget
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Total attempts allowed, including the first one
    pub max_attempts: u32,
    /// Randomize each delay into [delay / 2, delay]
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(12 * 60 * 60),
            multiplier: 2.0,
            max_attempts: 10,
            jitter: true,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            max_attempts: config.max_attempts,
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// Policy without jitter, handy for deterministic schedules
    pub fn fixed(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts,
            jitter: false,
            ..Self::default()
        }
    }

    /// Backoff after the given (1-based) failed attempt, before jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);

        if capped.is_finite() && capped >= 0.0 {
            Duration::from_millis(capped as u64)
        } else {
            self.max_delay
        }
    }

    /// Delay before retrying after `attempt` failures, or `None` when the
    /// attempt budget is exhausted
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }

        let delay = self.delay(attempt);
        if !self.jitter || delay.is_zero() {
            return Some(delay);
        }

        let scale = rand::thread_rng().gen_range(0.5..=1.0);
        Some(delay.mul_f64(scale))
    }
}
