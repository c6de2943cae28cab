//! Exponential backoff with jitter for queued waits and backend retries.

use crate::config::{RetryConfig, RetryPreset};
use rand::Rng;
use std::time::Duration;

/// Delay schedule: `base * multiplier^(attempt-1)`, capped at `max`, with
/// `±jitter_percent` applied.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub jitter_percent: f64,
    /// When false the delay never grows past `base_delay`.
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::preset(RetryPreset::Default)
    }
}

impl RetryPolicy {
    pub fn preset(preset: RetryPreset) -> Self {
        let (base_ms, max_ms) = match preset {
            RetryPreset::Default => (1_000, 30_000),
            RetryPreset::Aggressive => (500, 60_000),
            RetryPreset::Conservative => (2_000, 15_000),
        };
        Self {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_millis(max_ms),
            multiplier: 2.0,
            jitter_percent: 0.1,
            exponential: true,
        }
    }

    pub fn from_config(config: &RetryConfig, retry_enabled: bool) -> Self {
        let mut policy = match config.preset {
            Some(preset) => Self::preset(preset),
            None => Self {
                base_delay: Duration::from_millis(config.base_delay_ms),
                max_delay: Duration::from_millis(config.max_delay_ms),
                multiplier: config.multiplier,
                jitter_percent: config.jitter_percent,
                exponential: true,
            },
        };
        policy.exponential = retry_enabled;
        policy
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        if !self.exponential || attempt <= 1 {
            return self.base_delay.min(self.max_delay);
        }
        let exponent = (attempt - 1).min(63) as i32;
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Delay before retry number `attempt` with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if self.jitter_percent <= 0.0 || delay.is_zero() {
            return delay;
        }

        let spread = delay.as_secs_f64() * self.jitter_percent;
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }
}
