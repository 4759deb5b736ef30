//! Retry policy for handler dispatch.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential backoff policy applied by the dispatcher to retryable
/// handler failures. The default is a single attempt (no retries).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Base delay in seconds before the first retry.
    pub initial_interval: f64,
    pub backoff_factor: f64,
    /// Delay ceiling in seconds.
    pub max_interval: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 30.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A policy with retries enabled.
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before the retry following `attempt` (1-indexed), with
    /// exponential backoff capped at `max_interval` and 0–25% jitter when
    /// enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_interval;
        let multiplier = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        let capped = (base * multiplier).min(self.max_interval);

        let final_delay = if self.jitter {
            use rand::Rng;
            let mut rng = rand::thread_rng();
            let jitter_factor = rng.gen_range(0.0..0.25);
            capped * (1.0 + jitter_factor)
        } else {
            capped
        };

        Duration::from_secs_f64(final_delay.max(0.0))
    }
}
