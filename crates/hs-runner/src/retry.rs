//! Bounded exponential backoff for remote service calls.

use hs_types::ServiceError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How transient service failures are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts after the first failure before giving up.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Delay before retry number `attempt` (1-based), or `None` when the error
    /// must not be retried.
    pub fn delay_for(&self, attempt: u32, error: &ServiceError) -> Option<Duration> {
        if !error.is_transient() || attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        let backoff = self
            .base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        match error {
            ServiceError::RateLimited { retry_after_ms } => {
                Some(backoff.max(Duration::from_millis(*retry_after_ms)))
            }
            _ => Some(backoff),
        }
    }
}
