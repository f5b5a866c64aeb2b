//! Exponential backoff for chain RPC calls.

use std::time::Duration;

use ibcindex_core::config::RetryConfig;

/// Stateless retry policy. Computes the next delay given the attempt number.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Returns the delay before the `attempt`-th retry (1-based), doubling
    /// from the initial backoff up to the cap.
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }
        Some(self.backoff(attempt))
    }

    /// Delay between attempts once retries are exhausted. The watcher never
    /// gives up on a chain; it keeps polling at the cap.
    pub fn exhausted_delay(&self) -> Duration {
        self.max_backoff
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Returns `true` if any retries remain after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}
