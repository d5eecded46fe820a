// src/retry/strategy.rs

use crate::config::{BackoffKind, RetryConfig};
use std::time::Duration;

/// Limits and backoff for the per-request retry/failover protocol.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub max_attempts: u32,
    backoff: BackoffKind,
    backoff_base: Duration,
    backoff_max: Duration,
}

/// Per-request counters. `attempts` counts distinct backends already given
/// up on; `retries` counts repeats against the current backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub retries: u32,
}

/// What the forwarder should do after a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Wait, then send to the same backend again.
    RetrySame { backoff: Duration },
    /// Mark the backend dead and select a new peer.
    Failover,
}

impl RetryState {
    /// True once `max_attempts` distinct backends have been given up on.
    pub fn exhausted(&self, policy: &RetryPolicy) -> bool {
        self.attempts >= policy.max_attempts
    }

    pub fn on_transport_failure(self, policy: &RetryPolicy) -> (RetryState, RetryAction) {
        if self.retries < policy.max_retries {
            let next = RetryState {
                retries: self.retries + 1,
                ..self
            };
            let backoff = policy.backoff(next.retries);
            (next, RetryAction::RetrySame { backoff })
        } else {
            let next = RetryState {
                attempts: self.attempts + 1,
                retries: 0,
            };
            (next, RetryAction::Failover)
        }
    }
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            max_attempts: config.max_attempts,
            backoff: config.backoff,
            backoff_base: config.backoff_base(),
            backoff_max: config.backoff_max(),
        }
    }

    /// Fixed policy with the given limits and delay.
    pub fn fixed(max_retries: u32, max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            max_attempts,
            backoff: BackoffKind::Fixed,
            backoff_base: delay,
            backoff_max: delay,
        }
    }

    /// Upper bound on backend invocations for one inbound request.
    pub fn max_invocations(&self) -> u32 {
        self.max_attempts * (self.max_retries + 1)
    }

    /// Delay before retry number `retry` (1-based) against the same backend.
    pub fn backoff(&self, retry: u32) -> Duration {
        match self.backoff {
            BackoffKind::Fixed => self.backoff_base,
            BackoffKind::Exponential => self.exponential_backoff(retry),
        }
    }

    /// Exponential backoff with jitter
    fn exponential_backoff(&self, retry: u32) -> Duration {
        let base = self.backoff_base.as_millis() as u64;
        let max = self.backoff_max.as_millis() as u64;

        // base * 2^(retry - 1)
        let exponential = base.saturating_mul(2u64.saturating_pow(retry.saturating_sub(1)));
        let capped = exponential.min(max);

        // Add jitter (0-25% of the calculated backoff)
        let jitter = (capped as f64 * rand::random::<f64>() * 0.25) as u64;

        Duration::from_millis(capped + jitter)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}
