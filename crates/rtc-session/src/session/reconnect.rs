//! Media-path reconnection budget and backoff

use rand::Rng;
use std::time::Duration;
use tracing::{debug, info};

/// Reconnection policy configuration
///
/// Controls how reconnection attempts are scheduled when the peer
/// connection drops.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectionPolicy {
    /// Maximum number of reconnection attempts (default: 3)
    pub max_attempts: u32,
    /// Delay before the first attempt in milliseconds (default: 1000ms)
    pub backoff_initial_ms: u64,
    /// Upper bound on any delay in milliseconds (default: 10000ms)
    pub backoff_max_ms: u64,
    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter, still clamped to the cap (default: false)
    pub jitter_enabled: bool,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_initial_ms: 1000,
            backoff_max_ms: 10000,
            backoff_multiplier: 2.0,
            jitter_enabled: false,
        }
    }
}

impl ReconnectionPolicy {
    /// Backoff before attempt `attempt` (1-indexed)
    ///
    /// `min(initial * multiplier^(attempt-1), max)`
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let backoff_ms =
            (self.backoff_initial_ms as f64) * self.backoff_multiplier.powi(exponent);
        let cap = self.backoff_max_ms as f64;
        let backoff_ms = backoff_ms.min(cap);

        let final_ms = if self.jitter_enabled {
            let jitter = rand::thread_rng().gen_range(0.0..=backoff_ms * 0.25);
            (backoff_ms + jitter).min(cap)
        } else {
            backoff_ms
        };

        Duration::from_millis(final_ms as u64)
    }

    /// Check if attempt number `attempt` (1-indexed) is within budget
    pub fn allows(&self, attempt: u32) -> bool {
        attempt >= 1 && attempt <= self.max_attempts
    }
}

/// Attempt counter for one session
#[derive(Debug, Clone)]
pub struct ReconnectState {
    policy: ReconnectionPolicy,
    attempt: u32,
}

impl ReconnectState {
    /// Fresh counter
    pub fn new(policy: ReconnectionPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Attempts made since the last successful connection
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The policy in force
    pub fn policy(&self) -> &ReconnectionPolicy {
        &self.policy
    }

    /// True once every allowed attempt has been used
    pub fn is_exhausted(&self) -> bool {
        self.attempt >= self.policy.max_attempts
    }

    /// Claim the next attempt
    ///
    /// Returns the attempt number and its delay, or `None` when the budget
    /// is spent.
    pub fn next_attempt(&mut self) -> Option<(u32, Duration)> {
        let next = self.attempt + 1;
        if !self.policy.allows(next) {
            debug!(
                "Reconnect budget exhausted ({}/{})",
                self.attempt, self.policy.max_attempts
            );
            return None;
        }

        self.attempt = next;
        let delay = self.policy.calculate_backoff(next);
        info!(
            "Reconnection attempt {}/{} scheduled in {:?}",
            next, self.policy.max_attempts, delay
        );
        Some((next, delay))
    }

    /// Reset after the connection is re-established
    pub fn reset(&mut self) {
        if self.attempt > 0 {
            debug!("Reconnect counter reset after {} attempts", self.attempt);
        }
        self.attempt = 0;
    }
}
