//! Backoff schedule for retrying a failed sink write.

use std::time::Duration;

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Maximum number of attempts including the first (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 0,
        }
    }
}

impl RetryPolicy {
    /// Start a fresh backoff sequence.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            policy: self.clone(),
            current_delay: self.initial_delay,
            attempts: 0,
        }
    }
}

/// Tracks attempts within one retry sequence.
#[derive(Debug)]
pub struct Backoff {
    policy: RetryPolicy,
    current_delay: Duration,
    attempts: u32,
}

impl Backoff {
    /// Record a failed attempt and return how long to wait before the next
    /// one, or `None` when the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempts = self.attempts.saturating_add(1);
        if self.policy.max_attempts > 0 && self.attempts >= self.policy.max_attempts {
            return None;
        }

        let delay = self.current_delay;
        self.current_delay = self
            .current_delay
            .saturating_mul(2)
            .min(self.policy.max_delay);
        Some(delay.min(self.policy.max_delay))
    }

    /// Failed attempts recorded so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
