//! Bounded exponential backoff used when (re)connecting to the broker.
//!
//! The policy never spins forever: once `max_attempts` is exhausted the caller
//! is expected to surface `BrokerError::Unavailable`.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            initial,
            max,
            max_attempts,
        }
    }

    /// Delay to wait after the given failed attempt (1-based), doubling each
    /// time and capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.initial.saturating_mul(1u32 << exp);
        delay.min(self.max)
    }

    /// Iterator over the attempt numbers allowed by this policy.
    pub fn attempts(&self) -> impl Iterator<Item = u32> {
        1..=self.max_attempts.max(1)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), Duration::from_secs(8), 5)
    }
}
