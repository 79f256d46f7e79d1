//! Exponential backoff for recoverable upload failures.
//!
//! One interval is shared by the whole retry set: it doubles on each
//! firing of the retry timer and only drops back to the initial value
//! once nothing is left waiting for a retry.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBackoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl RetryBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        // A max below the initial value would make the first interval exceed the cap
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Interval to arm the retry timer with right now
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Double the interval after a firing, capped at the maximum
    pub fn advance(&mut self) {
        self.current = self.current.saturating_mul(2).min(self.max);
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn is_at_initial(&self) -> bool {
        self.current == self.initial
    }
}
