//! Coalescing of change notifications.
//!
//! At most one notification per interval, and a change is never dropped:
//! events inside the interval arm a single timer for its remainder.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDecision {
    /// Notify right away.
    EmitNow,
    /// Arm the timer for this long, then notify.
    Arm(Duration),
    /// A timer is already armed; it will cover this event.
    AlreadyArmed,
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    min_interval: Duration,
    last_signal: Option<Instant>,
    timer_armed: bool,
}

impl Debouncer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_signal: None,
            timer_armed: false,
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub fn on_event(&mut self, now: Instant) -> SignalDecision {
        if self.timer_armed {
            return SignalDecision::AlreadyArmed;
        }

        // Before the first notification the whole interval is waited out,
        // so the first burst after startup yields a single signal.
        let elapsed = self
            .last_signal
            .map(|last| now.saturating_duration_since(last))
            .unwrap_or(Duration::ZERO);

        if self.last_signal.is_some() && elapsed > self.min_interval {
            self.last_signal = Some(now);
            SignalDecision::EmitNow
        } else {
            self.timer_armed = true;
            SignalDecision::Arm(self.min_interval.saturating_sub(elapsed))
        }
    }

    /// The armed timer fired and the notification went out.
    pub fn on_timer(&mut self, now: Instant) {
        self.timer_armed = false;
        self.last_signal = Some(now);
    }

    /// Forget any armed timer, e.g. when the watch is replaced.
    pub fn cancel(&mut self) {
        self.timer_armed = false;
    }
}
