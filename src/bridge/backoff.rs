//! Reconnect backoff
//!
//! Delay doubles after every failed attempt until it reaches the ceiling,
//! then stays there. A successful connection resets it to the floor.

use std::time::Duration;

/// Backoff bounds, in whole seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    min: u64,
    max: u64,
}

/// Delay to use for the next reconnect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    current: u64,
}

impl BackoffState {
    pub fn current_delay(&self) -> Duration {
        Duration::from_secs(self.current)
    }
}

impl BackoffPolicy {
    /// Bounds are clamped so that `1 <= min <= max`
    pub fn new(min: Duration, max: Duration) -> Self {
        let min = min.as_secs().max(1);
        let max = max.as_secs().max(min);
        Self { min, max }
    }

    pub fn min(&self) -> Duration {
        Duration::from_secs(self.min)
    }

    pub fn max(&self) -> Duration {
        Duration::from_secs(self.max)
    }

    /// Initial state, also used after a successful connection
    pub fn reset(&self) -> BackoffState {
        BackoffState { current: self.min }
    }

    /// Return the delay to wait now and the state for the attempt after it
    pub fn next_delay(&self, state: BackoffState) -> (BackoffState, Duration) {
        let current = state.current.clamp(self.min, self.max);
        let next = if current < self.max {
            current.saturating_mul(2).min(self.max)
        } else {
            self.max
        };
        (BackoffState { current: next }, Duration::from_secs(current))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(64))
    }
}
