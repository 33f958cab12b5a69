//! Reconnect delay policy

use std::time::Duration;

/// Doubling backoff with a cap
///
/// The first delay is `min`; each following delay doubles until it reaches
/// `max`, where it stays until [`Backoff::reset`] is called.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        let max = max.max(min);
        Self {
            min,
            max,
            current: min,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Go back to the minimum delay
    pub fn reset(&mut self) {
        self.current = self.min;
        self.attempts = 0;
    }

    /// Attempts since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
