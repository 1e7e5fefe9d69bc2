use std::time::Duration;

use crate::gateway::constants::{BACKOFF_BASE_MS, MAX_RECONNECT_ATTEMPTS};

/// Doubling delays between reconnects, capped at eight times the base.
pub(super) struct Backoff {
    base: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(BACKOFF_BASE_MS), MAX_RECONNECT_ATTEMPTS)
    }
}

impl Backoff {
    pub(super) fn new(base: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max_attempts,
            attempt: 0,
        }
    }

    /// Consumes one attempt and returns how long to wait before it.
    pub(super) fn next(&mut self) -> Duration {
        let exponent = self.attempt.min(3);
        self.attempt = self.attempt.saturating_add(1);
        self.base * (1u32 << exponent)
    }

    pub(super) fn attempts(&self) -> u32 {
        self.attempt
    }

    pub(super) fn is_exhausted(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Called once a connection gets all the way to Ready.
    pub(super) fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_then_caps() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..5).map(|_| backoff.next().as_millis() as u64).collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 8_000]);
        assert_eq!(backoff.attempts(), 5);
        assert!(backoff.is_exhausted());

        backoff.reset();
        assert!(!backoff.is_exhausted());
        assert_eq!(backoff.next(), Duration::from_secs(1));
    }

    #[test]
    fn test_custom_limits() {
        let mut backoff = Backoff::new(Duration::from_millis(10), 2);
        assert_eq!(backoff.next(), Duration::from_millis(10));
        assert!(!backoff.is_exhausted());
        assert_eq!(backoff.next(), Duration::from_millis(20));
        assert!(backoff.is_exhausted());
    }
}
