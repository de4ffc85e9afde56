//! Growing delay between retry attempts.

use std::time::Duration;

/// Multiplicative backoff with an optional cap.
///
/// Each call to [`Backoff::linear`] returns the current delay and then
/// multiplies it for the next call.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
    /// Upper bound on the delay; zero means uncapped.
    pub max: Duration,
    /// Factor applied after each call.
    pub multiplier: f64,
}

impl Backoff {
    /// Creates an uncapped backoff starting at `initial`.
    #[must_use]
    pub fn new(initial: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            current: initial,
            max: Duration::ZERO,
            multiplier,
        }
    }

    /// Caps the delay at `max`.
    #[must_use]
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = max;
        self
    }

    /// Returns the delay that the next call will yield.
    #[must_use]
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Returns the current delay and advances it.
    pub fn linear(&mut self) -> Duration {
        let wait = self.current;
        let mut next = self.current.mul_f64(self.multiplier.max(0.0));
        if !self.max.is_zero() && next > self.max {
            next = self.max;
        }
        self.current = next;
        wait
    }

    /// Restarts from the initial delay.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_linear_doubles() {
        let mut backoff = Backoff::new(Duration::from_secs(120), 2.0);
        assert_eq!(backoff.linear(), Duration::from_secs(120));
        assert_eq!(backoff.linear(), Duration::from_secs(240));
        assert_eq!(backoff.linear(), Duration::from_secs(480));
    }

    #[test]
    fn test_linear_respects_cap() {
        let mut backoff =
            Backoff::new(Duration::from_secs(1), 10.0).with_max(Duration::from_secs(5));
        assert_eq!(backoff.linear(), Duration::from_secs(1));
        assert_eq!(backoff.linear(), Duration::from_secs(5));
        assert_eq!(backoff.linear(), Duration::from_secs(5));
    }

    #[test]
    fn test_reset() {
        let mut backoff = Backoff::new(Duration::from_millis(10), 3.0);
        backoff.linear();
        backoff.reset();
        assert_eq!(backoff.current(), Duration::from_millis(10));
    }
}
