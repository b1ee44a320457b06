//! Reconnect delays: exponential growth, a cap, and up to 25% extra jitter.

use rand::Rng;
use std::time::Duration;

/// Share of the delay added as random jitter, at most.
pub const JITTER_RATIO: f64 = 0.25;

/// Retry schedule for dialing the control plane.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_retries: u32,
    retries: u32,
}

impl Backoff {
    /// `max_retries` of zero means keep trying forever.
    pub fn new(base: Duration, max: Duration, max_retries: u32) -> Self {
        Self {
            base,
            max,
            max_retries,
            retries: 0,
        }
    }

    /// Record a failed attempt and return how long to wait before the next.
    pub fn next_delay(&mut self) -> Duration {
        self.retries = self.retries.saturating_add(1);
        let delay = self.delay_for(self.retries);
        delay + delay.mul_f64(rand::rng().random_range(0.0..=JITTER_RATIO))
    }

    /// Delay before jitter for the given retry count: `min(base * 2^(retry-1), max)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }

    /// Forget past failures after a successful connect.
    pub fn reset(&mut self) {
        self.retries = 0;
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// True once the configured ceiling has been reached.
    pub fn exhausted(&self) -> bool {
        self.max_retries != 0 && self.retries >= self.max_retries
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(120), 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_cap() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay_for(1), Duration::from_secs(1));
        assert_eq!(backoff.delay_for(2), Duration::from_secs(2));
        assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
        assert_eq!(backoff.delay_for(7), Duration::from_secs(64));
        assert_eq!(backoff.delay_for(8), Duration::from_secs(120));
        assert_eq!(backoff.delay_for(500), Duration::from_secs(120));
    }

    #[test]
    fn non_decreasing_and_bounded() {
        let mut backoff = Backoff::default();
        let max = Duration::from_secs(120);
        let mut previous = Duration::ZERO;
        for retry in 1..64 {
            let base = backoff.delay_for(retry);
            assert!(base >= previous);
            previous = base;

            let jittered = backoff.next_delay();
            assert!(jittered >= base);
            assert!(jittered <= max.mul_f64(1.0 + JITTER_RATIO));
        }
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff = Backoff::default();
        for _ in 0..5 {
            let _ = backoff.next_delay();
        }
        assert_eq!(backoff.retries(), 5);
        backoff.reset();
        assert_eq!(backoff.retries(), 0);
        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_millis(1250));
    }

    #[test]
    fn ceiling() {
        let mut unlimited = Backoff::default();
        for _ in 0..1000 {
            let _ = unlimited.next_delay();
        }
        assert!(!unlimited.exhausted());

        let mut limited = Backoff::new(Duration::from_millis(1), Duration::from_millis(10), 3);
        let _ = limited.next_delay();
        let _ = limited.next_delay();
        assert!(!limited.exhausted());
        let _ = limited.next_delay();
        assert!(limited.exhausted());
    }
}
