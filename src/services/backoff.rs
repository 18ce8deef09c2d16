//! Capped exponential backoff with jitter.
//!
//! Used by the lifecycle manager for spawn retries and by the gateway
//! client for reconnection. Delay doubles per attempt, is capped, and
//! carries symmetric jitter so a cohort of retrying agents does not
//! thunder back in lockstep.

use rand::Rng;
use std::time::Duration;

/// Retry policy: `min(base * 2^attempt, cap)` with ±`jitter` applied.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_ms: u64,
    pub cap_ms: u64,
    /// Symmetric jitter fraction in `[0.0, 1.0)`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_ms: 1_000,
            cap_ms: 300_000, // 5 minutes
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_ms: u64, cap_ms: u64) -> Self {
        Self { max_retries, base_ms, cap_ms, ..Self::default() }
    }

    /// Reconnection profile: 1 s floor, 30 s cap, unbounded attempts.
    pub fn reconnect(base_ms: u64, cap_ms: u64) -> Self {
        Self { max_retries: u32::MAX, base_ms, cap_ms, jitter: 0.25 }
    }

    /// Deterministic delay before jitter, for attempt numbers from 0.
    pub fn raw_delay(&self, attempt: u32) -> Duration {
        let ms = self
            .base_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(self.cap_ms);
        Duration::from_millis(ms)
    }

    /// Jittered delay for the given attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.raw_delay(attempt).as_millis() as f64;
        let spread = raw * self.jitter;
        let jittered = if spread > 0.0 {
            rand::thread_rng().gen_range(raw - spread..=raw + spread)
        } else {
            raw
        };
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    pub const fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, 1_000, 300_000);
        assert_eq!(policy.raw_delay(0), Duration::from_millis(1_000));
        assert_eq!(policy.raw_delay(1), Duration::from_millis(2_000));
        assert_eq!(policy.raw_delay(2), Duration::from_millis(4_000));
        assert_eq!(policy.raw_delay(8), Duration::from_millis(256_000));
        assert_eq!(policy.raw_delay(9), Duration::from_millis(300_000));
        assert_eq!(policy.raw_delay(40), Duration::from_millis(300_000));
    }

    #[test]
    fn test_jittered_delay_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..10 {
            let raw = policy.raw_delay(attempt).as_millis() as f64;
            for _ in 0..50 {
                let delay = policy.delay(attempt).as_millis() as f64;
                assert!(delay >= raw * (1.0 - policy.jitter) - 1.0);
                assert!(delay <= raw * (1.0 + policy.jitter) + 1.0);
                assert!(delay <= policy.cap_ms as f64 * (1.0 + policy.jitter) + 1.0);
            }
        }
    }

    #[test]
    fn test_consecutive_delays_bounded_by_doubling() {
        let policy = RetryPolicy::default();
        for attempt in 1..12 {
            let prev = policy.raw_delay(attempt - 1).as_millis() as f64;
            let next = policy.delay(attempt).as_millis() as f64;
            assert!(next <= 2.0 * prev * (1.0 + policy.jitter) + 1.0);
        }
    }

    #[test]
    fn test_allows_respects_max_retries() {
        let policy = RetryPolicy::new(2, 100, 1_000);
        assert!(policy.allows(0));
        assert!(policy.allows(1));
        assert!(!policy.allows(2));
    }

    #[test]
    fn test_no_overflow_on_huge_attempts() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.raw_delay(u32::MAX), Duration::from_millis(policy.cap_ms));
    }
}
