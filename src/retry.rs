//! Bounded exponential backoff with full jitter.

use std::time::Duration;

use rand::Rng;

/// Backoff policy: `base * 2^attempt`, capped, with full jitter (a
/// uniform draw from zero to the capped value).
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Total attempts including the first.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Policy for transient backend errors: 2 attempts, 200 ms base, 2 s cap.
    pub fn transient() -> Self {
        Self {
            base: Duration::from_millis(200),
            cap: Duration::from_secs(2),
            max_attempts: 2,
        }
    }

    /// Policy for liveness probes: 3 attempts, 150 ms base, 1 s cap.
    pub fn probe() -> Self {
        Self {
            base: Duration::from_millis(150),
            cap: Duration::from_secs(1),
            max_attempts: 3,
        }
    }

    /// Jittered delay before retry number `attempt` (0-based: the delay
    /// after the first failure is `delay(0)`).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap);
        if exp.is_zero() {
            return Duration::ZERO;
        }
        let jittered = rand::rng().random_range(0..=exp.as_millis() as u64);
        Duration::from_millis(jittered)
    }
}
