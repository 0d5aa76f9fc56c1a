/// Retry delay for transient anchoring failures.
///
/// `delay(attempts) = min(base * 2^attempts, cap) + jitter`, with jitter
/// drawn uniformly from `[0, max_jitter)`.
use std::time::Duration;

use rand::Rng;

/// Exponent at which `base * 2^n` passes any sane cap; larger values are clamped.
const MAX_EXPONENT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            cap: Duration::from_secs(5 * 60),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl BackoffPolicy {
    /// Delay before jitter. `attempts` is the number of earlier failures.
    pub fn base_delay(&self, attempts: u32) -> Duration {
        let factor = 1u32 << attempts.min(MAX_EXPONENT);
        self.base.saturating_mul(factor).min(self.cap)
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        };
        self.base_delay(attempts) + jitter
    }

    /// Absolute time (ms since epoch) of the next attempt.
    pub fn next_attempt_ms(&self, now_ms: i64, attempts: u32) -> i64 {
        now_ms.saturating_add(self.delay(attempts).as_millis() as i64)
    }
}
