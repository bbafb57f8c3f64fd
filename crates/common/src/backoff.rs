//! Jittered exponential backoff for retry loops.
//!
//! Used by the certificate coordinator between conflicting durable writes so
//! that processes racing on the same slot spread out instead of colliding on
//! every retry.

use rand::Rng;
use std::time::Duration;
use tracing::trace;

/// Exponential backoff with additive random jitter.
///
/// The nth delay is `min(base * 2^n, max)` plus a uniformly random jitter in
/// `[0, delay / 2]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Delay before the next retry; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);

        let jitter_cap = delay.as_millis() as u64 / 2;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_cap)
        };

        let total = delay + Duration::from_millis(jitter);
        trace!(
            attempt = self.attempt,
            delay_ms = total.as_millis() as u64,
            "Computed backoff delay"
        );
        total
    }

    /// Delay before jitter for the current attempt.
    pub fn ceiling(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt.min(16)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
