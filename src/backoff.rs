//! Exponential reconnection backoff with a cap and random jitter.

use std::time::Duration;

use crate::constants::{BACKOFF_INITIAL, BACKOFF_JITTER, BACKOFF_MAX};

/// Reconnection delay policy.
///
/// Attempt `n` (1-based) waits `min(initial * 2^(n-1), max)` plus a random
/// jitter in `[0, jitter]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Cap for the exponential part.
    pub max: Duration,
    /// Upper bound of the random jitter.
    pub jitter: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: BACKOFF_INITIAL,
            max: BACKOFF_MAX,
            jitter: BACKOFF_JITTER,
        }
    }
}

impl Backoff {
    /// Exponential part of the delay for `attempt`, without jitter.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << shift)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Full delay for `attempt`, including jitter.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::random::<u64>() % jitter_ms.saturating_add(1))
        };
        self.base_delay(attempt).saturating_add(jitter)
    }
}
