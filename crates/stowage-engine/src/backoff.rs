//! Retry delay calculation

use rand::Rng;
use std::time::Duration;
use stowage_common::config::ProcessorConfig;

/// Exponential backoff with proportional jitter
///
/// `delay(n) = min(base * 2^(n-1), cap) + uniform(0, jitter_ratio * that)`
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    base_ms: u64,
    cap_ms: u64,
    jitter_ratio: f64,
}

impl Backoff {
    #[must_use]
    pub fn new(base: Duration, cap: Duration, jitter_ratio: f64) -> Self {
        Self {
            base_ms: u64::try_from(base.as_millis()).unwrap_or(u64::MAX).max(1),
            cap_ms: u64::try_from(cap.as_millis()).unwrap_or(u64::MAX).max(1),
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
        }
    }

    #[must_use]
    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
            config.jitter_ratio,
        )
    }

    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based), without jitter
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(63);
        let delay = self
            .base_ms
            .checked_mul(1u64 << shift)
            .unwrap_or(u64::MAX)
            .min(self.cap_ms);
        Duration::from_millis(delay)
    }

    /// Delay with jitter applied
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let max_jitter = (delay.as_millis() as f64 * self.jitter_ratio) as u64;
        if max_jitter == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
    }
}
