//! Exponential backoff for queued mutation delivery.
//!
//! The sync engine consults [`RetryPolicy`] after every retryable delivery
//! failure to compute the item's next eligible attempt time. The attempt
//! ceiling itself lives on each queued mutation (`max_attempts`), so the
//! policy only shapes the delay curve:
//!
//! ```text
//! delay(n) = min(initial * factor^(n-1), max) ± jitter
//! ```
//!
//! A server-provided `retry_after` hint raises the delay to at least the hint.

use std::time::Duration;

use rand::Rng;

/// Backoff curve for delivery retries.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt (default: 1s).
    pub initial_delay: Duration,
    /// Upper bound on the computed delay before jitter (default: 5m).
    pub max_delay: Duration,
    /// Multiplier applied per additional attempt (default: 2.0).
    pub backoff_factor: f64,
    /// Random jitter range as a fraction (default: 0.2 = ±20%).
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            jitter_percent: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Create a policy, clamping the factor to >= 1.0 and jitter to 0.0..=1.0.
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
        }
    }

    /// Policy without jitter; handy where delays must be predictable.
    #[must_use]
    pub fn deterministic(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
    ) -> Self {
        Self::new(initial_delay, max_delay, backoff_factor, 0.0)
    }

    /// Delay before the next try, given how many attempts have failed so far.
    ///
    /// `failed_attempts` is 1-based: after the first failure pass 1. Zero is
    /// treated as one.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // ms values are well within f64 precision for delays
    #[allow(clippy::cast_possible_wrap)] // exponent is capped at 31
    pub fn delay_for_attempt(&self, failed_attempts: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let exp = failed_attempts.saturating_sub(1).min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 && base_ms > 0.0 {
            let jitter_range = base_ms * self.jitter_percent;
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let delay_ms = (base_ms + jitter).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }

    /// Backoff delay, raised to honor a server `retry_after` hint.
    #[must_use]
    pub fn delay_with_hint(&self, failed_attempts: u32, retry_after: Option<Duration>) -> Duration {
        let delay = self.delay_for_attempt(failed_attempts);
        match retry_after {
            Some(hint) => delay.max(hint),
            None => delay,
        }
    }

    /// Largest delay this policy can produce, jitter included.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn max_jittered_delay(&self) -> Duration {
        self.max_delay.mul_f64(1.0 + self.jitter_percent)
    }
}
