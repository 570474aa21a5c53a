//! Property-based tests for the circuit breaker state machine.
//!
//! Timestamps are passed explicitly through the `*_at` methods, so every
//! transition (including Open → HalfOpen after recovery) is exercised
//! without sleeping.
//!
//! - Starts Closed and admits normal traffic
//! - `failure_threshold` failures inside the window open the circuit
//! - Failures spread wider than the window never open it
//! - Open refuses with a hint no larger than the recovery timeout
//! - HalfOpen admits at most `half_open_max_trials` concurrent trials
//! - All trials succeeding closes; any trial failure reopens

use std::time::Duration;

use proptest::prelude::*;
use tokio::time::Instant;

use vetsync_core::circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitStateKind,
};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_config() -> impl Strategy<Value = CircuitBreakerConfig> {
    (1u32..=10, 100u64..=60_000, 100u64..=60_000, 1u32..=5).prop_map(
        |(threshold, window_ms, recovery_ms, trials)| {
            CircuitBreakerConfig::new(
                threshold,
                Duration::from_millis(window_ms),
                Duration::from_millis(recovery_ms),
                trials,
            )
        },
    )
}

fn open_breaker(config: &CircuitBreakerConfig, start: Instant) -> CircuitBreaker {
    let mut cb = CircuitBreaker::with_name("prop", config.clone());
    for _ in 0..config.failure_threshold {
        let admission = cb.allow_at(start).expect("closed circuit admits");
        cb.record_failure_at(admission, start);
    }
    cb
}

// ────────────────────────────────────────────────────────────────────
// Closed state
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// A new breaker is Closed and admits normal traffic.
    #[test]
    fn prop_starts_closed(config in arb_config()) {
        let now = Instant::now();
        let mut cb = CircuitBreaker::with_name("prop", config);
        prop_assert_eq!(cb.allow_at(now), Ok(Admission::Normal));
        let status = cb.status_at(now);
        prop_assert_eq!(status.state, CircuitStateKind::Closed);
        prop_assert_eq!(status.failures_in_window, 0);
    }

    /// Thresholds and trial counts are normalized to at least 1.
    #[test]
    fn prop_config_normalizes(threshold in 0u32..=3, trials in 0u32..=3) {
        let config = CircuitBreakerConfig::new(
            threshold,
            Duration::from_secs(1),
            Duration::from_secs(1),
            trials,
        );
        prop_assert!(config.failure_threshold >= 1);
        prop_assert!(config.half_open_max_trials >= 1);
    }

    /// Exactly `failure_threshold` failures inside the window open the circuit.
    #[test]
    fn prop_threshold_failures_open(config in arb_config()) {
        let now = Instant::now();
        let mut cb = CircuitBreaker::with_name("prop", config.clone());
        for i in 1..config.failure_threshold {
            let admission = cb.allow_at(now).expect("closed");
            cb.record_failure_at(admission, now);
            let state = cb.status_at(now).state;
            prop_assert_eq!(state, CircuitStateKind::Closed, "after {} failures", i);
        }
        let admission = cb.allow_at(now).expect("closed");
        cb.record_failure_at(admission, now);
        prop_assert_eq!(cb.status_at(now).state, CircuitStateKind::Open);
    }

    /// Failures spaced further apart than the window never accumulate.
    #[test]
    fn prop_spread_failures_stay_closed(config in arb_config(), count in 1usize..=30) {
        prop_assume!(config.failure_threshold >= 2);
        let start = Instant::now();
        let step = config.monitoring_window + Duration::from_millis(1);
        let mut cb = CircuitBreaker::with_name("prop", config.clone());
        let mut now = start;
        for _ in 0..count {
            let admission = cb.allow_at(now).expect("closed");
            cb.record_failure_at(admission, now);
            now += step;
        }
        let status = cb.status_at(now - step);
        prop_assert_eq!(status.state, CircuitStateKind::Closed);
        prop_assert_eq!(status.failures_in_window, 1);
    }
}

// ────────────────────────────────────────────────────────────────────
// Open state
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// While open, calls are refused with a positive hint bounded by the
    /// recovery timeout.
    #[test]
    fn prop_open_refuses_with_hint(config in arb_config(), frac in 0.0f64..0.99) {
        let start = Instant::now();
        let mut cb = open_breaker(&config, start);
        let elapsed = config.recovery_timeout.mul_f64(frac);
        let hint = cb.allow_at(start + elapsed);
        prop_assert!(hint.is_err());
        let hint_ms = hint.unwrap_err();
        prop_assert!(hint_ms >= 1);
        prop_assert!(u128::from(hint_ms) <= config.recovery_timeout.as_millis().max(1));
        prop_assert_eq!(cb.status_at(start + elapsed).rejected_total, 1);
    }

    /// After the recovery timeout the next call is a trial.
    #[test]
    fn prop_recovery_admits_trial(config in arb_config()) {
        let start = Instant::now();
        let mut cb = open_breaker(&config, start);
        let later = start + config.recovery_timeout;
        prop_assert_eq!(cb.allow_at(later), Ok(Admission::Trial));
        prop_assert_eq!(cb.status_at(later).state, CircuitStateKind::HalfOpen);
    }
}

// ────────────────────────────────────────────────────────────────────
// Half-open state
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// No more than `half_open_max_trials` trials run concurrently.
    #[test]
    fn prop_half_open_bounds_trials(config in arb_config(), extra in 1u32..=5) {
        let start = Instant::now();
        let mut cb = open_breaker(&config, start);
        let later = start + config.recovery_timeout;
        let mut admitted = 0u32;
        for _ in 0..config.half_open_max_trials + extra {
            if cb.allow_at(later).is_ok() {
                admitted += 1;
            }
        }
        prop_assert_eq!(admitted, config.half_open_max_trials);
    }

    /// All trials succeeding closes the circuit.
    #[test]
    fn prop_successful_trials_close(config in arb_config()) {
        let start = Instant::now();
        let mut cb = open_breaker(&config, start);
        let later = start + config.recovery_timeout;
        let admissions: Vec<Admission> = (0..config.half_open_max_trials)
            .map(|_| cb.allow_at(later).expect("trial slot"))
            .collect();
        for admission in admissions {
            prop_assert_eq!(cb.status_at(later).state, CircuitStateKind::HalfOpen);
            cb.record_success_at(admission, later);
        }
        let status = cb.status_at(later);
        prop_assert_eq!(status.state, CircuitStateKind::Closed);
        prop_assert_eq!(status.failures_in_window, 0);
    }

    /// Any trial failure reopens the circuit and restarts the timer.
    #[test]
    fn prop_trial_failure_reopens(config in arb_config(), successes_first in 0u32..=4) {
        let start = Instant::now();
        let mut cb = open_breaker(&config, start);
        let later = start + config.recovery_timeout;
        let successes_first = successes_first.min(config.half_open_max_trials - 1);
        for _ in 0..successes_first {
            let admission = cb.allow_at(later).expect("trial slot");
            cb.record_success_at(admission, later);
        }
        let admission = cb.allow_at(later).expect("trial slot");
        cb.record_failure_at(admission, later);

        let status = cb.status_at(later);
        prop_assert_eq!(status.state, CircuitStateKind::Open);
        let recovery_ms = config.recovery_timeout.as_millis() as u64;
        prop_assert_eq!(status.cooldown_remaining_ms, Some(recovery_ms));
        prop_assert!(cb.allow_at(later).is_err());
    }
}
