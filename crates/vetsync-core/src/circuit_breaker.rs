//! Circuit breakers guarding the backing store, one per operation class.
//!
//! Each breaker is a small state machine:
//!
//! - `Closed`: calls pass; failures are counted in a rolling monitoring
//!   window. Reaching the threshold inside the window opens the circuit.
//! - `Open`: calls fail fast with a `retry_after` hint. Once the recovery
//!   timeout elapses the next call moves the breaker to `HalfOpen`.
//! - `HalfOpen`: at most `half_open_max_trials` trial calls are admitted.
//!   All of them succeeding closes the circuit; any failure reopens it and
//!   restarts the recovery timer.
//!
//! Breakers live in a [`CircuitBreakerRegistry`] that the server constructs
//! and hands to request handlers; there is no process-global registry.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ResilienceConfig;
use crate::error::ResilienceError;
use crate::priority::OperationClass;

/// Configuration for a circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures within `monitoring_window` that open the circuit.
    pub failure_threshold: u32,
    /// Rolling window over which failures are counted.
    pub monitoring_window: Duration,
    /// Time spent open before trial calls are admitted.
    pub recovery_timeout: Duration,
    /// Trial calls admitted while half-open; all must succeed to close.
    pub half_open_max_trials: u32,
}

impl CircuitBreakerConfig {
    /// Create a new configuration. Threshold and trial count are at least 1.
    #[must_use]
    pub fn new(
        failure_threshold: u32,
        monitoring_window: Duration,
        recovery_timeout: Duration,
        half_open_max_trials: u32,
    ) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            monitoring_window,
            recovery_timeout,
            half_open_max_trials: half_open_max_trials.max(1),
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            monitoring_window: Duration::from_secs(30),
            recovery_timeout: Duration::from_secs(15),
            half_open_max_trials: 2,
        }
    }
}

#[derive(Debug, Clone)]
enum CircuitState {
    Closed,
    Open { opened_at: Instant },
    HalfOpen { in_flight: u32, successes: u32 },
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Normal traffic through a closed circuit.
    Normal,
    /// One of the bounded half-open trial calls.
    Trial,
}

/// Public-facing circuit state for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStateKind {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitStateKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Snapshot of circuit breaker status for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStatus {
    pub state: CircuitStateKind,
    pub failures_in_window: u32,
    pub failure_threshold: u32,
    pub monitoring_window_ms: u64,
    pub recovery_timeout_ms: u64,
    pub open_for_ms: Option<u64>,
    pub cooldown_remaining_ms: Option<u64>,
    pub half_open_in_flight: Option<u32>,
    pub half_open_successes: Option<u32>,
    pub half_open_max_trials: u32,
    /// Calls refused without reaching the store since creation.
    pub rejected_total: u64,
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Circuit breaker state machine.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: CircuitState,
    failures: VecDeque<Instant>,
    rejected_total: u64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with a stable name.
    #[must_use]
    pub fn with_name(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            rejected_total: 0,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn prune_window(&mut self, now: Instant) {
        while let Some(&front) = self.failures.front() {
            if now.saturating_duration_since(front) > self.config.monitoring_window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open { opened_at: now };
    }

    /// Check whether a call may proceed at `now`.
    ///
    /// On refusal returns the suggested wait in milliseconds.
    pub fn allow_at(&mut self, now: Instant) -> Result<Admission, u64> {
        match self.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open { opened_at } => {
                let open_for = now.saturating_duration_since(opened_at);
                if open_for >= self.config.recovery_timeout {
                    self.state = CircuitState::HalfOpen {
                        in_flight: 1,
                        successes: 0,
                    };
                    info!(
                        circuit = %self.name,
                        "Circuit transitioned to half-open after recovery timeout"
                    );
                    Ok(Admission::Trial)
                } else {
                    self.rejected_total += 1;
                    Err(millis(self.config.recovery_timeout - open_for).max(1))
                }
            }
            CircuitState::HalfOpen {
                in_flight,
                successes,
            } => {
                if in_flight + successes < self.config.half_open_max_trials {
                    self.state = CircuitState::HalfOpen {
                        in_flight: in_flight + 1,
                        successes,
                    };
                    Ok(Admission::Trial)
                } else {
                    self.rejected_total += 1;
                    Err(millis(self.config.recovery_timeout).max(1))
                }
            }
        }
    }

    /// Check whether a call may proceed now.
    pub fn allow(&mut self) -> Result<Admission, u64> {
        self.allow_at(Instant::now())
    }

    /// Record a successful call admitted as `admission`.
    pub fn record_success_at(&mut self, admission: Admission, now: Instant) {
        match self.state {
            CircuitState::Closed => self.prune_window(now),
            CircuitState::HalfOpen {
                in_flight,
                successes,
            } if admission == Admission::Trial => {
                let successes = successes + 1;
                if successes >= self.config.half_open_max_trials {
                    self.failures.clear();
                    self.state = CircuitState::Closed;
                    info!(circuit = %self.name, "Circuit closed after successful trials");
                } else {
                    self.state = CircuitState::HalfOpen {
                        in_flight: in_flight.saturating_sub(1),
                        successes,
                    };
                }
            }
            // Stale outcomes from calls admitted before the circuit opened.
            CircuitState::HalfOpen { .. } | CircuitState::Open { .. } => {}
        }
    }

    /// Record a failed call admitted as `admission`.
    pub fn record_failure_at(&mut self, admission: Admission, now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.failures.push_back(now);
                self.prune_window(now);
                let failures = u32::try_from(self.failures.len()).unwrap_or(u32::MAX);
                if failures >= self.config.failure_threshold {
                    self.open(now);
                    warn!(
                        circuit = %self.name,
                        failures,
                        threshold = self.config.failure_threshold,
                        window_ms = millis(self.config.monitoring_window),
                        "Circuit opened after failures within monitoring window"
                    );
                } else {
                    debug!(circuit = %self.name, failures, "Circuit recorded failure");
                }
            }
            CircuitState::HalfOpen { .. } if admission == Admission::Trial => {
                self.open(now);
                warn!(circuit = %self.name, "Circuit re-opened after half-open trial failure");
            }
            CircuitState::HalfOpen { .. } | CircuitState::Open { .. } => {}
        }
    }

    /// Give back a trial slot whose call ended without an outcome.
    pub fn release_trial(&mut self) {
        if let CircuitState::HalfOpen {
            in_flight,
            successes,
        } = self.state
        {
            self.state = CircuitState::HalfOpen {
                in_flight: in_flight.saturating_sub(1),
                successes,
            };
        }
    }

    /// Status snapshot as of `now`.
    #[must_use]
    pub fn status_at(&self, now: Instant) -> CircuitBreakerStatus {
        let failures_in_window = self
            .failures
            .iter()
            .filter(|&&at| now.saturating_duration_since(at) <= self.config.monitoring_window)
            .count();
        let mut status = CircuitBreakerStatus {
            state: CircuitStateKind::Closed,
            failures_in_window: u32::try_from(failures_in_window).unwrap_or(u32::MAX),
            failure_threshold: self.config.failure_threshold,
            monitoring_window_ms: millis(self.config.monitoring_window),
            recovery_timeout_ms: millis(self.config.recovery_timeout),
            open_for_ms: None,
            cooldown_remaining_ms: None,
            half_open_in_flight: None,
            half_open_successes: None,
            half_open_max_trials: self.config.half_open_max_trials,
            rejected_total: self.rejected_total,
        };
        match self.state {
            CircuitState::Closed => {}
            CircuitState::Open { opened_at } => {
                let open_for = now.saturating_duration_since(opened_at);
                status.open_for_ms = Some(millis(open_for));
                match self.config.recovery_timeout.checked_sub(open_for) {
                    Some(remaining) if !remaining.is_zero() => {
                        status.state = CircuitStateKind::Open;
                        status.cooldown_remaining_ms = Some(millis(remaining));
                    }
                    // Cooldown over: the next call becomes a trial.
                    _ => {
                        status.state = CircuitStateKind::HalfOpen;
                        status.half_open_in_flight = Some(0);
                        status.half_open_successes = Some(0);
                    }
                }
            }
            CircuitState::HalfOpen {
                in_flight,
                successes,
            } => {
                status.state = CircuitStateKind::HalfOpen;
                status.half_open_in_flight = Some(in_flight);
                status.half_open_successes = Some(successes);
            }
        }
        status
    }

    #[must_use]
    pub fn status(&self) -> CircuitBreakerStatus {
        self.status_at(Instant::now())
    }
}

/// Snapshot of a named circuit breaker for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub class: OperationClass,
    pub status: CircuitBreakerStatus,
}

fn lock(breaker: &Mutex<CircuitBreaker>) -> MutexGuard<'_, CircuitBreaker> {
    breaker.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Permission for one call through a breaker.
///
/// Report the outcome with [`BreakerPermit::success`] or
/// [`BreakerPermit::failure`]. Dropping the permit without an outcome (for
/// example when the request is cancelled) releases a half-open trial slot.
#[must_use = "record the call outcome on the permit"]
#[derive(Debug)]
pub struct BreakerPermit<'a> {
    breaker: &'a Mutex<CircuitBreaker>,
    admission: Admission,
    settled: bool,
}

impl BreakerPermit<'_> {
    #[must_use]
    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub fn success(mut self) {
        self.settled = true;
        lock(self.breaker).record_success_at(self.admission, Instant::now());
    }

    pub fn failure(mut self) {
        self.settled = true;
        lock(self.breaker).record_failure_at(self.admission, Instant::now());
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            lock(self.breaker).release_trial();
        }
    }
}

/// Circuit breakers for every operation class.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: BTreeMap<OperationClass, Mutex<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Build a registry with a breaker per class, configured by `config_for`.
    pub fn new(config_for: impl Fn(OperationClass) -> CircuitBreakerConfig) -> Self {
        let breakers = OperationClass::ALL
            .into_iter()
            .map(|class| {
                let breaker = CircuitBreaker::with_name(class.as_str(), config_for(class));
                (class, Mutex::new(breaker))
            })
            .collect();
        Self { breakers }
    }

    /// Every class shares one configuration.
    #[must_use]
    pub fn uniform(config: &CircuitBreakerConfig) -> Self {
        Self::new(|_| config.clone())
    }

    #[must_use]
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(|class| config.breaker_for(class))
    }

    fn breaker(&self, class: OperationClass) -> &Mutex<CircuitBreaker> {
        // Every class is registered in `new`.
        &self.breakers[&class]
    }

    /// Ask the class breaker for permission to call the backing store.
    pub fn acquire(&self, class: OperationClass) -> Result<BreakerPermit<'_>, ResilienceError> {
        let breaker = self.breaker(class);
        let admitted = lock(breaker).allow();
        match admitted {
            Ok(admission) => Ok(BreakerPermit {
                breaker,
                admission,
                settled: false,
            }),
            Err(retry_after_ms) => Err(ResilienceError::CircuitOpen {
                class: class.as_str().to_string(),
                retry_after_ms,
            }),
        }
    }

    #[must_use]
    pub fn status(&self, class: OperationClass) -> CircuitBreakerStatus {
        lock(self.breaker(class)).status()
    }

    /// Snapshot every breaker, in class order.
    #[must_use]
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        self.breakers
            .iter()
            .map(|(class, breaker)| CircuitBreakerSnapshot {
                class: *class,
                status: lock(breaker).status(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, trials: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(
            threshold,
            Duration::from_secs(30),
            Duration::from_secs(10),
            trials,
        )
    }

    #[test]
    fn circuit_opens_after_threshold() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreaker::with_name("test", config(2, 1));

        assert_eq!(breaker.allow_at(t0), Ok(Admission::Normal));
        breaker.record_failure_at(Admission::Normal, t0);
        assert_eq!(breaker.status_at(t0).state, CircuitStateKind::Closed);

        breaker.record_failure_at(Admission::Normal, t0);
        let status = breaker.status_at(t0);
        assert_eq!(status.state, CircuitStateKind::Open);
        assert_eq!(status.cooldown_remaining_ms, Some(10_000));
        assert_eq!(breaker.allow_at(t0 + Duration::from_secs(4)), Err(6_000));
        assert_eq!(breaker.status_at(t0).rejected_total, 1);
    }

    #[test]
    fn failures_outside_window_do_not_count() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreaker::with_name("test", config(2, 1));

        breaker.record_failure_at(Admission::Normal, t0);
        let later = t0 + Duration::from_secs(31);
        breaker.record_failure_at(Admission::Normal, later);
        assert_eq!(breaker.status_at(later).state, CircuitStateKind::Closed);
        assert_eq!(breaker.status_at(later).failures_in_window, 1);
    }

    #[test]
    fn half_open_admits_bounded_trials() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreaker::with_name("test", config(1, 2));
        breaker.record_failure_at(Admission::Normal, t0);

        let t1 = t0 + Duration::from_secs(10);
        assert_eq!(breaker.status_at(t1).state, CircuitStateKind::HalfOpen);
        assert_eq!(breaker.allow_at(t1), Ok(Admission::Trial));
        assert_eq!(breaker.allow_at(t1), Ok(Admission::Trial));
        assert!(breaker.allow_at(t1).is_err());

        breaker.record_success_at(Admission::Trial, t1);
        assert_eq!(breaker.status_at(t1).state, CircuitStateKind::HalfOpen);
        // Completed trials still count toward the bound.
        assert!(breaker.allow_at(t1).is_err());

        breaker.record_success_at(Admission::Trial, t1);
        assert_eq!(breaker.status_at(t1).state, CircuitStateKind::Closed);
        assert_eq!(breaker.status_at(t1).failures_in_window, 0);
    }

    #[test]
    fn half_open_failure_reopens_and_restarts_timer() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreaker::with_name("test", config(1, 2));
        breaker.record_failure_at(Admission::Normal, t0);

        let t1 = t0 + Duration::from_secs(12);
        assert_eq!(breaker.allow_at(t1), Ok(Admission::Trial));
        breaker.record_failure_at(Admission::Trial, t1);

        let status = breaker.status_at(t1);
        assert_eq!(status.state, CircuitStateKind::Open);
        assert_eq!(status.cooldown_remaining_ms, Some(10_000));
    }

    #[test]
    fn stale_normal_outcome_ignored_while_half_open() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreaker::with_name("test", config(1, 1));
        breaker.record_failure_at(Admission::Normal, t0);
        let t1 = t0 + Duration::from_secs(10);
        assert_eq!(breaker.allow_at(t1), Ok(Admission::Trial));

        breaker.record_failure_at(Admission::Normal, t1);
        assert_eq!(breaker.status_at(t1).state, CircuitStateKind::HalfOpen);
    }

    #[test]
    fn released_trial_frees_slot() {
        let t0 = Instant::now();
        let mut breaker = CircuitBreaker::with_name("test", config(1, 1));
        breaker.record_failure_at(Admission::Normal, t0);
        let t1 = t0 + Duration::from_secs(10);

        assert_eq!(breaker.allow_at(t1), Ok(Admission::Trial));
        assert!(breaker.allow_at(t1).is_err());
        breaker.release_trial();
        assert_eq!(breaker.allow_at(t1), Ok(Admission::Trial));
    }

    #[test]
    fn registry_isolates_classes() {
        let registry = CircuitBreakerRegistry::uniform(&config(1, 1));
        registry
            .acquire(OperationClass::Analytics)
            .unwrap()
            .failure();

        let err = registry.acquire(OperationClass::Analytics).unwrap_err();
        assert!(matches!(
            err,
            ResilienceError::CircuitOpen { ref class, .. } if class == "analytics"
        ));
        assert!(registry.acquire(OperationClass::AdministrationWrite).is_ok());
        assert_eq!(
            registry.status(OperationClass::Analytics).state,
            CircuitStateKind::Open
        );
        assert_eq!(registry.snapshots().len(), OperationClass::ALL.len());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_permit_releases_trial() {
        let registry = CircuitBreakerRegistry::uniform(&CircuitBreakerConfig::new(
            1,
            Duration::from_secs(30),
            Duration::from_secs(5),
            1,
        ));
        registry.acquire(OperationClass::Read).unwrap().failure();
        tokio::time::advance(Duration::from_secs(5)).await;

        let permit = registry.acquire(OperationClass::Read).unwrap();
        assert_eq!(permit.admission(), Admission::Trial);
        assert!(registry.acquire(OperationClass::Read).is_err());
        drop(permit);

        let permit = registry.acquire(OperationClass::Read).unwrap();
        permit.success();
        assert_eq!(
            registry.status(OperationClass::Read).state,
            CircuitStateKind::Closed
        );
    }

    #[test]
    fn registry_from_config_uses_class_overrides() {
        let registry = CircuitBreakerRegistry::from_config(&ResilienceConfig::default());
        assert_eq!(
            registry.status(OperationClass::Batch).failure_threshold,
            3
        );
        assert_eq!(
            registry
                .status(OperationClass::AdministrationWrite)
                .failure_threshold,
            5
        );
    }
}
