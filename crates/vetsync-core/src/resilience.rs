//! The server's resilience layer: breakers, rate limits and admission.
//!
//! A [`ResilienceLayer`] is constructed once per server and shared with
//! request handlers through an `Arc`. Tests build isolated instances.

use serde::{Deserialize, Serialize};

use crate::admission::{AdmissionController, AdmissionSnapshot};
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerSnapshot, CircuitStateKind};
use crate::config::ResilienceConfig;
use crate::rate_limiter::{RateLimitSnapshot, RateLimiter};

/// Overall health derived from the resilience state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Ok,
    /// At least one circuit is not closed.
    Degraded,
}

/// Detailed resilience health for `/health/detailed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceHealth {
    pub status: HealthStatus,
    pub circuits: Vec<CircuitBreakerSnapshot>,
    pub admission: AdmissionSnapshot,
    pub rate_limit: RateLimitSnapshot,
}

/// Shared resilience state for one server process.
#[derive(Debug)]
pub struct ResilienceLayer {
    pub breakers: CircuitBreakerRegistry,
    pub rate_limiter: RateLimiter,
    pub admission: AdmissionController,
}

impl ResilienceLayer {
    #[must_use]
    pub fn new(
        breakers: CircuitBreakerRegistry,
        rate_limiter: RateLimiter,
        admission: AdmissionController,
    ) -> Self {
        Self {
            breakers,
            rate_limiter,
            admission,
        }
    }

    #[must_use]
    pub fn from_config(config: &ResilienceConfig) -> Self {
        Self::new(
            CircuitBreakerRegistry::from_config(config),
            RateLimiter::from_config(config),
            AdmissionController::new(config.admission.clone()),
        )
    }

    #[must_use]
    pub fn status(&self) -> HealthStatus {
        status_of(&self.breakers.snapshots())
    }

    #[must_use]
    pub fn health(&self) -> ResilienceHealth {
        let circuits = self.breakers.snapshots();
        ResilienceHealth {
            status: status_of(&circuits),
            circuits,
            admission: self.admission.snapshot(),
            rate_limit: self.rate_limiter.snapshot(),
        }
    }
}

fn status_of(circuits: &[CircuitBreakerSnapshot]) -> HealthStatus {
    if circuits
        .iter()
        .any(|snapshot| snapshot.status.state != CircuitStateKind::Closed)
    {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}
