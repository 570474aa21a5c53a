//! Server-side mutation handling.
//!
//! Every submission passes, in order: request checks, payload validation,
//! the caller's rate limit, the operation-class circuit breaker, and the
//! admission queue. Only an admitted request obtains a store connection, and
//! the admission permit is held until the blocking store call returns, even
//! if the HTTP caller has already been answered with a timeout.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::backing_store::{BackingStore, DomainError, StoreError};
use crate::config::Config;
use crate::error::{LedgerError, ResilienceError, ValidationError};
use crate::ledger::request_fingerprint;
use crate::mutation::validate_payload;
use crate::resilience::{HealthStatus, ResilienceLayer};
use crate::wire::{BasicHealth, DetailedHealth, ErrorBody, SubmitRequest, SubmitResponse, codes};

const DEFAULT_MAX_PAYLOAD_BYTES: usize = 64 * 1024;
const OVERLOAD_RETRY_HINT_MS: u64 = 1_000;

/// Failure of a single submission, mapped onto the wire error contract.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("no such endpoint")]
    NotFound,

    #[error("invalid payload: {0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Domain(DomainError),

    #[error("idempotency key {operation_key} was already used for a different request")]
    Conflict { operation_key: String },

    #[error(transparent)]
    Resilience(#[from] ResilienceError),

    #[error("store call exceeded {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("backing store unavailable: {0}")]
    Store(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for ServiceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Domain(domain) => Self::Domain(domain),
            StoreError::Ledger(LedgerError::Conflict { operation_key }) => {
                Self::Conflict { operation_key }
            }
            other => Self::Store(other.to_string()),
        }
    }
}

impl ServiceError {
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::NotFound => 404,
            Self::Conflict { .. } => 409,
            Self::Validation(_) | Self::Domain(_) => 422,
            Self::Resilience(ResilienceError::RateLimited { .. }) => 429,
            Self::Resilience(_) => 503,
            Self::Timeout { .. } => 504,
            Self::Store(_) | Self::Internal(_) => 500,
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => codes::BAD_REQUEST,
            Self::NotFound => codes::NOT_FOUND,
            Self::Validation(_) => codes::VALIDATION_FAILED,
            Self::Domain(domain) => domain.code,
            Self::Conflict { .. } => codes::IDEMPOTENCY_CONFLICT,
            Self::Resilience(ResilienceError::RateLimited { .. }) => codes::RATE_LIMITED,
            Self::Resilience(ResilienceError::CircuitOpen { .. }) => codes::CIRCUIT_OPEN,
            Self::Resilience(_) => codes::OVERLOADED,
            Self::Timeout { .. } => codes::TIMEOUT,
            Self::Store(_) => codes::STORE_UNAVAILABLE,
            Self::Internal(_) => codes::INTERNAL,
        }
    }

    /// Whether the client should keep the item and try again later.
    #[must_use]
    pub fn retryable(&self) -> bool {
        matches!(self.status_code(), 429 | 500 | 503 | 504)
    }

    #[must_use]
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::Resilience(err) => err.retry_after_ms().or(Some(OVERLOAD_RETRY_HINT_MS)),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            retryable: self.retryable(),
            retry_after_ms: self.retry_after_ms(),
        }
    }
}

/// Applies submitted mutations behind the resilience layer.
#[derive(Debug)]
pub struct MutationService {
    store: BackingStore,
    resilience: Arc<ResilienceLayer>,
    request_timeout: Duration,
    max_payload_bytes: usize,
}

impl MutationService {
    #[must_use]
    pub fn new(
        store: BackingStore,
        resilience: Arc<ResilienceLayer>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            resilience,
            request_timeout,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
        }
    }

    #[must_use]
    pub fn with_max_payload_bytes(mut self, max_payload_bytes: usize) -> Self {
        self.max_payload_bytes = max_payload_bytes;
        self
    }

    /// Open the configured store and build a fresh resilience layer.
    pub fn from_config(config: &Config) -> Result<Self, StoreError> {
        let store = BackingStore::open(&config.server.db_path)?;
        let resilience = Arc::new(ResilienceLayer::from_config(&config.resilience));
        Ok(Self::new(store, resilience, config.server.request_timeout())
            .with_max_payload_bytes(config.queue.max_payload_bytes))
    }

    #[must_use]
    pub fn store(&self) -> &BackingStore {
        &self.store
    }

    #[must_use]
    pub fn resilience(&self) -> &Arc<ResilienceLayer> {
        &self.resilience
    }

    /// Apply one submission at most once per idempotency key.
    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, ServiceError> {
        let deadline = Instant::now() + self.request_timeout;

        if request.idempotency_key.trim().is_empty() {
            return Err(ServiceError::BadRequest("idempotencyKey must not be empty".to_string()));
        }
        if request.caller_id.trim().is_empty() {
            return Err(ServiceError::BadRequest("callerId must not be empty".to_string()));
        }
        let payload = validate_payload(request.kind, &request.payload, self.max_payload_bytes)?;
        let class = request.kind.operation_class();

        self.resilience.rate_limiter.check(&request.caller_id, class)?;
        let breaker = self.resilience.breakers.acquire(class)?;
        let admission_deadline =
            deadline.min(Instant::now() + self.resilience.admission.config().max_wait());
        let permit = self.resilience.admission.admit_until(class, admission_deadline).await?;

        let store = self.store.clone();
        let fingerprint = request_fingerprint(request.kind, &request.payload);
        let key = request.idempotency_key.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            store.apply(&key, &payload, &fingerprint)
        });

        match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(Ok(applied))) => {
                breaker.success();
                if applied.replayed {
                    debug!(
                        operation_key = %request.idempotency_key,
                        caller = %request.caller_id,
                        "Replayed stored result"
                    );
                } else {
                    info!(
                        operation_key = %request.idempotency_key,
                        kind = %request.kind,
                        caller = %request.caller_id,
                        "Mutation applied"
                    );
                }
                Ok(SubmitResponse {
                    result: applied.value,
                    replayed: applied.replayed,
                })
            }
            Ok(Ok(Err(err))) => {
                if err.is_infrastructure() {
                    breaker.failure();
                    warn!(
                        operation_key = %request.idempotency_key,
                        operation_class = %class,
                        error = %err,
                        "Backing store failure"
                    );
                } else {
                    breaker.success();
                    debug!(
                        operation_key = %request.idempotency_key,
                        error = %err,
                        "Mutation refused"
                    );
                }
                Err(err.into())
            }
            Ok(Err(join_err)) => {
                breaker.failure();
                warn!(
                    operation_key = %request.idempotency_key,
                    error = %join_err,
                    "Store task failed"
                );
                Err(ServiceError::Internal(join_err.to_string()))
            }
            Err(_) => {
                breaker.failure();
                let timeout_ms =
                    u64::try_from(self.request_timeout.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    operation_key = %request.idempotency_key,
                    operation_class = %class,
                    timeout_ms,
                    "Store call timed out"
                );
                Err(ServiceError::Timeout { timeout_ms })
            }
        }
    }

    #[must_use]
    pub fn health_basic(&self) -> BasicHealth {
        BasicHealth {
            status: "ok".to_string(),
            version: crate::VERSION.to_string(),
        }
    }

    /// Detailed health. The ledger count reads the store off the async pool.
    pub async fn health_detailed(&self) -> Result<DetailedHealth, ServiceError> {
        let store = self.store.clone();
        let ledger_records = tokio::task::spawn_blocking(move || store.ledger_count())
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))??;
        let resilience = self.resilience.health();
        let status = match resilience.status {
            HealthStatus::Ok => "ok",
            HealthStatus::Degraded => "degraded",
        };
        Ok(DetailedHealth {
            status: status.to_string(),
            version: crate::VERSION.to_string(),
            ledger_records,
            resilience,
        })
    }

    /// Maintenance: purge ledger records past `retention`.
    pub async fn purge_ledger(&self, retention: Duration) -> Result<usize, ServiceError> {
        let store = self.store.clone();
        let purged = tokio::task::spawn_blocking(move || store.purge_ledger(retention))
            .await
            .map_err(|e| ServiceError::Internal(e.to_string()))??;
        info!(purged, "Ledger purge complete");
        Ok(purged)
    }
}
