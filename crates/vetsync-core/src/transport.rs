//! Delivery of queued mutations to the server.
//!
//! [`HttpTransport`] talks to the HTTP surface; [`LocalTransport`] calls a
//! [`MutationService`] in-process and can inject network faults.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;

use crate::service::MutationService;
use crate::wire::{ErrorBody, MUTATIONS_PATH, SubmitRequest, SubmitResponse, codes};

/// How the sync engine should treat a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Keep the item, back off, try again.
    Retryable,
    /// Retryable, and no further items should be attempted this drain.
    Offline,
    /// The server refused the mutation; retrying cannot help.
    Terminal,
}

/// A failed delivery attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("server unreachable: {0}")]
    Offline(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("server error {status} {code}: {message}")]
    Server {
        status: u16,
        code: String,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("rejected ({status} {code}): {message}")]
    Rejected {
        status: u16,
        code: String,
        message: String,
    },

    #[error("unexpected response: {0}")]
    Protocol(String),
}

impl DeliveryError {
    #[must_use]
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Offline(_) => FailureClass::Offline,
            Self::Rejected { .. } => FailureClass::Terminal,
            Self::Timeout(_)
            | Self::Network(_)
            | Self::Server { .. }
            | Self::RateLimited { .. }
            | Self::Protocol(_) => FailureClass::Retryable,
        }
    }

    /// A refusal that applies to the whole operation class rather than to
    /// this one item: rate limiting, an open circuit, admission overload.
    #[must_use]
    pub fn is_class_wide(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Server { code, .. } => matches!(
                code.as_str(),
                codes::RATE_LIMITED | codes::CIRCUIT_OPEN | codes::OVERLOADED
            ),
            _ => false,
        }
    }

    /// Server-provided minimum wait, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Server { retry_after, .. } | Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classify a structured error response.
    #[must_use]
    pub fn from_error_body(status: u16, body: ErrorBody) -> Self {
        let retry_after = body.retry_after_ms.map(Duration::from_millis);
        if !body.retryable {
            return Self::Rejected {
                status,
                code: body.code,
                message: body.message,
            };
        }
        if status == 429 {
            Self::RateLimited { retry_after }
        } else {
            Self::Server {
                status,
                code: body.code,
                message: body.message,
                retry_after,
            }
        }
    }

    /// Classify a response whose body is not a structured error.
    fn from_status(status: u16, message: String, retry_after: Option<Duration>) -> Self {
        match status {
            429 => Self::RateLimited { retry_after },
            408 | 500..=599 => Self::Server {
                status,
                code: format!("http_{status}"),
                message,
                retry_after,
            },
            _ => Self::Rejected {
                status,
                code: format!("http_{status}"),
                message,
            },
        }
    }
}

/// Sends one mutation to the server.
#[async_trait]
pub trait MutationTransport: Send + Sync {
    async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, DeliveryError>;
}

// =============================================================================
// HTTP
// =============================================================================

/// reqwest client for `POST /v1/mutations`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    #[must_use]
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.into(),
            client,
            timeout,
        }
    }

    fn mutations_url(&self) -> String {
        format!("{}{MUTATIONS_PATH}", self.base_url.trim_end_matches('/'))
    }

    /// Fetch `/health` or `/health/detailed` as raw JSON.
    pub async fn health(&self, detailed: bool) -> Result<serde_json::Value, DeliveryError> {
        let path = if detailed { "/health/detailed" } else { "/health" };
        let response = self
            .client
            .get(format!("{}{path}", self.base_url.trim_end_matches('/')))
            .send()
            .await
            .map_err(|e| self.classify(&e))?;
        let status = response.status();
        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| DeliveryError::Protocol(format!("invalid health body: {e}")))?;
        if status.is_success() {
            Ok(body)
        } else {
            Err(DeliveryError::from_status(status.as_u16(), body.to_string(), None))
        }
    }

    fn classify(&self, err: &reqwest::Error) -> DeliveryError {
        if err.is_timeout() {
            DeliveryError::Timeout(self.timeout)
        } else if err.is_connect() {
            DeliveryError::Offline(err.to_string())
        } else {
            DeliveryError::Network(err.to_string())
        }
    }
}

fn retry_after_header(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl MutationTransport for HttpTransport {
    async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, DeliveryError> {
        let response = self
            .client
            .post(self.mutations_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify(&e))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<SubmitResponse>()
                .await
                .map_err(|e| DeliveryError::Protocol(format!("invalid success body: {e}")));
        }

        let header_hint = retry_after_header(&response);
        let body = response.bytes().await.map_err(|e| self.classify(&e))?;
        match serde_json::from_slice::<ErrorBody>(&body) {
            Ok(mut error) => {
                if error.retry_after_ms.is_none() {
                    error.retry_after_ms =
                        header_hint.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
                }
                Err(DeliveryError::from_error_body(status.as_u16(), error))
            }
            Err(_) => Err(DeliveryError::from_status(
                status.as_u16(),
                status
                    .canonical_reason()
                    .map_or_else(|| String::from_utf8_lossy(&body).to_string(), str::to_string),
                header_hint,
            )),
        }
    }
}

/// Classification of a bare HTTP status with no structured body.
impl From<StatusCode> for FailureClass {
    fn from(status: StatusCode) -> Self {
        DeliveryError::from_status(status.as_u16(), String::new(), None).class()
    }
}

// =============================================================================
// In-process
// =============================================================================

/// Scripted fault for the next submission through a [`LocalTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// The server cannot be reached; nothing is applied.
    Unreachable,
    /// The server applies the mutation but the response never arrives.
    LoseResponse,
    /// The call takes this long before reaching the server.
    Delay(Duration),
}

/// Binds a sync engine directly to a [`MutationService`].
#[derive(Debug)]
pub struct LocalTransport {
    service: Arc<MutationService>,
    reachable: AtomicBool,
    faults: Mutex<VecDeque<Fault>>,
    submissions: AtomicU64,
}

impl LocalTransport {
    #[must_use]
    pub fn new(service: Arc<MutationService>) -> Self {
        Self {
            service,
            reachable: AtomicBool::new(true),
            faults: Mutex::new(VecDeque::new()),
            submissions: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn service(&self) -> &Arc<MutationService> {
        &self.service
    }

    /// While unreachable every submission fails as offline.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Queue a fault for an upcoming submission. Faults apply in order.
    pub fn inject(&self, fault: Fault) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(fault);
    }

    /// Submissions attempted through this transport, faults included.
    #[must_use]
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    fn next_fault(&self) -> Option<Fault> {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }
}

#[async_trait]
impl MutationTransport for LocalTransport {
    async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, DeliveryError> {
        self.submissions.fetch_add(1, Ordering::SeqCst);
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(DeliveryError::Offline("server unreachable".to_string()));
        }
        let lose_response = match self.next_fault() {
            Some(Fault::Unreachable) => {
                return Err(DeliveryError::Offline("injected: unreachable".to_string()));
            }
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                false
            }
            Some(Fault::LoseResponse) => true,
            None => false,
        };

        let key = request.idempotency_key.clone();
        let outcome = self
            .service
            .submit(request)
            .await
            .map_err(|e| DeliveryError::from_error_body(e.status_code(), e.to_body()));
        if lose_response {
            debug!(operation_key = %key, "Dropping response");
            return Err(DeliveryError::Network("injected: response lost".to_string()));
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::post;
    use serde_json::json;

    async fn spawn_status_server(status: StatusCode, body: serde_json::Value) -> String {
        let app = Router::new().route(
            MUTATIONS_PATH,
            post(move || {
                let body = body.clone();
                async move { (status, [("retry-after", "7")], axum::Json(body)) }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}")
    }

    fn sample_request() -> SubmitRequest {
        SubmitRequest {
            idempotency_key: "m1".to_string(),
            caller_id: "device-a".to_string(),
            kind: crate::mutation::MutationKind::MarkInventoryInUse,
            payload: json!({"lotId": "lot-1", "inUse": true}),
        }
    }

    #[test]
    fn body_classification() {
        let rejected = DeliveryError::from_error_body(
            422,
            ErrorBody {
                code: codes::VALIDATION_FAILED.to_string(),
                message: "bad".to_string(),
                retryable: false,
                retry_after_ms: None,
            },
        );
        assert_eq!(rejected.class(), FailureClass::Terminal);

        let limited = DeliveryError::from_error_body(
            429,
            ErrorBody {
                code: codes::RATE_LIMITED.to_string(),
                message: "slow down".to_string(),
                retryable: true,
                retry_after_ms: Some(1_500),
            },
        );
        assert_eq!(limited.class(), FailureClass::Retryable);
        assert_eq!(limited.retry_after(), Some(Duration::from_millis(1_500)));
        assert!(limited.is_class_wide());

        let open = DeliveryError::from_error_body(
            503,
            ErrorBody {
                code: codes::CIRCUIT_OPEN.to_string(),
                message: "store circuit open".to_string(),
                retryable: true,
                retry_after_ms: Some(2_000),
            },
        );
        assert_eq!(open.class(), FailureClass::Retryable);
        assert!(open.is_class_wide());

        let unavailable = DeliveryError::from_error_body(
            503,
            ErrorBody {
                code: codes::STORE_UNAVAILABLE.to_string(),
                message: "disk".to_string(),
                retryable: true,
                retry_after_ms: None,
            },
        );
        assert!(!unavailable.is_class_wide());
        assert!(!DeliveryError::Timeout(Duration::from_secs(1)).is_class_wide());
    }

    #[test]
    fn raw_status_classification() {
        assert_eq!(FailureClass::from(StatusCode::BAD_GATEWAY), FailureClass::Retryable);
        assert_eq!(FailureClass::from(StatusCode::TOO_MANY_REQUESTS), FailureClass::Retryable);
        assert_eq!(FailureClass::from(StatusCode::NOT_FOUND), FailureClass::Terminal);
    }

    #[tokio::test]
    async fn http_rate_limit_uses_header_hint() {
        let base_url = spawn_status_server(
            StatusCode::TOO_MANY_REQUESTS,
            json!({"code": "rate_limited", "message": "slow down", "retryable": true}),
        )
        .await;
        let transport = HttpTransport::new(base_url, Duration::from_secs(5));

        let err = transport.submit(sample_request()).await.unwrap_err();
        assert_eq!(err.class(), FailureClass::Retryable);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(7)));
    }

    #[tokio::test]
    async fn http_validation_error_is_terminal() {
        let base_url = spawn_status_server(
            StatusCode::UNPROCESSABLE_ENTITY,
            json!({"code": "validation_failed", "message": "bad lot", "retryable": false}),
        )
        .await;
        let transport = HttpTransport::new(base_url, Duration::from_secs(5));

        let err = transport.submit(sample_request()).await.unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::Rejected { status: 422, ref code, .. } if code == "validation_failed"
        ));
    }

    #[tokio::test]
    async fn http_connection_refused_is_offline() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let transport = HttpTransport::new(format!("http://{addr}"), Duration::from_secs(5));
        let err = transport.submit(sample_request()).await.unwrap_err();
        assert_eq!(err.class(), FailureClass::Offline);
    }
}
