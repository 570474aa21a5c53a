//! JSON contract between the sync engine and the mutation server.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::mutation::{MutationKind, QueuedMutation};
use crate::resilience::ResilienceHealth;

/// Path of the mutation endpoint.
pub const MUTATIONS_PATH: &str = "/v1/mutations";

/// Error codes carried in [`ErrorBody::code`].
pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const NOT_FOUND: &str = "not_found";
    pub const VALIDATION_FAILED: &str = "validation_failed";
    pub const IDEMPOTENCY_CONFLICT: &str = "idempotency_conflict";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const CIRCUIT_OPEN: &str = "circuit_open";
    pub const OVERLOADED: &str = "overloaded";
    pub const TIMEOUT: &str = "timeout";
    pub const STORE_UNAVAILABLE: &str = "store_unavailable";
    pub const INTERNAL: &str = "internal";
}

/// One mutation submission. `idempotency_key` is the client mutation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRequest {
    pub idempotency_key: String,
    pub caller_id: String,
    pub kind: MutationKind,
    pub payload: Value,
}

impl SubmitRequest {
    #[must_use]
    pub fn for_mutation(mutation: &QueuedMutation, caller_id: &str) -> Self {
        Self {
            idempotency_key: mutation.id.clone(),
            caller_id: caller_id.to_string(),
            kind: mutation.kind,
            payload: mutation.payload.clone(),
        }
    }
}

/// Canonical result of an applied mutation; stored verbatim in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResult {
    pub operation_key: String,
    pub kind: MutationKind,
    /// Primary record written (administration id or lot id).
    pub resource_id: String,
    pub applied_at_ms: u64,
    #[serde(default)]
    pub detail: Value,
}

/// Successful submission. `replayed` is true when the ledger answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub result: MutationResult,
    pub replayed: bool,
}

/// Structured error returned with every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

/// `GET /health`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicHealth {
    pub status: String,
    pub version: String,
}

/// `GET /health/detailed`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailedHealth {
    pub status: String,
    pub version: String,
    pub ledger_records: u64,
    pub resilience: ResilienceHealth,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_uses_idempotency_key_field() {
        let request = SubmitRequest {
            idempotency_key: "m1".to_string(),
            caller_id: "dev-a".to_string(),
            kind: MutationKind::RecordAdministration,
            payload: json!({}),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["idempotencyKey"], "m1");
        assert_eq!(json["kind"], "record-administration");
    }

    #[test]
    fn error_body_omits_missing_hint() {
        let body = ErrorBody {
            code: codes::VALIDATION_FAILED.to_string(),
            message: "bad dose".to_string(),
            retryable: false,
            retry_after_ms: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert!(json.get("retryAfterMs").is_none());
        assert_eq!(json["retryable"], false);
    }
}
