//! Queued domain mutations and their typed payloads.
//!
//! A [`QueuedMutation`] is the durable client-side record of one recorded
//! action. Its `id` is generated once at enqueue and doubles as the
//! idempotency key on every delivery attempt.
//!
//! Payloads travel as JSON but are parsed into a [`MutationPayload`] before
//! they are accepted, so malformed input never reaches the queue. Each
//! payload names the downstream resources it touches; the sync engine uses
//! those keys to keep same-resource deliveries strictly ordered.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;
use crate::priority::OperationClass;

/// Longest accepted free-text note on an administration.
pub const MAX_NOTES_CHARS: usize = 2_000;

/// Milliseconds since the Unix epoch.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Generate a time-ordered mutation id (timestamp prefix + random).
#[must_use]
pub fn generate_mutation_id() -> String {
    let ts = epoch_ms();
    let rand: u64 = rand::random();
    format!("mut-{ts:013x}-{rand:016x}")
}

// =============================================================================
// Kinds
// =============================================================================

/// Enumerated mutation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    RecordAdministration,
    AdjustInventoryQuantity,
    MarkInventoryInUse,
}

impl MutationKind {
    pub const ALL: [Self; 3] = [
        Self::RecordAdministration,
        Self::AdjustInventoryQuantity,
        Self::MarkInventoryInUse,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RecordAdministration => "record-administration",
            Self::AdjustInventoryQuantity => "adjust-inventory-quantity",
            Self::MarkInventoryInUse => "mark-inventory-in-use",
        }
    }

    /// Class the server accounts this mutation against.
    #[must_use]
    pub fn operation_class(self) -> OperationClass {
        match self {
            Self::RecordAdministration => OperationClass::AdministrationWrite,
            Self::AdjustInventoryQuantity | Self::MarkInventoryInUse => {
                OperationClass::InventoryWrite
            }
        }
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = ValidationError;

    /// Accepts both `record-administration` and `record_administration`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('_', "-");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| ValidationError::UnknownKind(s.to_string()))
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// A dose given to an animal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RecordAdministration {
    pub animal_id: String,
    pub medication_id: String,
    pub dose_amount: f64,
    pub dose_unit: String,
    /// When the dose was given (epoch ms), as entered by the caregiver.
    pub administered_at_ms: u64,
    pub administered_by: String,
    /// Lot the dose was drawn from; decremented by `dose_amount` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_lot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A signed correction to a lot's remaining quantity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AdjustInventoryQuantity {
    pub lot_id: String,
    pub delta: f64,
    pub reason: String,
}

/// Flag a lot as the one currently being drawn from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MarkInventoryInUse {
    pub lot_id: String,
    pub in_use: bool,
}

fn require_text(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}

fn animal_key(id: &str) -> String {
    format!("animal:{id}")
}

fn lot_key(id: &str) -> String {
    format!("inventory_lot:{id}")
}

impl RecordAdministration {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("animalId", &self.animal_id)?;
        require_text("medicationId", &self.medication_id)?;
        require_text("doseUnit", &self.dose_unit)?;
        require_text("administeredBy", &self.administered_by)?;
        if !self.dose_amount.is_finite() || self.dose_amount <= 0.0 {
            return Err(ValidationError::InvalidField {
                field: "doseAmount",
                reason: "must be a positive number".to_string(),
            });
        }
        if self.administered_at_ms == 0 {
            return Err(ValidationError::InvalidField {
                field: "administeredAtMs",
                reason: "must be set".to_string(),
            });
        }
        if let Some(lot) = &self.inventory_lot_id {
            require_text("inventoryLotId", lot)?;
        }
        if let Some(notes) = &self.notes {
            if notes.chars().count() > MAX_NOTES_CHARS {
                return Err(ValidationError::InvalidField {
                    field: "notes",
                    reason: format!("must be at most {MAX_NOTES_CHARS} characters"),
                });
            }
        }
        Ok(())
    }
}

impl AdjustInventoryQuantity {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("lotId", &self.lot_id)?;
        require_text("reason", &self.reason)?;
        if !self.delta.is_finite() || self.delta == 0.0 {
            return Err(ValidationError::InvalidField {
                field: "delta",
                reason: "must be a non-zero number".to_string(),
            });
        }
        Ok(())
    }
}

impl MarkInventoryInUse {
    pub fn validate(&self) -> Result<(), ValidationError> {
        require_text("lotId", &self.lot_id)
    }
}

/// A parsed, validated mutation payload.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationPayload {
    RecordAdministration(RecordAdministration),
    AdjustInventoryQuantity(AdjustInventoryQuantity),
    MarkInventoryInUse(MarkInventoryInUse),
}

fn parse_as<T: DeserializeOwned>(
    kind: MutationKind,
    payload: &Value,
) -> Result<T, ValidationError> {
    T::deserialize(payload).map_err(|e| ValidationError::MalformedPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

impl MutationPayload {
    /// Parse and validate `payload` as `kind`.
    pub fn parse(kind: MutationKind, payload: &Value) -> Result<Self, ValidationError> {
        let parsed = match kind {
            MutationKind::RecordAdministration => {
                Self::RecordAdministration(parse_as(kind, payload)?)
            }
            MutationKind::AdjustInventoryQuantity => {
                Self::AdjustInventoryQuantity(parse_as(kind, payload)?)
            }
            MutationKind::MarkInventoryInUse => Self::MarkInventoryInUse(parse_as(kind, payload)?),
        };
        parsed.validate()?;
        Ok(parsed)
    }

    #[must_use]
    pub fn kind(&self) -> MutationKind {
        match self {
            Self::RecordAdministration(_) => MutationKind::RecordAdministration,
            Self::AdjustInventoryQuantity(_) => MutationKind::AdjustInventoryQuantity,
            Self::MarkInventoryInUse(_) => MutationKind::MarkInventoryInUse,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        match self {
            Self::RecordAdministration(p) => p.validate(),
            Self::AdjustInventoryQuantity(p) => p.validate(),
            Self::MarkInventoryInUse(p) => p.validate(),
        }
    }

    /// Downstream resources this mutation writes.
    #[must_use]
    pub fn resources(&self) -> Vec<String> {
        match self {
            Self::RecordAdministration(p) => {
                let mut keys = vec![animal_key(&p.animal_id)];
                if let Some(lot) = &p.inventory_lot_id {
                    keys.push(lot_key(lot));
                }
                keys
            }
            Self::AdjustInventoryQuantity(p) => vec![lot_key(&p.lot_id)],
            Self::MarkInventoryInUse(p) => vec![lot_key(&p.lot_id)],
        }
    }
}

/// Size-check, parse and validate a raw payload before it is queued.
pub fn validate_payload(
    kind: MutationKind,
    payload: &Value,
    max_bytes: usize,
) -> Result<MutationPayload, ValidationError> {
    let actual = serde_json::to_vec(payload)
        .map_err(|e| ValidationError::MalformedPayload {
            kind: kind.to_string(),
            reason: e.to_string(),
        })?
        .len();
    if actual > max_bytes {
        return Err(ValidationError::PayloadTooLarge {
            actual,
            max: max_bytes,
        });
    }
    MutationPayload::parse(kind, payload)
}

// =============================================================================
// Queued record
// =============================================================================

/// Delivery state of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationState {
    /// Waiting for (re)delivery.
    #[default]
    Pending,
    /// Terminal-failed; needs a manual retry or discard.
    Failed,
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.pad("pending"),
            Self::Failed => f.pad("failed"),
        }
    }
}

/// A pending client-side action, as persisted in the queue store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
    pub id: String,
    pub kind: MutationKind,
    pub payload: Value,
    /// Enqueue time, epoch ms.
    pub created_at: u64,
    pub attempts: u32,
    #[serde(alias = "maxRetries")]
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub state: MutationState,
    /// Insertion sequence; the queue's total order.
    #[serde(default)]
    pub seq: u64,
    /// Earliest time (epoch ms) the next automatic attempt may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<u64>,
}

impl QueuedMutation {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state == MutationState::Pending
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state == MutationState::Failed
    }

    /// Whether backoff allows an automatic attempt at `now_ms`.
    #[must_use]
    pub fn is_due(&self, now_ms: u64) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now_ms)
    }

    /// Re-parse the stored payload.
    pub fn parsed_payload(&self) -> Result<MutationPayload, ValidationError> {
        MutationPayload::parse(self.kind, &self.payload)
    }

    /// Resource keys for ordering; an unparseable payload orders on its id.
    #[must_use]
    pub fn resources(&self) -> Vec<String> {
        self.parsed_payload()
            .map_or_else(|_| vec![format!("mutation:{}", self.id)], |p| p.resources())
    }

    #[must_use]
    pub fn view(&self, now_ms: u64) -> QueueItemView {
        QueueItemView {
            id: self.id.clone(),
            kind: self.kind,
            state: self.state,
            age_ms: now_ms.saturating_sub(self.created_at),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            last_error: self.last_error.clone(),
            next_attempt_in_ms: self
                .next_attempt_at
                .filter(|_| self.is_pending())
                .map(|at| at.saturating_sub(now_ms)),
        }
    }
}

/// Row shown in the queue inspection view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItemView {
    pub id: String,
    pub kind: MutationKind,
    pub state: MutationState,
    pub age_ms: u64,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_in_ms: Option<u64>,
}
