//! Error types for vetsync-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for vetsync-core
#[derive(Error, Debug)]
pub enum Error {
    /// Local payload validation failed; the mutation never entered the queue
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Mutation queue errors
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Idempotency ledger errors
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Resilience layer refusals
    #[error("Resilience error: {0}")]
    Resilience(#[from] ResilienceError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// SQLite errors
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task joins, channel failures, etc.)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Validation(_) => Some(
                Remediation::new("Fix the payload fields and record the action again.")
                    .alternative("Nothing was queued; the rejected action has no side effects."),
            ),
            Self::Queue(err) => Some(err.remediation()),
            Self::Ledger(err) => Some(err.remediation()),
            Self::Resilience(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Database(_) => Some(
                Remediation::new("Database operation failed. Check file permissions and retry.")
                    .command("Show config", "vetsync config show")
                    .alternative("Ensure the data directory is writable."),
            ),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
            Self::Runtime(_) => Some(
                Remediation::new("Retry the command.")
                    .alternative("If the issue persists, restart the sync process."),
            ),
        }
    }
}

/// Client-side payload validation failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown mutation kind: {0}")]
    UnknownKind(String),

    #[error("payload for {kind} is malformed: {reason}")]
    MalformedPayload { kind: String, reason: String },

    #[error("field `{field}` {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("payload is {actual} bytes, limit is {max}")]
    PayloadTooLarge { actual: usize, max: usize },
}

/// Mutation queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("mutation not found: {0}")]
    NotFound(String),

    #[error("mutation id already queued: {0}")]
    DuplicateId(String),

    #[error("mutation {0} is not in the failed state")]
    NotFailed(String),

    #[error("clearing the queue requires explicit confirmation")]
    ConfirmationRequired,

    #[error("queue storage error: {0}")]
    Storage(String),

    #[error("corrupt queue record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl QueueError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::NotFound(_) => Remediation::new("List the queue and use a valid mutation id.")
                .command("List queue", "vetsync queue list"),
            Self::DuplicateId(_) => Remediation::new(
                "A mutation with this id is already queued. Let it sync or discard it first.",
            )
            .command("List queue", "vetsync queue list"),
            Self::NotFailed(_) => {
                Remediation::new("Only failed mutations can be retried or discarded manually.")
                    .command("List queue", "vetsync queue list")
                    .alternative("Pending mutations are delivered automatically when online.")
            }
            Self::ConfirmationRequired => {
                Remediation::new("Confirm that pending changes should be dropped.")
                    .command("Clear queue", "vetsync queue clear --yes")
            }
            Self::Storage(_) => {
                Remediation::new("Queue storage failed. Check the data directory and retry.")
                    .command("Show config", "vetsync config show")
                    .alternative("Ensure the queue database is writable.")
            }
            Self::Corrupt { .. } => Remediation::new(
                "A queue record could not be decoded. Inspect the queue database.",
            )
            .command("List queue", "vetsync queue list --format json")
            .alternative("Discard the corrupt record once its contents are recovered."),
        }
    }
}

/// Idempotency ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("operation key {operation_key} was already applied with a different payload")]
    Conflict { operation_key: String },

    #[error("ledger database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("ledger snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
}

impl LedgerError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Conflict { .. } => Remediation::new(
                "The idempotency key was reused for a different action. Record it again.",
            )
            .alternative("Each recorded action must carry its own mutation id."),
            Self::Database(_) => {
                Remediation::new("Ledger write failed. The whole write was rolled back; retry.")
                    .command("Health", "vetsync health --detailed")
            }
            Self::Snapshot(_) => Remediation::new("A stored result could not be decoded.")
                .alternative("Inspect the idempotency_records table for the operation key."),
        }
    }
}

/// Resilience layer refusals. All are retryable from the client's view.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResilienceError {
    #[error("circuit for {class} is open; retry in {retry_after_ms} ms")]
    CircuitOpen { class: String, retry_after_ms: u64 },

    #[error("rate limited on {class}; retry in {retry_after_ms} ms")]
    RateLimited { class: String, retry_after_ms: u64 },

    #[error("admission queue full ({depth} waiting)")]
    AdmissionQueueFull { depth: usize },

    #[error("admission deadline exceeded after {waited_ms} ms")]
    AdmissionTimeout { waited_ms: u64 },
}

impl ResilienceError {
    /// Suggested wait before retrying, in milliseconds.
    #[must_use]
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            Self::CircuitOpen { retry_after_ms, .. } | Self::RateLimited { retry_after_ms, .. } => {
                Some(*retry_after_ms)
            }
            Self::AdmissionQueueFull { .. } | Self::AdmissionTimeout { .. } => None,
        }
    }

    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::CircuitOpen { retry_after_ms, .. } => Remediation::new(format!(
                "The backing store is failing; calls are paused. Retry after {retry_after_ms} ms."
            ))
            .command("Health", "vetsync health --detailed"),
            Self::RateLimited { retry_after_ms, .. } => Remediation::new(format!(
                "Too many requests from this caller. Retry after {retry_after_ms} ms."
            ))
            .alternative("Queued mutations are retried automatically."),
            Self::AdmissionQueueFull { .. } | Self::AdmissionTimeout { .. } => {
                Remediation::new("The server is at its connection ceiling. Retry shortly.")
                    .command("Health", "vetsync health --detailed")
                    .alternative("Raise resilience.admission.max_concurrent if the store allows.")
            }
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Failed to serialize config: {0}")]
    SerializeFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\""))
            .alternative("Ensure the file is readable by the current user."),
            Self::ParseFailed(_) => {
                Remediation::new("Config parse failed. Fix the TOML syntax and retry.")
                    .command("Show effective config", "vetsync config show")
            }
            Self::SerializeFailed(_) => {
                Remediation::new("Failed to serialize configuration. Check config values.")
                    .alternative("Recreate the config from known-good defaults.")
            }
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Show effective config", "vetsync config show")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
