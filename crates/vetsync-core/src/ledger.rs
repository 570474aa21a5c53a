//! Idempotency ledger: at most one applied effect per operation key.
//!
//! [`IdempotencyLedger::apply`] runs the domain write and the ledger insert
//! inside one `BEGIN IMMEDIATE` transaction. Either both commit or neither
//! does, so a retried key can never slip past a half-applied write.
//!
//! Each record stores a SHA-256 fingerprint of the request (kind + canonical
//! payload). A replay with the same fingerprint returns the stored result;
//! a different fingerprint under the same key is a conflict.
//!
//! Records are append-only on the request path. [`IdempotencyLedger::purge_older_than`]
//! exists for scheduled maintenance only.

use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::error::LedgerError;
use crate::mutation::MutationKind;

pub const LEDGER_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS idempotency_records (
        operation_key    TEXT PRIMARY KEY NOT NULL,
        kind             TEXT NOT NULL,
        request_hash     TEXT NOT NULL,
        result_snapshot  TEXT NOT NULL,
        first_applied_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_idempotency_applied_at
        ON idempotency_records(first_applied_at);
";

/// SHA-256 of the request's kind and payload, hex encoded.
///
/// `serde_json` maps keep keys sorted, so logically equal payloads hash the
/// same regardless of field order on the wire.
#[must_use]
pub fn request_fingerprint(kind: MutationKind, payload: &Value) -> String {
    let canonical = serde_json::json!({ "kind": kind, "payload": payload }).to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

/// A stored ledger row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdempotencyRecord {
    pub operation_key: String,
    pub kind: String,
    pub request_hash: String,
    pub result_snapshot: Value,
    pub first_applied_at: u64,
}

/// Result of [`IdempotencyLedger::apply`].
#[derive(Debug, Clone, PartialEq)]
pub struct Applied<T> {
    pub value: T,
    /// True when the stored snapshot was returned and nothing was written.
    pub replayed: bool,
}

fn to_sql_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn from_sql_ms(ms: i64) -> u64 {
    u64::try_from(ms).unwrap_or(0)
}

fn lookup(
    conn: &Connection,
    operation_key: &str,
) -> Result<Option<(String, String)>, rusqlite::Error> {
    conn.query_row(
        "SELECT request_hash, result_snapshot FROM idempotency_records WHERE operation_key = ?1",
        params![operation_key],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
}

/// Ledger operations over a caller-provided connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdempotencyLedger;

impl IdempotencyLedger {
    /// Create the ledger table if needed.
    pub fn init(conn: &Connection) -> Result<(), LedgerError> {
        conn.execute_batch(LEDGER_SCHEMA)?;
        Ok(())
    }

    /// Apply `write` at most once for `operation_key`.
    ///
    /// If the key is already recorded with the same fingerprint, the stored
    /// snapshot is returned and `write` is not called. Otherwise `write`
    /// runs inside the transaction and its result is recorded before commit.
    /// An error from `write` rolls back everything and records nothing.
    pub fn apply<T, E, F>(
        conn: &mut Connection,
        operation_key: &str,
        kind: MutationKind,
        request_hash: &str,
        now_ms: u64,
        write: F,
    ) -> Result<Applied<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<LedgerError>,
        F: FnOnce(&Transaction<'_>) -> Result<T, E>,
    {
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(LedgerError::from)?;

        if let Some((stored_hash, snapshot)) =
            lookup(&tx, operation_key).map_err(LedgerError::from)?
        {
            if stored_hash != request_hash {
                return Err(LedgerError::Conflict {
                    operation_key: operation_key.to_string(),
                }
                .into());
            }
            let value = serde_json::from_str(&snapshot).map_err(LedgerError::from)?;
            debug!(operation_key, "Idempotent replay from ledger");
            return Ok(Applied {
                value,
                replayed: true,
            });
        }

        let value = write(&tx)?;
        let snapshot = serde_json::to_string(&value).map_err(LedgerError::from)?;
        tx.execute(
            "INSERT INTO idempotency_records
                (operation_key, kind, request_hash, result_snapshot, first_applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                operation_key,
                kind.as_str(),
                request_hash,
                snapshot,
                to_sql_ms(now_ms)
            ],
        )
        .map_err(LedgerError::from)?;
        tx.commit().map_err(LedgerError::from)?;
        debug!(operation_key, kind = %kind, "Ledger recorded first application");
        Ok(Applied {
            value,
            replayed: false,
        })
    }

    pub fn get(
        conn: &Connection,
        operation_key: &str,
    ) -> Result<Option<IdempotencyRecord>, LedgerError> {
        let row = conn
            .query_row(
                "SELECT operation_key, kind, request_hash, result_snapshot, first_applied_at
                 FROM idempotency_records WHERE operation_key = ?1",
                params![operation_key],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()?;
        row.map(
            |(operation_key, kind, request_hash, snapshot, applied_at)| -> Result<_, LedgerError> {
            Ok(IdempotencyRecord {
                operation_key,
                kind,
                request_hash,
                result_snapshot: serde_json::from_str(&snapshot)?,
                first_applied_at: from_sql_ms(applied_at),
            })
        })
        .transpose()
    }

    pub fn count(conn: &Connection) -> Result<u64, LedgerError> {
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM idempotency_records", [], |row| {
                row.get(0)
            })?;
        Ok(from_sql_ms(count))
    }

    /// Delete records first applied more than `retention` before `now_ms`.
    ///
    /// Maintenance only; `retention` must exceed the longest time a client
    /// may keep retrying a key.
    pub fn purge_older_than(
        conn: &Connection,
        retention: Duration,
        now_ms: u64,
    ) -> Result<usize, LedgerError> {
        let retention_ms = u64::try_from(retention.as_millis()).unwrap_or(u64::MAX);
        let cutoff = now_ms.saturating_sub(retention_ms);
        let removed = conn.execute(
            "DELETE FROM idempotency_records WHERE first_applied_at < ?1",
            params![to_sql_ms(cutoff)],
        )?;
        if removed > 0 {
            info!(removed, cutoff_ms = cutoff, "Purged expired idempotency records");
        }
        Ok(removed)
    }
}
