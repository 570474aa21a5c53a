//! SQLite backing store for administrations and inventory.
//!
//! Every mutation is applied through [`IdempotencyLedger::apply`], so the
//! domain rows and the ledger record for an operation key share one
//! transaction. Calls are blocking; the service runs them on the blocking
//! pool after admission.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::error::LedgerError;
use crate::ledger::{Applied, IdempotencyLedger};
use crate::mutation::{
    AdjustInventoryQuantity, MarkInventoryInUse, MutationPayload, RecordAdministration, epoch_ms,
};
use crate::wire::MutationResult;

const DOMAIN_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS inventory_lots (
        lot_id             TEXT PRIMARY KEY NOT NULL,
        medication_id      TEXT NOT NULL,
        quantity_remaining REAL NOT NULL CHECK (quantity_remaining >= 0),
        unit               TEXT NOT NULL,
        in_use             INTEGER NOT NULL DEFAULT 0,
        updated_at         INTEGER NOT NULL
    );
    CREATE TABLE IF NOT EXISTS administrations (
        administration_id  TEXT PRIMARY KEY NOT NULL,
        animal_id          TEXT NOT NULL,
        medication_id      TEXT NOT NULL,
        dose_amount        REAL NOT NULL,
        dose_unit          TEXT NOT NULL,
        administered_at    INTEGER NOT NULL,
        administered_by    TEXT NOT NULL,
        inventory_lot_id   TEXT REFERENCES inventory_lots(lot_id),
        notes              TEXT,
        recorded_at        INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_administrations_animal
        ON administrations(animal_id, administered_at);
    CREATE TABLE IF NOT EXISTS inventory_adjustments (
        adjustment_id      TEXT PRIMARY KEY NOT NULL,
        lot_id             TEXT NOT NULL REFERENCES inventory_lots(lot_id),
        delta              REAL NOT NULL,
        reason             TEXT NOT NULL,
        recorded_at        INTEGER NOT NULL
    );
";

/// A domain rule refused the mutation. Not retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct DomainError {
    pub code: &'static str,
    pub message: String,
}

impl DomainError {
    fn lot_not_found(lot_id: &str) -> Self {
        Self {
            code: "lot_not_found",
            message: format!("inventory lot {lot_id} does not exist"),
        }
    }

    fn insufficient_inventory(lot_id: &str, remaining: f64, wanted: f64) -> Self {
        Self {
            code: "insufficient_inventory",
            message: format!("lot {lot_id} has {remaining} remaining, {wanted} requested"),
        }
    }
}

/// Backing store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("domain rule violated: {0}")]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("store database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("store directory error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether the failure says something about store health.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        match self {
            Self::Domain(_) | Self::Ledger(LedgerError::Conflict { .. }) => false,
            Self::Ledger(_) | Self::Database(_) | Self::Io(_) => true,
        }
    }
}

/// Inventory lot row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryLot {
    pub lot_id: String,
    pub medication_id: String,
    pub quantity_remaining: f64,
    pub unit: String,
    pub in_use: bool,
}

/// Administration row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdministrationRecord {
    pub administration_id: String,
    pub animal_id: String,
    pub medication_id: String,
    pub dose_amount: f64,
    pub dose_unit: String,
    pub administered_at_ms: u64,
    pub inventory_lot_id: Option<String>,
    pub recorded_at_ms: u64,
}

fn to_sql_ms(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn from_sql_ms(ms: i64) -> u64 {
    u64::try_from(ms).unwrap_or(0)
}

fn open_conn(db_path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000; PRAGMA foreign_keys=ON;",
    )?;
    Ok(conn)
}

fn lot_remaining(tx: &Transaction<'_>, lot_id: &str) -> Result<f64, StoreError> {
    tx.query_row(
        "SELECT quantity_remaining FROM inventory_lots WHERE lot_id = ?1",
        params![lot_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| DomainError::lot_not_found(lot_id).into())
}

fn set_remaining(
    tx: &Transaction<'_>,
    lot_id: &str,
    remaining: f64,
    now_ms: u64,
) -> Result<(), StoreError> {
    tx.execute(
        "UPDATE inventory_lots SET quantity_remaining = ?2, updated_at = ?3 WHERE lot_id = ?1",
        params![lot_id, remaining, to_sql_ms(now_ms)],
    )?;
    Ok(())
}

fn record_administration(
    tx: &Transaction<'_>,
    key: &str,
    p: &RecordAdministration,
    now_ms: u64,
) -> Result<MutationResult, StoreError> {
    let mut lot_remaining_after = None;
    if let Some(lot_id) = &p.inventory_lot_id {
        let remaining = lot_remaining(tx, lot_id)?;
        if remaining < p.dose_amount {
            return Err(
                DomainError::insufficient_inventory(lot_id, remaining, p.dose_amount).into(),
            );
        }
        let after = remaining - p.dose_amount;
        set_remaining(tx, lot_id, after, now_ms)?;
        lot_remaining_after = Some(after);
    }
    tx.execute(
        "INSERT INTO administrations
            (administration_id, animal_id, medication_id, dose_amount, dose_unit,
             administered_at, administered_by, inventory_lot_id, notes, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            key,
            p.animal_id,
            p.medication_id,
            p.dose_amount,
            p.dose_unit,
            to_sql_ms(p.administered_at_ms),
            p.administered_by,
            p.inventory_lot_id,
            p.notes,
            to_sql_ms(now_ms)
        ],
    )?;
    Ok(MutationResult {
        operation_key: key.to_string(),
        kind: crate::mutation::MutationKind::RecordAdministration,
        resource_id: key.to_string(),
        applied_at_ms: now_ms,
        detail: json!({
            "animalId": p.animal_id,
            "lotId": p.inventory_lot_id,
            "lotRemaining": lot_remaining_after,
        }),
    })
}

fn adjust_inventory_quantity(
    tx: &Transaction<'_>,
    key: &str,
    p: &AdjustInventoryQuantity,
    now_ms: u64,
) -> Result<MutationResult, StoreError> {
    let remaining = lot_remaining(tx, &p.lot_id)?;
    let after = remaining + p.delta;
    if after < 0.0 {
        return Err(DomainError::insufficient_inventory(&p.lot_id, remaining, -p.delta).into());
    }
    set_remaining(tx, &p.lot_id, after, now_ms)?;
    tx.execute(
        "INSERT INTO inventory_adjustments (adjustment_id, lot_id, delta, reason, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![key, p.lot_id, p.delta, p.reason, to_sql_ms(now_ms)],
    )?;
    Ok(MutationResult {
        operation_key: key.to_string(),
        kind: crate::mutation::MutationKind::AdjustInventoryQuantity,
        resource_id: p.lot_id.clone(),
        applied_at_ms: now_ms,
        detail: json!({ "quantityRemaining": after }),
    })
}

fn mark_inventory_in_use(
    tx: &Transaction<'_>,
    key: &str,
    p: &MarkInventoryInUse,
    now_ms: u64,
) -> Result<MutationResult, StoreError> {
    let updated = tx.execute(
        "UPDATE inventory_lots SET in_use = ?2, updated_at = ?3 WHERE lot_id = ?1",
        params![p.lot_id, p.in_use, to_sql_ms(now_ms)],
    )?;
    if updated == 0 {
        return Err(DomainError::lot_not_found(&p.lot_id).into());
    }
    Ok(MutationResult {
        operation_key: key.to_string(),
        kind: crate::mutation::MutationKind::MarkInventoryInUse,
        resource_id: p.lot_id.clone(),
        applied_at_ms: now_ms,
        detail: json!({ "inUse": p.in_use }),
    })
}

/// Administration and inventory store.
#[derive(Debug, Clone)]
pub struct BackingStore {
    db_path: PathBuf,
}

impl BackingStore {
    /// Open the store at `db_path`, creating the schema if needed.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = open_conn(&db_path)?;
        conn.execute_batch(DOMAIN_SCHEMA)?;
        IdempotencyLedger::init(&conn)?;
        Ok(Self { db_path })
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        Ok(open_conn(&self.db_path)?)
    }

    /// Apply a mutation at most once per `operation_key`.
    pub fn apply(
        &self,
        operation_key: &str,
        payload: &MutationPayload,
        request_hash: &str,
    ) -> Result<Applied<MutationResult>, StoreError> {
        let mut conn = self.connect()?;
        let now_ms = epoch_ms();
        let applied = IdempotencyLedger::apply(
            &mut conn,
            operation_key,
            payload.kind(),
            request_hash,
            now_ms,
            |tx| match payload {
                MutationPayload::RecordAdministration(p) => {
                    record_administration(tx, operation_key, p, now_ms)
                }
                MutationPayload::AdjustInventoryQuantity(p) => {
                    adjust_inventory_quantity(tx, operation_key, p, now_ms)
                }
                MutationPayload::MarkInventoryInUse(p) => {
                    mark_inventory_in_use(tx, operation_key, p, now_ms)
                }
            },
        )?;
        debug!(
            operation_key,
            kind = %payload.kind(),
            replayed = applied.replayed,
            "Mutation applied"
        );
        Ok(applied)
    }

    /// Register a lot. Replaces nothing; an existing lot id is an error.
    pub fn create_lot(
        &self,
        lot_id: &str,
        medication_id: &str,
        quantity: f64,
        unit: &str,
    ) -> Result<InventoryLot, StoreError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO inventory_lots
                (lot_id, medication_id, quantity_remaining, unit, in_use, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![lot_id, medication_id, quantity, unit, to_sql_ms(epoch_ms())],
        )?;
        Ok(InventoryLot {
            lot_id: lot_id.to_string(),
            medication_id: medication_id.to_string(),
            quantity_remaining: quantity,
            unit: unit.to_string(),
            in_use: false,
        })
    }

    pub fn lot(&self, lot_id: &str) -> Result<Option<InventoryLot>, StoreError> {
        let conn = self.connect()?;
        let lot = conn
            .query_row(
                "SELECT lot_id, medication_id, quantity_remaining, unit, in_use
                 FROM inventory_lots WHERE lot_id = ?1",
                params![lot_id],
                |row| {
                    Ok(InventoryLot {
                        lot_id: row.get(0)?,
                        medication_id: row.get(1)?,
                        quantity_remaining: row.get(2)?,
                        unit: row.get(3)?,
                        in_use: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(lot)
    }

    /// Administrations for an animal, oldest first.
    pub fn administrations_for(
        &self,
        animal_id: &str,
    ) -> Result<Vec<AdministrationRecord>, StoreError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT administration_id, animal_id, medication_id, dose_amount, dose_unit,
                    administered_at, inventory_lot_id, recorded_at
             FROM administrations WHERE animal_id = ?1
             ORDER BY recorded_at, rowid",
        )?;
        let rows = stmt
            .query_map(params![animal_id], |row| {
                Ok(AdministrationRecord {
                    administration_id: row.get(0)?,
                    animal_id: row.get(1)?,
                    medication_id: row.get(2)?,
                    dose_amount: row.get(3)?,
                    dose_unit: row.get(4)?,
                    administered_at_ms: from_sql_ms(row.get(5)?),
                    inventory_lot_id: row.get(6)?,
                    recorded_at_ms: from_sql_ms(row.get(7)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn administration_count(&self) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM administrations", [], |row| row.get(0))?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub fn ledger_count(&self) -> Result<u64, StoreError> {
        let conn = self.connect()?;
        Ok(IdempotencyLedger::count(&conn)?)
    }

    /// Maintenance: drop ledger records older than `retention`.
    pub fn purge_ledger(&self, retention: std::time::Duration) -> Result<usize, StoreError> {
        let conn = self.connect()?;
        Ok(IdempotencyLedger::purge_older_than(&conn, retention, epoch_ms())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::request_fingerprint;
    use crate::mutation::MutationKind;
    use serde_json::Value;

    fn store() -> (tempfile::TempDir, BackingStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = BackingStore::open(dir.path().join("server.db")).unwrap();
        (dir, store)
    }

    fn apply(
        store: &BackingStore,
        key: &str,
        kind: MutationKind,
        payload: Value,
    ) -> Result<Applied<MutationResult>, StoreError> {
        let parsed = MutationPayload::parse(kind, &payload).unwrap();
        store.apply(key, &parsed, &request_fingerprint(kind, &payload))
    }

    fn dose(lot: &str, amount: f64) -> Value {
        json!({
            "animalId": "dog-1",
            "medicationId": "med-1",
            "doseAmount": amount,
            "doseUnit": "ml",
            "administeredAtMs": 1_700_000_000_000_u64,
            "administeredBy": "alex",
            "inventoryLotId": lot,
        })
    }

    #[test]
    fn administration_decrements_lot_once() {
        let (_dir, store) = store();
        store.create_lot("lot-1", "med-1", 10.0, "ml").unwrap();

        let kind = MutationKind::RecordAdministration;
        let first = apply(&store, "m1", kind, dose("lot-1", 2.5)).unwrap();
        let again = apply(&store, "m1", kind, dose("lot-1", 2.5)).unwrap();
        assert!(!first.replayed);
        assert!(again.replayed);
        assert_eq!(first.value, again.value);

        assert_eq!(store.administration_count().unwrap(), 1);
        let lot = store.lot("lot-1").unwrap().unwrap();
        assert!((lot.quantity_remaining - 7.5).abs() < 1e-9);
        assert_eq!(store.ledger_count().unwrap(), 1);
    }

    #[test]
    fn insufficient_inventory_is_domain_error_without_ledger_record() {
        let (_dir, store) = store();
        store.create_lot("lot-1", "med-1", 1.0, "ml").unwrap();

        let err = apply(&store, "m1", MutationKind::RecordAdministration, dose("lot-1", 5.0))
            .unwrap_err();
        assert!(matches!(err, StoreError::Domain(ref e) if e.code == "insufficient_inventory"));
        assert!(!err.is_infrastructure());
        assert_eq!(store.administration_count().unwrap(), 0);
        assert_eq!(store.ledger_count().unwrap(), 0);
    }

    #[test]
    fn unknown_lot_rejected() {
        let (_dir, store) = store();
        let err = apply(
            &store,
            "m1",
            MutationKind::MarkInventoryInUse,
            json!({"lotId": "ghost", "inUse": true}),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Domain(ref e) if e.code == "lot_not_found"));
    }

    #[test]
    fn adjustment_then_mark_in_use() {
        let (_dir, store) = store();
        store.create_lot("lot-1", "med-1", 0.0, "tablet").unwrap();

        let adjusted = apply(
            &store,
            "a1",
            MutationKind::AdjustInventoryQuantity,
            json!({"lotId": "lot-1", "delta": 30.0, "reason": "delivery"}),
        )
        .unwrap();
        assert_eq!(adjusted.value.detail["quantityRemaining"], 30.0);

        apply(
            &store,
            "a2",
            MutationKind::MarkInventoryInUse,
            json!({"lotId": "lot-1", "inUse": true}),
        )
        .unwrap();
        let lot = store.lot("lot-1").unwrap().unwrap();
        assert!(lot.in_use);
        assert!((lot.quantity_remaining - 30.0).abs() < 1e-9);
    }

    #[test]
    fn conflicting_reuse_of_key() {
        let (_dir, store) = store();
        store.create_lot("lot-1", "med-1", 10.0, "ml").unwrap();
        apply(&store, "m1", MutationKind::RecordAdministration, dose("lot-1", 1.0)).unwrap();
        let err = apply(&store, "m1", MutationKind::RecordAdministration, dose("lot-1", 2.0))
            .unwrap_err();
        assert!(matches!(err, StoreError::Ledger(LedgerError::Conflict { .. })));
        assert!(!err.is_infrastructure());
    }

    #[test]
    fn administrations_listed_in_order() {
        let (_dir, store) = store();
        store.create_lot("lot-1", "med-1", 10.0, "ml").unwrap();
        for key in ["m1", "m2", "m3"] {
            apply(&store, key, MutationKind::RecordAdministration, dose("lot-1", 1.0)).unwrap();
        }
        let ids: Vec<String> = store
            .administrations_for("dog-1")
            .unwrap()
            .into_iter()
            .map(|a| a.administration_id)
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }
}
