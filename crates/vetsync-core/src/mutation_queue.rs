//! Durable, ordered store of pending mutations.
//!
//! Records live in a [`KvStore`] under `mutation/<seq>` with a zero-padded
//! sequence, so key order is insertion order. An in-memory copy is loaded on
//! open and every change is written through to storage before the call
//! returns; memory is only updated once the write succeeded.
//!
//! The store publishes a [`QueueStatus`] (pending and failed counts) on a
//! `watch` channel for the status badge.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use crate::kv_store::KvStore;
use crate::mutation::{
    MutationKind, MutationState, QueueItemView, QueuedMutation, epoch_ms, generate_mutation_id,
    validate_payload,
};

const KEY_PREFIX: &str = "mutation/";

fn record_key(seq: u64) -> String {
    format!("{KEY_PREFIX}{seq:020}")
}

/// Counts shown by the pending-change badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub failed: usize,
}

impl QueueStatus {
    #[must_use]
    pub fn total(&self) -> usize {
        self.pending + self.failed
    }
}

/// Ordered mutation queue over a durable key-value store.
pub struct MutationQueueStore {
    kv: Arc<dyn KvStore>,
    config: QueueConfig,
    /// Records keyed by insertion sequence.
    items: Mutex<BTreeMap<u64, QueuedMutation>>,
    status_tx: watch::Sender<QueueStatus>,
}

impl std::fmt::Debug for MutationQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationQueueStore")
            .field("config", &self.config)
            .field("status", &*self.status_tx.borrow())
            .finish_non_exhaustive()
    }
}

fn count(items: &BTreeMap<u64, QueuedMutation>) -> QueueStatus {
    items
        .values()
        .fold(QueueStatus::default(), |mut status, item| {
            match item.state {
                MutationState::Pending => status.pending += 1,
                MutationState::Failed => status.failed += 1,
            }
            status
        })
}

impl MutationQueueStore {
    /// Load every persisted record from `kv`.
    pub fn open(kv: Arc<dyn KvStore>, config: QueueConfig) -> Result<Self> {
        let mut items = BTreeMap::new();
        for (key, bytes) in kv.list(KEY_PREFIX)? {
            let record: QueuedMutation =
                serde_json::from_slice(&bytes).map_err(|e| QueueError::Corrupt {
                    key: key.clone(),
                    reason: e.to_string(),
                })?;
            items.insert(record.seq, record);
        }
        let status = count(&items);
        if status.total() > 0 {
            info!(
                pending = status.pending,
                failed = status.failed,
                "Loaded mutation queue"
            );
        }
        let (status_tx, _) = watch::channel(status);
        Ok(Self {
            kv,
            config,
            items: Mutex::new(items),
            status_tx,
        })
    }

    fn items(&self) -> MutexGuard<'_, BTreeMap<u64, QueuedMutation>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, record: &QueuedMutation) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.kv.put(&record_key(record.seq), &bytes)
    }

    fn publish(&self, items: &BTreeMap<u64, QueuedMutation>) {
        self.status_tx.send_replace(count(items));
    }

    fn find_seq(items: &BTreeMap<u64, QueuedMutation>, id: &str) -> Option<u64> {
        items
            .iter()
            .find_map(|(seq, item)| (item.id == id).then_some(*seq))
    }

    /// Apply `change` to a copy of record `id`, persist it, then commit.
    fn update(
        &self,
        id: &str,
        change: impl FnOnce(&mut QueuedMutation) -> Result<()>,
    ) -> Result<QueuedMutation> {
        let mut items = self.items();
        let seq = Self::find_seq(&items, id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let mut record = items[&seq].clone();
        change(&mut record)?;
        self.persist(&record)?;
        items.insert(seq, record.clone());
        self.publish(&items);
        Ok(record)
    }

    /// Queue a new mutation under a freshly generated id.
    pub fn enqueue(&self, kind: MutationKind, payload: Value) -> Result<QueuedMutation> {
        self.enqueue_with_id(generate_mutation_id(), kind, payload)
    }

    /// Queue a new mutation under a caller-chosen id.
    ///
    /// Fails only on an invalid payload, a duplicate id, or a storage error.
    /// The record is durable when this returns.
    pub fn enqueue_with_id(
        &self,
        id: impl Into<String>,
        kind: MutationKind,
        payload: Value,
    ) -> Result<QueuedMutation> {
        let id = id.into();
        validate_payload(kind, &payload, self.config.max_payload_bytes)?;

        let mut items = self.items();
        if Self::find_seq(&items, &id).is_some() {
            return Err(QueueError::DuplicateId(id).into());
        }
        let seq = items.last_key_value().map_or(0, |(seq, _)| seq + 1);
        let record = QueuedMutation {
            id,
            kind,
            payload,
            created_at: epoch_ms(),
            attempts: 0,
            max_attempts: self.config.max_attempts,
            last_error: None,
            state: MutationState::Pending,
            seq,
            next_attempt_at: None,
        };
        self.persist(&record)?;
        items.insert(seq, record.clone());
        self.publish(&items);
        debug!(mutation_id = %record.id, kind = %record.kind, seq, "Mutation enqueued");
        Ok(record)
    }

    /// Oldest pending mutation, ignoring backoff.
    #[must_use]
    pub fn peek_next(&self) -> Option<QueuedMutation> {
        self.items().values().find(|item| item.is_pending()).cloned()
    }

    /// Pending mutations in insertion order.
    #[must_use]
    pub fn pending(&self) -> Vec<QueuedMutation> {
        self.items()
            .values()
            .filter(|item| item.is_pending())
            .cloned()
            .collect()
    }

    /// Every mutation, pending and failed, in insertion order.
    #[must_use]
    pub fn list(&self) -> Vec<QueuedMutation> {
        self.items().values().cloned().collect()
    }

    /// Inspection rows for the queue view.
    #[must_use]
    pub fn views(&self) -> Vec<QueueItemView> {
        let now = epoch_ms();
        self.items().values().map(|item| item.view(now)).collect()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<QueuedMutation> {
        self.items().values().find(|item| item.id == id).cloned()
    }

    /// First pending mutation inserted after `seq` (from the start if `None`).
    #[must_use]
    pub fn pending_after(&self, seq: Option<u64>) -> Option<QueuedMutation> {
        let items = self.items();
        let mut range = match seq {
            Some(seq) => items.range(seq.saturating_add(1)..),
            None => items.range(..),
        };
        range.find(|(_, item)| item.is_pending()).map(|(_, item)| item.clone())
    }

    /// Earliest backoff deadline strictly after `now_ms` among pending items.
    #[must_use]
    pub fn next_due_after(&self, now_ms: u64) -> Option<u64> {
        self.items()
            .values()
            .filter(|item| item.is_pending())
            .filter_map(|item| item.next_attempt_at)
            .filter(|at| *at > now_ms)
            .min()
    }

    /// Remove a delivered mutation. Returns false if it was already gone.
    pub fn ack(&self, id: &str) -> Result<bool> {
        let mut items = self.items();
        let Some(seq) = Self::find_seq(&items, id) else {
            return Ok(false);
        };
        self.kv.delete(&record_key(seq))?;
        items.remove(&seq);
        self.publish(&items);
        debug!(mutation_id = %id, "Mutation acknowledged");
        Ok(true)
    }

    /// Record a failed delivery attempt.
    ///
    /// Reaching `max_attempts` moves the item to the failed state; otherwise
    /// it stays pending and becomes eligible again at `next_attempt_at`.
    pub fn mark_attempt(
        &self,
        id: &str,
        error: &str,
        next_attempt_at: Option<u64>,
    ) -> Result<QueuedMutation> {
        let record = self.update(id, |record| {
            record.attempts = record.attempts.saturating_add(1);
            record.last_error = Some(error.to_string());
            if record.attempts >= record.max_attempts {
                record.state = MutationState::Failed;
                record.next_attempt_at = None;
            } else {
                record.next_attempt_at = next_attempt_at;
            }
            Ok(())
        })?;
        if record.is_failed() {
            warn!(
                mutation_id = %record.id,
                kind = %record.kind,
                attempts = record.attempts,
                error,
                "Mutation exhausted retries"
            );
        }
        Ok(record)
    }

    /// Record a non-retryable failure and move the item to the failed state.
    pub fn mark_failed(&self, id: &str, error: &str) -> Result<QueuedMutation> {
        let record = self.update(id, |record| {
            record.attempts = record.attempts.saturating_add(1);
            record.last_error = Some(error.to_string());
            record.state = MutationState::Failed;
            record.next_attempt_at = None;
            Ok(())
        })?;
        warn!(
            mutation_id = %record.id,
            kind = %record.kind,
            error,
            "Mutation rejected"
        );
        Ok(record)
    }

    /// Return a failed item to pending with a fresh attempt budget. The id
    /// is unchanged, so the server still deduplicates it.
    pub fn retry(&self, id: &str) -> Result<QueuedMutation> {
        self.update(id, |record| {
            if !record.is_failed() {
                return Err(QueueError::NotFailed(record.id.clone()).into());
            }
            record.state = MutationState::Pending;
            record.attempts = 0;
            record.next_attempt_at = None;
            Ok(())
        })
    }

    /// Permanently drop a failed item.
    pub fn discard(&self, id: &str) -> Result<QueuedMutation> {
        let mut items = self.items();
        let seq = Self::find_seq(&items, id).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if !items[&seq].is_failed() {
            return Err(QueueError::NotFailed(id.to_string()).into());
        }
        self.kv.delete(&record_key(seq))?;
        let record = items.remove(&seq).ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        self.publish(&items);
        info!(mutation_id = %id, kind = %record.kind, "Failed mutation discarded");
        Ok(record)
    }

    /// Remove every item. `confirmed` must be true.
    pub fn clear(&self, confirmed: bool) -> Result<usize> {
        if !confirmed {
            return Err(QueueError::ConfirmationRequired.into());
        }
        let mut items = self.items();
        let seqs: Vec<u64> = items.keys().copied().collect();
        for seq in &seqs {
            self.kv.delete(&record_key(*seq))?;
            items.remove(seq);
        }
        self.publish(&items);
        warn!(removed = seqs.len(), "Mutation queue cleared");
        Ok(seqs.len())
    }

    #[must_use]
    pub fn status(&self) -> QueueStatus {
        *self.status_tx.borrow()
    }

    /// Observe status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<QueueStatus> {
        self.status_tx.subscribe()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }
}
