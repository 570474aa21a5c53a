//! Priority-ordered admission in front of the backing store.
//!
//! At most `max_concurrent` requests hold an [`AdmissionPermit`] at once.
//! Requests arriving while every slot is taken wait in a bounded priority
//! queue (higher [`AdmissionPriority`] first, FIFO within a priority) until
//! a slot frees up or their deadline passes. Arrivals that find the queue at
//! `queue_capacity` are rejected immediately.
//!
//! A released permit hands its slot straight to the best waiter, so the
//! concurrency count never dips and re-rises around a hand-off.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ResilienceError;
use crate::priority::{AdmissionPriority, OperationClass};

/// Admission queue configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Ceiling on concurrently admitted requests
    pub max_concurrent: usize,
    /// Waiters beyond this are rejected outright
    pub queue_capacity: usize,
    /// Longest a request may wait for a slot
    pub max_wait_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            queue_capacity: 64,
            max_wait_ms: 2_000,
        }
    }
}

impl AdmissionConfig {
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Serializable admission statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionSnapshot {
    pub active: usize,
    pub queue_depth: usize,
    pub max_concurrent: usize,
    pub queue_capacity: usize,
    pub peak_active: usize,
    pub admitted_total: u64,
    pub rejected_total: u64,
    pub timed_out_total: u64,
}

struct Waiter {
    priority: AdmissionPriority,
    seq: u64,
    class: OperationClass,
    tx: oneshot::Sender<AdmissionPermit>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    // Max-heap: higher priority first, then lower sequence (older) first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct State {
    active: usize,
    waiters: BinaryHeap<Waiter>,
    next_seq: u64,
}

struct Inner {
    config: AdmissionConfig,
    state: Mutex<State>,
    peak_active: AtomicUsize,
    admitted_total: AtomicU64,
    rejected_total: AtomicU64,
    timed_out_total: AtomicU64,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn note_admitted(&self, active: usize) {
        self.admitted_total.fetch_add(1, AtomicOrdering::Relaxed);
        self.peak_active.fetch_max(active, AtomicOrdering::Relaxed);
    }
}

/// Pass a freed slot to the best waiter, or return it to the pool.
fn hand_off(inner: &Arc<Inner>) {
    loop {
        let (waiter, active) = {
            let mut state = inner.state();
            match state.waiters.pop() {
                Some(waiter) => (waiter, state.active),
                None => {
                    state.active = state.active.saturating_sub(1);
                    return;
                }
            }
        };
        let permit = AdmissionPermit {
            inner: Some(Arc::clone(inner)),
            class: waiter.class,
            priority: waiter.priority,
        };
        match waiter.tx.send(permit) {
            Ok(()) => {
                inner.note_admitted(active);
                return;
            }
            // Waiter gave up between pop and send; try the next one.
            Err(mut unclaimed) => unclaimed.disarm(),
        }
    }
}

/// A held admission slot. Dropping it frees the slot.
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct AdmissionPermit {
    inner: Option<Arc<Inner>>,
    class: OperationClass,
    priority: AdmissionPriority,
}

impl AdmissionPermit {
    #[must_use]
    pub fn class(&self) -> OperationClass {
        self.class
    }

    #[must_use]
    pub fn priority(&self) -> AdmissionPriority {
        self.priority
    }

    fn disarm(&mut self) {
        self.inner = None;
    }
}

impl std::fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("class", &self.class)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            hand_off(&inner);
        }
    }
}

/// Removes an abandoned waiter from the queue.
struct WaitGuard<'a> {
    inner: &'a Inner,
    seq: u64,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        let seq = self.seq;
        self.inner.state().waiters.retain(|w| w.seq != seq);
    }
}

/// Bounded priority admission queue. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl AdmissionController {
    #[must_use]
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State::default()),
                peak_active: AtomicUsize::new(0),
                admitted_total: AtomicU64::new(0),
                rejected_total: AtomicU64::new(0),
                timed_out_total: AtomicU64::new(0),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &AdmissionConfig {
        &self.inner.config
    }

    /// Wait for a slot for `class`, up to the configured `max_wait`.
    pub async fn admit(&self, class: OperationClass) -> Result<AdmissionPermit, ResilienceError> {
        let deadline = Instant::now() + self.inner.config.max_wait();
        self.admit_until(class, deadline).await
    }

    /// Wait for a slot for `class` until `deadline`.
    pub async fn admit_until(
        &self,
        class: OperationClass,
        deadline: Instant,
    ) -> Result<AdmissionPermit, ResilienceError> {
        let priority = class.priority();
        let submitted_at = Instant::now();

        let (rx, seq) = {
            let mut state = self.inner.state();
            if state.active < self.inner.config.max_concurrent && state.waiters.is_empty() {
                state.active += 1;
                let active = state.active;
                drop(state);
                self.inner.note_admitted(active);
                return Ok(AdmissionPermit {
                    inner: Some(Arc::clone(&self.inner)),
                    class,
                    priority,
                });
            }
            if state.waiters.len() >= self.inner.config.queue_capacity {
                let depth = state.waiters.len();
                drop(state);
                self.inner.rejected_total.fetch_add(1, AtomicOrdering::Relaxed);
                warn!(
                    operation_class = %class,
                    priority = priority.label(),
                    depth,
                    "Admission queue full; rejecting request"
                );
                return Err(ResilienceError::AdmissionQueueFull { depth });
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            let (tx, rx) = oneshot::channel();
            state.waiters.push(Waiter {
                priority,
                seq,
                class,
                tx,
            });
            debug!(
                operation_class = %class,
                priority = priority.label(),
                depth = state.waiters.len(),
                "Request queued for admission"
            );
            (rx, seq)
        };

        let _guard = WaitGuard {
            inner: &self.inner,
            seq,
        };
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) | Err(_) => {
                self.inner
                    .timed_out_total
                    .fetch_add(1, AtomicOrdering::Relaxed);
                let waited_ms =
                    u64::try_from(submitted_at.elapsed().as_millis()).unwrap_or(u64::MAX);
                debug!(
                    operation_class = %class,
                    waited_ms,
                    "Admission deadline exceeded"
                );
                Err(ResilienceError::AdmissionTimeout { waited_ms })
            }
        }
    }

    /// Current concurrently admitted requests.
    #[must_use]
    pub fn active(&self) -> usize {
        self.inner.state().active
    }

    /// Current number of waiters.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.inner.state().waiters.len()
    }

    #[must_use]
    pub fn snapshot(&self) -> AdmissionSnapshot {
        let (active, queue_depth) = {
            let state = self.inner.state();
            (state.active, state.waiters.len())
        };
        AdmissionSnapshot {
            active,
            queue_depth,
            max_concurrent: self.inner.config.max_concurrent,
            queue_capacity: self.inner.config.queue_capacity,
            peak_active: self.inner.peak_active.load(AtomicOrdering::Relaxed),
            admitted_total: self.inner.admitted_total.load(AtomicOrdering::Relaxed),
            rejected_total: self.inner.rejected_total.load(AtomicOrdering::Relaxed),
            timed_out_total: self.inner.timed_out_total.load(AtomicOrdering::Relaxed),
        }
    }
}
