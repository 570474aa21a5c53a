//! Client-side drain loop.
//!
//! One [`SyncEngine`] drives one device queue. Each drain walks pending
//! items in insertion order and, per item, moves it through
//! `pending -> in-flight -> {delivered, retry-wait, failed}`:
//!
//! - delivered: the item is acknowledged and removed;
//! - retry-wait: the attempt is recorded with a backoff deadline and every
//!   resource the item touches is held for the rest of the drain, so a later
//!   item for the same animal or lot cannot overtake it. A refusal aimed at
//!   the whole operation class (rate limited, circuit open, overloaded)
//!   also pauses that class until the next drain;
//! - failed: a terminal refusal. Nothing is held and the drain continues.
//!
//! An unreachable server interrupts the drain. Items not yet due also hold
//! their resources unless the drain is forced ("sync now"), and a skipped
//! item passes its holds on to everything behind it.
//!
//! Timekeeping uses `tokio::time::Instant` anchored at the wall clock when
//! the engine is built, so a paused test clock drives backoff deadlines too.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connectivity::ConnectivityMonitor;
use crate::error::QueueError;
use crate::mutation::{QueuedMutation, epoch_ms};
use crate::mutation_queue::MutationQueueStore;
use crate::priority::OperationClass;
use crate::retry::RetryPolicy;
use crate::transport::{DeliveryError, FailureClass, MutationTransport};
use crate::wire::SubmitRequest;

/// Why a drain could not run.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("a drain is already running")]
    DrainInProgress,

    #[error("device is offline")]
    Offline,

    #[error(transparent)]
    Queue(#[from] crate::Error),
}

/// Outcome counts of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub delivered: usize,
    /// Retryable failures left pending with a backoff deadline.
    pub retried: usize,
    /// Items moved to the failed state, by refusal or exhausted attempts.
    pub failed: usize,
    /// Items not attempted: not yet due, or behind a held resource.
    pub skipped: usize,
    /// The drain stopped early because the server was unreachable.
    pub interrupted: bool,
}

impl DrainReport {
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.delivered + self.retried + self.failed
    }
}

/// Status surface for the online indicator and pending badge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub online: bool,
    pub pending: usize,
    pub failed: usize,
    pub draining: bool,
    pub last_drain_at_ms: Option<u64>,
    pub last_report: Option<DrainReport>,
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub caller_id: String,
    pub retry: RetryPolicy,
    /// Upper bound on one delivery attempt; expiry counts as retryable.
    pub request_timeout: Duration,
}

impl SyncSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            caller_id: config.client.caller_id.clone(),
            retry: config.retry.to_policy(),
            request_timeout: config.client.request_timeout(),
        }
    }
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Drains a [`MutationQueueStore`] through a [`MutationTransport`].
pub struct SyncEngine {
    queue: Arc<MutationQueueStore>,
    transport: Arc<dyn MutationTransport>,
    connectivity: ConnectivityMonitor,
    settings: SyncSettings,
    draining: AtomicBool,
    sync_requested: Notify,
    last_drain: Mutex<Option<(u64, DrainReport)>>,
    status_tx: watch::Sender<SyncStatus>,
    epoch_origin_ms: u64,
    origin: Instant,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("caller_id", &self.settings.caller_id)
            .field("draining", &self.draining.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    #[must_use]
    pub fn new(
        queue: Arc<MutationQueueStore>,
        transport: Arc<dyn MutationTransport>,
        connectivity: ConnectivityMonitor,
        settings: SyncSettings,
    ) -> Self {
        let (status_tx, _) = watch::channel(SyncStatus::default());
        let engine = Self {
            queue,
            transport,
            connectivity,
            settings,
            draining: AtomicBool::new(false),
            sync_requested: Notify::new(),
            last_drain: Mutex::new(None),
            status_tx,
            epoch_origin_ms: epoch_ms(),
            origin: Instant::now(),
        };
        engine.publish();
        engine
    }

    /// Milliseconds since the Unix epoch on the engine clock.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        let elapsed = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.epoch_origin_ms.saturating_add(elapsed)
    }

    #[must_use]
    pub fn queue(&self) -> &Arc<MutationQueueStore> {
        &self.queue
    }

    #[must_use]
    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        let queue = self.queue.status();
        let last = *self.last_drain.lock().unwrap_or_else(PoisonError::into_inner);
        SyncStatus {
            online: self.connectivity.is_online(),
            pending: queue.pending,
            failed: queue.failed,
            draining: self.is_draining(),
            last_drain_at_ms: last.map(|(at, _)| at),
            last_report: last.map(|(_, report)| report),
        }
    }

    /// Observe status changes published at drain boundaries and by the loop.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    fn publish(&self) {
        let status = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
    }

    /// "Sync now": drain immediately, ignoring backoff deadlines.
    pub async fn sync_now(&self) -> Result<DrainReport, SyncError> {
        if !self.connectivity.is_online() {
            return Err(SyncError::Offline);
        }
        self.drain_once(true).await
    }

    /// Ask a running [`Self::run`] loop for a forced drain without waiting.
    pub fn request_sync(&self) {
        self.sync_requested.notify_one();
    }

    /// Run one pass over the queue. Fails with `DrainInProgress` rather than
    /// start a second concurrent drain.
    pub async fn drain_once(&self, force: bool) -> Result<DrainReport, SyncError> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SyncError::DrainInProgress);
        }
        let guard = DrainGuard(&self.draining);
        self.publish();

        let result = self.drain_pass(force).await;

        if let Ok(report) = &result {
            *self.last_drain.lock().unwrap_or_else(PoisonError::into_inner) =
                Some((self.now_ms(), *report));
            if report.attempted() > 0 || report.interrupted {
                info!(
                    delivered = report.delivered,
                    retried = report.retried,
                    failed = report.failed,
                    skipped = report.skipped,
                    interrupted = report.interrupted,
                    "Drain finished"
                );
            }
        }
        drop(guard);
        self.publish();
        result
    }

    async fn drain_pass(&self, force: bool) -> Result<DrainReport, SyncError> {
        let mut report = DrainReport::default();
        let mut held: HashSet<String> = HashSet::new();
        let mut paused: HashSet<OperationClass> = HashSet::new();
        let mut cursor = None;

        while let Some(item) = self.queue.pending_after(cursor) {
            cursor = Some(item.seq);
            let resources = item.resources();
            let class = item.kind.operation_class();

            if paused.contains(&class) || resources.iter().any(|r| held.contains(r)) {
                debug!(mutation_id = %item.id, "Held behind an earlier item");
                held.extend(resources);
                report.skipped += 1;
                continue;
            }
            if !force && !item.is_due(self.now_ms()) {
                held.extend(resources);
                report.skipped += 1;
                continue;
            }
            if !self.connectivity.is_online() {
                report.interrupted = true;
                break;
            }

            let err = match self.deliver(&item).await {
                Ok(()) => {
                    self.queue.ack(&item.id)?;
                    report.delivered += 1;
                    continue;
                }
                Err(err) => err,
            };
            let failure = err.class();
            if failure == FailureClass::Terminal {
                if skip_removed(self.queue.mark_failed(&item.id, &err.to_string()))?.is_some() {
                    report.failed += 1;
                }
                continue;
            }
            let attempt = item.attempts.saturating_add(1);
            let delay = self.settings.retry.delay_with_hint(attempt, err.retry_after());
            let next_attempt_at = self
                .now_ms()
                .saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
            let updated = skip_removed(self.queue.mark_attempt(
                &item.id,
                &err.to_string(),
                Some(next_attempt_at),
            ))?;
            match updated {
                Some(updated) if updated.is_failed() => report.failed += 1,
                Some(_) => {
                    debug!(
                        mutation_id = %item.id,
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Delivery failed; backing off"
                    );
                    report.retried += 1;
                    held.extend(resources);
                }
                None => {}
            }
            if err.is_class_wide() && paused.insert(class) {
                info!(
                    operation_class = %class,
                    error = %err,
                    "Server refused the class; pausing it for this drain"
                );
            }
            if failure == FailureClass::Offline {
                report.interrupted = true;
                break;
            }
        }
        Ok(report)
    }

    async fn deliver(&self, item: &QueuedMutation) -> Result<(), DeliveryError> {
        let request = SubmitRequest::for_mutation(item, &self.settings.caller_id);
        let timeout = self.settings.request_timeout;
        match tokio::time::timeout(timeout, self.transport.submit(request)).await {
            Ok(Ok(response)) => {
                debug!(
                    mutation_id = %item.id,
                    kind = %item.kind,
                    replayed = response.replayed,
                    "Mutation delivered"
                );
                Ok(())
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(DeliveryError::Timeout(timeout)),
        }
    }

    fn next_wakeup(&self) -> Option<Duration> {
        let now = self.now_ms();
        self.queue
            .next_due_after(now)
            .map(|due| Duration::from_millis(due - now))
    }

    /// Drive drains until `shutdown` turns true.
    ///
    /// Drains start when connectivity comes back, when the queue changes,
    /// when a backoff deadline passes, and on [`Self::request_sync`].
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut online_rx = self.connectivity.subscribe();
        let mut queue_rx = self.queue.subscribe();
        let mut force = false;
        info!(caller = %self.settings.caller_id, "Sync engine started");

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            online_rx.borrow_and_update();
            if self.connectivity.is_online() {
                queue_rx.borrow_and_update();
                match self.drain_once(force).await {
                    Ok(_) | Err(SyncError::DrainInProgress | SyncError::Offline) => {}
                    Err(SyncError::Queue(err)) => {
                        warn!(error = %err, "Drain aborted by queue storage error");
                    }
                }
            }
            force = false;
            self.publish();

            let wakeup = self.next_wakeup();
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = queue_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                () = self.sync_requested.notified() => {
                    force = true;
                }
                () = sleep_for(wakeup) => {}
            }
        }
        info!("Sync engine stopped");
    }
}

/// An item removed while its delivery was in flight (queue cleared or item
/// discarded) is not an error for the drain.
fn skip_removed(
    result: crate::Result<QueuedMutation>,
) -> Result<Option<QueuedMutation>, SyncError> {
    match result {
        Ok(record) => Ok(Some(record)),
        Err(crate::Error::Queue(QueueError::NotFound(id))) => {
            debug!(mutation_id = %id, "Item left the queue during delivery");
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

async fn sleep_for(delay: Option<Duration>) {
    match delay {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::kv_store::MemoryKv;
    use crate::mutation::MutationKind;
    use crate::wire::{MutationResult, SubmitResponse};
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::collections::VecDeque;

    /// Transport that answers from a script and records every key sent.
    #[derive(Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<(), DeliveryError>>>,
        sent: Mutex<Vec<String>>,
        latency: Mutex<Duration>,
        clear_during_submit: Mutex<Option<Arc<MutationQueueStore>>>,
    }

    impl ScriptedTransport {
        fn push(&self, outcome: Result<(), DeliveryError>) {
            self.script.lock().unwrap().push_back(outcome);
        }

        fn set_latency(&self, latency: Duration) {
            *self.latency.lock().unwrap() = latency;
        }

        /// The next submission wipes `queue` before answering.
        fn clear_during_next_submit(&self, queue: Arc<MutationQueueStore>) {
            *self.clear_during_submit.lock().unwrap() = Some(queue);
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MutationTransport for ScriptedTransport {
        async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, DeliveryError> {
            self.sent.lock().unwrap().push(request.idempotency_key.clone());
            let latency = *self.latency.lock().unwrap();
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            let clear = self.clear_during_submit.lock().unwrap().take();
            if let Some(queue) = clear {
                queue.clear(true).unwrap();
            }
            let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
            outcome.map(|()| SubmitResponse {
                result: MutationResult {
                    operation_key: request.idempotency_key,
                    kind: request.kind,
                    resource_id: String::new(),
                    applied_at_ms: 0,
                    detail: Value::Null,
                },
                replayed: false,
            })
        }
    }

    fn server_error() -> DeliveryError {
        DeliveryError::Server {
            status: 503,
            code: "store_unavailable".to_string(),
            message: "overloaded".to_string(),
            retry_after: None,
        }
    }

    fn rejected() -> DeliveryError {
        DeliveryError::Rejected {
            status: 422,
            code: "validation_failed".to_string(),
            message: "bad".to_string(),
        }
    }

    fn engine(max_attempts: u32) -> (Arc<ScriptedTransport>, SyncEngine) {
        let queue = MutationQueueStore::open(
            Arc::new(MemoryKv::new()),
            QueueConfig {
                max_attempts,
                ..QueueConfig::default()
            },
        )
        .unwrap();
        let transport = Arc::new(ScriptedTransport::default());
        let engine = SyncEngine::new(
            Arc::new(queue),
            transport.clone(),
            ConnectivityMonitor::new(true),
            SyncSettings {
                caller_id: "device-a".to_string(),
                retry: RetryPolicy::deterministic(
                    Duration::from_secs(1),
                    Duration::from_secs(60),
                    2.0,
                ),
                request_timeout: Duration::from_secs(5),
            },
        );
        (transport, engine)
    }

    fn rate_limited() -> DeliveryError {
        DeliveryError::RateLimited {
            retry_after: Some(Duration::from_secs(30)),
        }
    }

    fn lot_use(lot: &str) -> Value {
        json!({"lotId": lot, "inUse": true})
    }

    fn enqueue(engine: &SyncEngine, id: &str, lot: &str) {
        engine
            .queue()
            .enqueue_with_id(id, MutationKind::MarkInventoryInUse, lot_use(lot))
            .unwrap();
    }

    fn administer(engine: &SyncEngine, id: &str, animal: &str, lot: Option<&str>) {
        let mut payload = json!({
            "animalId": animal,
            "medicationId": "med-1",
            "doseAmount": 1.0,
            "doseUnit": "ml",
            "administeredAtMs": 1_700_000_000_000_u64,
            "administeredBy": "tech-1",
        });
        if let Some(lot) = lot {
            payload["inventoryLotId"] = json!(lot);
        }
        engine
            .queue()
            .enqueue_with_id(id, MutationKind::RecordAdministration, payload)
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_insertion_order() {
        let (transport, engine) = engine(5);
        enqueue(&engine, "m1", "a");
        enqueue(&engine, "m2", "b");
        enqueue(&engine, "m3", "a");

        let report = engine.drain_once(false).await.unwrap();
        assert_eq!(report.delivered, 3);
        assert_eq!(transport.sent(), vec!["m1", "m2", "m3"]);
        assert!(engine.queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failure_holds_same_resource_only() {
        let (transport, engine) = engine(5);
        enqueue(&engine, "m1", "a");
        enqueue(&engine, "m2", "a");
        enqueue(&engine, "m3", "b");
        transport.push(Err(server_error()));

        let report = engine.drain_once(false).await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.delivered, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(transport.sent(), vec!["m1", "m3"]);

        let m1 = engine.queue().get("m1").unwrap();
        assert_eq!(m1.attempts, 1);
        assert!(m1.last_error.unwrap().contains("overloaded"));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_deadline_respected_until_forced() {
        let (transport, engine) = engine(5);
        enqueue(&engine, "m1", "a");
        transport.push(Err(server_error()));
        engine.drain_once(false).await.unwrap();

        let report = engine.drain_once(false).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(transport.sent().len(), 1);

        tokio::time::advance(Duration::from_millis(1_001)).await;
        let report = engine.drain_once(false).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(transport.sent(), vec!["m1", "m1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_now_ignores_backoff() {
        let (transport, engine) = engine(5);
        enqueue(&engine, "m1", "a");
        transport.push(Err(server_error()));
        engine.drain_once(false).await.unwrap();

        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(transport.sent(), vec!["m1", "m1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_does_not_block_queue() {
        let (transport, engine) = engine(5);
        enqueue(&engine, "m1", "a");
        enqueue(&engine, "m2", "a");
        transport.push(Err(rejected()));

        let report = engine.drain_once(false).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(report.delivered, 1);
        let m1 = engine.queue().get("m1").unwrap();
        assert!(m1.is_failed());
        assert_eq!(engine.status().failed, 1);
        assert_eq!(engine.status().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn offline_error_interrupts_drain() {
        let (transport, engine) = engine(5);
        enqueue(&engine, "m1", "a");
        enqueue(&engine, "m2", "b");
        transport.push(Err(DeliveryError::Offline("refused".to_string())));

        let report = engine.drain_once(false).await.unwrap();
        assert!(report.interrupted);
        assert_eq!(transport.sent(), vec!["m1"]);
        assert_eq!(engine.queue().get("m2").unwrap().attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_now_refused_while_offline() {
        let (_transport, engine) = engine(5);
        engine.connectivity().set_online(false);
        assert!(matches!(engine.sync_now().await, Err(SyncError::Offline)));
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_drains_on_reconnect_and_retries_on_timer() {
        let (transport, engine) = engine(5);
        let engine = Arc::new(engine);
        engine.connectivity().set_online(false);
        enqueue(&engine, "m1", "a");
        transport.push(Err(server_error()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run(shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(transport.sent().is_empty());

        engine.connectivity().set_online(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.sent(), vec!["m1"]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(transport.sent(), vec!["m1", "m1"]);
        assert!(engine.queue().is_empty());

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap();
        let status = engine.status();
        assert!(status.last_drain_at_ms.is_some());
        assert_eq!(status.pending, 0);
        assert!(!status.draining);
    }

    #[tokio::test(start_paused = true)]
    async fn class_wide_refusal_pauses_the_class() {
        let (transport, engine) = engine(5);
        enqueue(&engine, "m1", "a");
        enqueue(&engine, "m2", "b");
        enqueue(&engine, "m3", "c");
        administer(&engine, "dose", "cat-1", None);
        transport.push(Err(rate_limited()));

        let report = engine.drain_once(false).await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.delivered, 1);
        assert_eq!(transport.sent(), vec!["m1", "dose"]);
        assert_eq!(engine.queue().get("m2").unwrap().attempts, 0);
        assert_eq!(engine.queue().get("m3").unwrap().attempts, 0);

        let report = engine.sync_now().await.unwrap();
        assert_eq!(report.delivered, 3);
        assert!(engine.queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_item_passes_its_holds_on() {
        let (transport, engine) = engine(5);
        enqueue(&engine, "m1", "a");
        // Held behind m1 on lot a; its hold on cat-1 must carry over.
        administer(&engine, "dose", "cat-1", Some("a"));
        administer(&engine, "dose2", "cat-1", None);
        transport.push(Err(server_error()));

        let report = engine.drain_once(false).await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.skipped, 2);
        assert_eq!(transport.sent(), vec!["m1"]);
        assert_eq!(engine.queue().get("dose2").unwrap().attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn item_removed_during_delivery_does_not_abort_drain() {
        let (transport, engine) = engine(5);
        enqueue(&engine, "m1", "a");
        transport.push(Err(server_error()));
        transport.clear_during_next_submit(Arc::clone(engine.queue()));

        let report = engine.drain_once(false).await.unwrap();
        assert_eq!(report.attempted(), 0);
        assert!(engine.queue().is_empty());

        enqueue(&engine, "m2", "b");
        transport.push(Err(rejected()));
        transport.clear_during_next_submit(Arc::clone(engine.queue()));
        let report = engine.drain_once(false).await.unwrap();
        assert_eq!(report.failed, 0);
        assert!(engine.queue().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn sync_now_refused_while_drain_running() {
        let (transport, engine) = engine(5);
        let engine = Arc::new(engine);
        enqueue(&engine, "m1", "a");
        enqueue(&engine, "m2", "b");
        transport.set_latency(Duration::from_millis(100));

        let first = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.drain_once(false).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(engine.is_draining());
        assert!(matches!(
            engine.sync_now().await,
            Err(SyncError::DrainInProgress)
        ));

        let report = first.await.unwrap().unwrap();
        assert_eq!(report.delivered, 2);
        assert_eq!(transport.sent(), vec!["m1", "m2"]);
        assert!(!engine.is_draining());
    }

    #[tokio::test(start_paused = true)]
    async fn requested_sync_ignores_backoff_in_run_loop() {
        let (transport, engine) = engine(5);
        let engine = Arc::new(engine);
        transport.push(Err(server_error()));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runner = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.run(shutdown_rx).await })
        };

        enqueue(&engine, "m1", "a");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.sent(), vec!["m1"]);
        assert_eq!(engine.queue().get("m1").unwrap().attempts, 1);

        // Backoff is one second; the request goes through well before it.
        engine.request_sync();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.sent(), vec!["m1", "m1"]);
        assert!(engine.queue().is_empty());

        shutdown_tx.send(true).unwrap();
        runner.await.unwrap();
    }
}
