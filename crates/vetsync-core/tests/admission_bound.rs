//! Admission bound under reconnection bursts.
//!
//! More concurrent requests than the ceiling never yields more than the
//! ceiling in flight; excess requests queue up to capacity and are refused
//! beyond it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;

use vetsync_core::admission::{AdmissionConfig, AdmissionController};
use vetsync_core::backing_store::BackingStore;
use vetsync_core::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use vetsync_core::error::ResilienceError;
use vetsync_core::mutation::MutationKind;
use vetsync_core::priority::OperationClass;
use vetsync_core::rate_limiter::RateLimiter;
use vetsync_core::resilience::ResilienceLayer;
use vetsync_core::service::MutationService;
use vetsync_core::token_bucket::BucketConfig;
use vetsync_core::wire::SubmitRequest;

#[tokio::test(start_paused = true)]
async fn burst_is_bounded_queued_then_rejected() {
    let controller = AdmissionController::new(AdmissionConfig {
        max_concurrent: 3,
        queue_capacity: 5,
        max_wait_ms: 60_000,
    });
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..12 {
        let controller = controller.clone();
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        tasks.spawn(async move {
            let permit = controller.admit(OperationClass::AdministrationWrite).await?;
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            in_flight.fetch_sub(1, Ordering::SeqCst);
            drop(permit);
            Ok::<(), ResilienceError>(())
        });
    }

    let mut admitted = 0;
    let mut rejected = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined.unwrap() {
            Ok(()) => admitted += 1,
            Err(ResilienceError::AdmissionQueueFull { depth }) => {
                assert_eq!(depth, 5);
                rejected += 1;
            }
            Err(other) => panic!("unexpected admission error: {other}"),
        }
    }

    assert_eq!(admitted, 8);
    assert_eq!(rejected, 4);
    assert_eq!(peak.load(Ordering::SeqCst), 3);

    let snapshot = controller.snapshot();
    assert_eq!(snapshot.active, 0);
    assert_eq!(snapshot.queue_depth, 0);
    assert_eq!(snapshot.peak_active, 3);
    assert_eq!(snapshot.admitted_total, 8);
    assert_eq!(snapshot.rejected_total, 4);
}

#[tokio::test(start_paused = true)]
async fn waiter_past_deadline_times_out() {
    let controller = AdmissionController::new(AdmissionConfig {
        max_concurrent: 1,
        queue_capacity: 4,
        max_wait_ms: 500,
    });
    let held = controller.admit(OperationClass::Batch).await.unwrap();

    let err = controller
        .admit(OperationClass::AdministrationWrite)
        .await
        .unwrap_err();
    assert!(matches!(err, ResilienceError::AdmissionTimeout { .. }));
    assert_eq!(controller.queue_depth(), 0);

    drop(held);
    assert_eq!(controller.active(), 0);
    assert!(controller.admit(OperationClass::Read).await.is_ok());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn service_never_exceeds_admission_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let store = BackingStore::open(dir.path().join("server.db")).unwrap();
    store.create_lot("lot-1", "med-1", 1_000.0, "ml").unwrap();
    let resilience = Arc::new(ResilienceLayer::new(
        CircuitBreakerRegistry::uniform(&CircuitBreakerConfig::default()),
        RateLimiter::uniform(&BucketConfig {
            capacity: 1_000.0,
            refill_rate: 1_000.0,
            start_empty: false,
        }),
        AdmissionController::new(AdmissionConfig {
            max_concurrent: 2,
            queue_capacity: 64,
            max_wait_ms: 30_000,
        }),
    ));
    let svc = Arc::new(MutationService::new(
        store,
        Arc::clone(&resilience),
        Duration::from_secs(30),
    ));

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..24 {
        let svc = Arc::clone(&svc);
        tasks.spawn(async move {
            svc.submit(SubmitRequest {
                idempotency_key: format!("burst-{i}"),
                caller_id: format!("device-{}", i % 6),
                kind: MutationKind::AdjustInventoryQuantity,
                payload: json!({ "lotId": "lot-1", "delta": -1.0, "reason": "count" }),
            })
            .await
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap().unwrap();
    }

    let admission = resilience.admission.snapshot();
    assert!(admission.peak_active <= 2, "peak {}", admission.peak_active);
    assert_eq!(admission.admitted_total, 24);
    assert_eq!(admission.active, 0);
    let lot = svc.store().lot("lot-1").unwrap().unwrap();
    assert!((lot.quantity_remaining - 976.0).abs() < f64::EPSILON);
}
