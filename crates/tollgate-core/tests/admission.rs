//! Admission controller behavior through the public API

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_pending, assert_ready_ok, task};
use tollgate_core::{
    AdmissionConfig, AdmissionController, CancellationToken, Error, OutputEstimationStrategy,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tollgate_core=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// 1000-token limit with a 100-token buffer; reservations hold exactly the
/// input tokens unless an output estimate is given.
fn base_config() -> AdmissionConfig {
    AdmissionConfig::with_limits(1_000, 60, 100)
        .with_output_estimation(OutputEstimationStrategy::FixedAmount, 1.0, 0)
        .with_wait_bounds(10, 1_000)
        .with_jitter_range_ms(0)
}

fn controller(config: AdmissionConfig) -> AdmissionController {
    init_tracing();
    AdmissionController::new(config).unwrap()
}

#[tokio::test]
async fn test_boundary_first_reserve_is_immediate_second_waits() {
    let c = controller(base_config());

    let start = std::time::Instant::now();
    let _first = c.reserve(100, 0).await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));

    // 100 + 850 = 950 > 900
    let second = tokio::time::timeout(Duration::from_millis(50), c.reserve(850, 0)).await;
    assert!(second.is_err());

    // The abandoned wait left nothing behind
    assert_eq!(c.reserved_tokens().await, 100);
    assert_eq!(c.available_slots(), 9);
}

#[tokio::test]
async fn test_finalize_with_actual_usage() {
    let c = controller(base_config());

    let mut handle = c.reserve(100, 0).await.unwrap();
    assert_eq!(c.reserved_tokens().await, 100);
    assert_eq!(c.current_usage().await, 100);

    handle.record_actual_usage(80);
    handle.finalize().await;

    assert!(handle.is_finalized());
    assert_eq!(c.reserved_tokens().await, 0);
    assert_eq!(c.current_usage().await, 80);
    assert_eq!(c.historical_usage().await, 80);
}

#[tokio::test]
async fn test_finalize_without_usage_frees_slot_and_tokens() {
    let c = controller(base_config().with_max_concurrent_reservations(1));

    let mut handle = c.reserve(300, 0).await.unwrap();
    assert_eq!(c.available_slots(), 0);

    handle.finalize().await;

    assert_eq!(c.available_slots(), 1);
    assert_eq!(c.reserved_tokens().await, 0);
    assert_eq!(c.current_usage().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_usage_expires_after_window() {
    let c = controller(base_config());

    let mut handle = c.reserve(100, 0).await.unwrap();
    handle.record_actual_usage(80);
    handle.finalize().await;
    assert_eq!(c.current_usage().await, 80);

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(c.current_usage().await, 80);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(c.current_usage().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_third_concurrent_reserve_blocks_until_release() {
    let c = controller(base_config().with_max_concurrent_reservations(2));

    let mut first = c.reserve(10, 0).await.unwrap();
    let _second = c.reserve(10, 0).await.unwrap();

    let mut third = task::spawn(c.reserve(10, 0));
    assert_pending!(third.poll());
    assert_pending!(third.poll());

    first.finalize().await;
    assert!(third.is_woken());

    let handle = assert_ready_ok!(third.poll());
    assert_eq!(handle.reserved_tokens(), 10);
    assert_eq!(c.usage_stats().await.active_reservations, 2);
}

#[tokio::test(start_paused = true)]
async fn test_request_limit_blocks_sixth_request() {
    let c = controller(base_config().with_max_requests_per_minute(5));

    for _ in 0..5 {
        let mut handle = c.reserve(10, 0).await.unwrap();
        handle.finalize().await;
    }
    assert_eq!(c.usage_stats().await.requests_in_last_minute, 5);

    // Plenty of tokens left, but the minute is used up
    let sixth = tokio::time::timeout(Duration::from_millis(500), c.reserve(10, 0)).await;
    assert!(sixth.is_err());
    assert_eq!(c.usage_stats().await.available_tokens, 900);

    tokio::time::advance(Duration::from_secs(61)).await;
    let handle = tokio::time::timeout(Duration::from_millis(1), c.reserve(10, 0))
        .await
        .expect("request slot should be free after a minute")
        .unwrap();
    assert_eq!(handle.reserved_tokens(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_waiting_reserve_admitted_when_capacity_frees() {
    let c = controller(base_config());
    let mut big = c.reserve(800, 0).await.unwrap();

    let waiter = tokio::spawn({
        let c = c.clone();
        async move { c.reserve(200, 0).await }
    });

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(!waiter.is_finished());

    big.finalize().await;
    let handle = waiter.await.unwrap().unwrap();
    assert_eq!(handle.reserved_tokens(), 200);
    assert_eq!(c.reserved_tokens().await, 200);
}

#[tokio::test(start_paused = true)]
async fn test_capacity_timeout_leaves_no_reservation() {
    let c = controller(base_config().with_max_wait_retries(2));
    let _held = c.reserve(100, 0).await.unwrap();

    let err = c.reserve(850, 0).await.unwrap_err();
    assert!(err.is_retryable());
    match err {
        Error::CapacityTimeout {
            attempts,
            requested,
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(requested, 850);
        }
        other => panic!("expected capacity timeout, got {other:?}"),
    }

    assert_eq!(c.reserved_tokens().await, 100);
    assert_eq!(c.usage_stats().await.active_reservations, 1);
    assert_eq!(c.available_slots(), 9);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_capacity_wait_releases_slot() {
    let c = controller(base_config());
    let _held = c.reserve(800, 0).await.unwrap();
    let cancel = CancellationToken::new();

    let waiter = tokio::spawn({
        let c = c.clone();
        let cancel = cancel.clone();
        async move { c.reserve_with_cancel(200, 0, &cancel).await }
    });

    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(c.available_slots(), 8);

    cancel.cancel();
    let result = waiter.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(c.available_slots(), 9);
    assert_eq!(c.reserved_tokens().await, 800);
}

#[tokio::test]
async fn test_cancel_while_waiting_for_slot() {
    let c = controller(base_config().with_max_concurrent_reservations(1));
    let _held = c.reserve(10, 0).await.unwrap();
    let cancel = CancellationToken::new();

    let mut pending = task::spawn(c.reserve_with_cancel(10, 0, &cancel));
    assert_pending!(pending.poll());

    cancel.cancel();
    assert!(pending.is_woken());
    match pending.poll() {
        std::task::Poll::Ready(Err(Error::Cancelled)) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }
    drop(pending);

    assert_eq!(c.available_slots(), 0);
    assert_eq!(c.reserved_tokens().await, 10);
}

#[tokio::test]
async fn test_already_cancelled_token_fails_fast() {
    let c = controller(base_config());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = c.reserve_with_cancel(10, 0, &cancel).await;
    assert!(matches!(result, Err(Error::Cancelled)));
    assert_eq!(c.available_slots(), 10);
}

#[tokio::test]
async fn test_invalid_arguments_rejected_without_side_effects() {
    let c = controller(base_config());

    assert!(matches!(
        c.reserve(0, 0).await,
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        c.try_reserve(0, 10).await,
        Err(Error::InvalidArgument(_))
    ));

    let stats = c.usage_stats().await;
    assert_eq!(stats.current_usage, 0);
    assert_eq!(stats.requests_in_last_minute, 0);
    assert_eq!(stats.available_slots, 10);
}

#[tokio::test]
async fn test_oversized_request_times_out_without_waiting() {
    let c = controller(base_config().with_max_concurrent_reservations(1));

    // 1000 tokens can never fit under the 900-token effective limit
    let start = std::time::Instant::now();
    let err = c.reserve(500, 500).await.unwrap_err();
    assert!(start.elapsed() < Duration::from_millis(100));
    assert!(err.is_retryable());
    assert!(matches!(
        err,
        Error::CapacityTimeout {
            attempts: 0,
            requested: 1_000,
        }
    ));

    assert!(matches!(
        c.try_reserve(901, 0).await,
        Err(Error::CapacityTimeout { attempts: 0, .. })
    ));

    let stats = c.usage_stats().await;
    assert_eq!(stats.current_usage, 0);
    assert_eq!(stats.requests_in_last_minute, 0);
    assert_eq!(stats.available_slots, 1);
}

#[tokio::test]
async fn test_output_estimation_strategies() {
    let conservative = controller(base_config().with_output_estimation(
        OutputEstimationStrategy::Conservative,
        1.0,
        0,
    ));
    let handle = conservative.reserve(100, 0).await.unwrap();
    assert_eq!(handle.reserved_tokens(), 200);
    assert_eq!(handle.estimated_output_tokens(), 100);

    let multiplier = controller(base_config().with_output_estimation(
        OutputEstimationStrategy::FixedMultiplier,
        0.25,
        0,
    ));
    let handle = multiplier.reserve(101, 0).await.unwrap();
    assert_eq!(handle.reserved_tokens(), 101 + 26);

    // Caller estimate overrides the strategy
    let handle = multiplier.reserve(100, 40).await.unwrap();
    assert_eq!(handle.reserved_tokens(), 140);
    assert_eq!(handle.input_tokens(), 100);
}

#[tokio::test]
async fn test_finalize_is_idempotent() {
    let c = controller(base_config());

    let mut handle = c.reserve(100, 0).await.unwrap();
    handle.record_actual_usage(60);
    handle.finalize().await;
    handle.finalize().await;
    handle.finalize_detached();

    // Ignored after finalize
    handle.record_actual_usage(10);
    assert_eq!(handle.actual_tokens(), Some(60));
    drop(handle);

    let stats = c.usage_stats().await;
    assert_eq!(stats.reserved_tokens, 0);
    assert_eq!(stats.historical_usage, 60);
    assert_eq!(stats.available_slots, 10);
}

#[tokio::test]
async fn test_repeated_record_and_finalize_matches_single_call() {
    let once = controller(base_config());
    let mut handle = once.reserve(100, 0).await.unwrap();
    handle.record_actual_usage(75);
    handle.finalize().await;

    let repeated = controller(base_config());
    let mut handle = repeated.reserve(100, 0).await.unwrap();
    handle.record_actual_usage(75);
    handle.finalize().await;
    handle.record_actual_usage(75);
    handle.finalize().await;
    handle.record_actual_usage(500);
    handle.finalize().await;

    let expected = once.usage_stats().await;
    let actual = repeated.usage_stats().await;
    assert_eq!(actual.historical_usage, expected.historical_usage);
    assert_eq!(actual.reserved_tokens, expected.reserved_tokens);
    assert_eq!(actual.active_reservations, expected.active_reservations);
    assert_eq!(actual.available_slots, expected.available_slots);
    assert_eq!(actual.requests_in_last_minute, 1);
}

#[tokio::test]
async fn test_record_actual_usage_replaces_previous_value() {
    let c = controller(base_config());

    let mut handle = c.reserve(100, 0).await.unwrap();
    handle.record_actual_usage(70);
    handle.record_actual_usage(90);
    assert_eq!(handle.actual_tokens(), Some(90));
    handle.finalize().await;

    assert_eq!(c.historical_usage().await, 90);
}

#[tokio::test]
async fn test_dropped_handle_is_released_in_background() {
    let c = controller(base_config().with_max_concurrent_reservations(1));

    let handle = c.reserve(250, 0).await.unwrap();
    assert_eq!(c.available_slots(), 0);
    drop(handle);

    for _ in 0..10 {
        if c.reserved_tokens().await == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }

    assert_eq!(c.reserved_tokens().await, 0);
    assert_eq!(c.available_slots(), 1);
    assert_eq!(c.historical_usage().await, 0);
}

#[tokio::test]
async fn test_dropped_handle_discards_recorded_usage() {
    let c = controller(base_config());

    let mut handle = c.reserve(250, 0).await.unwrap();
    handle.record_actual_usage(120);
    drop(handle);

    c.shutdown().await;
    assert_eq!(c.reserved_tokens().await, 0);
    assert_eq!(c.historical_usage().await, 0);
}

#[tokio::test]
async fn test_finalize_detached_books_recorded_usage() {
    let c = controller(base_config());

    let mut handle = c.reserve(250, 0).await.unwrap();
    handle.record_actual_usage(120);
    handle.finalize_detached();
    assert!(handle.is_finalized());
    drop(handle);

    c.shutdown().await;
    assert_eq!(c.reserved_tokens().await, 0);
    assert_eq!(c.historical_usage().await, 120);
}

#[test]
fn test_dropped_handle_outside_runtime_releases_inline() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let c = controller(base_config());

    let handle = runtime.block_on(c.reserve(100, 0)).unwrap();
    assert_eq!(c.available_slots(), 9);

    drop(handle);

    assert_eq!(c.available_slots(), 10);
    assert_eq!(runtime.block_on(c.reserved_tokens()), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stale_reservation_eviction_releases_slot_once() {
    let c = controller(
        base_config()
            .with_max_concurrent_reservations(1)
            .with_stale_reservation_secs(30),
    );

    let mut abandoned = c.reserve(100, 0).await.unwrap();
    assert_eq!(c.available_slots(), 0);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(c.evict_stale_reservations().await, 1);
    assert_eq!(c.available_slots(), 1);
    assert_eq!(c.reserved_tokens().await, 0);

    // Late finalize books usage but does not hand out a second slot
    abandoned.record_actual_usage(40);
    abandoned.finalize().await;
    assert_eq!(c.available_slots(), 1);
    assert_eq!(c.historical_usage().await, 40);
}

#[tokio::test(start_paused = true)]
async fn test_stale_reservations_evicted_opportunistically() {
    let c = controller(base_config().with_stale_reservation_secs(30));

    let abandoned = c.reserve(100, 0).await.unwrap();
    std::mem::forget(abandoned);
    assert_eq!(c.usage_stats().await.active_reservations, 1);

    tokio::time::advance(Duration::from_secs(31)).await;
    let stats = c.usage_stats().await;
    assert_eq!(stats.active_reservations, 0);
    assert_eq!(stats.reserved_tokens, 0);
    assert_eq!(stats.available_slots, 10);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_rejects_new_and_pending_reservations() {
    let c = controller(base_config());
    let _held = c.reserve(800, 0).await.unwrap();

    let waiter = tokio::spawn({
        let c = c.clone();
        async move { c.reserve(200, 0).await }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;

    c.shutdown().await;
    c.shutdown().await;
    assert!(c.is_shutdown());

    assert!(matches!(waiter.await.unwrap(), Err(Error::Disposed)));
    assert!(matches!(c.reserve(10, 0).await, Err(Error::Disposed)));
    assert!(matches!(c.try_reserve(10, 0).await, Err(Error::Disposed)));
}

#[tokio::test]
async fn test_shutdown_fails_slot_waiters() {
    let c = controller(base_config().with_max_concurrent_reservations(1));
    let _held = c.reserve(10, 0).await.unwrap();

    let mut pending = task::spawn(c.reserve(10, 0));
    assert_pending!(pending.poll());

    c.shutdown().await;
    match pending.poll() {
        std::task::Poll::Ready(Err(Error::Disposed)) => {}
        other => panic!("expected disposed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_try_reserve() {
    let c = controller(base_config().with_max_concurrent_reservations(2));

    let _a = c.try_reserve(600, 0).await.unwrap();
    assert!(matches!(
        c.try_reserve(400, 0).await,
        Err(Error::CapacityTimeout { attempts: 1, .. })
    ));
    // The failed attempt gave its slot back
    assert_eq!(c.available_slots(), 1);

    let _b = c.try_reserve(300, 0).await.unwrap();
    assert!(matches!(
        c.try_reserve(1, 0).await,
        Err(Error::CapacityTimeout { .. })
    ));
    assert_eq!(c.reserved_tokens().await, 900);
}

#[tokio::test]
async fn test_usage_stats_consistency() {
    let c = controller(base_config());

    let mut done = c.reserve(200, 0).await.unwrap();
    done.record_actual_usage(150);
    done.finalize().await;
    let _active = c.reserve(300, 0).await.unwrap();

    let stats = c.usage_stats().await;
    assert_eq!(stats.historical_usage, 150);
    assert_eq!(stats.reserved_tokens, 300);
    assert_eq!(stats.current_usage, 450);
    assert_eq!(stats.available_tokens, 450);
    assert_eq!(stats.effective_limit, 900);
    assert_eq!(stats.active_reservations, 1);
    assert_eq!(stats.requests_in_last_minute, 2);
    assert!((stats.utilization() - 0.5).abs() < f64::EPSILON);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["current_usage"], 450);
    assert_eq!(json["reserved_tokens"], 300);
}

#[tokio::test]
async fn test_available_tokens_never_negative() {
    let c = controller(base_config());

    let mut handle = c.reserve(100, 0).await.unwrap();
    // Actual usage can exceed the reservation and the limit
    handle.record_actual_usage(1_200);
    handle.finalize().await;

    let stats = c.usage_stats().await;
    assert_eq!(stats.current_usage, 1_200);
    assert_eq!(stats.available_tokens, 0);
}

#[tokio::test]
async fn test_active_reservations_listing() {
    let c = controller(base_config());
    let first = c.reserve(100, 0).await.unwrap();
    let _second = c.reserve(50, 25).await.unwrap();

    let active = c.active_reservations().await;
    assert_eq!(active.len(), 2);
    assert!(active.iter().any(|r| r.id == first.id() && r.reserved_tokens == 100));
    assert!(active.iter().any(|r| r.reserved_tokens == 75 && r.input_tokens == 50));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reservations_never_exceed_limit() {
    let c = controller(
        base_config()
            .with_max_concurrent_reservations(20)
            .with_wait_bounds(5, 50)
            .with_jitter_range_ms(10)
            .with_max_wait_retries(200),
    );
    let peak = Arc::new(AtomicU64::new(0));

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let c = c.clone();
            let peak = Arc::clone(&peak);
            tokio::spawn(async move {
                let mut handle = c.reserve(100, 0).await.unwrap();

                let stats = c.usage_stats().await;
                assert!(stats.current_usage <= 900);
                assert_eq!(
                    stats.current_usage,
                    stats.historical_usage + stats.reserved_tokens
                );
                peak.fetch_max(stats.reserved_tokens, Ordering::SeqCst);

                tokio::time::sleep(Duration::from_millis(10)).await;
                handle.finalize().await;
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= 900);
    assert_eq!(c.reserved_tokens().await, 0);
    assert_eq!(c.available_slots(), 20);
}
