//! Startup fallback to the in-process backend when the database is unavailable.

use std::time::{Duration, Instant};

use penstock::*;
use penstock_testkit::*;
use serde_json::json;

const WAIT: Duration = Duration::from_secs(5);

async fn run_echo_round_trip(queue: &QueueService) {
    let pool = WorkerPoolBuilder::new(fast_worker_config(2))
        .with_queue(queue)
        .register("echo", UppercaseHandler)
        .build()
        .unwrap();
    pool.start().await.unwrap();

    let id = queue
        .enqueue("echo", json!({"text": "degraded"}), EnqueueOptions::default())
        .await
        .unwrap();
    let record = wait_for_terminal(queue, id, WAIT).await;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.result, Some(json!({"text": "DEGRADED"})));

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn unreachable_database_falls_back_and_processes_jobs() {
    let connector = UnreachableConnector;
    let queue = QueueService::initialize(fast_queue_config(), Some(&connector)).await;

    assert_eq!(queue.backend_kind(), BackendKind::Fallback);
    let reason = queue.degraded_reason().unwrap();
    assert!(reason.contains("unreachable"), "reason: {reason}");

    run_echo_round_trip(&queue).await;
    queue.close().await.unwrap();
}

#[tokio::test]
async fn hanging_database_probe_is_bounded_by_timeout() {
    let connector = HangingConnector;
    let config = QueueConfig {
        probe_timeout_ms: 100,
        ..fast_queue_config()
    };

    let started = Instant::now();
    let queue = QueueService::initialize(config, Some(&connector)).await;
    assert!(started.elapsed() < Duration::from_secs(2));

    assert!(queue.is_degraded());
    assert!(queue.degraded_reason().unwrap().contains("100ms"));

    run_echo_round_trip(&queue).await;
    queue.close().await.unwrap();
}

#[tokio::test]
async fn connect_without_persistence_uses_in_process_backend() {
    let queue = QueueService::connect(fast_queue_config()).await;
    assert_eq!(queue.backend_kind(), BackendKind::Fallback);

    run_echo_round_trip(&queue).await;
    queue.close().await.unwrap();
}
