//! End-to-end worker pool tests on the in-process backend.
//!
//! Covers job lifecycle, progress, retry and backoff classification,
//! concurrency bounds, lifecycle events, bundle aggregation and recovery of
//! jobs abandoned by a stopped pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use penstock::*;
use penstock_testkit::*;
use serde_json::{json, Value};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn start_pool(queue: &QueueService, builder: WorkerPoolBuilder) -> WorkerPool {
    let pool = builder.with_queue(queue).build().expect("build worker pool");
    pool.start().await.expect("start worker pool");
    pool
}

#[tokio::test]
async fn echo_job_completes_with_uppercased_text() {
    let queue = in_process_queue();
    let pool = start_pool(
        &queue,
        WorkerPoolBuilder::new(fast_worker_config(3)).register("echo", UppercaseHandler),
    )
    .await;

    let id = queue
        .enqueue("echo", json!({"text": "hello"}), EnqueueOptions::default())
        .await
        .unwrap();

    let record = wait_for_terminal(&queue, id, WAIT).await;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.result, Some(json!({"text": "HELLO"})));
    assert_eq!(record.progress, 100);
    assert_eq!(record.attempts, 1);
    assert!(record.started_at.is_some());
    assert!(record.completed_at.is_some());
    assert!(record.error.is_none());

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn progress_stays_below_100_until_completion() {
    let queue = in_process_queue();
    let pool = start_pool(
        &queue,
        WorkerPoolBuilder::new(fast_worker_config(1)).register(
            "steps",
            ProgressHandler::new(vec![30, 100, 60], Duration::from_millis(30)),
        ),
    )
    .await;

    let mut rx = queue.events().subscribe();
    let id = queue
        .enqueue("steps", json!({"entry": 7}), EnqueueOptions::default())
        .await
        .unwrap();

    let active = wait_for_status(&queue, id, JobStatus::Active, WAIT).await;
    assert!(active.progress < 100);

    let record = wait_for_terminal(&queue, id, WAIT).await;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.progress, 100);

    let mut progress_seen = Vec::new();
    let mut completed_seen = false;
    while let Ok(Ok(event)) = timeout(Duration::from_millis(200), rx.recv()).await {
        if event.job.id != id {
            continue;
        }
        match event.kind {
            JobEventKind::Progress => {
                assert_eq!(event.job.status, JobStatus::Active);
                progress_seen.push(event.job.progress);
            }
            JobEventKind::Completed => {
                completed_seen = true;
                break;
            }
            _ => {}
        }
    }
    assert!(completed_seen);
    assert_eq!(progress_seen, vec![30, 99]);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn transient_failures_then_success_counts_every_attempt() {
    let queue = in_process_queue();
    let flaky = FlakyHandler::new(2);
    let pool = start_pool(
        &queue,
        WorkerPoolBuilder::new(fast_worker_config(1)).register("flaky", flaky.clone()),
    )
    .await;

    let id = queue
        .enqueue("flaky", json!({}), EnqueueOptions::default().with_attempts(5))
        .await
        .unwrap();

    let record = wait_for_terminal(&queue, id, WAIT).await;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.result, Some(json!({"attempt": 3})));
    assert!(record.error.is_none());
    assert_eq!(flaky.calls(), 3);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn retried_job_is_not_claimed_before_its_backoff() {
    let queue = QueueService::in_process(QueueConfig::default().with_retry(RetryPolicy {
        base_delay_ms: 300,
        factor: 2.0,
        max_delay_ms: 10_000,
        jitter_ratio: 0.0,
    }));
    let pool = start_pool(
        &queue,
        WorkerPoolBuilder::new(fast_worker_config(1)).register("flaky", FlakyHandler::new(1)),
    )
    .await;

    let mut rx = queue.events().subscribe();
    let id = queue
        .enqueue("flaky", json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let record = wait_for_terminal(&queue, id, WAIT).await;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.attempts, 2);

    let mut events = Vec::new();
    while let Ok(Ok(event)) = timeout(Duration::from_millis(200), rx.recv()).await {
        if event.job.id == id {
            events.push(event);
        }
    }
    let first_start = events
        .iter()
        .find(|e| e.kind == JobEventKind::Started)
        .and_then(|e| e.job.started_at)
        .expect("first attempt started");
    let retry = events
        .iter()
        .find(|e| matches!(e.kind, JobEventKind::Retry { .. }))
        .expect("retry event");
    assert_eq!(retry.kind, JobEventKind::Retry { delay_ms: 300 });

    let eligible_at = retry.job.available_at;
    assert!(eligible_at - first_start >= chrono::Duration::milliseconds(300));

    let second_start = record.started_at.unwrap();
    assert!(second_start >= eligible_at, "reclaimed at {second_start}, eligible at {eligible_at}");
    assert!(second_start - first_start >= chrono::Duration::milliseconds(300));

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn completion_service_rate_limit_is_retried() {
    struct Summarize {
        completions: Arc<ScriptedCompletionService>,
        storage: Arc<InMemoryStorage>,
    }

    #[async_trait]
    impl JobHandler for Summarize {
        async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError> {
            let entry_id = ctx.payload["entry_id"].as_str().unwrap_or_default().to_string();
            let text = ctx.payload["text"].as_str().unwrap_or_default().to_string();
            let summary = self.completions.complete(&format!("Summarize: {text}")).await?;
            self.storage
                .save(&entry_id, json!({ "summary": summary.clone() }))
                .await?;
            Ok(summary)
        }
    }

    let completions = Arc::new(
        ScriptedCompletionService::new(json!({"summary": "a quiet day"}))
            .then(Err(CompletionError::RateLimited)),
    );
    let storage = Arc::new(InMemoryStorage::new());
    let queue = in_process_queue();
    let pool = start_pool(
        &queue,
        WorkerPoolBuilder::new(fast_worker_config(1)).register(
            "summarize_entry",
            Summarize {
                completions: completions.clone(),
                storage: storage.clone(),
            },
        ),
    )
    .await;

    let id = queue
        .enqueue(
            "summarize_entry",
            json!({"entry_id": "entry-9", "text": "Rain all day."}),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    let record = wait_for_terminal(&queue, id, WAIT).await;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.attempts, 2);
    assert_eq!(record.result, Some(json!({"summary": "a quiet day"})));
    assert!(record.error.is_none());

    assert_eq!(
        completions.prompts(),
        vec!["Summarize: Rain all day.".to_string(); 2]
    );
    assert_eq!(
        storage.get("entry-9"),
        Some(json!({"summary": {"summary": "a quiet day"}}))
    );

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn timeout_failures_exhaust_attempts_then_fail() {
    let queue = in_process_queue();
    let failing = FailingHandler::new(Failure::Timeout);
    let channel = RecordingNotificationChannel::new();
    let bridge_shutdown = ShutdownToken::new();
    let bridge = spawn_notification_bridge(
        queue.events(),
        Arc::new(channel.clone()),
        bridge_shutdown.clone(),
    );

    let pool = start_pool(
        &queue,
        WorkerPoolBuilder::new(fast_worker_config(1)).register("analyze", failing.clone()),
    )
    .await;

    let id = queue
        .enqueue("analyze", json!({"entry": 1}), EnqueueOptions::default().with_attempts(2))
        .await
        .unwrap();

    let record = wait_for_terminal(&queue, id, WAIT).await;
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.attempts, 2);
    assert!(record.error.as_deref().unwrap().contains("timed out"));
    assert!(record.progress < 100);

    // No attempt beyond the ceiling.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(failing.calls(), 2);

    timeout(WAIT, async {
        while !channel.kinds_for(id).contains(&JobEventKind::Failed) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("failed event delivered");

    channel.assert_event_count_eq(4);
    let kinds = channel.kinds_for(id);
    assert_eq!(kinds[0], JobEventKind::Started);
    assert!(matches!(kinds[1], JobEventKind::Retry { .. }));
    assert_eq!(kinds[2], JobEventKind::Started);
    assert_eq!(kinds[3], JobEventKind::Failed);

    let events = channel.events();
    let retry = &events[1];
    assert_eq!(retry.job.status, JobStatus::Waiting);
    assert_eq!(retry.job.attempts, 1);
    assert!(retry.job.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(events[3].job.status, JobStatus::Failed);
    assert_eq!(events[3].job.attempts, 2);

    pool.shutdown().await.unwrap();
    bridge_shutdown.cancel();
    bridge.await.unwrap();
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let queue = in_process_queue();
    let failing = FailingHandler::new(Failure::Validation);
    let pool = start_pool(
        &queue,
        WorkerPoolBuilder::new(fast_worker_config(2)).register("analyze", failing.clone()),
    )
    .await;

    let id = queue
        .enqueue("analyze", json!({"entry": ""}), EnqueueOptions::default().with_attempts(5))
        .await
        .unwrap();

    let record = wait_for_terminal(&queue, id, WAIT).await;
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.attempts, 1);
    assert_eq!(failing.calls(), 1);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn panicking_handler_fails_job_without_stopping_pool() {
    let queue = in_process_queue();
    let pool = start_pool(
        &queue,
        WorkerPoolBuilder::new(fast_worker_config(2))
            .register("explode", PanickingHandler)
            .register("echo", UppercaseHandler),
    )
    .await;

    let bad = queue
        .enqueue("explode", json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let record = wait_for_terminal(&queue, bad, WAIT).await;
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.attempts, 1);

    let good = queue
        .enqueue("echo", json!({"text": "still here"}), EnqueueOptions::default())
        .await
        .unwrap();
    let record = wait_for_terminal(&queue, good, WAIT).await;
    assert_eq!(record.status, JobStatus::Completed);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn concurrency_limit_is_never_exceeded() {
    let queue = in_process_queue();
    let gauge = ConcurrencyGauge::new(Duration::from_millis(40));
    let pool = start_pool(
        &queue,
        WorkerPoolBuilder::new(fast_worker_config(3)).register("work", gauge.clone()),
    )
    .await;

    // Samples how many jobs the backend holds as `active` while the pool runs.
    let sampling = ShutdownToken::new();
    let sampler = {
        let queue = queue.clone();
        let sampling = sampling.clone();
        tokio::spawn(async move {
            let mut peak_active = 0;
            while !sampling.is_cancelled() {
                let snapshot = queue.snapshot().await.unwrap();
                peak_active = peak_active.max(snapshot.count(JobStatus::Active));
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            peak_active
        })
    };

    let mut ids = Vec::new();
    for n in 0..12 {
        ids.push(
            queue
                .enqueue("work", json!({"n": n}), EnqueueOptions::default())
                .await
                .unwrap(),
        );
    }

    let records = wait_for_all_terminal(&queue, &ids, WAIT).await;
    assert!(records.iter().all(|r| r.status == JobStatus::Completed));
    sampling.cancel();
    let peak_active = sampler.await.unwrap();

    assert!(gauge.peak() <= 3, "peak concurrency was {}", gauge.peak());
    assert!(gauge.peak() >= 2);
    assert!(peak_active <= 3, "backend held {peak_active} active jobs");
    assert!(peak_active >= 1);

    let snapshot = queue.snapshot().await.unwrap();
    assert_eq!(snapshot.count(JobStatus::Active), 0);
    assert_eq!(snapshot.count(JobStatus::Completed), 12);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn bundle_with_one_failure_reports_partial_failure() {
    let queue = in_process_queue();
    let pool = start_pool(
        &queue,
        WorkerPoolBuilder::new(fast_worker_config(4))
            .register("echo", UppercaseHandler)
            .register("reject", FailingHandler::new(Failure::Validation)),
    )
    .await;

    let jobs = vec![
        ("echo".to_string(), json!({"text": "a"})),
        ("echo".to_string(), json!({"text": "b"})),
        ("echo".to_string(), json!({"text": "c"})),
        ("reject".to_string(), json!({})),
    ];
    let (bundle_id, ids) = queue
        .enqueue_bundle(Some(BundleId::new("entry-42")), jobs, EnqueueOptions::default())
        .await
        .unwrap();
    wait_for_all_terminal(&queue, &ids, WAIT).await;

    let status = queue.get_bundle_status(&bundle_id).await.unwrap().unwrap();
    assert_eq!(status.bundle_id, bundle_id);
    assert_eq!(status.overall_progress, 75);
    assert_eq!(status.status, BundleState::PartialFailure);
    assert_eq!(status.jobs.len(), 4);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn jobs_are_queryable_by_state() {
    let queue = in_process_queue();
    let a = queue.enqueue("echo", json!({"text": "a"}), EnqueueOptions::default()).await.unwrap();
    let b = queue.enqueue("echo", json!({"text": "b"}), EnqueueOptions::default()).await.unwrap();

    let waiting = queue.get_jobs_by_state(&[JobStatus::Waiting]).await.unwrap();
    let ids: Vec<JobId> = waiting.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![a, b]);

    let pool = start_pool(
        &queue,
        WorkerPoolBuilder::new(fast_worker_config(2)).register("echo", UppercaseHandler),
    )
    .await;
    wait_for_all_terminal(&queue, &[a, b], WAIT).await;

    assert!(queue.get_jobs_by_state(&[JobStatus::Waiting, JobStatus::Active]).await.unwrap().is_empty());
    assert_eq!(queue.get_jobs_by_state(&[JobStatus::Completed]).await.unwrap().len(), 2);

    pool.shutdown().await.unwrap();
}

#[tokio::test]
async fn reaper_removes_expired_terminal_jobs() {
    let queue = QueueService::in_process(QueueConfig {
        retention_secs: 0,
        ..fast_queue_config()
    });
    let pool = start_pool(
        &queue,
        WorkerPoolBuilder::new(fast_worker_config(1)).register("echo", UppercaseHandler),
    )
    .await;

    let done = queue.enqueue("echo", json!({"text": "x"}), EnqueueOptions::default()).await.unwrap();
    wait_for_terminal(&queue, done, WAIT).await;
    pool.shutdown().await.unwrap();

    let pending = queue.enqueue("echo", json!({"text": "y"}), EnqueueOptions::default()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(queue.reap_now().await.unwrap(), 1);
    assert!(queue.get_status(done).await.unwrap().is_none());
    assert!(queue.get_status(pending).await.unwrap().is_some());
}

#[tokio::test]
async fn job_abandoned_by_timed_out_shutdown_runs_on_next_pool() {
    let queue = QueueService::in_process(QueueConfig {
        stale_after_secs: 0,
        ..fast_queue_config()
    });
    let stuck = start_pool(
        &queue,
        WorkerPoolBuilder::new(fast_worker_config(1).with_shutdown_timeout(50))
            .register("echo", ConcurrencyGauge::new(Duration::from_secs(3600))),
    )
    .await;

    let id = queue
        .enqueue("echo", json!({"text": "late"}), EnqueueOptions::default())
        .await
        .unwrap();
    wait_for_status(&queue, id, JobStatus::Active, WAIT).await;
    stuck.shutdown().await.unwrap();

    let record = queue.get_status(id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Active);

    tokio::time::sleep(Duration::from_millis(10)).await;
    let recovery = queue.recover_stale_now().await.unwrap();
    assert_eq!(recovery, StaleRecovery { requeued: 1, failed: 0 });

    let fresh = start_pool(
        &queue,
        WorkerPoolBuilder::new(fast_worker_config(1)).register("echo", UppercaseHandler),
    )
    .await;
    let record = wait_for_terminal(&queue, id, WAIT).await;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.attempts, 2);
    assert_eq!(record.result, Some(json!({"text": "LATE"})));
    assert!(record.error.is_none());

    fresh.shutdown().await.unwrap();
}

#[tokio::test]
async fn reaper_fails_abandoned_job_with_no_attempts_left() {
    let config = QueueConfig {
        stale_after_secs: 0,
        reaper_interval_secs: 1,
        ..fast_queue_config()
    };
    let queue = QueueService::initialize(config, None).await;
    let mut rx = queue.events().subscribe();
    let stuck = start_pool(
        &queue,
        WorkerPoolBuilder::new(fast_worker_config(1).with_shutdown_timeout(50))
            .register("echo", ConcurrencyGauge::new(Duration::from_secs(3600))),
    )
    .await;

    let id = queue
        .enqueue("echo", json!({"text": "once"}), EnqueueOptions::default().with_attempts(1))
        .await
        .unwrap();
    wait_for_status(&queue, id, JobStatus::Active, WAIT).await;
    stuck.shutdown().await.unwrap();

    let record = wait_for_status(&queue, id, JobStatus::Failed, WAIT).await;
    assert_eq!(record.attempts, 1);
    assert_eq!(record.error.as_deref(), Some(STALE_JOB_ERROR));
    assert!(record.completed_at.is_some());

    let failed = timeout(WAIT, async {
        loop {
            let event = rx.recv().await.unwrap();
            if event.job.id == id && event.kind == JobEventKind::Failed {
                return event;
            }
        }
    })
    .await
    .expect("failed event published");
    assert_eq!(failed.job.error.as_deref(), Some(STALE_JOB_ERROR));

    queue.close().await.unwrap();
}
