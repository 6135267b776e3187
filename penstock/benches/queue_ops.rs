//! Benchmarks for queue operations using criterion.
//!
//! These benchmarks measure the in-process backend and the facade:
//! - Single job enqueue
//! - Bundle enqueue
//! - Claim with contention (several claimers racing for one backlog)
//! - Full lifecycle (enqueue → claim → complete)
//! - Bundle aggregation

#![allow(missing_docs)]

use std::sync::Arc;

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use penstock::bundle::aggregate;
use penstock::job::{BundleId, EnqueueOptions, JobRecord, JobStatus};
use penstock::persistence::MemoryBackend;
use penstock::queue::QueueBackend;
use penstock::QueueConfig;
use penstock::QueueService;
use serde_json::json;
use tokio::runtime::Runtime;

/// Creates a tokio runtime for async benchmarks.
fn create_runtime() -> Runtime {
    Runtime::new().expect("Failed to create tokio runtime")
}

fn record(n: usize) -> JobRecord {
    JobRecord::new(
        "analyze_entry",
        json!({ "entry_id": n, "text": "went for a long walk" }),
        &EnqueueOptions::default(),
        3,
    )
}

/// Benchmark: Enqueue single job through the facade.
fn bench_enqueue_single(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("enqueue_single");
    group.sample_size(100);
    group.measurement_time(std::time::Duration::from_secs(10));

    group.bench_function("in_memory", |b| {
        let queue = QueueService::in_process(QueueConfig::default());

        b.to_async(&rt).iter(|| async {
            let _ = queue
                .enqueue("analyze_entry", json!({"entry_id": 1}), EnqueueOptions::default())
                .await
                .expect("enqueue should succeed");
        });
    });

    group.finish();
}

/// Benchmark: Enqueue a bundle of jobs.
fn bench_enqueue_bundle(c: &mut Criterion) {
    let rt = create_runtime();

    let bundle_sizes = vec![2, 4, 16, 64];

    let mut group = c.benchmark_group("enqueue_bundle");
    group.sample_size(50);

    for bundle_size in &bundle_sizes {
        group.throughput(Throughput::Elements(*bundle_size as u64));
        group.bench_with_input(
            BenchmarkId::new("in_memory", bundle_size),
            bundle_size,
            |b, &size| {
                let queue = QueueService::in_process(QueueConfig::default());

                b.to_async(&rt).iter(|| async {
                    let jobs = (0..size)
                        .map(|i| ("analyze_entry".to_string(), json!({ "entry_id": i })))
                        .collect();

                    let _ = queue
                        .enqueue_bundle(None, jobs, EnqueueOptions::default())
                        .await
                        .expect("bundle enqueue should succeed");
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: Claim with contention.
///
/// Several claimers race for the same backlog; every iteration refills it.
fn bench_claim_contention(c: &mut Criterion) {
    let worker_counts = vec![1, 4, 8, 16];

    let mut group = c.benchmark_group("claim_contention");
    group.sample_size(50);
    group.measurement_time(std::time::Duration::from_secs(15));

    for worker_count in &worker_counts {
        group.bench_with_input(
            BenchmarkId::new("claimers", worker_count),
            worker_count,
            |b, &workers| {
                let rt = create_runtime();

                b.to_async(&rt).iter(|| async {
                    let backend = Arc::new(MemoryBackend::new());
                    for n in 0..256 {
                        backend.insert(record(n)).await.unwrap();
                    }

                    let mut handles = vec![];
                    for _ in 0..workers {
                        let backend = backend.clone();
                        handles.push(tokio::spawn(async move {
                            while !backend.claim(8, Utc::now()).await.unwrap().is_empty() {}
                        }));
                    }

                    for handle in handles {
                        let _ = handle.await;
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark: Full job lifecycle on the backend.
fn bench_full_lifecycle(c: &mut Criterion) {
    let rt = create_runtime();

    let mut group = c.benchmark_group("full_lifecycle");
    group.throughput(Throughput::Elements(1));

    group.bench_function("in_memory", |b| {
        let backend = MemoryBackend::new();

        b.to_async(&rt).iter(|| async {
            let job = record(0);
            let id = job.id;
            backend.insert(job).await.expect("insert should succeed");

            let claimed = backend
                .claim(1, Utc::now())
                .await
                .expect("claim should succeed");
            assert_eq!(claimed.len(), 1);

            backend
                .complete(id, json!({"summary": "ok"}))
                .await
                .expect("complete should succeed");
        });
    });

    group.finish();
}

/// Benchmark: Aggregate bundle status.
fn bench_bundle_aggregate(c: &mut Criterion) {
    let mut group = c.benchmark_group("bundle_aggregate");

    for size in [4usize, 64, 1024] {
        let jobs: Vec<JobRecord> = (0..size)
            .map(|n| {
                let mut job = record(n);
                job.status = if n % 5 == 0 {
                    JobStatus::Failed
                } else {
                    JobStatus::Completed
                };
                job
            })
            .collect();
        let bundle_id = BundleId::new("bench-bundle");

        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &jobs, |b, jobs| {
            b.iter(|| aggregate(bundle_id.clone(), jobs));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_enqueue_single,
    bench_enqueue_bundle,
    bench_claim_contention,
    bench_full_lifecycle,
    bench_bundle_aggregate
);
criterion_main!(benches);
