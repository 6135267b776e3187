//! Journal analysis pipeline on penstock.
//!
//! Each journal entry fans out into an `analyze_entry` and a
//! `summarize_entry` job sharing one bundle. Handlers call a completion
//! service, save the result against the entry, and report progress; the
//! bundle status is printed once every job has settled.
//!
//! Runs on the in-process backend unless `DATABASE_URL` is set and the
//! `postgres` feature is enabled:
//!
//! ```text
//! cargo run --example journal_pipeline
//! DATABASE_URL=postgres://... cargo run --example journal_pipeline --features postgres
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use penstock::telemetry::init_tracing;
use penstock::*;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
struct EntryInput {
    entry_id: String,
    text: String,
}

/// Deterministic stand-in for a hosted model. Every third call times out.
struct CannedCompletions {
    calls: AtomicU32,
}

#[async_trait]
impl CompletionService for CannedCompletions {
    async fn complete(&self, prompt: &str) -> Result<Value, CompletionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(50)).await;
        if call % 3 == 0 {
            return Err(CompletionError::Timeout);
        }

        let words = prompt.split_whitespace().count();
        if prompt.starts_with("Analyze") {
            Ok(json!({ "mood": if words > 12 { "reflective" } else { "brief" }, "words": words }))
        } else {
            let summary: String = prompt.chars().skip("Summarize: ".len()).take(40).collect();
            Ok(json!({ "summary": summary }))
        }
    }
}

struct AnalyzeEntry {
    completions: Arc<dyn CompletionService>,
    storage: Arc<dyn Storage>,
}

#[async_trait]
impl JobHandler for AnalyzeEntry {
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError> {
        let input: EntryInput = ctx.payload_as()?;
        if input.text.trim().is_empty() {
            return Err(HandlerError::validation("entry text is empty"));
        }
        ctx.report_progress(10).await;

        let prompt = format!("Analyze the mood of this journal entry: {}", input.text);
        let analysis = with_timeout(Duration::from_secs(2), "analysis", async {
            self.completions.complete(&prompt).await.map_err(HandlerError::from)
        })
        .await?;
        ctx.report_progress(70).await;

        self.storage
            .save(&input.entry_id, json!({ "analysis": analysis.clone() }))
            .await?;
        Ok(analysis)
    }
}

struct SummarizeEntry {
    completions: Arc<dyn CompletionService>,
    storage: Arc<dyn Storage>,
}

#[async_trait]
impl JobHandler for SummarizeEntry {
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError> {
        let input: EntryInput = ctx.payload_as()?;
        ctx.report_progress(20).await;

        let summary = with_timeout(Duration::from_secs(2), "summary", async {
            self.completions
                .complete(&format!("Summarize: {}", input.text))
                .await
                .map_err(HandlerError::from)
        })
        .await?;

        self.storage
            .save(&input.entry_id, json!({ "summary": summary.clone() }))
            .await?;
        Ok(summary)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = QueueConfig::from_env()?.with_retry(RetryPolicy {
        base_delay_ms: 200,
        ..RetryPolicy::default()
    });
    let queue = QueueService::connect(config).await;
    if let Some(reason) = queue.degraded_reason() {
        println!("running on the {} backend: {reason}", queue.backend_kind());
    }

    let shutdown = ShutdownToken::new();
    let logger = spawn_event_logger(queue.events(), shutdown.clone());

    let completions: Arc<dyn CompletionService> = Arc::new(CannedCompletions {
        calls: AtomicU32::new(0),
    });
    let storage = Arc::new(InMemoryStorage::new());

    let pool = WorkerPoolBuilder::new(WorkerConfig::new("journal").with_concurrency(3).with_poll_interval(100))
        .with_queue(&queue)
        .register(
            "analyze_entry",
            AnalyzeEntry {
                completions: completions.clone(),
                storage: storage.clone(),
            },
        )
        .register(
            "summarize_entry",
            SummarizeEntry {
                completions,
                storage: storage.clone(),
            },
        )
        .build()?;
    pool.start().await?;

    let entries = [
        ("entry-1", "Walked along the river this morning and finally felt the weight of the week lift."),
        ("entry-2", "Rain all day. Read two chapters."),
        ("entry-3", ""),
    ];

    let mut bundles = Vec::new();
    for (entry_id, text) in entries {
        let payload = json!({ "entry_id": entry_id, "text": text });
        let (bundle_id, _) = queue
            .enqueue_bundle(
                Some(BundleId::new(entry_id)),
                vec![
                    ("analyze_entry".to_string(), payload.clone()),
                    ("summarize_entry".to_string(), payload),
                ],
                EnqueueOptions::default(),
            )
            .await?;
        bundles.push(bundle_id);
    }

    for bundle_id in &bundles {
        loop {
            let Some(status) = queue.get_bundle_status(bundle_id).await? else {
                break;
            };
            if status.status != BundleState::Processing {
                println!(
                    "{}: {:?} ({}%)",
                    bundle_id,
                    status.status,
                    status.overall_progress
                );
                for job in &status.jobs {
                    println!("  {} {} attempts={}", job.job_type, job.status, job.attempts);
                }
                if let Some(saved) = storage.get(bundle_id.as_str()) {
                    println!("  saved: {saved}");
                }
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    let snapshot = queue.snapshot().await?;
    println!(
        "queue: {} completed, {} failed",
        snapshot.count(JobStatus::Completed),
        snapshot.count(JobStatus::Failed)
    );

    pool.shutdown().await?;
    shutdown.cancel();
    let _ = logger.await;
    queue.close().await?;
    Ok(())
}
