use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::error::HandlerError;
use crate::events::{JobEvent, JobEventKind, JobEventPublisher};
use crate::job::JobRecord;
use crate::queue::QueueBackend;
use crate::retry::{decide, RetryDecision, RetryPolicy};
use crate::telemetry;

use super::handler::{HandlerRegistry, JobContext};
use super::worker::WorkerConfig;

/// Token for signaling graceful shutdown to background tasks.
#[derive(Clone, Debug)]
pub struct ShutdownToken {
    inner: Arc<ShutdownTokenInner>,
}

#[derive(Debug)]
struct ShutdownTokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl ShutdownToken {
    /// Create a new shutdown token.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ShutdownTokenInner {
                cancelled: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Signal cancellation.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Wait until cancelled.
    pub async fn cancelled(&self) {
        // Register interest before checking the flag so a concurrent cancel
        // cannot slip between the check and the wait.
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared between the scheduling loop and job tasks.
struct PoolShared {
    config: WorkerConfig,
    backend: Arc<dyn QueueBackend>,
    events: Arc<dyn JobEventPublisher>,
    registry: Arc<HandlerRegistry>,
    retry: RetryPolicy,
    slots: Arc<Semaphore>,
}

impl PoolShared {
    fn active_jobs(&self) -> usize {
        self.config
            .concurrency
            .saturating_sub(self.slots.available_permits())
    }

    async fn publish(&self, kind: JobEventKind, job: JobRecord) {
        if let Err(err) = self.events.publish(JobEvent::new(kind, job)).await {
            tracing::error!("publish {} event failed: {err}", kind.as_str());
        }
    }
}

/// Bounded pool that claims jobs and runs their handlers.
///
/// A single scheduling loop polls the backend every `poll_interval_ms`,
/// claiming at most as many jobs as there are free execution slots. Every
/// claimed job runs on its own task; its outcome is written back through the
/// backend and announced on the event channel.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    shutdown_token: ShutdownToken,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.shared.config)
            .field("backend", &self.shared.backend.kind())
            .field("registry", &self.shared.registry)
            .field("active_jobs", &self.shared.active_jobs())
            .field("shutdown_cancelled", &self.shutdown_token.is_cancelled())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool from explicit parts. Prefer [`WorkerPoolBuilder`](super::WorkerPoolBuilder).
    pub fn new(
        config: WorkerConfig,
        backend: Arc<dyn QueueBackend>,
        events: Arc<dyn JobEventPublisher>,
        registry: HandlerRegistry,
        retry: RetryPolicy,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        let config = WorkerConfig {
            concurrency,
            ..config
        };
        Self {
            shared: Arc::new(PoolShared {
                config,
                backend,
                events,
                registry: Arc::new(registry),
                retry,
                slots: Arc::new(Semaphore::new(concurrency)),
            }),
            shutdown_token: ShutdownToken::new(),
            loop_handle: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.shared.registry
    }

    /// Jobs currently executing.
    pub fn active_jobs(&self) -> usize {
        self.shared.active_jobs()
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.shutdown_token.clone()
    }

    /// Spawn the scheduling loop.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool was already started.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            anyhow::bail!("worker pool {} already started", self.shared.config.worker_id);
        }

        tracing::info!(
            worker_id = %self.shared.config.worker_id,
            concurrency = self.shared.config.concurrency,
            backend = %self.shared.backend.kind(),
            job_types = ?self.shared.registry.job_types(),
            "starting worker pool"
        );

        let shared = Arc::clone(&self.shared);
        let shutdown = self.shutdown_token.clone();
        let handle = tokio::spawn(async move {
            scheduling_loop(shared, shutdown).await;
        });

        *self.loop_handle.lock().await = Some(handle);
        Ok(())
    }

    /// Stop claiming new jobs and wait for in-flight jobs to settle.
    ///
    /// Waiting is bounded by `shutdown_timeout_ms`. Jobs still running after
    /// that stay `active` until the queue's stale-job sweep hands them back
    /// (see [`QueueService::recover_stale_now`](crate::QueueService::recover_stale_now)).
    /// A late result from such a job is dropped and counted as `lost`.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        tracing::info!(worker_id = %self.shared.config.worker_id, "shutting down worker pool");

        self.shutdown_token.cancel();

        let handle = self.loop_handle.lock().await.take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!("scheduling loop task failed: {err}");
            }
        }

        // Holding every permit means every job task has finished.
        let concurrency = self.shared.config.concurrency as u32;
        match tokio::time::timeout(
            self.shared.config.shutdown_timeout(),
            self.shared.slots.acquire_many(concurrency),
        )
        .await
        {
            Ok(Ok(_all)) => {}
            Ok(Err(err)) => tracing::warn!("worker slots closed during shutdown: {err}"),
            Err(_) => tracing::warn!(
                active = self.shared.active_jobs(),
                "timed out waiting for in-flight jobs"
            ),
        }

        tracing::info!(worker_id = %self.shared.config.worker_id, "worker pool shutdown complete");
        Ok(())
    }
}

async fn scheduling_loop(shared: Arc<PoolShared>, shutdown: ShutdownToken) {
    let interval = shared.config.poll_interval();

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        run_tick(&shared).await;

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    tracing::debug!(worker_id = %shared.config.worker_id, "scheduling loop stopped");
}

/// One claim round: fill free slots with eligible jobs.
async fn run_tick(shared: &Arc<PoolShared>) {
    let capacity = shared.slots.available_permits();
    if capacity == 0 {
        return;
    }

    let span = telemetry::claim_span(&shared.config.worker_id, capacity);
    let claimed = match shared.backend.claim(capacity, Utc::now()).instrument(span).await {
        Ok(claimed) => claimed,
        Err(err) => {
            tracing::error!("claim error: {err:#}");
            return;
        }
    };

    for record in claimed {
        // Only this loop acquires permits, so the capacity read above still holds.
        let permit = match Arc::clone(&shared.slots).try_acquire_owned() {
            Ok(permit) => permit,
            Err(err) => {
                tracing::error!(job_id = %record.id, "no free worker slot for claimed job: {err}");
                let retry_at = Utc::now();
                if let Err(err) = shared
                    .backend
                    .retry(record.id, "worker pool saturated".to_string(), retry_at)
                    .await
                {
                    tracing::error!("queue retry error: {err:#}");
                }
                continue;
            }
        };

        shared.publish(JobEventKind::Started, record.clone()).await;
        telemetry::set_active_jobs(shared.active_jobs());

        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            run_job(shared, record, permit).await;
        });
    }
}

async fn run_job(shared: Arc<PoolShared>, record: JobRecord, permit: OwnedSemaphorePermit) {
    let timing = telemetry::record_job_start(record.job_type.clone());

    let outcome = match shared.registry.get(&record.job_type) {
        Some(handler) => {
            let ctx = JobContext::new(
                &record,
                Arc::clone(&shared.backend),
                Arc::clone(&shared.events),
            );
            let execution = tokio::spawn(telemetry::instrument_dispatch(
                record.id.to_string(),
                record.job_type.clone(),
                record.attempts,
                async move { handler.handle(ctx).await },
            ));
            match execution.await {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => {
                    Err(HandlerError::Panicked(panic_message(join_err.into_panic())))
                }
                Err(join_err) => Err(HandlerError::Panicked(join_err.to_string())),
            }
        }
        None => Err(HandlerError::UnknownJobType(record.job_type.clone())),
    };

    let label = settle(&shared, record, outcome).await;
    telemetry::record_job_end(timing, label);

    drop(permit);
    telemetry::set_active_jobs(shared.active_jobs());
}

/// Write a handler outcome back to the backend and announce it.
///
/// Returns the outcome label: `completed`, `retry` or `failed` when the write
/// landed, `lost` when the job had already left `active`, `error` when the
/// backend write itself failed.
async fn settle(
    shared: &PoolShared,
    mut record: JobRecord,
    outcome: Result<Value, HandlerError>,
) -> &'static str {
    let span = telemetry::complete_span(
        record.id.to_string(),
        &record.job_type,
        match &outcome {
            Ok(_) => "completed",
            Err(_) => "error",
        },
    );

    async move {
        match outcome {
            Ok(result) => {
                match shared.backend.complete(record.id, result.clone()).await {
                    Ok(true) => {
                        record.mark_completed(result, Utc::now());
                        shared.publish(JobEventKind::Completed, record).await;
                        "completed"
                    }
                    Ok(false) => "lost",
                    Err(err) => {
                        tracing::error!("queue complete error: {err:#}");
                        "error"
                    }
                }
            }
            Err(error) => {
                let message = error.to_string();
                let decision = decide(
                    &error,
                    record.attempts,
                    record.max_attempts,
                    record.backoff_base_ms,
                    &shared.retry,
                );
                match decision {
                    RetryDecision::Retry { delay } => {
                        let delay_ms = delay.as_millis().min(u64::MAX as u128) as u64;
                        let available_at = Utc::now()
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::zero());
                        tracing::debug!(
                            job_id = %record.id,
                            attempt = record.attempts,
                            delay_ms,
                            "retryable failure: {message}"
                        );
                        match shared
                            .backend
                            .retry(record.id, message.clone(), available_at)
                            .await
                        {
                            Ok(true) => {
                                record.mark_retry(message, available_at);
                                shared.publish(JobEventKind::Retry { delay_ms }, record).await;
                                "retry"
                            }
                            Ok(false) => "lost",
                            Err(err) => {
                                tracing::error!("queue retry error: {err:#}");
                                "error"
                            }
                        }
                    }
                    RetryDecision::Fail { exhausted } => {
                        tracing::debug!(
                            job_id = %record.id,
                            attempts = record.attempts,
                            exhausted,
                            "terminal failure: {message}"
                        );
                        match shared.backend.fail(record.id, message.clone()).await {
                            Ok(true) => {
                                record.mark_failed(message, Utc::now());
                                shared.publish(JobEventKind::Failed, record).await;
                                "failed"
                            }
                            Ok(false) => "lost",
                            Err(err) => {
                                tracing::error!("queue fail error: {err:#}");
                                "error"
                            }
                        }
                    }
                }
            }
        }
    }
    .instrument(span)
    .await
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
