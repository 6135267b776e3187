use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::collaborators::NotificationChannel;
use crate::job::JobRecord;
use crate::runtime::ShutdownToken;

/// Lifecycle transition that produced an event.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum JobEventKind {
    /// Job was claimed and handed to its handler.
    Started,
    /// Handler reported progress.
    Progress,
    /// Job completed successfully.
    Completed,
    /// Job reached the terminal `failed` state.
    Failed,
    /// Attempt failed; the job is waiting out a backoff delay.
    Retry { delay_ms: u64 },
}

impl JobEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobEventKind::Started => "started",
            JobEventKind::Progress => "progress",
            JobEventKind::Completed => "completed",
            JobEventKind::Failed => "failed",
            JobEventKind::Retry { .. } => "retry",
        }
    }
}

/// A lifecycle event carrying a snapshot of the job at emission time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(flatten)]
    pub kind: JobEventKind,
    pub job: JobRecord,
    pub timestamp: DateTime<Utc>,
}

impl JobEvent {
    pub fn new(kind: JobEventKind, job: JobRecord) -> Self {
        Self {
            kind,
            job,
            timestamp: Utc::now(),
        }
    }
}

/// Trait for publishing job lifecycle events.
#[async_trait]
pub trait JobEventPublisher: Send + Sync {
    /// Publish an event to all subscribers.
    ///
    /// Returns an error if the event cannot be published.
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()>;

    /// Subscribe to events published from now on.
    fn subscribe(&self) -> broadcast::Receiver<JobEvent>;
}

/// In-process event bus using tokio broadcast channels.
///
/// `InProcEventBus` provides a lightweight, fan-out event bus. Events are
/// broadcast to all active subscribers; if a subscriber lags behind, it will
/// receive `RecvError::Lagged` but won't block the publisher.
///
/// # Characteristics
///
/// - Non-blocking publish: Publishers never wait for slow subscribers
/// - Fan-out: All subscribers receive all events (within capacity)
/// - Bounded: Events are dropped if capacity is exceeded (Lagged)
/// - In-process: Events don't leave the process (for external delivery,
///   attach a [`NotificationChannel`] with [`spawn_notification_bridge`])
#[derive(Clone)]
pub struct InProcEventBus {
    sender: broadcast::Sender<JobEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl InProcEventBus {
    /// Create a new event bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Publish without awaiting. With no subscribers the event is dropped.
    pub fn emit(&self, event: JobEvent) {
        let _ = self.sender.send(event);
    }
}

#[async_trait]
impl JobEventPublisher for InProcEventBus {
    async fn publish(&self, event: JobEvent) -> anyhow::Result<()> {
        self.emit(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }
}

/// Log every lifecycle event on a dedicated task until shutdown.
pub fn spawn_event_logger(
    events: Arc<dyn JobEventPublisher>,
    shutdown: ShutdownToken,
) -> JoinHandle<()> {
    let mut rx = events.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => log_event(&event),
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("event logger lagged, skipped {skipped} events");
                    }
                }
            }
        }
    })
}

fn log_event(event: &JobEvent) {
    let job = &event.job;
    match event.kind {
        JobEventKind::Started => tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "job started"
        ),
        JobEventKind::Progress => tracing::debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            progress = job.progress,
            "job progress"
        ),
        JobEventKind::Completed => tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            "job completed"
        ),
        JobEventKind::Failed => tracing::warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            error = job.error.as_deref().unwrap_or_default(),
            "job failed"
        ),
        JobEventKind::Retry { delay_ms } => tracing::warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            delay_ms,
            error = job.error.as_deref().unwrap_or_default(),
            "job scheduled for retry"
        ),
    }
}

/// Forward every lifecycle event to `channel` on a dedicated task.
///
/// Delivery failures are logged and dropped; they never reach the worker pool.
pub fn spawn_notification_bridge(
    events: Arc<dyn JobEventPublisher>,
    channel: Arc<dyn NotificationChannel>,
    shutdown: ShutdownToken,
) -> JoinHandle<()> {
    let mut rx = events.subscribe();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => {
                        if let Err(err) = channel.notify(&event).await {
                            tracing::warn!(
                                job_id = %event.job.id,
                                event = event.kind.as_str(),
                                "notification delivery failed: {err}"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("notification bridge lagged, skipped {skipped} events");
                    }
                }
            }
        }
    })
}
