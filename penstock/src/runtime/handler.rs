use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::HandlerError;
use crate::events::{JobEvent, JobEventKind, JobEventPublisher};
use crate::job::{BundleId, JobId, JobRecord};
use crate::queue::QueueBackend;

/// Executes jobs of one type.
///
/// Handlers must be idempotent: a job that fails with a retryable error is
/// run again from the start.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError>;
}

/// Adapter returned by [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`JobHandler`].
///
/// ```ignore
/// registry.register("echo", handler_fn(|ctx| async move {
///     Ok(ctx.payload.clone())
/// }));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> Result<Value, HandlerError> {
        (self.f)(ctx).await
    }
}

/// Job type to handler mapping, filled at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `job_type`, replacing any previous one.
    pub fn register<H>(&mut self, job_type: impl Into<String>, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.register_arc(job_type, Arc::new(handler))
    }

    pub fn register_arc(
        &mut self,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> &mut Self {
        let job_type = job_type.into();
        if self.handlers.insert(job_type.clone(), handler).is_some() {
            tracing::warn!(job_type = %job_type, "replacing previously registered handler");
        }
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<H>(mut self, job_type: impl Into<String>, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.register(job_type, handler);
        self
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    /// Registered job types, sorted.
    pub fn job_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// What a handler sees of the job it is running.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: String,
    pub payload: Value,
    /// 1-based attempt number.
    pub attempt: u32,
    pub max_attempts: u32,
    pub bundle_id: Option<BundleId>,
    backend: Arc<dyn QueueBackend>,
    events: Arc<dyn JobEventPublisher>,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("job_type", &self.job_type)
            .field("attempt", &self.attempt)
            .field("max_attempts", &self.max_attempts)
            .field("bundle_id", &self.bundle_id)
            .finish()
    }
}

impl JobContext {
    pub fn new(
        record: &JobRecord,
        backend: Arc<dyn QueueBackend>,
        events: Arc<dyn JobEventPublisher>,
    ) -> Self {
        Self {
            job_id: record.id,
            job_type: record.job_type.clone(),
            payload: record.payload.clone(),
            attempt: record.attempts,
            max_attempts: record.max_attempts,
            bundle_id: record.bundle_id.clone(),
            backend,
            events,
        }
    }

    /// Deserialize the payload into the handler's input type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_value(self.payload.clone()).map_err(HandlerError::from)
    }

    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Record progress (0-100) and publish a progress event.
    ///
    /// Values that do not increase progress are ignored. Failures to store
    /// progress are logged and never fail the job.
    pub async fn report_progress(&self, progress: u8) {
        match self.backend.update_progress(self.job_id, progress).await {
            Ok(Some(record)) => {
                let event = JobEvent::new(JobEventKind::Progress, record);
                if let Err(err) = self.events.publish(event).await {
                    tracing::warn!(job_id = %self.job_id, "publish progress event failed: {err}");
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(job_id = %self.job_id, "progress update failed: {err:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InProcEventBus;
    use crate::job::EnqueueOptions;
    use crate::persistence::MemoryBackend;
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct EchoInput {
        text: String,
    }

    async fn claimed_context(payload: Value) -> (JobContext, Arc<MemoryBackend>, InProcEventBus) {
        let backend = Arc::new(MemoryBackend::new());
        let bus = InProcEventBus::new(16);
        backend
            .insert(JobRecord::new("echo", payload, &EnqueueOptions::default(), 3))
            .await
            .unwrap();
        let record = backend.claim(1, Utc::now()).await.unwrap().remove(0);
        let ctx = JobContext::new(&record, backend.clone(), Arc::new(bus.clone()));
        (ctx, backend, bus)
    }

    #[tokio::test]
    async fn handler_fn_runs_closure() {
        let handler = handler_fn(|ctx: JobContext| async move {
            let input: EchoInput = ctx.payload_as()?;
            Ok(json!(input.text.to_uppercase()))
        });
        let (ctx, _, _) = claimed_context(json!({"text": "hello"})).await;
        assert_eq!(handler.handle(ctx).await.unwrap(), json!("HELLO"));
    }

    #[tokio::test]
    async fn payload_as_maps_shape_errors_to_malformed_input() {
        let (ctx, _, _) = claimed_context(json!({"wrong": 1})).await;
        let err = ctx.payload_as::<EchoInput>().unwrap_err();
        assert!(matches!(err, HandlerError::MalformedInput(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn report_progress_updates_backend_and_emits_event() {
        let (ctx, backend, bus) = claimed_context(json!({})).await;
        let mut rx = bus.subscribe();

        ctx.report_progress(40).await;
        ctx.report_progress(10).await;

        let stored = backend.get(ctx.job_id).await.unwrap().unwrap();
        assert_eq!(stored.progress, 40);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, JobEventKind::Progress);
        assert_eq!(event.job.progress, 40);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn registry_lists_sorted_types() {
        let noop = || handler_fn(|_ctx: JobContext| async { Ok(Value::Null) });
        let registry = HandlerRegistry::new()
            .with("summarize", noop())
            .with("analyze", noop());
        assert_eq!(registry.job_types(), vec!["analyze", "summarize"]);
        assert!(registry.contains("analyze"));
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 2);
    }
}
