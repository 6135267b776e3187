use std::fmt;
use std::sync::Arc;

use crate::events::JobEventPublisher;
use crate::queue::QueueBackend;
use crate::retry::RetryPolicy;
use crate::service::QueueService;

use super::handler::{HandlerRegistry, JobHandler};
use super::supervisor::WorkerPool;
use super::worker::WorkerConfig;

/// Builder for constructing a `WorkerPool` with explicit dependencies.
///
/// The builder validates that all required dependencies are provided before
/// constructing the pool.
///
/// # Example
///
/// ```ignore
/// use penstock::*;
///
/// let pool = WorkerPoolBuilder::new(WorkerConfig::new("journal"))
///     .with_queue(&queue)
///     .register("analyze_entry", AnalyzeEntry::new(completions))
///     .build()?;
/// pool.start().await?;
/// ```
pub struct WorkerPoolBuilder {
    config: WorkerConfig,
    backend: Option<Arc<dyn QueueBackend>>,
    events: Option<Arc<dyn JobEventPublisher>>,
    registry: HandlerRegistry,
    retry: Option<RetryPolicy>,
}

impl fmt::Debug for WorkerPoolBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("WorkerPoolBuilder");
        debug.field("config", &self.config);
        debug.field("backend_set", &self.backend.is_some());
        debug.field("events_set", &self.events.is_some());
        debug.field("registry", &self.registry);
        debug.field("retry", &self.retry);

        if let Some(backend) = &self.backend {
            debug.field("backend_kind", &backend.kind());
        }

        debug.finish()
    }
}

impl WorkerPoolBuilder {
    /// Create a new builder with the given worker configuration.
    pub fn new(config: WorkerConfig) -> Self {
        Self {
            config,
            backend: None,
            events: None,
            registry: HandlerRegistry::new(),
            retry: None,
        }
    }

    /// Take backend, event channel and retry policy from a queue service.
    ///
    /// An explicit [`with_retry_policy`](Self::with_retry_policy) wins over the
    /// service's policy regardless of call order.
    pub fn with_queue(mut self, queue: &QueueService) -> Self {
        self.backend = Some(queue.backend());
        self.events = Some(queue.events());
        if self.retry.is_none() {
            self.retry = Some(queue.config().retry.clone());
        }
        self
    }

    /// Set the queue backend.
    pub fn with_backend(mut self, backend: Arc<dyn QueueBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the event publisher.
    pub fn with_events(mut self, events: Arc<dyn JobEventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Replace the handler registry.
    pub fn with_registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Register a handler for `job_type`.
    pub fn register<H>(mut self, job_type: impl Into<String>, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.registry.register(job_type, handler);
        self
    }

    /// Set the retry policy.
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Replace the worker configuration.
    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the `WorkerPool` with all configured dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend or event publisher is missing, or if
    /// no handler was registered.
    pub fn build(self) -> anyhow::Result<WorkerPool> {
        let backend = self
            .backend
            .ok_or_else(|| anyhow::anyhow!("backend dependency missing"))?;
        let events = self
            .events
            .ok_or_else(|| anyhow::anyhow!("events dependency missing"))?;
        if self.registry.is_empty() {
            anyhow::bail!("no job handlers registered");
        }

        Ok(WorkerPool::new(
            self.config,
            backend,
            events,
            self.registry,
            self.retry.unwrap_or_default(),
        ))
    }
}
