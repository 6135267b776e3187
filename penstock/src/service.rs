//! The queue facade shared by producers, the worker pool and status readers.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::bundle::{aggregate, BundleStatus};
use crate::config::QueueConfig;
use crate::events::{InProcEventBus, JobEvent, JobEventKind, JobEventPublisher};
use crate::job::{BundleId, EnqueueOptions, JobId, JobRecord, JobStatus};
use crate::persistence::MemoryBackend;
use crate::probe::{probe_backend, DurableConnector};
use crate::queue::{BackendKind, QueueBackend, QueueSnapshot, StaleRecovery};
use crate::runtime::ShutdownToken;
use crate::telemetry;

/// Entry point for enqueueing work and reading job state.
///
/// Built once at startup and cloned wherever it is needed; clones share the
/// same backend, event channel and reaper.
#[derive(Clone)]
pub struct QueueService {
    inner: Arc<Inner>,
}

struct Inner {
    backend: Arc<dyn QueueBackend>,
    events: Arc<dyn JobEventPublisher>,
    config: QueueConfig,
    degraded_reason: Option<String>,
    reaper: Mutex<Option<(ShutdownToken, JoinHandle<()>)>>,
}

impl fmt::Debug for QueueService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueService")
            .field("backend", &self.inner.backend.kind())
            .field("degraded_reason", &self.inner.degraded_reason)
            .field("config", &self.inner.config)
            .field("reaper_running", &self.inner.reaper.lock().is_some())
            .finish()
    }
}

impl QueueService {
    /// Probe the durable backend, bind to whichever backend answers, and start
    /// the reaper.
    ///
    /// Never fails: an unreachable or missing durable backend leaves the
    /// service on the in-process backend with [`degraded_reason`](Self::degraded_reason) set.
    pub async fn initialize(config: QueueConfig, connector: Option<&dyn DurableConnector>) -> Self {
        let selection = probe_backend(connector, config.probe_timeout()).await;
        let events: Arc<dyn JobEventPublisher> = Arc::new(InProcEventBus::new(config.event_capacity));

        let service = Self::with_parts(
            selection.backend,
            events,
            config,
            selection.degraded_reason,
        );
        service.start_reaper();

        tracing::info!(
            backend = %service.backend_kind(),
            degraded = service.is_degraded(),
            "queue service initialized"
        );
        service
    }

    /// [`initialize`](Self::initialize) with the connector implied by `config`.
    ///
    /// A configured database is only used when the crate is built with the
    /// `postgres` feature.
    pub async fn connect(config: QueueConfig) -> Self {
        #[cfg(feature = "postgres")]
        {
            let connector = config
                .persistence
                .clone()
                .map(crate::probe::PostgresConnector::new);
            Self::initialize(config, connector.as_ref().map(|c| c as &dyn DurableConnector)).await
        }

        #[cfg(not(feature = "postgres"))]
        {
            if config.persistence.is_some() {
                tracing::warn!(
                    "persistence configured but penstock was built without the `postgres` feature"
                );
            }
            Self::initialize(config, None).await
        }
    }

    /// Explicit construction over a chosen backend. The reaper is not started.
    pub fn new(
        backend: Arc<dyn QueueBackend>,
        events: Arc<dyn JobEventPublisher>,
        config: QueueConfig,
    ) -> Self {
        let degraded_reason = match backend.kind() {
            BackendKind::Durable => None,
            BackendKind::Fallback => Some("in-process backend selected explicitly".to_string()),
        };
        Self::with_parts(backend, events, config, degraded_reason)
    }

    /// Service over a fresh in-process backend and event bus. The reaper is
    /// not started.
    pub fn in_process(config: QueueConfig) -> Self {
        let events = Arc::new(InProcEventBus::new(config.event_capacity));
        Self::new(Arc::new(MemoryBackend::new()), events, config)
    }

    fn with_parts(
        backend: Arc<dyn QueueBackend>,
        events: Arc<dyn JobEventPublisher>,
        config: QueueConfig,
        degraded_reason: Option<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                events,
                config,
                degraded_reason,
                reaper: Mutex::new(None),
            }),
        }
    }

    /// Record a new `waiting` job and return its id. Does not wait for execution.
    pub async fn enqueue(
        &self,
        job_type: impl Into<String>,
        payload: Value,
        options: EnqueueOptions,
    ) -> anyhow::Result<JobId> {
        let job_type = job_type.into();
        if job_type.trim().is_empty() {
            anyhow::bail!("job type must not be empty");
        }

        let record = JobRecord::new(
            job_type.clone(),
            payload,
            &options,
            self.inner.config.default_max_attempts,
        );
        let id = record.id;

        self.inner
            .backend
            .insert(record)
            .instrument(telemetry::enqueue_span(&job_type))
            .await?;
        telemetry::record_job_enqueued(&job_type);

        Ok(id)
    }

    /// Enqueue several jobs under one bundle id.
    ///
    /// Without `bundle_id` a fresh id is generated. Any bundle set on
    /// `options` is overridden.
    pub async fn enqueue_bundle(
        &self,
        bundle_id: Option<BundleId>,
        jobs: Vec<(String, Value)>,
        options: EnqueueOptions,
    ) -> anyhow::Result<(BundleId, Vec<JobId>)> {
        let bundle_id = bundle_id.unwrap_or_else(BundleId::generate);
        let options = options.with_bundle(bundle_id.clone());

        let mut ids = Vec::with_capacity(jobs.len());
        for (job_type, payload) in jobs {
            ids.push(self.enqueue(job_type, payload, options.clone()).await?);
        }

        tracing::debug!(bundle_id = %bundle_id.as_str(), jobs = ids.len(), "bundle enqueued");
        Ok((bundle_id, ids))
    }

    /// Current record for `id`, or `None` if unknown (or already reaped).
    pub async fn get_status(&self, id: JobId) -> anyhow::Result<Option<JobRecord>> {
        self.inner.backend.get(id).await
    }

    pub async fn get_jobs_by_state(&self, statuses: &[JobStatus]) -> anyhow::Result<Vec<JobRecord>> {
        self.inner.backend.list_by_status(statuses).await
    }

    /// Aggregate status of every job carrying `bundle_id`; `None` if there are none.
    pub async fn get_bundle_status(
        &self,
        bundle_id: &BundleId,
    ) -> anyhow::Result<Option<BundleStatus>> {
        let jobs = self.inner.backend.list_by_bundle(bundle_id).await?;
        if jobs.is_empty() {
            return Ok(None);
        }
        Ok(Some(aggregate(bundle_id.clone(), &jobs)))
    }

    pub async fn snapshot(&self) -> anyhow::Result<QueueSnapshot> {
        self.inner.backend.snapshot().await
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    pub fn is_degraded(&self) -> bool {
        self.backend_kind() == BackendKind::Fallback
    }

    /// Why the durable backend is not in use, if it isn't.
    pub fn degraded_reason(&self) -> Option<&str> {
        self.inner.degraded_reason.as_deref()
    }

    pub fn events(&self) -> Arc<dyn JobEventPublisher> {
        Arc::clone(&self.inner.events)
    }

    pub fn backend(&self) -> Arc<dyn QueueBackend> {
        Arc::clone(&self.inner.backend)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Delete terminal jobs older than the retention window now.
    pub async fn reap_now(&self) -> anyhow::Result<u64> {
        reap_once(self.inner.backend.as_ref(), &self.inner.config).await
    }

    /// Hand abandoned `active` jobs back now: anything claimed more than
    /// `stale_after_secs` ago returns to `waiting`, or fails when it has no
    /// attempts left. A `retry` or `failed` event is published for each.
    pub async fn recover_stale_now(&self) -> anyhow::Result<StaleRecovery> {
        recover_once(
            self.inner.backend.as_ref(),
            self.inner.events.as_ref(),
            &self.inner.config,
        )
        .await
    }

    /// Start the periodic reaper, which deletes expired terminal jobs and
    /// recovers stale active ones. Calling it again while it runs is a no-op.
    pub fn start_reaper(&self) {
        let mut slot = self.inner.reaper.lock();
        if slot.is_some() {
            return;
        }

        let shutdown = ShutdownToken::new();
        let backend = Arc::clone(&self.inner.backend);
        let events = Arc::clone(&self.inner.events);
        let config = self.inner.config.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move {
            let interval = config.reaper_interval();
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                if let Err(err) = recover_once(backend.as_ref(), events.as_ref(), &config).await {
                    tracing::warn!("stale job sweep failed: {err:#}");
                }
                if let Err(err) = reap_once(backend.as_ref(), &config).await {
                    tracing::warn!("reaper sweep failed: {err:#}");
                }
            }
            tracing::debug!("reaper stopped");
        });

        *slot = Some((shutdown, handle));
    }

    /// Stop the reaper and release backend resources.
    pub async fn close(&self) -> anyhow::Result<()> {
        let reaper = self.inner.reaper.lock().take();
        if let Some((shutdown, handle)) = reaper {
            shutdown.cancel();
            if let Err(err) = handle.await {
                tracing::warn!("reaper task failed: {err}");
            }
        }

        self.inner.backend.close().await
    }
}

async fn reap_once(backend: &dyn QueueBackend, config: &QueueConfig) -> anyhow::Result<u64> {
    let retention = chrono::Duration::from_std(config.retention())?;
    let cutoff = Utc::now() - retention;
    let removed = backend.reap(cutoff).await?;
    if removed > 0 {
        tracing::info!(removed, "reaped finished jobs");
    }
    Ok(removed)
}

async fn recover_once(
    backend: &dyn QueueBackend,
    events: &dyn JobEventPublisher,
    config: &QueueConfig,
) -> anyhow::Result<StaleRecovery> {
    let stale_after = chrono::Duration::from_std(config.stale_after())?;
    let now = Utc::now();
    let recovered = backend.requeue_stale(now - stale_after, now).await?;

    let recovery = StaleRecovery::tally(&recovered);
    for job in recovered {
        let kind = match job.status {
            JobStatus::Failed => JobEventKind::Failed,
            _ => JobEventKind::Retry { delay_ms: 0 },
        };
        if let Err(err) = events.publish(JobEvent::new(kind, job)).await {
            tracing::error!("publish {} event failed: {err}", kind.as_str());
        }
    }
    if recovery.total() > 0 {
        tracing::info!(
            requeued = recovery.requeued,
            failed = recovery.failed,
            "recovered stale jobs"
        );
    }
    Ok(recovery)
}
