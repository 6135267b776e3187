use std::collections::HashMap;
use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{BundleId, JobId, JobRecord, JobStatus};

/// Which backend strategy is serving the queue.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Network-attached, survives restarts, shared by many processes.
    Durable,
    /// In-process and memory-resident.
    Fallback,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Durable => "durable",
            BackendKind::Fallback => "fallback",
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trait for backends that hold Job Records.
///
/// Status transitions out of `active` (`complete`, `retry`, `fail`) only
/// apply when the job is still `active`; otherwise they are no-ops and return
/// `false`.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Which strategy this is.
    fn kind(&self) -> BackendKind;

    /// Persist a freshly created `waiting` record.
    async fn insert(&self, record: JobRecord) -> anyhow::Result<()>;

    /// Fetch one record.
    async fn get(&self, id: JobId) -> anyhow::Result<Option<JobRecord>>;

    /// All records whose status is in `statuses`, oldest first.
    async fn list_by_status(&self, statuses: &[JobStatus]) -> anyhow::Result<Vec<JobRecord>>;

    /// All records carrying `bundle_id`, oldest first.
    async fn list_by_bundle(&self, bundle_id: &BundleId) -> anyhow::Result<Vec<JobRecord>>;

    /// Atomically claim up to `limit` claimable jobs, FIFO by `created_at`.
    ///
    /// Claimed jobs come back `active` with `attempts` incremented, `started_at`
    /// set and progress reset. No job is returned by two concurrent calls.
    async fn claim(&self, limit: usize, now: DateTime<Utc>) -> anyhow::Result<Vec<JobRecord>>;

    /// Record handler progress; ignored unless the job is active and the
    /// value increases. Returns the updated record when it changed.
    async fn update_progress(&self, id: JobId, progress: u8) -> anyhow::Result<Option<JobRecord>>;

    /// `active -> completed`.
    async fn complete(&self, id: JobId, result: Value) -> anyhow::Result<bool>;

    /// `active -> waiting`, eligible again at `available_at`.
    async fn retry(
        &self,
        id: JobId,
        error: String,
        available_at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// `active -> failed`.
    async fn fail(&self, id: JobId, error: String) -> anyhow::Result<bool>;

    /// Delete terminal jobs that finished before `cutoff`.
    async fn reap(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;

    /// Hand back `active` jobs claimed before `cutoff` whose worker is gone.
    ///
    /// Jobs with attempts left return to `waiting`, claimable from `now`;
    /// the rest move to `failed`. Both carry [`STALE_JOB_ERROR`]. Returns the
    /// recovered records in their new state.
    async fn requeue_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<JobRecord>>;

    /// Per-status counts at this instant.
    async fn snapshot(&self) -> anyhow::Result<QueueSnapshot>;

    /// Release connections and other resources.
    async fn close(&self) -> anyhow::Result<()>;
}

/// Error recorded on jobs recovered by [`QueueBackend::requeue_stale`].
pub const STALE_JOB_ERROR: &str = "worker stopped before the job finished";

/// Counts from one stale-job sweep.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StaleRecovery {
    /// Returned to `waiting`.
    pub requeued: u64,
    /// Out of attempts, moved to `failed`.
    pub failed: u64,
}

impl StaleRecovery {
    pub fn tally(recovered: &[JobRecord]) -> Self {
        let failed = recovered
            .iter()
            .filter(|r| r.status == JobStatus::Failed)
            .count() as u64;
        Self {
            requeued: recovered.len() as u64 - failed,
            failed,
        }
    }

    pub fn total(&self) -> u64 {
        self.requeued + self.failed
    }
}

/// Snapshot of queue state at a point in time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueSnapshot {
    /// Timestamp when the snapshot was taken.
    pub sampled_at: DateTime<Utc>,
    /// Backend that produced the snapshot.
    pub backend: BackendKind,
    /// Job counts keyed by status.
    pub counts: HashMap<JobStatus, usize>,
}

impl QueueSnapshot {
    /// Create an empty snapshot at the given time.
    pub fn new(sampled_at: DateTime<Utc>, backend: BackendKind) -> Self {
        Self {
            sampled_at,
            backend,
            counts: HashMap::new(),
        }
    }

    pub fn record(&mut self, status: JobStatus, count: usize) {
        *self.counts.entry(status).or_default() += count;
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.counts.get(&status).copied().unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}
