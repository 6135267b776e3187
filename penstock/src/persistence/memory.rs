use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::job::{BundleId, JobId, JobRecord, JobStatus};
use crate::queue::{BackendKind, QueueBackend, QueueSnapshot, STALE_JOB_ERROR};

/// In-process, memory-resident backend used when the durable one is
/// unreachable.
///
/// One mutex guards every record, so claim's check-then-set is atomic with
/// respect to any other operation in the process. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<JobId, StoredJob>,
    next_seq: u64,
}

#[derive(Clone, Debug)]
struct StoredJob {
    // Insertion order breaks ties between identical `created_at` values.
    seq: u64,
    record: JobRecord,
}

impl MemoryState {
    fn sorted<'a>(&'a self, filter: impl Fn(&JobRecord) -> bool) -> Vec<&'a StoredJob> {
        let mut matching: Vec<&StoredJob> =
            self.jobs.values().filter(|s| filter(&s.record)).collect();
        matching.sort_by_key(|s| (s.record.created_at, s.seq));
        matching
    }

    fn active_mut(&mut self, id: JobId, op: &str) -> Option<&mut JobRecord> {
        match self.jobs.get_mut(&id) {
            Some(stored) if stored.record.status == JobStatus::Active => Some(&mut stored.record),
            Some(stored) => {
                warn!(
                    job_id = %id,
                    status = %stored.record.status,
                    "ignoring {op} for job that is not active"
                );
                None
            }
            None => {
                warn!(job_id = %id, "ignoring {op} for unknown job");
                None
            }
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently held, terminal ones included.
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fallback
    }

    async fn insert(&self, record: JobRecord) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.jobs.contains_key(&record.id) {
            anyhow::bail!("job already exists: {}", record.id);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(record.id, StoredJob { seq, record });
        Ok(())
    }

    async fn get(&self, id: JobId) -> anyhow::Result<Option<JobRecord>> {
        Ok(self.state.lock().jobs.get(&id).map(|s| s.record.clone()))
    }

    async fn list_by_status(&self, statuses: &[JobStatus]) -> anyhow::Result<Vec<JobRecord>> {
        let state = self.state.lock();
        Ok(state
            .sorted(|r| statuses.contains(&r.status))
            .into_iter()
            .map(|s| s.record.clone())
            .collect())
    }

    async fn list_by_bundle(&self, bundle_id: &BundleId) -> anyhow::Result<Vec<JobRecord>> {
        let state = self.state.lock();
        Ok(state
            .sorted(|r| r.bundle_id.as_ref() == Some(bundle_id))
            .into_iter()
            .map(|s| s.record.clone())
            .collect())
    }

    async fn claim(&self, limit: usize, now: DateTime<Utc>) -> anyhow::Result<Vec<JobRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut state = self.state.lock();
        let ids: Vec<JobId> = state
            .sorted(|r| r.is_claimable(now))
            .into_iter()
            .take(limit)
            .map(|s| s.record.id)
            .collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(stored) = state.jobs.get_mut(&id) {
                stored.record.mark_claimed(now);
                claimed.push(stored.record.clone());
            }
        }

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "claimed jobs from fallback backend");
        }
        Ok(claimed)
    }

    async fn update_progress(&self, id: JobId, progress: u8) -> anyhow::Result<Option<JobRecord>> {
        let mut state = self.state.lock();
        let Some(stored) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if stored.record.status != JobStatus::Active {
            return Ok(None);
        }
        if stored.record.apply_progress(progress) {
            Ok(Some(stored.record.clone()))
        } else {
            Ok(None)
        }
    }

    async fn complete(&self, id: JobId, result: Value) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        match state.active_mut(id, "complete") {
            Some(record) => {
                record.mark_completed(result, Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn retry(
        &self,
        id: JobId,
        error: String,
        available_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        match state.active_mut(id, "retry") {
            Some(record) => {
                record.mark_retry(error, available_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn fail(&self, id: JobId, error: String) -> anyhow::Result<bool> {
        let mut state = self.state.lock();
        match state.active_mut(id, "fail") {
            Some(record) => {
                record.mark_failed(error, Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn reap(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut state = self.state.lock();
        let before = state.jobs.len();
        state.jobs.retain(|_, stored| {
            let record = &stored.record;
            !(record.is_terminal() && record.completed_at.is_some_and(|at| at < cutoff))
        });
        Ok((before - state.jobs.len()) as u64)
    }

    async fn requeue_stale(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<JobRecord>> {
        let mut state = self.state.lock();
        let mut recovered = Vec::new();
        for stored in state.jobs.values_mut() {
            let record = &mut stored.record;
            if !record.is_stale(cutoff) {
                continue;
            }
            if record.attempts_remaining() == 0 {
                record.mark_failed(STALE_JOB_ERROR.to_string(), now);
            } else {
                record.mark_retry(STALE_JOB_ERROR.to_string(), now);
            }
            warn!(job_id = %record.id, status = %record.status, "recovered stale job");
            recovered.push(record.clone());
        }
        Ok(recovered)
    }

    async fn snapshot(&self) -> anyhow::Result<QueueSnapshot> {
        let state = self.state.lock();
        let mut snapshot = QueueSnapshot::new(Utc::now(), BackendKind::Fallback);
        for status in JobStatus::ALL {
            snapshot.record(status, 0);
        }
        for stored in state.jobs.values() {
            snapshot.record(stored.record.status, 1);
        }
        Ok(snapshot)
    }

    async fn close(&self) -> anyhow::Result<()> {
        debug!(jobs = self.len(), "closing fallback backend");
        Ok(())
    }
}
