use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Attempt ceiling applied when neither the caller nor the config sets one.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Progress value written by the completion transition only.
pub const PROGRESS_COMPLETE: u8 = 100;

/// Highest progress a handler can report while the job is still active.
pub const PROGRESS_ACTIVE_CEILING: u8 = 99;

#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates sibling jobs submitted as one logical request.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleId(String);

impl BundleId {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Generate a fresh random bundle id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BundleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for BundleId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for BundleId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Waiting,
        JobStatus::Active,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// `completed` and `failed` admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(anyhow::anyhow!("invalid job status: {other}")),
        }
    }
}

/// Per-enqueue overrides.
#[derive(Clone, Debug, Default)]
pub struct EnqueueOptions {
    pub max_attempts: Option<u32>,
    pub backoff_base: Option<Duration>,
    pub bundle_id: Option<BundleId>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = Some(base);
        self
    }

    pub fn with_bundle(mut self, bundle_id: impl Into<BundleId>) -> Self {
        self.bundle_id = Some(bundle_id.into());
        self
    }
}

/// State of one unit of asynchronous work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: String,
    pub payload: Value,
    pub status: JobStatus,
    pub progress: u8,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Overrides the retry policy's base delay for this job.
    pub backoff_base_ms: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// The scheduler never claims the job before this instant.
    pub available_at: DateTime<Utc>,
    pub bundle_id: Option<BundleId>,
}

impl JobRecord {
    /// Build a fresh `waiting` record.
    ///
    /// A requested attempt ceiling of zero is raised to one so every job gets
    /// at least one execution.
    pub fn new(
        job_type: impl Into<String>,
        payload: Value,
        options: &EnqueueOptions,
        default_max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        let max_attempts = options
            .max_attempts
            .unwrap_or(default_max_attempts)
            .max(1);
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload,
            status: JobStatus::Waiting,
            progress: 0,
            attempts: 0,
            max_attempts,
            backoff_base_ms: options
                .backoff_base
                .map(|d| d.as_millis().min(u64::MAX as u128) as u64),
            result: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            available_at: now,
            bundle_id: options.bundle_id.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the scheduler may claim this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Waiting && self.available_at <= now
    }

    /// Active, and claimed before `cutoff`.
    pub fn is_stale(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active && self.started_at.is_some_and(|at| at < cutoff)
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts)
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            id: self.id,
            job_type: self.job_type.clone(),
            status: self.status,
            progress: self.progress,
            attempts: self.attempts,
            result: self.result.clone(),
            error: self.error.clone(),
        }
    }

    // Transitions below are applied by the backends; they assume the caller
    // already checked the current status.

    pub(crate) fn mark_claimed(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Active;
        self.attempts = self.attempts.saturating_add(1);
        self.started_at = Some(now);
        self.progress = 0;
    }

    /// Monotone within an attempt; never reaches 100 before completion.
    pub(crate) fn apply_progress(&mut self, progress: u8) -> bool {
        let clamped = progress.min(PROGRESS_ACTIVE_CEILING);
        if clamped > self.progress {
            self.progress = clamped;
            true
        } else {
            false
        }
    }

    pub(crate) fn mark_completed(&mut self, result: Value, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.progress = PROGRESS_COMPLETE;
        self.result = Some(result);
        self.error = None;
        self.completed_at = Some(now);
    }

    pub(crate) fn mark_retry(&mut self, error: String, available_at: DateTime<Utc>) {
        self.status = JobStatus::Waiting;
        self.progress = 0;
        self.error = Some(error);
        self.available_at = available_at;
    }

    pub(crate) fn mark_failed(&mut self, error: String, now: DateTime<Utc>) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(now);
    }
}

/// Caller-facing projection of a job's state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: JobId,
    pub job_type: String,
    pub status: JobStatus,
    pub progress: u8,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
