use serde::{Deserialize, Serialize};

use crate::job::{BundleId, JobRecord, JobStatus, JobStatusView};

/// Combined state of every job sharing a bundle id.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleState {
    /// Every job is terminal and none failed.
    Completed,
    /// Every job is terminal and at least one failed.
    PartialFailure,
    /// At least one job is still waiting or active.
    Processing,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BundleStatus {
    pub bundle_id: BundleId,
    /// Share of jobs that completed, as a rounded percentage.
    pub overall_progress: u8,
    pub status: BundleState,
    pub jobs: Vec<JobStatusView>,
}

/// Summarise a bundle from its member records.
///
/// An empty set reports zero progress and `Processing`.
pub fn aggregate(bundle_id: BundleId, jobs: &[JobRecord]) -> BundleStatus {
    let total = jobs.len();
    let completed = jobs
        .iter()
        .filter(|job| job.status == JobStatus::Completed)
        .count();
    let failed = jobs
        .iter()
        .filter(|job| job.status == JobStatus::Failed)
        .count();

    let overall_progress = if total == 0 {
        0
    } else {
        ((completed as f64 / total as f64) * 100.0).round() as u8
    };

    let status = if total == 0 || completed + failed < total {
        BundleState::Processing
    } else if failed > 0 {
        BundleState::PartialFailure
    } else {
        BundleState::Completed
    };

    BundleStatus {
        bundle_id,
        overall_progress,
        status,
        jobs: jobs.iter().map(JobRecord::status_view).collect(),
    }
}
