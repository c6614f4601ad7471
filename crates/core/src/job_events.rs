//! Progress and system-status events relayed to observers.
//!
//! Events are point-in-time snapshots. They are never persisted; a late
//! observer gets one snapshot on connect and live events afterwards.

use serde::{Deserialize, Serialize};

use crate::job::{Artifact, JobError, JobState};
use crate::types::{JobId, Timestamp};

/// Progress update during job execution (queue position, percentage).
pub const MSG_TYPE_JOB_PROGRESS: &str = "job_progress";

/// Job completed successfully.
pub const MSG_TYPE_JOB_COMPLETED: &str = "job_completed";

/// Job failed after recovery was exhausted or aborted.
pub const MSG_TYPE_JOB_FAILED: &str = "job_failed";

/// Job was cancelled by a caller.
pub const MSG_TYPE_JOB_CANCELLED: &str = "job_cancelled";

/// Periodic aggregate of job counts per state.
pub const MSG_TYPE_SYSTEM_STATUS: &str = "system_status";

/// Snapshot of one job broadcast to its observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: JobId,
    /// Per-job sequence number; strictly increasing in emission order.
    pub seq: u64,
    pub state: JobState,
    /// A change of attempt means the progress below restarted from 0.
    pub attempt: u32,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Vec<Artifact>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
    pub timestamp: Timestamp,
}

impl ProgressEvent {
    /// WebSocket message type for this event.
    pub fn message_type(&self) -> &'static str {
        match self.state {
            JobState::Completed => MSG_TYPE_JOB_COMPLETED,
            JobState::Failed => MSG_TYPE_JOB_FAILED,
            JobState::Cancelled => MSG_TYPE_JOB_CANCELLED,
            _ => MSG_TYPE_JOB_PROGRESS,
        }
    }

    pub fn is_final(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Number of tracked jobs in each state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub queued: usize,
    pub submitting: usize,
    pub polling: usize,
    pub recovering: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl StateCounts {
    pub fn record(&mut self, state: JobState) {
        let slot = match state {
            JobState::Queued => &mut self.queued,
            JobState::Submitting => &mut self.submitting,
            JobState::Polling => &mut self.polling,
            JobState::Recovering => &mut self.recovering,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Cancelled => &mut self.cancelled,
        };
        *slot += 1;
    }

    /// Jobs currently owned by a worker.
    pub fn active(&self) -> usize {
        self.submitting + self.polling + self.recovering
    }

    pub fn total(&self) -> usize {
        self.queued + self.active() + self.completed + self.failed + self.cancelled
    }
}

impl FromIterator<JobState> for StateCounts {
    fn from_iter<I: IntoIterator<Item = JobState>>(iter: I) -> Self {
        let mut counts = StateCounts::default();
        for state in iter {
            counts.record(state);
        }
        counts
    }
}

/// Aggregate emitted to system observers on a fixed cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub counts: StateCounts,
    pub worker_count: usize,
    pub timestamp: Timestamp,
}
