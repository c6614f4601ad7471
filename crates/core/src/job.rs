//! The generation job record and its lifecycle states.

use serde::{Deserialize, Serialize};

use crate::classifier::ErrorCategory;
use crate::job_events::ProgressEvent;
use crate::params::GenerationParams;
use crate::quality_gate::QualityResult;
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Orchestrator state of a job.
///
/// `Queued -> Submitting -> Polling -> {Completed | Recovering | Failed}`,
/// with `Recovering -> Submitting` forming the retry loop. `Cancelled` is
/// reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Submitting,
    Polling,
    Recovering,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 7] = [
        JobState::Queued,
        JobState::Submitting,
        JobState::Polling,
        JobState::Recovering,
        JobState::Completed,
        JobState::Failed,
        JobState::Cancelled,
    ];

    /// String representation for storage and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Submitting => "submitting",
            JobState::Polling => "polling",
            JobState::Recovering => "recovering",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Parse from the stored string form.
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Last classified failure of a job, as shown to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub category: ErrorCategory,
    pub message: String,
}

/// One file produced by the render engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Path of the artifact, relative to the engine's output root.
    pub path: String,
    /// Node of the engine graph that produced it, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl Artifact {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            node_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Snapshot of a generation job.
///
/// Invariants maintained by the pipeline:
/// - `output` is `Some` if and only if `state == Completed`.
/// - `progress` never decreases within one attempt and resets to 0 when
///   `attempt` increments.
/// - `seq` increases by one for every emitted [`ProgressEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Render-engine handle of the current attempt.
    pub handle: Option<String>,
    pub parameters: GenerationParams,
    pub state: JobState,
    pub progress: u8,
    pub attempt: u32,
    pub last_error: Option<JobError>,
    pub output: Option<Vec<Artifact>>,
    pub quality: Option<QualityResult>,
    /// 1-based position in the intake queue while `Queued`.
    pub queue_position: Option<usize>,
    pub seq: u64,
    pub created_at: Timestamp,
    pub heartbeat_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl Job {
    pub fn new(id: JobId, parameters: GenerationParams) -> Self {
        let now = chrono::Utc::now();
        Self {
            id,
            handle: None,
            parameters,
            state: JobState::Queued,
            progress: 0,
            attempt: 1,
            last_error: None,
            output: None,
            quality: None,
            queue_position: None,
            seq: 0,
            created_at: now,
            heartbeat_at: now,
            completed_at: None,
        }
    }

    /// Build the event describing the job as it is right now.
    pub fn progress_event(&self) -> ProgressEvent {
        ProgressEvent {
            job_id: self.id.clone(),
            seq: self.seq,
            state: self.state,
            attempt: self.attempt,
            progress: self.progress,
            queue_position: self.queue_position,
            output: self.output.clone(),
            error: self.last_error.clone(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Bump the sequence number and build the next event.
    pub fn next_event(&mut self) -> ProgressEvent {
        self.seq += 1;
        self.progress_event()
    }
}
