//! Persisted copy of a generation job (`generation_jobs` table).

use kiln_core::classifier::ErrorCategory;
use kiln_core::error::CoreError;
use kiln_core::job::{Artifact, Job, JobError, JobState};
use kiln_core::params::GenerationParams;
use kiln_core::quality_gate::QualityResult;
use kiln_core::types::{JobId, Timestamp};
use serde::Serialize;
use sqlx::types::Json;
use sqlx::FromRow;

/// A row from the `generation_jobs` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GenerationJobRow {
    pub id: String,
    pub state: String,
    pub parameters: Json<GenerationParams>,
    pub attempt: i32,
    pub progress: i16,
    pub handle: Option<String>,
    pub output: Option<Json<Vec<Artifact>>>,
    pub error_category: Option<String>,
    pub error_message: Option<String>,
    pub quality: Option<Json<QualityResult>>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub completed_at: Option<Timestamp>,
}

impl GenerationJobRow {
    /// Rebuild the in-memory job record.
    ///
    /// Event sequence numbers are not persisted; a restored job starts
    /// at `seq == 0`.
    pub fn into_job(self) -> Result<Job, CoreError> {
        let state = JobState::parse(&self.state).ok_or_else(|| {
            CoreError::Internal(format!("Stored job {} has unknown state '{}'", self.id, self.state))
        })?;
        let last_error = self.error_message.map(|message| JobError {
            category: self
                .error_category
                .as_deref()
                .map(ErrorCategory::parse)
                .unwrap_or(ErrorCategory::Unknown),
            message,
        });

        Ok(Job {
            id: JobId::new(self.id),
            handle: self.handle,
            parameters: self.parameters.0,
            state,
            progress: self.progress.clamp(0, 100) as u8,
            attempt: self.attempt.max(1) as u32,
            last_error,
            output: self.output.map(|json| json.0),
            quality: self.quality.map(|json| json.0),
            queue_position: None,
            seq: 0,
            created_at: self.created_at,
            heartbeat_at: self.updated_at,
            completed_at: self.completed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use kiln_core::params::ParamValue;

    use super::*;

    fn row(state: &str) -> GenerationJobRow {
        let now = chrono::Utc::now();
        GenerationJobRow {
            id: "job-7".into(),
            state: state.into(),
            parameters: Json(GenerationParams::from([(
                "width".to_string(),
                ParamValue::Int(512),
            )])),
            attempt: 2,
            progress: 100,
            handle: Some("prompt-1".into()),
            output: Some(Json(vec![Artifact::new("out.png")])),
            error_category: Some("resource-exhaustion".into()),
            error_message: Some("CUDA out of memory".into()),
            quality: None,
            created_at: now,
            updated_at: now,
            completed_at: Some(now),
        }
    }

    #[test]
    fn row_converts_to_job() {
        let job = row("completed").into_job().unwrap();
        assert_eq!(job.id.as_str(), "job-7");
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempt, 2);
        assert_eq!(job.output.as_ref().map(Vec::len), Some(1));
        assert_eq!(
            job.last_error.map(|e| e.category),
            Some(ErrorCategory::ResourceExhaustion)
        );
    }

    #[test]
    fn unknown_state_is_rejected() {
        assert!(row("exploded").into_job().is_err());
    }
}
