//! Repository for the `generation_jobs` table.
//!
//! The pipeline writes every state change through [`GenerationJobRepo::upsert`];
//! reads only happen for jobs that are no longer held in memory.

use kiln_core::job::Job;
use kiln_core::types::Timestamp;
use sqlx::types::Json;
use sqlx::PgPool;

use crate::models::generation_job::GenerationJobRow;

/// Column list for `generation_jobs` queries.
const COLUMNS: &str = "\
    id, state, parameters, attempt, progress, handle, output, \
    error_category, error_message, quality, \
    created_at, updated_at, completed_at";

pub struct GenerationJobRepo;

impl GenerationJobRepo {
    /// Insert the job, or overwrite the stored copy with its current state.
    pub async fn upsert(pool: &PgPool, job: &Job) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO generation_jobs \
                 (id, state, parameters, attempt, progress, handle, output, \
                  error_category, error_message, quality, created_at, updated_at, completed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), $12) \
             ON CONFLICT (id) DO UPDATE SET \
                 state = EXCLUDED.state, \
                 parameters = EXCLUDED.parameters, \
                 attempt = EXCLUDED.attempt, \
                 progress = EXCLUDED.progress, \
                 handle = EXCLUDED.handle, \
                 output = EXCLUDED.output, \
                 error_category = EXCLUDED.error_category, \
                 error_message = EXCLUDED.error_message, \
                 quality = EXCLUDED.quality, \
                 updated_at = NOW(), \
                 completed_at = EXCLUDED.completed_at",
        )
        .bind(job.id.as_str())
        .bind(job.state.as_str())
        .bind(Json(&job.parameters))
        .bind(job.attempt as i32)
        .bind(job.progress as i16)
        .bind(job.handle.as_deref())
        .bind(job.output.as_ref().map(Json))
        .bind(job.last_error.as_ref().map(|e| e.category.as_str()))
        .bind(job.last_error.as_ref().map(|e| e.message.as_str()))
        .bind(job.quality.as_ref().map(Json))
        .bind(job.created_at)
        .bind(job.completed_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn find_by_id(pool: &PgPool, id: &str) -> Result<Option<GenerationJobRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM generation_jobs WHERE id = $1");
        sqlx::query_as::<_, GenerationJobRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Delete terminal jobs that finished before `cutoff`. Returns the
    /// number of rows removed.
    pub async fn purge_completed_before(pool: &PgPool, cutoff: Timestamp) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(
            "DELETE FROM generation_jobs \
             WHERE completed_at IS NOT NULL AND completed_at < $1",
        )
        .bind(cutoff)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }
}
