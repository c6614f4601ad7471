//! Handlers for the `/jobs` resource.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use kiln_core::params::GenerationParams;
use kiln_core::types::JobId;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::response::DataResponse;
use crate::state::AppState;

/// Request body for `POST /api/v1/jobs`.
#[derive(Debug, Deserialize)]
pub struct SubmitJob {
    /// Caller-chosen id; a time-ordered id is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub parameters: GenerationParams,
}

/// POST /api/v1/jobs
///
/// Enqueue a generation job. Returns 201 with the queued job.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(input): Json<SubmitJob>,
) -> AppResult<impl IntoResponse> {
    let id = match input.id {
        Some(id) if id.trim().is_empty() => {
            return Err(AppError::BadRequest("id must not be blank".to_string()));
        }
        Some(id) => state.service.enqueue_with_id(JobId::new(id), input.parameters)?,
        None => state.service.enqueue(input.parameters)?,
    };
    let job = state.service.get_status(&id).await?;

    Ok((StatusCode::CREATED, Json(DataResponse { data: job })))
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let job = state.service.get_status(&JobId::new(id)).await?;
    Ok(Json(DataResponse { data: job }))
}

/// POST /api/v1/jobs/{id}/cancel
///
/// Returns 202: a queued job is already `cancelled` in the response, a
/// running one finalizes shortly after.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let job = state.service.cancel(&JobId::new(id)).await?;
    tracing::info!(job_id = %job.id, state = job.state.as_str(), "Job cancellation requested");
    Ok((StatusCode::ACCEPTED, Json(DataResponse { data: job })))
}
