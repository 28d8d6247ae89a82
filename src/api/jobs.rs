//! Job submission and polling endpoints.

use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use serde_json::{Value, json};
use uuid::Uuid;

use super::AppState;
use super::auth::AuthUser;
use super::error::ApiError;
use crate::jobs::JobRecord;

const DEFAULT_PAGE: usize = 20;
const MAX_PAGE: usize = 100;

#[derive(Debug, Deserialize)]
pub struct RunRequest {
    pub message: String,
    /// Overrides the selection remembered on the session.
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
}

/// POST /run
pub async fn run(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<RunRequest>,
) -> Result<Json<Value>, ApiError> {
    let job = state
        .submitter
        .submit(user.user_id(), &body.message, body.scopes.as_deref())
        .await?;
    Ok(Json(json!({
        "job_id": job.id,
        "status": "queued",
        "message": "Task has been queued for processing",
    })))
}

/// GET /result/{job_id}
pub async fn result(
    State(state): State<AppState>,
    user: AuthUser,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, ApiError> {
    let not_found = || ApiError::NotFound("Job not found".to_string());
    let job_id: Uuid = job_id.parse().map_err(|_| not_found())?;
    state
        .db
        .get_job(job_id, user.user_id())
        .await?
        .map(Json)
        .ok_or_else(not_found)
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// GET /jobs
pub async fn list(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = params.offset.unwrap_or(0);
    let jobs = state.db.list_jobs(user.user_id(), limit, offset).await?;
    Ok(Json(json!({
        "total": jobs.len(),
        "jobs": jobs,
        "limit": limit,
        "offset": offset,
    })))
}
