use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::models::admin::{FailedJobsQuery, FailedJobsResponse, JobActionResponse};
use crate::models::job::{Job, JobId};
use crate::services::queue::QueueStats;

/// Upper bound on the dead-letter listing page.
const MAX_FAILED_LIMIT: usize = 500;

/// GET /api/v1/jobs/stats — pending, processing, completed and failed counts.
pub async fn queue_stats(State(state): State<AppState>) -> Json<QueueStats> {
    Json(state.queue.stats().await)
}

/// GET /api/v1/jobs/failed — dead-lettered jobs for operator review.
pub async fn failed_jobs(
    State(state): State<AppState>,
    Query(query): Query<FailedJobsQuery>,
) -> Result<Json<FailedJobsResponse>, StatusCode> {
    let limit = query.limit.min(MAX_FAILED_LIMIT);
    let jobs = state.queue.failed_jobs(limit).await.map_err(|e| {
        tracing::error!(error = %e, "Failed to list failed jobs");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(Json(FailedJobsResponse {
        count: jobs.len(),
        jobs,
    }))
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<Json<Job>, StatusCode> {
    match state.queue.get(job_id).await {
        Ok(Some(job)) => Ok(Json(job)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %e, "Failed to load job");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

/// POST /api/v1/jobs/{id}/retry — re-enqueue a failed job with a fresh budget.
pub async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<(StatusCode, Json<JobActionResponse>), StatusCode> {
    let accepted = state.queue.retry(job_id).await.map_err(|e| {
        tracing::error!(job_id = %job_id, error = %e, "Failed to retry job");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(action_response(
        job_id,
        accepted,
        "Job re-enqueued",
        "Job is not in the failed set",
    ))
}

/// POST /api/v1/jobs/{id}/cancel — cancel a job that has not started yet.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<JobId>,
) -> Result<(StatusCode, Json<JobActionResponse>), StatusCode> {
    let accepted = state.queue.cancel(job_id).await.map_err(|e| {
        tracing::error!(job_id = %job_id, error = %e, "Failed to cancel job");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(action_response(
        job_id,
        accepted,
        "Job cancelled",
        "Job is no longer pending",
    ))
}

fn action_response(
    job_id: JobId,
    accepted: bool,
    accepted_message: &str,
    rejected_message: &str,
) -> (StatusCode, Json<JobActionResponse>) {
    let (status, message) = if accepted {
        (StatusCode::OK, accepted_message)
    } else {
        (StatusCode::CONFLICT, rejected_message)
    };
    (
        status,
        Json(JobActionResponse {
            job_id,
            accepted,
            message: message.to_string(),
        }),
    )
}
