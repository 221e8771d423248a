use axum::routing::{get, post};
use axum::Router;

use crate::app_state::AppState;

pub mod health;
pub mod jobs;
pub mod metrics;

/// Health and job administration routes. `/metrics` is mounted separately
/// since it carries its own state.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/jobs/stats", get(jobs::queue_stats))
        .route("/api/v1/jobs/failed", get(jobs::failed_jobs))
        .route("/api/v1/jobs/{job_id}", get(jobs::get_job))
        .route("/api/v1/jobs/{job_id}/retry", post(jobs::retry_job))
        .route("/api/v1/jobs/{job_id}/cancel", post(jobs::cancel_job))
        .with_state(state)
}
