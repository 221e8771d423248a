use serde::{Deserialize, Serialize};

use crate::models::job::{Job, JobId};

/// Query string of `GET /api/v1/jobs/failed`.
#[derive(Debug, Deserialize)]
pub struct FailedJobsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FailedJobsResponse {
    pub count: usize,
    pub jobs: Vec<Job>,
}

/// Response of the retry and cancel endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct JobActionResponse {
    pub job_id: JobId,
    pub accepted: bool,
    pub message: String,
}
