use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Default ceiling on dispatch attempts before a job is dead-lettered.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Identifier of a queued job.
///
/// Backed by a UUIDv7, so the leading bits carry the enqueue time in
/// milliseconds and the remainder is random.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Lifecycle state of a queued job.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// One unit of deferred work, stored as JSON under `{prefix}:job:{id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub scheduled_at: DateTime<Utc>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: JobStatus,
    /// Set while the job is `processing`; a tick that finds it in the past
    /// reclaims the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Job {
    pub fn new(
        kind: impl Into<String>,
        payload: serde_json::Value,
        scheduled_at: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            kind: kind.into(),
            payload,
            scheduled_at,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            status: JobStatus::Pending,
            lease_expires_at: None,
            created_at: now,
            last_attempt_at: None,
            last_error: None,
        }
    }

    /// Pending Index score: `scheduled_at` in epoch milliseconds.
    pub fn due_score(&self) -> i64 {
        self.scheduled_at.timestamp_millis()
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_as_snake_case() {
        assert_eq!(JobStatus::Processing.to_string(), "processing");
        assert_eq!("failed".parse::<JobStatus>().unwrap(), JobStatus::Failed);
        let json = serde_json::to_string(&JobStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
    }

    #[test]
    fn test_new_job_starts_pending_with_zero_attempts() {
        let now = Utc::now();
        let job = Job::new("send-email", serde_json::json!({}), now, 3, now);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.due_score(), now.timestamp_millis());
        assert!(job.last_error.is_none());
    }

    #[test]
    fn test_max_attempts_is_at_least_one() {
        let now = Utc::now();
        let job = Job::new("send-email", serde_json::json!({}), now, 0, now);
        assert_eq!(job.max_attempts, 1);
    }

    #[test]
    fn test_job_ids_are_unique_and_parse_back() {
        let a = JobId::new();
        let b = JobId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().parse::<JobId>().unwrap(), a);
    }
}
