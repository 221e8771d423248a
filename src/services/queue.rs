use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::models::job::{Job, JobId, JobStatus, DEFAULT_MAX_ATTEMPTS};
use crate::services::executor::{ActionError, ActionRegistry};
use crate::services::retry::RetryDecision;
use crate::services::store::{Store, StoreError};

/// Poll interval of the dispatcher loop.
pub const DEFAULT_DISPATCH_INTERVAL: Duration = Duration::from_secs(30);

/// How long completed and cancelled records are kept.
pub const DEFAULT_COMPLETED_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// How long a claimed job may stay `processing` before another tick reclaims it.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(5 * 60);

pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Tunables for a [`JobQueue`].
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Namespace for every store key.
    pub prefix: String,
    /// Maximum due jobs dispatched per tick.
    pub batch_size: usize,
    pub lease: Duration,
    pub completed_retention: Duration,
    pub default_max_attempts: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            prefix: "jobs".to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            lease: DEFAULT_LEASE,
            completed_retention: DEFAULT_COMPLETED_RETENTION,
            default_max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

struct Keys {
    prefix: String,
    pending: String,
    processing: String,
    completed: String,
    failed: String,
}

impl Keys {
    fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            pending: format!("{prefix}:pending"),
            processing: format!("{prefix}:processing"),
            completed: format!("{prefix}:completed"),
            failed: format!("{prefix}:failed"),
        }
    }

    fn job(&self, id: &str) -> String {
        format!("{}:job:{}", self.prefix, id)
    }
}

/// Result of [`JobQueue::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// The job was persisted and will run on a later tick.
    Queued(JobId),
    /// The store was unreachable, so the action already ran synchronously.
    ExecutedImmediately,
}

impl ScheduleOutcome {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Self::Queued(id) => Some(*id),
            Self::ExecutedImmediately => None,
        }
    }
}

/// Operational counts over the queue's indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_count: u64,
    pub processing_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    pub store_reachable: bool,
}

/// What a single dispatch tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Another tick held the guard, nothing was done.
    pub skipped: bool,
    pub reclaimed: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
}

impl TickReport {
    fn record(&mut self, outcome: Resolution) {
        match outcome {
            Resolution::Completed => self.completed += 1,
            Resolution::Rescheduled => self.rescheduled += 1,
            Resolution::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Completed,
    Rescheduled,
    Failed,
}

/// Releases the in-process tick flag when dropped.
struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Store-backed delayed job queue.
///
/// The tick guard only excludes overlapping ticks inside this process. Claims
/// across processes race on a single sorted-set removal, but a job that
/// outlives its lease can be reclaimed and run a second time.
pub struct JobQueue {
    store: Arc<dyn Store>,
    registry: ActionRegistry,
    settings: QueueSettings,
    keys: Keys,
    ticking: AtomicBool,
}

impl JobQueue {
    pub fn new(store: Arc<dyn Store>, registry: ActionRegistry, settings: QueueSettings) -> Self {
        let keys = Keys::new(&settings.prefix);
        Self {
            store,
            registry,
            settings,
            keys,
            ticking: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Schedule `kind` to run after `delay` with the default attempt ceiling.
    pub async fn schedule(
        &self,
        kind: &str,
        payload: serde_json::Value,
        delay: Duration,
    ) -> Result<ScheduleOutcome, QueueError> {
        self.schedule_with(kind, payload, delay, self.settings.default_max_attempts)
            .await
    }

    /// Serialize `payload` and schedule it.
    pub async fn schedule_typed<P: Serialize>(
        &self,
        kind: &str,
        payload: &P,
        delay: Duration,
    ) -> Result<ScheduleOutcome, QueueError> {
        let payload = serde_json::to_value(payload).map_err(QueueError::Serialize)?;
        self.schedule(kind, payload, delay).await
    }

    /// Schedule with an explicit attempt ceiling.
    ///
    /// When the store cannot be reached the action runs right away instead
    /// and [`ScheduleOutcome::ExecutedImmediately`] is returned. Only a
    /// failure of that immediate run is reported to the caller.
    pub async fn schedule_with(
        &self,
        kind: &str,
        payload: serde_json::Value,
        delay: Duration,
        max_attempts: u32,
    ) -> Result<ScheduleOutcome, QueueError> {
        if kind.trim().is_empty() {
            return Err(QueueError::EmptyKind);
        }
        if !self.registry.contains(kind) {
            return Err(QueueError::UnknownKind(kind.to_string()));
        }
        self.registry
            .validate(kind, &payload)
            .map_err(QueueError::InvalidPayload)?;

        let now = Utc::now();
        let scheduled_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .ok_or(QueueError::DelayOutOfRange(delay))?;

        if !self.store.is_connected().await {
            tracing::warn!(kind = %kind, "Job store not reachable, executing job immediately");
            return self.run_immediately(kind, &payload).await;
        }

        let job = Job::new(kind, payload, scheduled_at, max_attempts, now);
        if let Err(e) = self.insert_pending(&job).await {
            tracing::error!(
                job_id = %job.id,
                kind = %kind,
                error = %e,
                "Failed to persist job, executing immediately"
            );
            // The index write may have been the one that failed.
            if let Err(e) = self.store.delete(&self.keys.job(&job.id.to_string())).await {
                tracing::debug!(job_id = %job.id, error = %e, "Could not remove partial job record");
            }
            return self.run_immediately(kind, &job.payload).await;
        }

        metrics::counter!("jobs_enqueued_total", "kind" => kind.to_string()).increment(1);
        tracing::info!(
            job_id = %job.id,
            kind = %kind,
            scheduled_at = %job.scheduled_at.to_rfc3339(),
            max_attempts = job.max_attempts,
            "Job scheduled"
        );

        Ok(ScheduleOutcome::Queued(job.id))
    }

    /// Run an action now, bypassing the store.
    pub async fn execute_now(&self, kind: &str, payload: &serde_json::Value) -> Result<(), QueueError> {
        if !self.registry.contains(kind) {
            return Err(QueueError::UnknownKind(kind.to_string()));
        }
        self.registry
            .validate(kind, payload)
            .map_err(QueueError::InvalidPayload)?;
        self.registry
            .execute(kind, payload)
            .await
            .map_err(QueueError::Action)?;
        tracing::info!(kind = %kind, "Immediate job executed");
        Ok(())
    }

    async fn run_immediately(
        &self,
        kind: &str,
        payload: &serde_json::Value,
    ) -> Result<ScheduleOutcome, QueueError> {
        metrics::counter!("jobs_immediate_total", "kind" => kind.to_string()).increment(1);
        self.registry
            .execute(kind, payload)
            .await
            .map_err(QueueError::Action)?;
        tracing::info!(kind = %kind, "Job executed immediately in place of scheduling");
        Ok(ScheduleOutcome::ExecutedImmediately)
    }

    async fn insert_pending(&self, job: &Job) -> Result<(), QueueError> {
        self.save(job).await?;
        self.store
            .sorted_add(&self.keys.pending, &job.id.to_string(), job.due_score())
            .await?;
        Ok(())
    }

    /// Poll loop. Ticks every `interval` (first tick immediately) until
    /// `shutdown` flips to `true` or its sender is dropped.
    ///
    /// A tick that overruns the interval causes the missed ticks to be
    /// skipped, never queued.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(interval_secs = interval.as_secs(), "Job dispatcher started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    // Refreshes the pending gauge.
                    self.stats().await;
                    if report.dispatched > 0 || report.reclaimed > 0 {
                        tracing::info!(
                            dispatched = report.dispatched,
                            completed = report.completed,
                            rescheduled = report.rescheduled,
                            failed = report.failed,
                            reclaimed = report.reclaimed,
                            "Dispatch tick finished"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Job dispatcher stopped");
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// One dispatch cycle against the clock reading `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> TickReport {
        let Some(_guard) = TickGuard::acquire(&self.ticking) else {
            tracing::debug!("Previous dispatch tick still running, skipping");
            return TickReport {
                skipped: true,
                ..TickReport::default()
            };
        };

        let mut report = TickReport::default();

        if !self.store.is_connected().await {
            tracing::trace!("Job store not reachable, nothing to dispatch");
            return report;
        }

        self.reclaim_expired_leases(now, &mut report).await;

        let due = match self
            .store
            .sorted_range_by_score(
                &self.keys.pending,
                now.timestamp_millis(),
                self.settings.batch_size,
            )
            .await
        {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read pending index");
                return report;
            }
        };

        for id in due {
            match self.dispatch(&id, now).await {
                Ok(Some(resolution)) => {
                    report.dispatched += 1;
                    report.record(resolution);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(job_id = %id, error = %e, "Error dispatching job");
                }
            }
        }

        report
    }

    /// Claim, run and resolve one due job. `Ok(None)` means the job was not
    /// ours to run (claimed elsewhere, missing, or no longer pending).
    async fn dispatch(&self, id: &str, now: DateTime<Utc>) -> Result<Option<Resolution>, QueueError> {
        if !self.store.sorted_remove(&self.keys.pending, id).await? {
            tracing::debug!(job_id = %id, "Job already claimed");
            return Ok(None);
        }

        // Until the lease entry exists the job is in neither index.
        let (mut job, lease_until) = match self.lease(id, now).await {
            Ok(Some(leased)) => leased,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.restore_pending(id, now).await;
                return Err(e);
            }
        };

        job.status = JobStatus::Processing;
        job.attempts += 1;
        job.last_attempt_at = Some(now);
        job.lease_expires_at = Some(lease_until);
        self.save(&job).await?;

        tracing::info!(
            job_id = %id,
            kind = %job.kind,
            attempt = job.attempts,
            max_attempts = job.max_attempts,
            "Processing job"
        );

        let resolution = match self.registry.execute(&job.kind, &job.payload).await {
            Ok(()) => self.complete(job).await?,
            Err(e) => {
                tracing::warn!(job_id = %id, kind = %job.kind, error = %e, "Job attempt failed");
                self.resolve_failure(job, &e, now).await?
            }
        };

        Ok(Some(resolution))
    }

    /// Load a claimed job and register its lease. If the record write that
    /// follows fails, the lease sweep finds the job and puts it back.
    async fn lease(
        &self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(Job, DateTime<Utc>)>, QueueError> {
        let Some(job) = self.load(id).await? else {
            tracing::warn!(job_id = %id, "Job record not found, dropping index entry");
            return Ok(None);
        };

        if job.status != JobStatus::Pending {
            tracing::debug!(job_id = %id, status = %job.status, "Job no longer pending");
            return Ok(None);
        }

        let lease = chrono::Duration::from_std(self.settings.lease).unwrap_or(chrono::Duration::zero());
        let lease_until = now + lease;
        self.store
            .sorted_add(&self.keys.processing, id, lease_until.timestamp_millis())
            .await?;

        Ok(Some((job, lease_until)))
    }

    /// Return a claimed id to the pending index after a failed claim. The
    /// entry was due, so scoring it at `now` keeps it due.
    async fn restore_pending(&self, id: &str, now: DateTime<Utc>) {
        match self
            .store
            .sorted_add(&self.keys.pending, id, now.timestamp_millis())
            .await
        {
            Ok(()) => tracing::warn!(job_id = %id, "Claim failed, job returned to pending index"),
            Err(e) => tracing::error!(
                job_id = %id,
                error = %e,
                "Claim failed and job could not be returned to pending index"
            ),
        }
    }

    async fn complete(&self, mut job: Job) -> Result<Resolution, QueueError> {
        let id = job.id.to_string();
        job.status = JobStatus::Completed;
        job.lease_expires_at = None;
        self.save(&job).await?;
        self.finish_completed(&id).await?;

        metrics::counter!("jobs_completed_total", "kind" => job.kind.clone()).increment(1);
        tracing::info!(
            job_id = %id,
            kind = %job.kind,
            attempts = job.attempts,
            "Job completed"
        );
        Ok(Resolution::Completed)
    }

    /// Index bookkeeping for a record already saved as completed. The
    /// processing entry goes last so the lease sweep can finish the rest.
    async fn finish_completed(&self, id: &str) -> Result<(), QueueError> {
        self.store.set_add(&self.keys.completed, id).await?;
        self.store
            .expire(&self.keys.job(id), self.settings.completed_retention)
            .await?;
        self.store.sorted_remove(&self.keys.processing, id).await?;
        Ok(())
    }

    async fn finish_failed(&self, id: &str) -> Result<(), QueueError> {
        self.store.set_add(&self.keys.failed, id).await?;
        self.store.sorted_remove(&self.keys.processing, id).await?;
        Ok(())
    }

    /// Apply the kind's retry policy to a failed attempt.
    async fn resolve_failure(
        &self,
        mut job: Job,
        error: &ActionError,
        now: DateTime<Utc>,
    ) -> Result<Resolution, QueueError> {
        let id = job.id.to_string();
        job.last_error = Some(error.to_string());
        job.lease_expires_at = None;

        let decision = match self.registry.policy(&job.kind) {
            Some(policy) if !error.is_permanent() => policy.next_attempt(&job, now),
            _ => RetryDecision::GiveUp,
        };

        match decision {
            RetryDecision::Reschedule(at) => {
                job.status = JobStatus::Pending;
                job.scheduled_at = at;
                self.save(&job).await?;
                self.store
                    .sorted_add(&self.keys.pending, &id, job.due_score())
                    .await?;
                self.store.sorted_remove(&self.keys.processing, &id).await?;

                metrics::counter!("jobs_retried_total", "kind" => job.kind.clone()).increment(1);
                tracing::warn!(
                    job_id = %id,
                    kind = %job.kind,
                    attempt = job.attempts,
                    max_attempts = job.max_attempts,
                    next_attempt = %at.to_rfc3339(),
                    "Job rescheduled for retry"
                );
                Ok(Resolution::Rescheduled)
            }
            RetryDecision::GiveUp => {
                job.status = JobStatus::Failed;
                self.save(&job).await?;
                self.finish_failed(&id).await?;

                metrics::counter!("jobs_failed_total", "kind" => job.kind.clone()).increment(1);
                tracing::error!(
                    job_id = %id,
                    kind = %job.kind,
                    attempts = job.attempts,
                    permanent = error.is_permanent(),
                    error = %error,
                    "Job failed, moved to dead letter set"
                );
                Ok(Resolution::Failed)
            }
        }
    }

    /// Resolve jobs whose lease ran out, e.g. because the process died mid-job.
    async fn reclaim_expired_leases(&self, now: DateTime<Utc>, report: &mut TickReport) {
        let expired = match self
            .store
            .sorted_range_by_score(
                &self.keys.processing,
                now.timestamp_millis(),
                self.settings.batch_size,
            )
            .await
        {
            Ok(expired) => expired,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read processing index");
                return;
            }
        };

        for id in expired {
            if let Err(e) = self.reclaim(&id, now, report).await {
                tracing::error!(job_id = %id, error = %e, "Error reclaiming job");
            }
        }
    }

    async fn reclaim(
        &self,
        id: &str,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), QueueError> {
        match self.load(id).await? {
            Some(job) if job.status == JobStatus::Processing => {
                tracing::warn!(
                    job_id = %id,
                    kind = %job.kind,
                    attempt = job.attempts,
                    "Reclaiming job with expired lease"
                );
                metrics::counter!("jobs_reclaimed_total").increment(1);
                let error = ActionError::Transient("lease expired before the job finished".to_string());
                let resolution = self.resolve_failure(job, &error, now).await?;
                report.reclaimed += 1;
                report.record(resolution);
            }
            Some(job) if job.status == JobStatus::Pending => {
                // Claimed but never marked processing.
                self.store
                    .sorted_add(&self.keys.pending, id, job.due_score())
                    .await?;
                self.store.sorted_remove(&self.keys.processing, id).await?;
                report.reclaimed += 1;
            }
            Some(job) if job.status == JobStatus::Completed => {
                tracing::warn!(job_id = %id, "Finishing completed job left in processing index");
                self.finish_completed(id).await?;
            }
            Some(job) if job.status == JobStatus::Failed => {
                tracing::warn!(job_id = %id, "Finishing failed job left in processing index");
                self.finish_failed(id).await?;
            }
            _ => {
                self.store.sorted_remove(&self.keys.processing, id).await?;
            }
        }
        Ok(())
    }

    /// Counts of pending, processing, completed and failed jobs.
    ///
    /// Never fails: an unreachable store yields zeroed counts with
    /// `store_reachable == false`.
    pub async fn stats(&self) -> QueueStats {
        if !self.store.is_connected().await {
            return QueueStats::default();
        }

        let counts = tokio::try_join!(
            self.store.sorted_len(&self.keys.pending),
            self.store.sorted_len(&self.keys.processing),
            self.store.set_len(&self.keys.completed),
            self.store.set_len(&self.keys.failed),
        );

        match counts {
            Ok((pending, processing, completed, failed)) => {
                metrics::gauge!("jobs_pending").set(pending as f64);
                QueueStats {
                    pending_count: pending,
                    processing_count: processing,
                    completed_count: completed,
                    failed_count: failed,
                    store_reachable: true,
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to read queue stats");
                QueueStats::default()
            }
        }
    }

    pub async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        self.load(&id.to_string()).await
    }

    /// Cancel a job that has not been claimed yet. Returns `false` if the job
    /// is unknown, not pending, or was claimed concurrently.
    pub async fn cancel(&self, id: JobId) -> Result<bool, QueueError> {
        let key = id.to_string();
        let Some(mut job) = self.load(&key).await? else {
            return Ok(false);
        };
        if job.status != JobStatus::Pending {
            return Ok(false);
        }
        if !self.store.sorted_remove(&self.keys.pending, &key).await? {
            return Ok(false);
        }

        job.status = JobStatus::Cancelled;
        self.save(&job).await?;
        self.store
            .expire(&self.keys.job(&key), self.settings.completed_retention)
            .await?;

        tracing::info!(job_id = %id, kind = %job.kind, "Job cancelled");
        Ok(true)
    }

    /// Re-enqueue a dead-lettered job with a fresh attempt budget.
    pub async fn retry(&self, id: JobId) -> Result<bool, QueueError> {
        let key = id.to_string();
        let Some(mut job) = self.load(&key).await? else {
            tracing::warn!(job_id = %id, "Job not found for retry");
            return Ok(false);
        };
        if job.status != JobStatus::Failed {
            return Ok(false);
        }

        job.status = JobStatus::Pending;
        job.attempts = 0;
        job.last_error = None;
        job.scheduled_at = Utc::now();
        self.insert_pending(&job).await?;
        self.store.set_remove(&self.keys.failed, &key).await?;

        tracing::info!(job_id = %id, kind = %job.kind, "Failed job re-enqueued");
        Ok(true)
    }

    /// Dead-lettered jobs, at most `limit`.
    pub async fn failed_jobs(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        let ids = self.store.set_members(&self.keys.failed).await?;
        let mut jobs = Vec::new();
        for id in ids.iter().take(limit) {
            if let Some(job) = self.load(id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Drop completed jobs created more than `older_than` ago, along with
    /// completed-set members whose record has already expired.
    pub async fn purge_completed(&self, older_than: Duration) -> Result<usize, QueueError> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|d| Utc::now().checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut cleared = 0;
        for id in self.store.set_members(&self.keys.completed).await? {
            match self.load(&id).await? {
                Some(job) if job.created_at >= cutoff => continue,
                Some(_) => {
                    self.store.delete(&self.keys.job(&id)).await?;
                }
                None => {}
            }
            self.store.set_remove(&self.keys.completed, &id).await?;
            cleared += 1;
        }

        tracing::info!(cleared, older_than_secs = older_than.as_secs(), "Purged completed jobs");
        Ok(cleared)
    }

    async fn load(&self, id: &str) -> Result<Option<Job>, QueueError> {
        let key = self.keys.job(id);
        match self.store.get_json(&key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|source| QueueError::Corrupt { key, source }),
            None => Ok(None),
        }
    }

    async fn save(&self, job: &Job) -> Result<(), QueueError> {
        let value = serde_json::to_value(job).map_err(QueueError::Serialize)?;
        self.store
            .set_json(&self.keys.job(&job.id.to_string()), &value)
            .await?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job kind must not be empty")]
    EmptyKind,

    #[error("No action registered for kind {0:?}")]
    UnknownKind(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[source] ActionError),

    #[error("Delay {0:?} is out of range")]
    DelayOutOfRange(Duration),

    #[error("Action failed: {0}")]
    Action(#[source] ActionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Corrupt job record {key}: {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },
}
