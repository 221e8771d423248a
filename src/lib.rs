//! Delayed Job Queue
//!
//! This library schedules side-effecting actions (scheduled emails, payment
//! charge retries) to run at a later time. Jobs are persisted in Redis, picked
//! up by a polling dispatcher, retried with backoff on failure, and moved to a
//! dead-letter set once their attempt budget is spent.

pub mod app_state;
pub mod config;
pub mod models;
pub mod routes;
pub mod services;

pub use models::job::{Job, JobId, JobStatus};
pub use services::executor::{ActionError, ActionRegistry, JobHandler};
pub use services::queue::{JobQueue, QueueError, QueueSettings, QueueStats, ScheduleOutcome};
pub use services::retry::RetryPolicy;
pub use services::store::{MemoryStore, Store, StoreError};
