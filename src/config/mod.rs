use serde::Deserialize;
use std::time::Duration;

use crate::services::queue::{QueueSettings, DEFAULT_DISPATCH_INTERVAL};
use crate::services::retry::RetryPolicy;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Ops server bind address (e.g., "0.0.0.0:3000"). Unused by the worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Prometheus exporter address of the worker process
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,

    /// Redis connection string. Without it jobs live in process memory only.
    pub redis_url: Option<String>,

    /// Namespace for all queue keys in Redis
    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    #[serde(default = "default_dispatch_interval_secs")]
    pub dispatch_interval_secs: u64,

    /// Maximum due jobs dispatched per tick
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Per-job action timeout
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,

    /// How long a job may stay `processing` before it is reclaimed
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,

    #[serde(default = "default_completed_retention_secs")]
    pub completed_retention_secs: u64,

    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,

    #[serde(default = "default_email_retry_delay_secs")]
    pub email_retry_delay_secs: u64,

    #[serde(default = "default_charge_retry_base_secs")]
    pub charge_retry_base_secs: u64,

    #[serde(default = "default_charge_retry_cap_secs")]
    pub charge_retry_cap_secs: u64,

    #[serde(default = "default_charge_retry_jitter_secs")]
    pub charge_retry_jitter_secs: u64,

    /// HTTP mail relay that accepts `{to, subject, html}`
    pub email_relay_url: String,

    /// Payment gateway charge endpoint
    pub payment_gateway_url: String,

    /// Bearer token for the payment gateway
    pub payment_gateway_token: Option<String>,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_queue_prefix() -> String {
    "jobs".to_string()
}

fn default_dispatch_interval_secs() -> u64 {
    DEFAULT_DISPATCH_INTERVAL.as_secs()
}

fn default_batch_size() -> usize {
    100
}

fn default_execution_timeout_secs() -> u64 {
    60
}

fn default_lease_secs() -> u64 {
    300
}

fn default_completed_retention_secs() -> u64 {
    86_400
}

fn default_max_attempts() -> u32 {
    3
}

fn default_email_retry_delay_secs() -> u64 {
    300
}

fn default_charge_retry_base_secs() -> u64 {
    60
}

fn default_charge_retry_cap_secs() -> u64 {
    3_600
}

fn default_charge_retry_jitter_secs() -> u64 {
    60
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs.max(1))
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            prefix: self.queue_prefix.clone(),
            batch_size: self.batch_size.max(1),
            lease: Duration::from_secs(self.lease_secs),
            completed_retention: Duration::from_secs(self.completed_retention_secs),
            default_max_attempts: self.default_max_attempts,
        }
    }

    pub fn email_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::Fixed(Duration::from_secs(self.email_retry_delay_secs))
    }

    pub fn charge_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::Exponential {
            base: Duration::from_secs(self.charge_retry_base_secs),
            cap: Duration::from_secs(self.charge_retry_cap_secs),
            jitter: Duration::from_secs(self.charge_retry_jitter_secs),
        }
    }
}
