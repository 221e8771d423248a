use std::sync::Arc;

use crate::config::AppConfig;
use crate::services::{
    actions,
    executor::ActionRegistry,
    queue::JobQueue,
    redis_store::RedisStore,
    relay::{HttpEmailRelay, HttpPaymentGateway},
    store::{MemoryStore, Store, StoreError},
};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<JobQueue>,
}

impl AppState {
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue: Arc::new(queue),
        }
    }
}

/// Open the configured store: Redis when `REDIS_URL` is set, process memory
/// otherwise.
pub fn open_store(config: &AppConfig) -> Result<Arc<dyn Store>, StoreError> {
    match &config.redis_url {
        Some(url) => Ok(Arc::new(RedisStore::new(url)?)),
        None => {
            tracing::warn!("REDIS_URL not configured, jobs will not survive a restart");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Wire the `send-email` and `retry-charge` actions to their HTTP relays.
pub fn build_registry(config: &AppConfig) -> ActionRegistry {
    let mut registry = ActionRegistry::new(config.execution_timeout());
    actions::register_defaults(
        &mut registry,
        Arc::new(HttpEmailRelay::new(config.email_relay_url.clone())),
        Arc::new(HttpPaymentGateway::new(
            config.payment_gateway_url.clone(),
            config.payment_gateway_token.clone(),
        )),
        config.email_retry_policy(),
        config.charge_retry_policy(),
    );
    registry
}

pub fn build_queue(config: &AppConfig) -> Result<JobQueue, StoreError> {
    let store = open_store(config)?;
    Ok(JobQueue::new(
        store,
        build_registry(config),
        config.queue_settings(),
    ))
}
