use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::services::retry::RetryPolicy;

/// Default bound on a single action invocation.
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of a failed action.
///
/// Permanent failures skip the remaining retry budget.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("{0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("no action registered for kind {0:?}")]
    UnknownKind(String),

    #[error("action timed out after {0:?}")]
    TimedOut(Duration),

    #[error("action panicked: {0}")]
    Panicked(String),
}

impl ActionError {
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Permanent(_) | Self::InvalidPayload(_) | Self::UnknownKind(_)
        )
    }
}

/// A side-effecting action bound to one job kind.
///
/// The queue guarantees at-least-once invocation only; handlers that must
/// not repeat a side effect (charging a card) have to be idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Reject a payload before it is persisted. Accepts everything by default.
    fn validate(&self, _payload: &serde_json::Value) -> Result<(), ActionError> {
        Ok(())
    }

    async fn handle(&self, payload: &serde_json::Value) -> Result<(), ActionError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ActionError>> + Send,
{
    async fn handle(&self, payload: &serde_json::Value) -> Result<(), ActionError> {
        (self.0)(payload.clone()).await
    }
}

struct Registration {
    handler: Arc<dyn JobHandler>,
    policy: RetryPolicy,
}

/// Maps job kinds to their action and retry policy.
pub struct ActionRegistry {
    actions: HashMap<String, Registration>,
    timeout: Duration,
}

impl ActionRegistry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            actions: HashMap::new(),
            timeout,
        }
    }

    /// Register `handler` for `kind`, replacing any earlier registration.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        policy: RetryPolicy,
    ) -> &mut Self {
        let kind = kind.into();
        tracing::debug!(kind = %kind, "Registered job action");
        self.actions.insert(kind, Registration { handler, policy });
        self
    }

    /// Register an async closure as the action for `kind`.
    pub fn register_fn<F, Fut>(
        &mut self,
        kind: impl Into<String>,
        action: F,
        policy: RetryPolicy,
    ) -> &mut Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ActionError>> + Send + 'static,
    {
        self.register(kind, Arc::new(FnHandler(action)), policy)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.actions.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn policy(&self, kind: &str) -> Option<&RetryPolicy> {
        self.actions.get(kind).map(|r| &r.policy)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn validate(&self, kind: &str, payload: &serde_json::Value) -> Result<(), ActionError> {
        let registration = self
            .actions
            .get(kind)
            .ok_or_else(|| ActionError::UnknownKind(kind.to_string()))?;
        registration.handler.validate(payload)
    }

    /// Run the action for `kind` under the registry's execution timeout.
    ///
    /// A panicking handler is reported as [`ActionError::Panicked`], which
    /// the retry policy treats like any other transient failure.
    pub async fn execute(&self, kind: &str, payload: &serde_json::Value) -> Result<(), ActionError> {
        let registration = self
            .actions
            .get(kind)
            .ok_or_else(|| ActionError::UnknownKind(kind.to_string()))?;

        let start = Instant::now();
        let guarded = AssertUnwindSafe(registration.handler.handle(payload)).catch_unwind();
        let result = match tokio::time::timeout(self.timeout, guarded).await {
            Ok(Ok(result)) => result,
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(kind = %kind, panic = %message, "Job action panicked");
                Err(ActionError::Panicked(message))
            }
            Err(_) => Err(ActionError::TimedOut(self.timeout)),
        };

        metrics::histogram!("job_execution_seconds", "kind" => kind.to_string())
            .record(start.elapsed().as_secs_f64());

        result
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_EXECUTION_TIMEOUT)
    }
}
