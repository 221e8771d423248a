//! Test helper utilities for queue scenarios

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use tripdesk_jobs::{
    ActionError, ActionRegistry, Job, JobHandler, JobId, JobQueue, MemoryStore, QueueSettings,
    RetryPolicy, ScheduleOutcome, Store, StoreError,
};

pub const KIND: &str = "send-email";

/// How a [`ScriptedAction`] responds to each call.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Succeed,
    /// Transient failure for the first `n` calls, success afterwards.
    FailFirst(usize),
    FailPermanently,
    Sleep(Duration),
    Panic,
}

/// Action that counts calls and records payloads in call order.
pub struct ScriptedAction {
    behavior: Behavior,
    calls: AtomicUsize,
    payloads: Mutex<Vec<serde_json::Value>>,
}

impl ScriptedAction {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior,
            calls: AtomicUsize::new(0),
            payloads: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub async fn payloads(&self) -> Vec<serde_json::Value> {
        self.payloads.lock().await.clone()
    }
}

#[async_trait]
impl JobHandler for ScriptedAction {
    async fn handle(&self, payload: &serde_json::Value) -> Result<(), ActionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().await.push(payload.clone());
        match self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::FailFirst(n) if call < n => Err(ActionError::Transient(format!(
                "smtp timeout on call {}",
                call + 1
            ))),
            Behavior::FailFirst(_) => Ok(()),
            Behavior::FailPermanently => {
                Err(ActionError::Permanent("recipient rejected".to_string()))
            }
            Behavior::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(())
            }
            Behavior::Panic => panic!("worker died mid-job"),
        }
    }
}

/// A queue over a fresh [`MemoryStore`] with one scripted action.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<JobQueue>,
    pub action: Arc<ScriptedAction>,
}

impl Harness {
    pub fn new(behavior: Behavior) -> Self {
        Self::with(
            behavior,
            RetryPolicy::email(),
            QueueSettings::default(),
            Duration::from_secs(5),
        )
    }

    pub fn with(
        behavior: Behavior,
        policy: RetryPolicy,
        settings: QueueSettings,
        timeout: Duration,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        let action = ScriptedAction::new(behavior);
        let mut registry = ActionRegistry::new(timeout);
        registry.register(KIND, action.clone(), policy);
        let queue = Arc::new(JobQueue::new(store.clone(), registry, settings));
        Self {
            store,
            queue,
            action,
        }
    }

    pub async fn enqueue(&self, delay: Duration) -> JobId {
        self.enqueue_payload(serde_json::json!({}), delay).await
    }

    pub async fn enqueue_payload(&self, payload: serde_json::Value, delay: Duration) -> JobId {
        match self.queue.schedule(KIND, payload, delay).await {
            Ok(ScheduleOutcome::Queued(id)) => id,
            other => panic!("expected job to be queued, got {:?}", other),
        }
    }

    pub async fn job(&self, id: JobId) -> Job {
        self.queue
            .get(id)
            .await
            .expect("store read")
            .expect("job record")
    }
}

/// Store write that [`FlakyStore`] fails once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlakyWrite {
    SortedAdd,
    SetAdd,
}

/// [`MemoryStore`] that fails the first matching write to `key` with
/// [`StoreError::Unavailable`] and behaves normally afterwards.
pub struct FlakyStore {
    pub inner: MemoryStore,
    write: FlakyWrite,
    key: String,
    tripped: AtomicBool,
}

impl FlakyStore {
    pub fn new(write: FlakyWrite, key: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::new(),
            write,
            key: key.to_string(),
            tripped: AtomicBool::new(false),
        })
    }

    fn trip(&self, write: FlakyWrite, key: &str) -> Result<(), StoreError> {
        if write == self.write && key == self.key && !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn set_json(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        self.inner.set_json(key, value).await
    }

    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        self.inner.get_json(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.trip(FlakyWrite::SetAdd, key)?;
        self.inner.set_add(key, member).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.set_remove(key, member).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.inner.set_members(key).await
    }

    async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
        self.inner.set_len(key).await
    }

    async fn sorted_add(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        self.trip(FlakyWrite::SortedAdd, key)?;
        self.inner.sorted_add(key, member, score).await
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.inner.sorted_remove(key, member).await
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        self.inner.sorted_range_by_score(key, max_score, limit).await
    }

    async fn sorted_len(&self, key: &str) -> Result<u64, StoreError> {
        self.inner.sorted_len(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.inner.expire(key, ttl).await
    }

    async fn is_connected(&self) -> bool {
        self.inner.is_connected().await
    }
}

/// A queue over `store` with one scripted action for [`KIND`].
pub fn queue_over(store: Arc<dyn Store>, action: Arc<ScriptedAction>) -> JobQueue {
    let mut registry = ActionRegistry::new(Duration::from_secs(5));
    registry.register(KIND, action, RetryPolicy::email());
    JobQueue::new(store, registry, QueueSettings::default())
}
