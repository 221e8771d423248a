use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Key/value store with set, sorted-set and TTL operations.
///
/// This is the only persistence boundary of the job queue. Sorted sets are
/// scored by epoch milliseconds and returned in ascending score order.
#[async_trait]
pub trait Store: Send + Sync {
    async fn set_json(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError>;

    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError>;

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError>;

    async fn set_len(&self, key: &str) -> Result<u64, StoreError>;

    async fn sorted_add(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError>;

    /// Remove `member`; returns `false` when it was not present, which the
    /// dispatcher uses to detect a lost claim.
    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Members with score `<= max_score`, lowest score first, at most `limit`.
    async fn sorted_range_by_score(
        &self,
        key: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;

    async fn sorted_len(&self, key: &str) -> Result<u64, StoreError>;

    /// Attach a time-to-live to a value key. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn is_connected(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Store unavailable")]
    Unavailable,
}

struct Entry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Default)]
struct MemoryInner {
    values: HashMap<String, Entry>,
    sets: HashMap<String, HashSet<String>>,
    sorted: HashMap<String, HashMap<String, i64>>,
}

/// In-process store used by tests and when no Redis URL is configured.
///
/// Nothing survives a restart. [`MemoryStore::set_connected`] simulates an
/// outage: every operation then fails with [`StoreError::Unavailable`].
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
    connected: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            connected: AtomicBool::new(true),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    fn ensure_connected(&self) -> Result<(), StoreError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable)
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn set_json(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        self.ensure_connected()?;
        let mut inner = self.inner.lock().await;
        inner.values.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn get_json(&self, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        self.ensure_connected()?;
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match inner.values.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                inner.values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_connected()?;
        let mut inner = self.inner.lock().await;
        inner.values.remove(key);
        inner.sets.remove(key);
        inner.sorted.remove(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.ensure_connected()?;
        let mut inner = self.inner.lock().await;
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        let mut inner = self.inner.lock().await;
        Ok(inner
            .sets
            .get_mut(key)
            .is_some_and(|set| set.remove(member)))
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.ensure_connected()?;
        let inner = self.inner.lock().await;
        let mut members: Vec<String> = inner
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        Ok(members)
    }

    async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
        self.ensure_connected()?;
        let inner = self.inner.lock().await;
        Ok(inner.sets.get(key).map_or(0, |set| set.len() as u64))
    }

    async fn sorted_add(&self, key: &str, member: &str, score: i64) -> Result<(), StoreError> {
        self.ensure_connected()?;
        let mut inner = self.inner.lock().await;
        inner
            .sorted
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        let mut inner = self.inner.lock().await;
        Ok(inner
            .sorted
            .get_mut(key)
            .is_some_and(|zset| zset.remove(member).is_some()))
    }

    async fn sorted_range_by_score(
        &self,
        key: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        self.ensure_connected()?;
        let inner = self.inner.lock().await;
        let Some(zset) = inner.sorted.get(key) else {
            return Ok(Vec::new());
        };
        let mut due: Vec<(&String, i64)> = zset
            .iter()
            .filter(|(_, score)| **score <= max_score)
            .map(|(member, score)| (member, *score))
            .collect();
        // Redis orders equal scores lexicographically by member.
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));
        Ok(due
            .into_iter()
            .take(limit)
            .map(|(member, _)| member.clone())
            .collect())
    }

    async fn sorted_len(&self, key: &str) -> Result<u64, StoreError> {
        self.ensure_connected()?;
        let inner = self.inner.lock().await;
        Ok(inner.sorted.get(key).map_or(0, |zset| zset.len() as u64))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.ensure_connected()?;
        let mut inner = self.inner.lock().await;
        match inner.values.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sorted_range_orders_by_score_and_respects_limit() {
        let store = MemoryStore::new();
        store.sorted_add("z", "late", 300).await.unwrap();
        store.sorted_add("z", "early", 100).await.unwrap();
        store.sorted_add("z", "middle", 200).await.unwrap();
        store.sorted_add("z", "future", 10_000).await.unwrap();

        let due = store.sorted_range_by_score("z", 1_000, 10).await.unwrap();
        assert_eq!(due, vec!["early", "middle", "late"]);

        let first = store.sorted_range_by_score("z", 1_000, 1).await.unwrap();
        assert_eq!(first, vec!["early"]);
    }

    #[tokio::test]
    async fn test_sorted_add_replaces_score_for_existing_member() {
        let store = MemoryStore::new();
        store.sorted_add("z", "job", 100).await.unwrap();
        store.sorted_add("z", "job", 500).await.unwrap();
        assert_eq!(store.sorted_len("z").await.unwrap(), 1);
        assert!(store.sorted_range_by_score("z", 200, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sorted_remove_reports_whether_member_existed() {
        let store = MemoryStore::new();
        store.sorted_add("z", "job", 1).await.unwrap();
        assert!(store.sorted_remove("z", "job").await.unwrap());
        assert!(!store.sorted_remove("z", "job").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_values_read_as_missing() {
        let store = MemoryStore::new();
        store
            .set_json("k", &serde_json::json!({"a": 1}))
            .await
            .unwrap();
        assert!(store.expire("k", Duration::ZERO).await.unwrap());
        assert!(store.get_json("k").await.unwrap().is_none());
        assert!(!store.expire("missing", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_disconnected_store_rejects_operations() {
        let store = MemoryStore::new();
        store.set_connected(false);
        assert!(!store.is_connected().await);
        assert!(matches!(
            store.set_add("s", "m").await,
            Err(StoreError::Unavailable)
        ));
        store.set_connected(true);
        store.set_add("s", "m").await.unwrap();
        assert_eq!(store.set_len("s").await.unwrap(), 1);
        assert_eq!(store.set_members("s").await.unwrap(), vec!["m"]);
    }
}
