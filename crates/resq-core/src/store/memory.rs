//! In-memory store backend for testing and development.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{Store, StoreError};

#[derive(Debug, Default)]
struct Inner {
    queues: HashMap<String, VecDeque<String>>,
    queue_names: BTreeSet<String>,
    workers: BTreeSet<String>,
    payloads: HashMap<String, String>,
    started: HashMap<String, DateTime<Utc>>,
    heartbeats: HashMap<String, DateTime<Utc>>,
    counters: HashMap<String, u64>,
    failures: Vec<String>,
    prune_lock: Option<(String, Instant)>,
}

/// A [`Store`] kept entirely in process memory.
///
/// Single-mutex, so operations observe each other atomically just as they
/// would against a real server. `reconnect` is a counted no-op.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    reconnects: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times [`Store::reconnect`] has been called.
    #[must_use]
    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    fn range_bounds(len: usize, lo: isize, hi: isize) -> Option<(usize, usize)> {
        let clamp = |i: isize| -> usize {
            if i < 0 {
                len.saturating_sub(i.unsigned_abs())
            } else {
                (i as usize).min(len)
            }
        };
        let start = clamp(lo);
        let end = if hi < 0 {
            let h = len.checked_sub(hi.unsigned_abs())?;
            h + 1
        } else {
            (hi as usize + 1).min(len)
        };
        (start < end).then_some((start, end))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn push(&self, queue: &str, payload: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.queue_names.insert(queue.to_string());
        inner
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(payload.to_string());
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.lock().await;
        Ok(inner.queues.get_mut(queue).and_then(VecDeque::pop_front))
    }

    async fn range(&self, queue: &str, lo: isize, hi: isize) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        let Some(list) = inner.queues.get(queue) else {
            return Ok(Vec::new());
        };
        let Some((start, end)) = Self::range_bounds(list.len(), lo, hi) else {
            return Ok(Vec::new());
        };
        Ok(list.iter().skip(start).take(end - start).cloned().collect())
    }

    async fn remove(&self, queue: &str, payload: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(list) = inner.queues.get_mut(queue) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|entry| entry != payload);
        Ok((before - list.len()) as u64)
    }

    async fn queues(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.inner.lock().await.queue_names.clone())
    }

    async fn remove_queue(&self, queue: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.queues.remove(queue);
        inner.queue_names.remove(queue);
        Ok(())
    }

    async fn worker_ids(&self) -> Result<BTreeSet<String>, StoreError> {
        Ok(self.inner.lock().await.workers.clone())
    }

    async fn worker_exists(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().await.workers.contains(id))
    }

    async fn register(&self, id: &str, started_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.workers.insert(id.to_string());
        inner.started.insert(id.to_string(), started_at);
        Ok(())
    }

    async fn unregister(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.workers.remove(id);
        inner.payloads.remove(id);
        inner.started.remove(id);
        inner.heartbeats.remove(id);
        inner.counters.remove(&format!("processed:{id}"));
        inner.counters.remove(&format!("failed:{id}"));
        Ok(())
    }

    async fn set_payload(&self, id: &str, encoded: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .payloads
            .insert(id.to_string(), encoded.to_string());
        Ok(())
    }

    async fn get_payload(&self, id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().await.payloads.get(id).cloned())
    }

    async fn clear_payload(&self, id: &str) -> Result<(), StoreError> {
        self.inner.lock().await.payloads.remove(id);
        Ok(())
    }

    async fn started_at(&self, id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.inner.lock().await.started.get(id).copied())
    }

    async fn heartbeat(&self, id: &str, time: DateTime<Utc>) -> Result<(), StoreError> {
        self.inner
            .lock()
            .await
            .heartbeats
            .insert(id.to_string(), time);
        Ok(())
    }

    async fn all_heartbeats(&self) -> Result<HashMap<String, DateTime<Utc>>, StoreError> {
        Ok(self.inner.lock().await.heartbeats.clone())
    }

    async fn remove_heartbeat(&self, id: &str) -> Result<(), StoreError> {
        self.inner.lock().await.heartbeats.remove(id);
        Ok(())
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, StoreError> {
        Ok(Utc::now())
    }

    async fn acquire_prune_lock(&self, id: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        match &inner.prune_lock {
            Some((_, expiry)) if *expiry > now => Ok(false),
            _ => {
                inner.prune_lock = Some((id.to_string(), now + ttl));
                Ok(true)
            }
        }
    }

    async fn workers_map(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Option<String>>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(ids
            .iter()
            .map(|id| (id.clone(), inner.payloads.get(id).cloned()))
            .collect())
    }

    async fn counter_incr(&self, name: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let value = inner.counters.entry(name.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn counter_get(&self, name: &str) -> Result<u64, StoreError> {
        Ok(self.inner.lock().await.counters.get(name).copied().unwrap_or(0))
    }

    async fn counter_clear(&self, name: &str) -> Result<(), StoreError> {
        self.inner.lock().await.counters.remove(name);
        Ok(())
    }

    async fn push_failure(&self, record: &str) -> Result<(), StoreError> {
        self.inner.lock().await.failures.push(record.to_string());
        Ok(())
    }

    async fn failure_count(&self) -> Result<u64, StoreError> {
        Ok(self.inner.lock().await.failures.len() as u64)
    }

    async fn failures(&self, lo: isize, hi: isize) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        let Some((start, end)) = Self::range_bounds(inner.failures.len(), lo, hi) else {
            return Ok(Vec::new());
        };
        Ok(inner.failures[start..end].to_vec())
    }

    async fn clear_failures(&self) -> Result<(), StoreError> {
        self.inner.lock().await.failures.clear();
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_pop_fifo() {
        let store = MemoryStore::new();

        store.push("q", "a").await.unwrap();
        store.push("q", "b").await.unwrap();

        assert_eq!(store.pop("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.pop("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.pop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_push_registers_queue_name() {
        let store = MemoryStore::new();

        store.push("low", "x").await.unwrap();
        store.push("high", "y").await.unwrap();

        let queues = store.queues().await.unwrap();
        assert!(queues.contains("low"));
        assert!(queues.contains("high"));

        store.remove_queue("low").await.unwrap();
        assert!(!store.queues().await.unwrap().contains("low"));
    }

    #[tokio::test]
    async fn test_remove_counts_occurrences() {
        let store = MemoryStore::new();

        store.push("q", "a").await.unwrap();
        store.push("q", "b").await.unwrap();
        store.push("q", "a").await.unwrap();

        assert_eq!(store.remove("q", "a").await.unwrap(), 2);
        assert_eq!(store.remove("q", "a").await.unwrap(), 0);
        assert_eq!(store.pop("q").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_range_negative_indices() {
        let store = MemoryStore::new();
        for entry in ["a", "b", "c", "d"] {
            store.push("q", entry).await.unwrap();
        }

        assert_eq!(store.range("q", 0, -1).await.unwrap(), ["a", "b", "c", "d"]);
        assert_eq!(store.range("q", 1, 2).await.unwrap(), ["b", "c"]);
        assert_eq!(store.range("q", 0, 0).await.unwrap(), ["a"]);
    }

    #[tokio::test]
    async fn test_unregister_clears_every_reference() {
        let store = MemoryStore::new();
        let id = "host:1:q";

        store.register(id, Utc::now()).await.unwrap();
        store.set_payload(id, "{}").await.unwrap();
        store.heartbeat(id, Utc::now()).await.unwrap();
        store.counter_incr(&format!("processed:{id}")).await.unwrap();
        store.counter_incr(&format!("failed:{id}")).await.unwrap();

        store.unregister(id).await.unwrap();

        assert!(!store.worker_exists(id).await.unwrap());
        assert_eq!(store.get_payload(id).await.unwrap(), None);
        assert_eq!(store.started_at(id).await.unwrap(), None);
        assert!(!store.all_heartbeats().await.unwrap().contains_key(id));
        assert_eq!(
            store.counter_get(&format!("processed:{id}")).await.unwrap(),
            0
        );
        assert_eq!(store.counter_get(&format!("failed:{id}")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prune_lock_mutual_exclusion() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);

        assert!(store.acquire_prune_lock("a", ttl).await.unwrap());
        assert!(!store.acquire_prune_lock("b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_prune_lock_expires() {
        let store = MemoryStore::new();

        assert!(store
            .acquire_prune_lock("a", Duration::from_millis(10))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store
            .acquire_prune_lock("b", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_counters() {
        let store = MemoryStore::new();

        assert_eq!(store.counter_get("processed").await.unwrap(), 0);
        assert_eq!(store.counter_incr("processed").await.unwrap(), 1);
        assert_eq!(store.counter_incr("processed").await.unwrap(), 2);

        store.counter_clear("processed").await.unwrap();
        assert_eq!(store.counter_get("processed").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_workers_map_bulk_fetch() {
        let store = MemoryStore::new();
        store.set_payload("a", "pa").await.unwrap();

        let ids = vec!["a".to_string(), "b".to_string()];
        let map = store.workers_map(&ids).await.unwrap();

        assert_eq!(map["a"].as_deref(), Some("pa"));
        assert_eq!(map["b"], None);
    }
}
