//! Redis-backed store.
//!
//! One instance owns one multiplexed connection. Every process must have its
//! own instance: a child processor calls [`Store::reconnect`] on entry
//! rather than reusing anything inherited from its parent.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;

use super::{KeySpace, Store, StoreError, RECONNECT_ATTEMPTS, RECONNECT_BACKOFF};

/// A [`Store`] talking to a Redis server.
pub struct RedisStore {
    client: redis::Client,
    conn: Mutex<Option<MultiplexedConnection>>,
    keys: KeySpace,
}

impl RedisStore {
    /// Open a store against `url` (e.g. `redis://127.0.0.1/`) under the
    /// default namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed. No connection is made
    /// until the first operation.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        Self::open_with_namespace(url, super::DEFAULT_NAMESPACE)
    }

    /// Open a store with an explicit key namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL cannot be parsed.
    pub fn open_with_namespace(url: &str, namespace: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self {
            client,
            conn: Mutex::new(None),
            keys: KeySpace::new(namespace),
        })
    }

    /// The key space this store writes under.
    #[must_use]
    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    async fn conn(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.connect_with_backoff().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn connect_with_backoff(&self) -> Result<MultiplexedConnection, StoreError> {
        let mut last_err = None;
        for attempt in 1..=RECONNECT_ATTEMPTS {
            match self.client.get_multiplexed_async_connection().await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        error = %err,
                        "data store connection attempt failed"
                    );
                    last_err = Some(err);
                    if attempt < RECONNECT_ATTEMPTS {
                        tokio::time::sleep(RECONNECT_BACKOFF * attempt).await;
                    }
                }
            }
        }
        Err(StoreError::Reconnect {
            attempts: RECONNECT_ATTEMPTS,
            source: last_err.expect("at least one attempt was made"),
        })
    }

    fn parse_stamp(key: &str, raw: &str) -> Result<DateTime<Utc>, StoreError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|stamp| stamp.with_timezone(&Utc))
            .map_err(|err| StoreError::MalformedValue {
                key: key.to_string(),
                detail: err.to_string(),
            })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn push(&self, queue: &str, payload: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(self.keys.queues())
            .arg(queue)
            .ignore()
            .cmd("RPUSH")
            .arg(self.keys.queue(queue))
            .arg(payload)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        let popped: Option<String> = redis::cmd("LPOP")
            .arg(self.keys.queue(queue))
            .query_async(&mut conn)
            .await?;
        Ok(popped)
    }

    async fn range(&self, queue: &str, lo: isize, hi: isize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let entries: Vec<String> = redis::cmd("LRANGE")
            .arg(self.keys.queue(queue))
            .arg(lo)
            .arg(hi)
            .query_async(&mut conn)
            .await?;
        Ok(entries)
    }

    async fn remove(&self, queue: &str, payload: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        let removed: u64 = redis::cmd("LREM")
            .arg(self.keys.queue(queue))
            .arg(0)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn queues(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut conn = self.conn().await?;
        let names: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.queues())
            .query_async(&mut conn)
            .await?;
        Ok(names.into_iter().collect())
    }

    async fn remove_queue(&self, queue: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .cmd("SREM")
            .arg(self.keys.queues())
            .arg(queue)
            .ignore()
            .cmd("DEL")
            .arg(self.keys.queue(queue))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn worker_ids(&self) -> Result<BTreeSet<String>, StoreError> {
        let mut conn = self.conn().await?;
        let ids: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.keys.workers())
            .query_async(&mut conn)
            .await?;
        Ok(ids.into_iter().collect())
    }

    async fn worker_exists(&self, id: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        let exists: bool = redis::cmd("SISMEMBER")
            .arg(self.keys.workers())
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(exists)
    }

    async fn register(&self, id: &str, started_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .cmd("SADD")
            .arg(self.keys.workers())
            .arg(id)
            .ignore()
            .cmd("SET")
            .arg(self.keys.worker_started(id))
            .arg(started_at.to_rfc3339())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn unregister(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .cmd("SREM")
            .arg(self.keys.workers())
            .arg(id)
            .ignore()
            .cmd("DEL")
            .arg(self.keys.worker(id))
            .ignore()
            .cmd("DEL")
            .arg(self.keys.worker_started(id))
            .ignore()
            .cmd("HDEL")
            .arg(self.keys.heartbeats())
            .arg(id)
            .ignore()
            .cmd("DEL")
            .arg(self.keys.stat(&format!("processed:{id}")))
            .ignore()
            .cmd("DEL")
            .arg(self.keys.stat(&format!("failed:{id}")))
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_payload(&self, id: &str, encoded: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("SET")
            .arg(self.keys.worker(id))
            .arg(encoded)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_payload(&self, id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = redis::cmd("GET")
            .arg(self.keys.worker(id))
            .query_async(&mut conn)
            .await?;
        Ok(payload)
    }

    async fn clear_payload(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(self.keys.worker(id))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn started_at(&self, id: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut conn = self.conn().await?;
        let key = self.keys.worker_started(id);
        let raw: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
        raw.map(|raw| Self::parse_stamp(&key, &raw)).transpose()
    }

    async fn heartbeat(&self, id: &str, time: DateTime<Utc>) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("HSET")
            .arg(self.keys.heartbeats())
            .arg(id)
            .arg(time.to_rfc3339())
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn all_heartbeats(&self) -> Result<HashMap<String, DateTime<Utc>>, StoreError> {
        let mut conn = self.conn().await?;
        let key = self.keys.heartbeats();
        let raw: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        raw.into_iter()
            .map(|(id, stamp)| Ok((id, Self::parse_stamp(&key, &stamp)?)))
            .collect()
    }

    async fn remove_heartbeat(&self, id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("HDEL")
            .arg(self.keys.heartbeats())
            .arg(id)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, StoreError> {
        let mut conn = self.conn().await?;
        let (secs, micros): (i64, i64) =
            redis::cmd("TIME").query_async(&mut conn).await?;
        DateTime::from_timestamp(secs, (micros * 1_000) as u32).ok_or_else(|| {
            StoreError::MalformedValue {
                key: "TIME".to_string(),
                detail: format!("out of range timestamp {secs}.{micros}"),
            }
        })
    }

    async fn acquire_prune_lock(&self, id: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn().await?;
        // SET NX EX is the atomic form; a crashed holder releases when the
        // key expires.
        let acquired: Option<String> = redis::cmd("SET")
            .arg(self.keys.prune_lock())
            .arg(id)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn workers_map(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, Option<String>>, StoreError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("MGET");
        for id in ids {
            cmd.arg(self.keys.worker(id));
        }
        let payloads: Vec<Option<String>> = cmd.query_async(&mut conn).await?;
        Ok(ids.iter().cloned().zip(payloads).collect())
    }

    async fn counter_incr(&self, name: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        let value: u64 = redis::cmd("INCR")
            .arg(self.keys.stat(name))
            .query_async(&mut conn)
            .await?;
        Ok(value)
    }

    async fn counter_get(&self, name: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        let value: Option<u64> = redis::cmd("GET")
            .arg(self.keys.stat(name))
            .query_async(&mut conn)
            .await?;
        Ok(value.unwrap_or(0))
    }

    async fn counter_clear(&self, name: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(self.keys.stat(name))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn push_failure(&self, record: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("RPUSH")
            .arg(self.keys.failed())
            .arg(record)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn failure_count(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn().await?;
        let count: u64 = redis::cmd("LLEN")
            .arg(self.keys.failed())
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn failures(&self, lo: isize, hi: isize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let records: Vec<String> = redis::cmd("LRANGE")
            .arg(self.keys.failed())
            .arg(lo)
            .arg(hi)
            .query_async(&mut conn)
            .await?;
        Ok(records)
    }

    async fn clear_failures(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        redis::cmd("DEL")
            .arg(self.keys.failed())
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        let mut guard = self.conn.lock().await;
        guard.take();
        let conn = self.connect_with_backoff().await?;
        *guard = Some(conn);
        Ok(())
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}
