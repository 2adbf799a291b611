//! Heartbeat loop.
//!
//! A background task that stamps the worker's identity with server time on a
//! fixed cadence. Peers treat a fresh stamp as proof of life; the pruner
//! treats an expired one as a crash. The wait is interruptible so teardown
//! completes promptly, and the loop clears its own entry on the way out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::WorkerId;
use crate::store::Store;

/// Handle to a running heartbeat loop.
#[derive(Debug)]
pub struct HeartbeatLoop {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl HeartbeatLoop {
    /// Spawn the loop for `id`, stamping every `interval`.
    #[must_use]
    pub fn start(store: Arc<dyn Store>, id: &WorkerId, interval: Duration) -> Self {
        let key = id.to_string();
        let (shutdown, mut stopped) = watch::channel(false);

        let task = tokio::spawn(async move {
            loop {
                match store.server_time().await {
                    Ok(now) => {
                        if let Err(err) = store.heartbeat(&key, now).await {
                            tracing::warn!(worker = %key, error = %err, "heartbeat write failed");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(worker = %key, error = %err, "heartbeat clock read failed");
                    }
                }

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stopped.changed() => break,
                }
            }

            if let Err(err) = store.remove_heartbeat(&key).await {
                tracing::warn!(worker = %key, error = %err, "could not clear heartbeat");
            }
        });

        Self { shutdown, task }
    }

    /// Stop the loop and wait for it to clear its entry.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_heartbeat_stamps_and_clears() {
        let store = Arc::new(MemoryStore::new());
        let id = WorkerId::new("host", 1, vec!["q".into()]);

        let hb = HeartbeatLoop::start(
            Arc::clone(&store) as Arc<dyn Store>,
            &id,
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let beats = store.all_heartbeats().await.unwrap();
        assert!(beats.contains_key(&id.to_string()));

        hb.stop().await;
        let beats = store.all_heartbeats().await.unwrap();
        assert!(!beats.contains_key(&id.to_string()));
    }

    #[tokio::test]
    async fn test_stop_interrupts_a_long_wait() {
        let store = Arc::new(MemoryStore::new());
        let id = WorkerId::new("host", 1, vec!["q".into()]);

        // An hour-long cadence: stop must still return promptly.
        let hb = HeartbeatLoop::start(
            Arc::clone(&store) as Arc<dyn Store>,
            &id,
            Duration::from_secs(3600),
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(1), hb.stop())
            .await
            .expect("stop should not wait out the cadence");
    }
}
