//! Processed/failed counters.
//!
//! Monotone counters keyed globally and per worker identity, backed by the
//! data store's atomic increment. No local caching, no expiry; a worker's
//! private counters disappear when it unregisters.

use crate::store::{Store, StoreError};

/// Record one successfully processed job for `worker`.
///
/// # Errors
///
/// Returns an error if either increment fails.
pub async fn incr_processed(store: &dyn Store, worker: &str) -> Result<(), StoreError> {
    store.counter_incr("processed").await?;
    store.counter_incr(&format!("processed:{worker}")).await?;
    Ok(())
}

/// Record one failed job for `worker`.
///
/// # Errors
///
/// Returns an error if either increment fails.
pub async fn incr_failed(store: &dyn Store, worker: &str) -> Result<(), StoreError> {
    store.counter_incr("failed").await?;
    store.counter_incr(&format!("failed:{worker}")).await?;
    Ok(())
}

/// The processed count, globally or for one worker.
///
/// # Errors
///
/// Returns an error on data store failure.
pub async fn processed(store: &dyn Store, worker: Option<&str>) -> Result<u64, StoreError> {
    match worker {
        Some(id) => store.counter_get(&format!("processed:{id}")).await,
        None => store.counter_get("processed").await,
    }
}

/// The failed count, globally or for one worker.
///
/// # Errors
///
/// Returns an error on data store failure.
pub async fn failed(store: &dyn Store, worker: Option<&str>) -> Result<u64, StoreError> {
    match worker {
        Some(id) => store.counter_get(&format!("failed:{id}")).await,
        None => store.counter_get("failed").await,
    }
}
