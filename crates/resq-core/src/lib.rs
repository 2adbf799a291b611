//! # resq-core
//!
//! Core library for resq, a Redis-backed background job worker runtime.
//!
//! A supervisor process owns a worker identity, keeps it fresh in the shared
//! registry via heartbeats, and forks child processors that reserve jobs
//! from prioritized queues and execute them through per-class hook
//! pipelines. Crashed peers are garbage-collected under a fleet-wide lock.
//! The registry layout and wire format are compatible with the conventional
//! `resque:` namespace, so existing producers and dashboards keep working.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use resq_core::client::Client;
//! use resq_core::job::registry::{JobClass, JobRegistry};
//! use resq_core::store::RedisStore;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(JobRegistry::new());
//! registry.register(
//!     JobClass::builder("UpdateGraph")
//!         .perform(|job| {
//!             let user = job.args().first().cloned();
//!             Box::pin(async move {
//!                 tracing::info!(?user, "updating graph");
//!                 Ok(())
//!             })
//!         })
//!         .build(),
//! );
//!
//! let store = Arc::new(RedisStore::open("redis://127.0.0.1/")?);
//! let client = Client::new(store, registry);
//! client.create("graphs", "UpdateGraph", vec!["defunkt".into()]).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod config;
pub mod failure;
pub mod job;
pub mod queues;
pub mod stats;
pub mod store;
pub mod worker;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::Client;
    pub use crate::config::{ConfigError, WorkerConfig};
    pub use crate::job::registry::{JobClass, JobRegistry};
    pub use crate::job::{Job, JobError, Payload};
    pub use crate::queues::QueueResolver;
    pub use crate::store::{MemoryStore, RedisStore, Store};
    pub use crate::worker::supervisor::{ChildSpec, Supervisor};
    pub use crate::worker::{WorkerError, WorkerId};
}

/// Re-export commonly used types at the crate root.
pub use client::Client;
pub use config::WorkerConfig;
pub use job::{Job, JobError, Payload};
pub use store::{RedisStore, Store};
pub use worker::supervisor::Supervisor;
pub use worker::{WorkerError, WorkerId};
