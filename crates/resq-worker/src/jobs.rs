//! Job class registration.
//!
//! The registry is assembled once per process, before any job can be
//! reserved; the wire payload's `class` field is resolved against it at
//! execution time. Deployments add their classes here. `Noop` ships built
//! in so a freshly provisioned fleet can be smoke-tested end to end.

use resq_core::job::registry::{JobClass, JobRegistry};

/// Build the registry this binary executes jobs from.
pub fn registry() -> JobRegistry {
    let registry = JobRegistry::new();

    registry.register(
        JobClass::builder("Noop")
            .perform(|job| {
                let job_id = job.payload().id.clone();
                Box::pin(async move {
                    tracing::info!(%job_id, "noop job executed");
                    Ok(())
                })
            })
            .build(),
    );

    registry
}
