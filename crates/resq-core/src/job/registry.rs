//! Handler registry.
//!
//! The wire payload carries a class name that is resolved at execution time.
//! Deployments register a [`JobClass`] per name at process init: a perform
//! function plus any before/around/after/failure hooks, all invoked in
//! registration order by the pipeline in [`crate::job::hooks`].
//!
//! Hooks receive the job behind an [`Arc`] and return boxed futures, so a
//! hook body is just a closure over owned data.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::{Job, JobError};

/// Boxed future used by handler and hook signatures.
pub type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'static>>;

/// The continuation an around hook must call to run the rest of the chain.
pub type Next = Box<dyn FnOnce() -> BoxFuture<Result<(), JobError>> + Send>;

/// A perform function or a before/after hook body.
pub type HookFn = Arc<dyn Fn(Arc<Job>) -> BoxFuture<Result<(), JobError>> + Send + Sync>;

/// An around hook body; wraps the continuation with its own pre/post work.
pub type AroundFn = Arc<dyn Fn(Arc<Job>, Next) -> BoxFuture<Result<(), JobError>> + Send + Sync>;

/// A failure hook body; receives the error and the job it was raised for.
pub type FailureFn =
    Arc<dyn Fn(Arc<JobError>, Arc<Job>) -> BoxFuture<Result<(), JobError>> + Send + Sync>;

/// A hook together with the name it was registered under.
#[derive(Clone)]
pub struct NamedHook<F> {
    /// Registration name, used in logs and composite errors.
    pub name: String,
    /// The hook body.
    pub body: F,
}

/// A registered job class: perform plus its hook sets.
pub struct JobClass {
    name: String,
    perform: HookFn,
    before: Vec<NamedHook<HookFn>>,
    around: Vec<NamedHook<AroundFn>>,
    after: Vec<NamedHook<HookFn>>,
    on_failure: Vec<NamedHook<FailureFn>>,
}

impl JobClass {
    /// Start building a class registered under `name`.
    #[must_use]
    pub fn builder(name: impl Into<String>) -> JobClassBuilder {
        JobClassBuilder {
            name: name.into(),
            perform: None,
            before: Vec::new(),
            around: Vec::new(),
            after: Vec::new(),
            on_failure: Vec::new(),
        }
    }

    /// The class name payloads refer to.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn perform_fn(&self) -> &HookFn {
        &self.perform
    }

    pub(crate) fn before_hooks(&self) -> &[NamedHook<HookFn>] {
        &self.before
    }

    pub(crate) fn around_hooks(&self) -> &[NamedHook<AroundFn>] {
        &self.around
    }

    pub(crate) fn after_hooks(&self) -> &[NamedHook<HookFn>] {
        &self.after
    }

    pub(crate) fn failure_hooks(&self) -> &[NamedHook<FailureFn>] {
        &self.on_failure
    }
}

impl std::fmt::Debug for JobClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobClass")
            .field("name", &self.name)
            .field("before", &self.before.len())
            .field("around", &self.around.len())
            .field("after", &self.after.len())
            .field("on_failure", &self.on_failure.len())
            .finish()
    }
}

/// Builder for [`JobClass`].
pub struct JobClassBuilder {
    name: String,
    perform: Option<HookFn>,
    before: Vec<NamedHook<HookFn>>,
    around: Vec<NamedHook<AroundFn>>,
    after: Vec<NamedHook<HookFn>>,
    on_failure: Vec<NamedHook<FailureFn>>,
}

impl JobClassBuilder {
    /// Set the perform function.
    #[must_use]
    pub fn perform<F>(mut self, body: F) -> Self
    where
        F: Fn(Arc<Job>) -> BoxFuture<Result<(), JobError>> + Send + Sync + 'static,
    {
        self.perform = Some(Arc::new(body));
        self
    }

    /// Add a before hook; hooks run in the order they are added.
    #[must_use]
    pub fn before_perform<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Arc<Job>) -> BoxFuture<Result<(), JobError>> + Send + Sync + 'static,
    {
        self.before.push(NamedHook {
            name: name.into(),
            body: Arc::new(body),
        });
        self
    }

    /// Add an around hook; the first added is outermost.
    #[must_use]
    pub fn around_perform<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Arc<Job>, Next) -> BoxFuture<Result<(), JobError>> + Send + Sync + 'static,
    {
        self.around.push(NamedHook {
            name: name.into(),
            body: Arc::new(body),
        });
        self
    }

    /// Add an after hook; hooks run in the order they are added.
    #[must_use]
    pub fn after_perform<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Arc<Job>) -> BoxFuture<Result<(), JobError>> + Send + Sync + 'static,
    {
        self.after.push(NamedHook {
            name: name.into(),
            body: Arc::new(body),
        });
        self
    }

    /// Add a failure hook; hooks run in the order they are added.
    #[must_use]
    pub fn on_failure<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(Arc<JobError>, Arc<Job>) -> BoxFuture<Result<(), JobError>> + Send + Sync + 'static,
    {
        self.on_failure.push(NamedHook {
            name: name.into(),
            body: Arc::new(body),
        });
        self
    }

    /// Build the class.
    ///
    /// # Panics
    ///
    /// Panics if no perform function was set; a class without one is a
    /// programming error, not a runtime condition.
    #[must_use]
    pub fn build(self) -> JobClass {
        JobClass {
            perform: self.perform.expect("perform is required"),
            name: self.name,
            before: self.before,
            around: self.around,
            after: self.after,
            on_failure: self.on_failure,
        }
    }
}

/// Class name → handler mapping, populated at process init.
#[derive(Default)]
pub struct JobRegistry {
    classes: RwLock<HashMap<String, Arc<JobClass>>>,
}

impl JobRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `class`, replacing any previous registration of the name.
    pub fn register(&self, class: JobClass) {
        let mut classes = self.classes.write().unwrap_or_else(|e| e.into_inner());
        classes.insert(class.name().to_string(), Arc::new(class));
    }

    /// Look up a class by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<JobClass>> {
        let classes = self.classes.read().unwrap_or_else(|e| e.into_inner());
        classes.get(name).cloned()
    }

    /// Names of all registered classes, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let classes = self.classes.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = classes.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("classes", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_class(name: &str) -> JobClass {
        JobClass::builder(name)
            .perform(|_job| Box::pin(async { Ok(()) }))
            .build()
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = JobRegistry::new();
        registry.register(noop_class("UpdateGraph"));

        assert!(registry.get("UpdateGraph").is_some());
        assert!(registry.get("Missing").is_none());
    }

    #[test]
    fn test_replacing_registration_wins() {
        let registry = JobRegistry::new();
        registry.register(noop_class("X"));
        registry.register(
            JobClass::builder("X")
                .perform(|_job| Box::pin(async { Err(JobError::failed("second")) }))
                .build(),
        );

        assert_eq!(registry.names(), ["X"]);
    }

    #[test]
    #[should_panic(expected = "perform is required")]
    fn test_builder_requires_perform() {
        let _ = JobClass::builder("X").build();
    }
}
