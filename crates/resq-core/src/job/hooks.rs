//! Hook pipeline.
//!
//! Execution order for a successful job: every before hook in registration
//! order, then the around hooks nested outermost-first with `perform` as the
//! innermost link, then every after hook in registration order.
//!
//! A before hook may abort cleanly with [`JobError::DontPerform`]. Any other
//! error, from any stage, runs the class's failure hooks exactly once (the
//! job carries a one-shot flag) and is then re-raised to the caller.

use std::sync::Arc;

use super::registry::{AroundFn, BoxFuture, HookFn, JobClass, JobRegistry, NamedHook, Next};
use super::{Job, JobError};

/// How a pipeline run ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// `perform` ran (or an around hook short-circuited it) and after hooks
    /// completed.
    Performed,
    /// A before hook signalled `DontPerform`; nothing else ran.
    Aborted,
}

/// Resolve `job`'s class and run it through the full pipeline.
///
/// # Errors
///
/// Returns [`JobError::UnknownClass`] when the payload names an unregistered
/// class (no hooks run in that case), or the re-raised job error after
/// failure hooks have had their turn.
pub async fn run(registry: &JobRegistry, job: &Arc<Job>) -> Result<Outcome, JobError> {
    let Some(class) = registry.get(&job.payload().class) else {
        return Err(JobError::UnknownClass(job.payload().class.clone()));
    };
    run_class(&class, job).await
}

/// Run `job` through an already-resolved class.
///
/// # Errors
///
/// See [`run`].
pub async fn run_class(class: &JobClass, job: &Arc<Job>) -> Result<Outcome, JobError> {
    for hook in class.before_hooks() {
        match (hook.body)(Arc::clone(job)).await {
            Ok(()) => {}
            Err(JobError::DontPerform) => {
                tracing::debug!(
                    class = class.name(),
                    hook = %hook.name,
                    job_id = %job.payload().id,
                    "before hook aborted job"
                );
                return Ok(Outcome::Aborted);
            }
            Err(err) => return Err(fail(class, job, err).await),
        }
    }

    if let Err(err) = compose(class.around_hooks(), class.perform_fn(), job).await {
        return Err(fail(class, job, err).await);
    }

    for hook in class.after_hooks() {
        if let Err(err) = (hook.body)(Arc::clone(job)).await {
            return Err(fail(class, job, err).await);
        }
    }

    Ok(Outcome::Performed)
}

/// Right-fold the around hooks into a nested callable whose innermost link
/// invokes `perform`.
fn compose(
    hooks: &[NamedHook<AroundFn>],
    perform: &HookFn,
    job: &Arc<Job>,
) -> BoxFuture<Result<(), JobError>> {
    match hooks.split_first() {
        None => (perform)(Arc::clone(job)),
        Some((outer, rest)) => {
            let rest: Vec<NamedHook<AroundFn>> = rest.to_vec();
            let perform = Arc::clone(perform);
            let inner_job = Arc::clone(job);
            let next: Next = Box::new(move || compose(&rest, &perform, &inner_job));
            (outer.body)(Arc::clone(job), next)
        }
    }
}

/// Run failure hooks for `original` at most once, then hand back the error
/// to re-raise.
///
/// A failure hook that itself errors does not stop the one-shot flag from
/// being set; its error is folded into a composite naming both failures.
async fn fail(class: &JobClass, job: &Arc<Job>, original: JobError) -> JobError {
    if job.mark_failure_hooks_ran() {
        return original;
    }
    let original = Arc::new(original);
    for hook in class.failure_hooks() {
        if let Err(secondary) = (hook.body)(Arc::clone(&original), Arc::clone(job)).await {
            tracing::warn!(
                class = class.name(),
                hook = %hook.name,
                error = %secondary,
                "failure hook raised"
            );
            return JobError::FailureHookFailed {
                hook: hook.name.clone(),
                secondary: secondary.to_string(),
                original: Box::new(unshare(original)),
            };
        }
    }
    unshare(original)
}

/// Reclaim the original error once the hooks are done with it. A hook that
/// squirrelled the handle away costs us the typed variant, not the message.
fn unshare(original: Arc<JobError>) -> JobError {
    Arc::try_unwrap(original).unwrap_or_else(|shared| JobError::Failed(shared.to_string()))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::job::Payload;

    type Log = Arc<Mutex<Vec<String>>>;

    fn record(log: &Log, entry: &str) {
        log.lock().unwrap().push(entry.to_string());
    }

    fn job() -> Arc<Job> {
        Arc::new(Job::new("q", Payload::new("Traced", vec![])))
    }

    fn traced_class(log: &Log) -> JobClass {
        let l = log.clone();
        let builder = JobClass::builder("Traced").perform(move |_| {
            let l = l.clone();
            Box::pin(async move {
                record(&l, "perform");
                Ok(())
            })
        });
        let l1 = log.clone();
        let l2 = log.clone();
        let l3 = log.clone();
        let l4 = log.clone();
        let l5 = log.clone();
        let l6 = log.clone();
        builder
            .before_perform("b1", move |_| {
                let l = l1.clone();
                Box::pin(async move {
                    record(&l, "before:b1");
                    Ok(())
                })
            })
            .before_perform("b2", move |_| {
                let l = l2.clone();
                Box::pin(async move {
                    record(&l, "before:b2");
                    Ok(())
                })
            })
            .around_perform("a1", move |_, next| {
                let l = l3.clone();
                Box::pin(async move {
                    record(&l, "around:a1:pre");
                    let result = next().await;
                    record(&l, "around:a1:post");
                    result
                })
            })
            .around_perform("a2", move |_, next| {
                let l = l4.clone();
                Box::pin(async move {
                    record(&l, "around:a2:pre");
                    let result = next().await;
                    record(&l, "around:a2:post");
                    result
                })
            })
            .after_perform("f1", move |_| {
                let l = l5.clone();
                Box::pin(async move {
                    record(&l, "after:f1");
                    Ok(())
                })
            })
            .after_perform("f2", move |_| {
                let l = l6.clone();
                Box::pin(async move {
                    record(&l, "after:f2");
                    Ok(())
                })
            })
            .build()
    }

    #[tokio::test]
    async fn test_success_runs_hooks_in_order() {
        let log: Log = Arc::default();
        let class = traced_class(&log);
        let job = job();

        let outcome = run_class(&class, &job).await.unwrap();

        assert_eq!(outcome, Outcome::Performed);
        assert_eq!(
            *log.lock().unwrap(),
            [
                "before:b1",
                "before:b2",
                "around:a1:pre",
                "around:a2:pre",
                "perform",
                "around:a2:post",
                "around:a1:post",
                "after:f1",
                "after:f2",
            ]
        );
    }

    #[tokio::test]
    async fn test_dont_perform_aborts_cleanly() {
        let log: Log = Arc::default();
        let l = log.clone();
        let lf = log.clone();
        let la = log.clone();
        let class = JobClass::builder("Traced")
            .perform(move |_| {
                let l = l.clone();
                Box::pin(async move {
                    record(&l, "perform");
                    Ok(())
                })
            })
            .before_perform("abort", |_| Box::pin(async { Err(JobError::DontPerform) }))
            .after_perform("after", move |_| {
                let l = la.clone();
                Box::pin(async move {
                    record(&l, "after");
                    Ok(())
                })
            })
            .on_failure("notify", move |_, _| {
                let l = lf.clone();
                Box::pin(async move {
                    record(&l, "failure");
                    Ok(())
                })
            })
            .build();
        let job = job();

        let outcome = run_class(&class, &job).await.unwrap();

        assert_eq!(outcome, Outcome::Aborted);
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_perform_error_runs_failure_hooks_and_reraises() {
        let log: Log = Arc::default();
        let lf = log.clone();
        let class = JobClass::builder("Traced")
            .perform(|_| Box::pin(async { Err(JobError::failed("boom")) }))
            .on_failure("notify", move |err, _| {
                let l = lf.clone();
                let msg = err.to_string();
                Box::pin(async move {
                    record(&l, &format!("failure:{msg}"));
                    Ok(())
                })
            })
            .build();
        let job = job();

        let err = run_class(&class, &job).await.unwrap_err();

        assert!(matches!(err, JobError::Failed(ref m) if m == "boom"));
        assert_eq!(*log.lock().unwrap(), ["failure:boom"]);
    }

    #[tokio::test]
    async fn test_failure_hooks_run_at_most_once() {
        let log: Log = Arc::default();
        let lf = log.clone();
        let class = JobClass::builder("Traced")
            .perform(|_| Box::pin(async { Err(JobError::failed("boom")) }))
            .on_failure("notify", move |_, _| {
                let l = lf.clone();
                Box::pin(async move {
                    record(&l, "failure");
                    Ok(())
                })
            })
            .build();
        let job = job();

        let _ = run_class(&class, &job).await.unwrap_err();
        let _ = run_class(&class, &job).await.unwrap_err();

        assert_eq!(*log.lock().unwrap(), ["failure"]);
    }

    #[tokio::test]
    async fn test_failure_hook_error_wraps_both_and_marks_flag() {
        let class = JobClass::builder("Traced")
            .perform(|_| Box::pin(async { Err(JobError::failed("boom")) }))
            .on_failure("broken", |_, _| {
                Box::pin(async { Err(JobError::failed("hook exploded")) })
            })
            .build();
        let job = job();

        let err = run_class(&class, &job).await.unwrap_err();

        match err {
            JobError::FailureHookFailed {
                hook,
                secondary,
                original,
            } => {
                assert_eq!(hook, "broken");
                assert_eq!(secondary, "hook exploded");
                assert!(matches!(*original, JobError::Failed(ref m) if m == "boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The flag was still marked: a second failure stays un-hooked.
        assert!(job.mark_failure_hooks_ran());
    }

    #[tokio::test]
    async fn test_around_hook_may_skip_the_chain() {
        let log: Log = Arc::default();
        let l = log.clone();
        let la = log.clone();
        let class = JobClass::builder("Traced")
            .perform(move |_| {
                let l = l.clone();
                Box::pin(async move {
                    record(&l, "perform");
                    Ok(())
                })
            })
            .around_perform("gate", |_, _next| Box::pin(async { Ok(()) }))
            .after_perform("after", move |_| {
                let l = la.clone();
                Box::pin(async move {
                    record(&l, "after");
                    Ok(())
                })
            })
            .build();
        let job = job();

        let outcome = run_class(&class, &job).await.unwrap();

        assert_eq!(outcome, Outcome::Performed);
        assert_eq!(*log.lock().unwrap(), ["after"]);
    }

    #[tokio::test]
    async fn test_dont_perform_outside_before_hooks_is_a_failure() {
        let log: Log = Arc::default();
        let lf = log.clone();
        let class = JobClass::builder("Traced")
            .perform(|_| Box::pin(async { Err(JobError::DontPerform) }))
            .on_failure("notify", move |_, _| {
                let l = lf.clone();
                Box::pin(async move {
                    record(&l, "failure");
                    Ok(())
                })
            })
            .build();
        let job = job();

        let err = run_class(&class, &job).await.unwrap_err();

        assert!(matches!(err, JobError::DontPerform));
        assert_eq!(*log.lock().unwrap(), ["failure"]);
    }

    #[tokio::test]
    async fn test_unknown_class_is_a_recognizable_failure() {
        let registry = JobRegistry::new();
        let job = Arc::new(Job::new("q", Payload::new("Missing", vec![])));

        let err = run(&registry, &job).await.unwrap_err();

        assert!(matches!(err, JobError::UnknownClass(ref name) if name == "Missing"));
    }
}
