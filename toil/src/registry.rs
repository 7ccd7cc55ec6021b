//! Maps job names to runnable implementations.
//!
//! A worker cannot know the concrete [`Job`] type behind a claimed row; all
//! it has is the `job` key of the descriptor. The registry bridges that gap:
//! each [`register`](JobRegistry::register) call erases one `Job`
//! implementation into a pair of closures keyed by [`Job::NAME`], and the
//! worker resolves names against it at dispatch time.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::job::{ExecutionError, Job, JobError};
use crate::ToilError;

type RunFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<(), JobError>> + Send + Sync>;
type FailureHookFn = Arc<dyn Fn(Value, ExecutionError) -> BoxFuture<'static, ()> + Send + Sync>;

/// A type-erased [`Job`] implementation.
#[derive(Clone)]
pub struct RegisteredJob {
    name: &'static str,
    run: RunFn,
    on_failure: FailureHookFn,
}

impl fmt::Debug for RegisteredJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredJob")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl RegisteredJob {
    fn of<J>() -> Self
    where
        J: Job,
    {
        Self {
            name: J::NAME,
            run: Arc::new(|data| {
                Box::pin(async move {
                    let job: J = serde_json::from_value(data)?;
                    job.run().await
                })
            }),
            on_failure: Arc::new(|data, error| {
                Box::pin(async move {
                    match serde_json::from_value::<J>(data) {
                        Ok(job) => job.on_failure(&error).await,
                        Err(decode_error) => tracing::debug!(
                            job = J::NAME,
                            %decode_error,
                            "skipping failure hook, job data does not deserialize"
                        ),
                    }
                })
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Deserializes `data` into the job and runs it. A value that does not
    /// deserialize counts as a failed run.
    pub(crate) fn run(&self, data: Value) -> BoxFuture<'static, Result<(), JobError>> {
        (self.run)(data)
    }

    /// Invokes the job's failure hook with the recorded error.
    pub(crate) fn on_failure(&self, data: Value, error: ExecutionError) -> BoxFuture<'static, ()> {
        (self.on_failure)(data, error)
    }
}

/// The set of job types a worker knows how to run.
///
/// ```
/// # use serde::{Deserialize, Serialize};
/// # use toil::job::{Job, JobError};
/// use toil::registry::JobRegistry;
///
/// # #[derive(Serialize, Deserialize)]
/// # struct SendReminder;
/// # #[async_trait::async_trait]
/// # impl Job for SendReminder {
/// #     const NAME: &'static str = "send_reminder";
/// #     async fn run(&self) -> Result<(), JobError> { Ok(()) }
/// # }
/// # #[derive(Serialize, Deserialize)]
/// # struct PruneSessions;
/// # #[async_trait::async_trait]
/// # impl Job for PruneSessions {
/// #     const NAME: &'static str = "prune_sessions";
/// #     async fn run(&self) -> Result<(), JobError> { Ok(()) }
/// # }
/// let registry = JobRegistry::new()
///     .register::<SendReminder>()
///     .register::<PruneSessions>();
/// assert!(registry.resolve("send_reminder").is_ok());
/// ```
#[derive(Clone, Default)]
pub struct JobRegistry {
    jobs: HashMap<&'static str, RegisteredJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `J` under [`Job::NAME`].
    ///
    /// Registering a second type under the same name replaces the first.
    pub fn register<J>(mut self) -> Self
    where
        J: Job,
    {
        if self.jobs.insert(J::NAME, RegisteredJob::of::<J>()).is_some() {
            tracing::warn!(
                job = J::NAME,
                "job name registered twice, keeping the later registration"
            );
        }
        self
    }

    /// Looks up the implementation for a descriptor's `job` key.
    pub fn resolve(&self, name: &str) -> Result<&RegisteredJob, ToilError> {
        self.jobs
            .get(name)
            .ok_or_else(|| ToilError::UnknownJobType(name.to_owned()))
    }

    pub fn job_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.jobs.keys().copied()
    }
}
