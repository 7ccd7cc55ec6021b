//! The job contract and the identifiers and handles that travel with a job
//! through the queue.

use std::error::Error;
use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::payload::JobDescriptor;

/// A unique identifier for an active job.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub struct JobId(i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// A unique identifier for a dead-lettered job.
///
/// Failed jobs get a fresh identifier when they are moved to the failed
/// table; it is unrelated to the [`JobId`] the job carried while active.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub struct FailedJobId(i64);

impl From<i64> for FailedJobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<FailedJobId> for i64 {
    fn from(value: FailedJobId) -> Self {
        value.0
    }
}

impl Display for FailedJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FailedJobId({})", self.0)
    }
}

/// The lifecycle state of an active job.
///
/// There is no terminal state: successful jobs are deleted on acknowledge
/// and exhausted jobs move to the failed table.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum JobStatus {
    /// Waiting to be claimed once `available_at` has passed.
    Pending,
    /// Claimed by a worker and currently leased.
    Processing,
}

/// A claimed job as returned from [`QueueService::dequeue`].
///
/// [`QueueService::dequeue`]: crate::queue::QueueService::dequeue
#[derive(Debug, Clone, PartialEq)]
pub struct JobHandle {
    pub id: JobId,
    pub queue: String,
    /// The decoded payload envelope, exactly as stored.
    pub descriptor: JobDescriptor,
    /// The reservation count including the reservation that produced this
    /// handle.
    pub attempts: u32,
}

/// The error type returned from [`Job::run`].
pub type JobError = Box<dyn Error + Send + Sync + 'static>;

/// Classification of an execution failure.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    /// [`Job::run`] returned an error.
    Failed,
    /// The job panicked.
    Panic,
    /// The job overran its declared deadline.
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Failed => "failed",
            Self::Panic => "panic",
            Self::Timeout => "timeout",
        }
    }
}

/// What went wrong while executing a job.
///
/// The [`Display`] form is the text recorded in the failed table's
/// `exception` column and handed to [`Job::on_failure`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExecutionError {
    pub(crate) fn failed(error: JobError) -> Self {
        Self {
            kind: ErrorKind::Failed,
            message: error.to_string(),
        }
    }

    pub(crate) fn timed_out(deadline: Duration) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: format!("execution exceeded the {}s deadline", deadline.as_secs()),
        }
    }
}

impl Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// An enqueuable unit of work.
///
/// The implementing value is itself the argument bag: it is serialized into
/// the payload envelope at enqueue time and deserialized back before
/// [`run`](Job::run) is invoked on a worker.
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use toil::prelude::*;
///
/// #[derive(Serialize, Deserialize)]
/// struct SendReminder {
///     user_id: i64,
/// }
///
/// #[async_trait::async_trait]
/// impl Job for SendReminder {
///     const NAME: &'static str = "send_reminder";
///     const MAX_TRIES: Option<u32> = Some(5);
///
///     async fn run(&self) -> Result<(), JobError> {
///         // deliver the reminder to self.user_id
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Job: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The stable name of this job type.
    ///
    /// This is the registry key and the `job` field of every stored payload.
    /// Using a static string rather than the type name means the Rust type
    /// can be renamed without orphaning jobs already sitting in the store.
    const NAME: &'static str;

    /// The retry ceiling for jobs of this type.
    ///
    /// Baked into the payload at enqueue time. [`None`] defers to the queue
    /// service's configured fallback.
    const MAX_TRIES: Option<u32> = None;

    /// An execution deadline, also baked into the payload at enqueue time.
    ///
    /// When set, a run that overruns the deadline is cancelled and settles
    /// through the normal failure path. [`None`] runs unbounded.
    const TIMEOUT: Option<Duration> = None;

    /// Execute the job.
    async fn run(&self) -> Result<(), JobError>;

    /// Invoked after a failure of any kind has been recorded.
    ///
    /// This is a side-effect hook (alerting, cleanup); the job's fate has
    /// already been settled by the time it runs and nothing it does can
    /// change that.
    async fn on_failure(&self, _error: &ExecutionError) {}
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn job_id_round_trips_through_i64() {
        let id = JobId::from(42);
        assert_eq!(i64::from(id), 42);
        assert_eq!(id.to_string(), "JobId(42)");
    }

    #[test]
    fn failed_job_id_display_names_the_table() {
        let id = FailedJobId::from(7);
        assert_eq!(i64::from(id), 7);
        assert_eq!(id.to_string(), "FailedJobId(7)");
    }

    #[test]
    fn execution_error_display_is_the_recorded_text() {
        let error = ExecutionError::failed("disk on fire".into());
        assert_eq!(error.kind, ErrorKind::Failed);
        assert_eq!(error.to_string(), "disk on fire");

        let error = ExecutionError::timed_out(Duration::from_secs(30));
        assert_eq!(error.kind, ErrorKind::Timeout);
        assert_eq!(error.to_string(), "execution exceeded the 30s deadline");
    }
}
