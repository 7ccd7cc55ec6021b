//! The persistence seam.
//!
//! A [`Store`] holds the two tables this queue is built on: `queue_jobs` for
//! active work and `queue_failed_jobs` for dead letters. The queue service
//! is the only caller; it owns all policy (queue defaults, retry delay,
//! lease length) and the store provides the atomic primitives. Two
//! implementations ship with the workspace: [`memory::InMemoryStore`] for
//! tests and demos, and the Postgres store in the `toil-sqlx` crate.
//!
//! Every implementation must pass the conformance suite exported from
//! [`testing`]; see [`store_test_suite!`](crate::store_test_suite).

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::job::{FailedJobId, JobId, JobStatus};

pub mod memory;
pub mod testing;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("failed job {0} not found")]
    FailedJobNotFound(FailedJobId),
    #[error("store in a bad state")]
    BadState,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// A job ready to be inserted.
///
/// Everything else about a fresh row is implied: `attempts` starts at zero,
/// the status is [`JobStatus::Pending`], and `created_at` is the insertion
/// time.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub queue: String,
    /// The encoded payload envelope, opaque to the store except where the
    /// retry ceiling has to be read back out (see [`Store::mark_job_failed`]).
    pub payload: String,
    pub available_at: DateTime<Utc>,
}

/// A row of the active jobs table.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRow {
    pub id: JobId,
    pub queue: String,
    pub payload: String,
    /// How many times this row has been reserved, including the reservation
    /// currently holding it when the status is [`JobStatus::Processing`].
    pub attempts: u32,
    pub reserved_at: Option<DateTime<Utc>>,
    /// When the current claim stops being trusted and the row becomes
    /// claimable again.
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
}

/// A row of the dead-letter table.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedJobRow {
    pub id: FailedJobId,
    pub queue: String,
    /// The original payload envelope, byte for byte.
    pub payload: String,
    pub exception: String,
    pub failed_at: DateTime<Utc>,
}

/// How a failure was settled by [`Store::mark_job_failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The retry ceiling was not reached; the row is pending again and will
    /// become claimable at `available_at`.
    Retried { available_at: DateTime<Utc> },
    /// The ceiling was reached and the row moved to the dead-letter table.
    Discarded,
}

/// The storage contract of the queue.
///
/// Each operation is atomic on its own: callers never see a row half way
/// through a reservation or a dead-letter migration, and a crash between two
/// operations can at worst re-deliver work, never lose it.
#[async_trait]
pub trait Store: Clone + Send + Sync + 'static {
    /// Insert a fresh pending row and return its id.
    async fn insert_job(&self, job: NewJob) -> Result<JobId, StoreError>;

    /// Atomically claim the next eligible job on `queue`, if any.
    ///
    /// Eligible rows are pending rows whose `available_at` has passed, plus
    /// processing rows whose lease has expired (a worker died holding them).
    /// The oldest `created_at` wins, ties broken by id. The claimed row is
    /// flipped to processing with `attempts` incremented, `reserved_at` set
    /// to now and a lease of `lease` from now; the updated row is returned.
    ///
    /// Selection and update happen in one transaction so two concurrent
    /// callers can never claim the same row.
    async fn reserve_job(
        &self,
        queue: &str,
        lease: TimeDelta,
    ) -> Result<Option<JobRow>, StoreError>;

    /// Delete a row, returning how many rows were deleted.
    ///
    /// Deleting an id that is already gone is not an error; it reports zero.
    async fn delete_job(&self, id: JobId) -> Result<u64, StoreError>;

    /// Settle a failed execution in one transaction.
    ///
    /// Looks the row up (absent ids are [`StoreError::JobNotFound`]) and
    /// reads the retry ceiling out of its payload envelope, falling back to
    /// `fallback_max_tries` when the envelope does not carry one or does not
    /// decode. Below the ceiling the row is reset to pending with its
    /// reservation cleared and `available_at = retry_at`; at the ceiling it
    /// is moved to the dead-letter table with `error` as the exception text.
    async fn mark_job_failed(
        &self,
        id: JobId,
        error: &str,
        retry_at: DateTime<Utc>,
        fallback_max_tries: u32,
    ) -> Result<FailOutcome, StoreError>;

    /// Move a row straight to the dead-letter table, ignoring its remaining
    /// retries. One transaction, like the exhausted branch of
    /// [`mark_job_failed`](Store::mark_job_failed).
    async fn discard_job(&self, id: JobId, error: &str) -> Result<(), StoreError>;

    /// Re-enqueue a dead letter as a brand-new job.
    ///
    /// In one transaction: inserts a fresh pending row (new id, zero
    /// attempts, available immediately) carrying the failed row's queue and
    /// payload, then deletes the failed row. Returns the new id.
    async fn retry_failed_job(&self, id: FailedJobId) -> Result<JobId, StoreError>;

    /// Count pending rows on `queue`. Processing rows are not included.
    async fn pending_count(&self, queue: &str) -> Result<u64, StoreError>;

    /// Count dead letters, optionally scoped to one queue.
    async fn failed_count(&self, queue: Option<&str>) -> Result<u64, StoreError>;

    /// Delete active rows in both statuses, optionally scoped to one queue,
    /// returning how many were deleted. Dead letters are untouched.
    async fn clear_jobs(&self, queue: Option<&str>) -> Result<u64, StoreError>;

    /// Delete dead letters, optionally scoped to one queue, returning how
    /// many were deleted.
    async fn clear_failed_jobs(&self, queue: Option<&str>) -> Result<u64, StoreError>;

    /// Point read of an active row.
    async fn fetch_job(&self, id: JobId) -> Result<Option<JobRow>, StoreError>;

    /// List dead letters, newest first, optionally scoped to one queue.
    async fn list_failed_jobs(
        &self,
        queue: Option<&str>,
    ) -> Result<Vec<FailedJobRow>, StoreError>;
}
