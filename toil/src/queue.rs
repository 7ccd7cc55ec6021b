//! The queue service: the API for putting jobs on a queue and taking them
//! off again.
//!
//! [`QueueService`] owns a [`Store`] and a [`QueueConfig`] and applies all
//! queueing policy (default queue, retry delay, retry ceiling, lease time)
//! on top of the store's mechanics. Every service instance carries its own
//! configuration, so two services over the same database can run with
//! different policies.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::job::{FailedJobId, Job, JobHandle, JobId};
use crate::payload::{self, CodecError, JobDescriptor};
use crate::store::{FailOutcome, FailedJobRow, NewJob, Store};
use crate::ToilError;

/// The queue jobs are enqueued on when no queue is named.
pub const DEFAULT_QUEUE: &str = "default";

/// Per-service queueing policy.
///
/// The defaults match the job tables' defaults: the `default` queue, three
/// tries, a one minute retry delay, and a five minute claim lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Queue used by [`QueueService::enqueue`] and [`QueueService::dequeue`].
    pub default_queue: String,
    /// Retry ceiling applied when a job's envelope does not carry one.
    pub max_tries: u32,
    /// How far into the future a failed job is pushed before its next try.
    pub retry_delay: TimeDelta,
    /// How long a claim is trusted before the job becomes reclaimable.
    pub lease_time: TimeDelta,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_queue: DEFAULT_QUEUE.to_owned(),
            max_tries: 3,
            retry_delay: TimeDelta::seconds(60),
            lease_time: TimeDelta::minutes(5),
        }
    }
}

impl QueueConfig {
    pub fn with_default_queue(self, queue: impl Into<String>) -> Self {
        Self {
            default_queue: queue.into(),
            ..self
        }
    }

    pub fn with_max_tries(self, max_tries: u32) -> Self {
        Self { max_tries, ..self }
    }

    pub fn with_retry_delay(self, retry_delay: TimeDelta) -> Self {
        Self {
            retry_delay,
            ..self
        }
    }

    pub fn with_lease_time(self, lease_time: TimeDelta) -> Self {
        Self { lease_time, ..self }
    }
}

/// A job queue over a [`Store`].
///
/// # Example
///
/// ```
/// # use serde::{Deserialize, Serialize};
/// # use toil::job::JobError;
/// use toil::prelude::*;
/// use toil::store::memory::InMemoryStore;
///
/// #[derive(Serialize, Deserialize)]
/// struct SendReminder {
///     user_id: i64,
/// }
///
/// #[async_trait::async_trait]
/// impl Job for SendReminder {
///     const NAME: &'static str = "send_reminder";
///
///     async fn run(&self) -> Result<(), JobError> {
///         Ok(())
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")] async fn main() -> Result<(), ToilError> {
/// let queue = QueueService::new(InMemoryStore::new());
/// let id = queue.enqueue(&SendReminder { user_id: 42 }).await?;
///
/// let handle = queue.dequeue().await?.unwrap();
/// assert_eq!(handle.id, id);
/// queue.acknowledge(handle.id).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct QueueService<S: Store> {
    store: S,
    config: QueueConfig,
}

impl<S> QueueService<S>
where
    S: Store,
{
    /// Creates a service with the default [`QueueConfig`].
    pub fn new(store: S) -> Self {
        Self::with_config(store, QueueConfig::default())
    }

    pub fn with_config(store: S, config: QueueConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Enqueues `job` on the default queue, available immediately.
    pub async fn enqueue<J>(&self, job: &J) -> Result<JobId, ToilError>
    where
        J: Job,
    {
        self.enqueue_on(&self.config.default_queue, job).await
    }

    /// Enqueues `job` on the named queue, available immediately.
    pub async fn enqueue_on<J>(&self, queue: &str, job: &J) -> Result<JobId, ToilError>
    where
        J: Job,
    {
        self.enqueue_at(queue, job, Utc::now()).await
    }

    /// Enqueues `job` on the default queue, not claimable until `delay` has
    /// passed. A zero delay enqueues immediately; a negative delay is
    /// rejected.
    pub async fn enqueue_delayed<J>(&self, job: &J, delay: TimeDelta) -> Result<JobId, ToilError>
    where
        J: Job,
    {
        self.enqueue_delayed_on(&self.config.default_queue, job, delay)
            .await
    }

    /// Enqueues `job` on the named queue after `delay`.
    pub async fn enqueue_delayed_on<J>(
        &self,
        queue: &str,
        job: &J,
        delay: TimeDelta,
    ) -> Result<JobId, ToilError>
    where
        J: Job,
    {
        if delay < TimeDelta::zero() {
            return Err(ToilError::NegativeDelay(delay));
        }
        self.enqueue_at(queue, job, Utc::now() + delay).await
    }

    async fn enqueue_at<J>(
        &self,
        queue: &str,
        job: &J,
        available_at: DateTime<Utc>,
    ) -> Result<JobId, ToilError>
    where
        J: Job,
    {
        if J::NAME.is_empty() {
            return Err(ToilError::EmptyJobName);
        }
        let descriptor = JobDescriptor {
            job: J::NAME.to_owned(),
            data: serde_json::to_value(job).map_err(CodecError::from)?,
            max_tries: Some(J::MAX_TRIES.unwrap_or(self.config.max_tries)),
            timeout: J::TIMEOUT.map(timeout_secs),
            created_at: Utc::now(),
        };
        let id = self
            .store
            .insert_job(NewJob {
                queue: queue.to_owned(),
                payload: payload::encode(&descriptor)?,
                available_at,
            })
            .await?;
        tracing::debug!(%id, queue, job = J::NAME, "enqueued job");
        Ok(id)
    }

    /// Claims the next available job on the default queue.
    pub async fn dequeue(&self) -> Result<Option<JobHandle>, ToilError> {
        self.dequeue_from(&self.config.default_queue).await
    }

    /// Claims the next available job on the named queue.
    ///
    /// Returns `None` when nothing is currently claimable. The claimed row's
    /// attempt count has already been bumped and its lease started; the
    /// caller settles the job with [`acknowledge`](Self::acknowledge),
    /// [`fail`](Self::fail), or [`discard`](Self::discard).
    ///
    /// A claimed row whose payload does not decode can never run, so it is
    /// moved straight to the dead-letter table and the claim loop continues
    /// with the next row.
    pub async fn dequeue_from(&self, queue: &str) -> Result<Option<JobHandle>, ToilError> {
        loop {
            let Some(row) = self
                .store
                .reserve_job(queue, self.config.lease_time)
                .await?
            else {
                return Ok(None);
            };
            match payload::decode(&row.payload) {
                Ok(descriptor) => {
                    return Ok(Some(JobHandle {
                        id: row.id,
                        queue: row.queue,
                        descriptor,
                        attempts: row.attempts,
                    }));
                }
                Err(error) => {
                    tracing::warn!(id = %row.id, %error, "quarantining job with undecodable payload");
                    self.store
                        .discard_job(row.id, &format!("corrupt payload: {error}"))
                        .await?;
                }
            }
        }
    }

    /// Completes a job by deleting its row.
    ///
    /// Acknowledging a job that is already gone is not an error.
    pub async fn acknowledge(&self, id: JobId) -> Result<(), ToilError> {
        if self.store.delete_job(id).await? == 0 {
            tracing::trace!(%id, "acknowledged a job that was already deleted");
        }
        Ok(())
    }

    /// Records a failed execution for `id`.
    ///
    /// Below the job's retry ceiling the job is rescheduled
    /// [`retry_delay`](QueueConfig::retry_delay) into the future; at the
    /// ceiling it is moved to the dead-letter table with `error` as the
    /// recorded exception.
    pub async fn fail(&self, id: JobId, error: &str) -> Result<FailOutcome, ToilError> {
        let retry_at = Utc::now() + self.config.retry_delay;
        Ok(self
            .store
            .mark_job_failed(id, error, retry_at, self.config.max_tries)
            .await?)
    }

    /// Moves `id` to the dead-letter table regardless of remaining tries.
    pub async fn discard(&self, id: JobId, error: &str) -> Result<(), ToilError> {
        Ok(self.store.discard_job(id, error).await?)
    }

    /// Re-enqueues a dead-lettered job as a brand new job on its original
    /// queue, with a fresh id and a zeroed attempt count, and deletes the
    /// dead-letter row.
    pub async fn retry(&self, id: FailedJobId) -> Result<JobId, ToilError> {
        let new_id = self.store.retry_failed_job(id).await?;
        tracing::debug!(failed_id = %id, %new_id, "retried dead-lettered job");
        Ok(new_id)
    }

    /// Number of pending jobs on the default queue.
    pub async fn size(&self) -> Result<u64, ToilError> {
        self.size_of(&self.config.default_queue).await
    }

    /// Number of pending jobs on the named queue. Jobs that are currently
    /// claimed are not counted; delayed jobs are.
    pub async fn size_of(&self, queue: &str) -> Result<u64, ToilError> {
        Ok(self.store.pending_count(queue).await?)
    }

    /// Number of dead-lettered jobs, optionally restricted to one queue.
    pub async fn failed_count(&self, queue: Option<&str>) -> Result<u64, ToilError> {
        Ok(self.store.failed_count(queue).await?)
    }

    /// Dead-letter listing, newest failure first.
    pub async fn failed_jobs(&self, queue: Option<&str>) -> Result<Vec<FailedJobRow>, ToilError> {
        Ok(self.store.list_failed_jobs(queue).await?)
    }

    /// Deletes active jobs, pending and claimed alike, returning how many
    /// went. Scoped to one queue when `queue` is given.
    pub async fn clear(&self, queue: Option<&str>) -> Result<u64, ToilError> {
        Ok(self.store.clear_jobs(queue).await?)
    }

    /// Deletes dead-lettered jobs, returning how many went.
    pub async fn clear_failed(&self, queue: Option<&str>) -> Result<u64, ToilError> {
        Ok(self.store.clear_failed_jobs(queue).await?)
    }
}

/// Timeouts travel in the envelope as whole seconds; a sub-second budget
/// rounds up rather than truncating to an instant deadline.
fn timeout_secs(timeout: Duration) -> u64 {
    timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0)
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use assert_matches::assert_matches;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    use super::*;
    use crate::job::JobError;
    use crate::store::memory::InMemoryStore;

    #[derive(Debug, Serialize, Deserialize)]
    struct SendEmail {
        to: String,
    }

    #[async_trait::async_trait]
    impl Job for SendEmail {
        const NAME: &'static str = "send_email";
        const MAX_TRIES: Option<u32> = Some(2);

        async fn run(&self) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Cleanup;

    #[async_trait::async_trait]
    impl Job for Cleanup {
        const NAME: &'static str = "cleanup";
        const TIMEOUT: Option<Duration> = Some(Duration::from_secs(30));

        async fn run(&self) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Quick;

    #[async_trait::async_trait]
    impl Job for Quick {
        const NAME: &'static str = "quick";
        const TIMEOUT: Option<Duration> = Some(Duration::from_millis(500));

        async fn run(&self) -> Result<(), JobError> {
            Ok(())
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Nameless;

    #[async_trait::async_trait]
    impl Job for Nameless {
        const NAME: &'static str = "";

        async fn run(&self) -> Result<(), JobError> {
            Ok(())
        }
    }

    fn send_email() -> SendEmail {
        SendEmail {
            to: "someone@example.com".to_owned(),
        }
    }

    #[tokio::test]
    async fn enqueue_then_dequeue_round_trips_the_descriptor() {
        let queue = QueueService::new(InMemoryStore::new());

        let id = queue.enqueue(&send_email()).await.unwrap();
        let handle = queue
            .dequeue()
            .await
            .unwrap()
            .expect("job should be claimable");

        assert_eq!(handle.id, id);
        assert_eq!(handle.queue, DEFAULT_QUEUE);
        assert_eq!(handle.attempts, 1);
        assert_eq!(handle.descriptor.job, "send_email");
        assert_eq!(handle.descriptor.data, json!({"to": "someone@example.com"}));
        assert_eq!(handle.descriptor.max_tries, Some(2));
        assert_eq!(handle.descriptor.timeout, None);
    }

    #[tokio::test]
    async fn enqueue_writes_the_job_timeout_in_seconds() {
        let queue = QueueService::new(InMemoryStore::new());

        queue.enqueue(&Cleanup).await.unwrap();
        let handle = queue.dequeue().await.unwrap().unwrap();

        assert_eq!(handle.descriptor.timeout, Some(30));
    }

    #[tokio::test]
    async fn sub_second_timeouts_round_up_to_a_whole_second() {
        let queue = QueueService::new(InMemoryStore::new());

        // Quick declares a 500ms budget.
        queue.enqueue(&Quick).await.unwrap();
        let handle = queue.dequeue().await.unwrap().unwrap();

        assert_eq!(handle.descriptor.timeout, Some(1));
    }

    #[test]
    fn timeout_secs_rounds_up_partial_seconds() {
        assert_eq!(timeout_secs(Duration::from_millis(500)), 1);
        assert_eq!(timeout_secs(Duration::from_millis(1500)), 2);
        assert_eq!(timeout_secs(Duration::from_secs(30)), 30);
        assert_eq!(timeout_secs(Duration::ZERO), 0);
    }

    #[tokio::test]
    async fn enqueue_falls_back_to_the_configured_ceiling() {
        let queue = QueueService::with_config(
            InMemoryStore::new(),
            QueueConfig::default().with_max_tries(7),
        );

        // Cleanup declares no ceiling of its own.
        queue.enqueue(&Cleanup).await.unwrap();
        let handle = queue.dequeue().await.unwrap().unwrap();

        assert_eq!(handle.descriptor.max_tries, Some(7));
    }

    #[tokio::test]
    async fn enqueue_on_targets_the_named_queue() {
        let queue = QueueService::new(InMemoryStore::new());

        queue.enqueue_on("mailers", &send_email()).await.unwrap();

        assert_eq!(queue.size().await.unwrap(), 0);
        assert_eq!(queue.size_of("mailers").await.unwrap(), 1);
        assert!(queue.dequeue().await.unwrap().is_none());
        assert!(queue.dequeue_from("mailers").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn enqueue_rejects_an_empty_job_name() {
        let queue = QueueService::new(InMemoryStore::new());

        assert_matches!(
            queue.enqueue(&Nameless).await,
            Err(ToilError::EmptyJobName)
        );
        assert_matches!(
            queue.enqueue_delayed(&Nameless, TimeDelta::zero()).await,
            Err(ToilError::EmptyJobName)
        );
    }

    #[tokio::test]
    async fn enqueue_delayed_rejects_a_negative_delay() {
        let queue = QueueService::new(InMemoryStore::new());

        assert_matches!(
            queue
                .enqueue_delayed(&send_email(), TimeDelta::seconds(-1))
                .await,
            Err(ToilError::NegativeDelay(_))
        );
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn delayed_jobs_are_invisible_until_due() {
        let queue = QueueService::new(InMemoryStore::new());

        queue
            .enqueue_delayed(&send_email(), TimeDelta::hours(1))
            .await
            .unwrap();

        // Counted as pending, but not claimable yet.
        assert_eq!(queue.size().await.unwrap(), 1);
        assert!(queue.dequeue().await.unwrap().is_none());

        // A zero delay means available right now.
        queue
            .enqueue_delayed(&send_email(), TimeDelta::zero())
            .await
            .unwrap();
        assert!(queue.dequeue().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn acknowledge_is_idempotent() {
        let queue = QueueService::new(InMemoryStore::new());

        queue.enqueue(&send_email()).await.unwrap();
        let handle = queue.dequeue().await.unwrap().unwrap();

        queue.acknowledge(handle.id).await.unwrap();
        queue.acknowledge(handle.id).await.unwrap();

        assert_eq!(queue.size().await.unwrap(), 0);
        assert_eq!(queue.failed_count(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fail_reschedules_with_the_retry_delay() {
        let queue = QueueService::with_config(
            InMemoryStore::new(),
            QueueConfig::default().with_retry_delay(TimeDelta::minutes(10)),
        );

        queue.enqueue(&send_email()).await.unwrap();
        let handle = queue.dequeue().await.unwrap().unwrap();
        let outcome = queue.fail(handle.id, "smtp down").await.unwrap();

        let FailOutcome::Retried { available_at } = outcome else {
            panic!("expected a retry, got {outcome:?}");
        };
        let expected = Utc::now() + TimeDelta::minutes(10);
        assert!((available_at - expected).abs() < TimeDelta::seconds(1));

        // Back to pending, but not claimable until the delay passes.
        assert_eq!(queue.size().await.unwrap(), 1);
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fail_dead_letters_once_the_ceiling_is_reached() {
        let queue = QueueService::with_config(
            InMemoryStore::new(),
            QueueConfig::default().with_retry_delay(TimeDelta::zero()),
        );

        // SendEmail allows two tries.
        queue.enqueue(&send_email()).await.unwrap();

        let handle = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(handle.attempts, 1);
        assert_matches!(
            queue.fail(handle.id, "smtp down").await.unwrap(),
            FailOutcome::Retried { .. }
        );

        let handle = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(handle.attempts, 2);
        assert_matches!(
            queue.fail(handle.id, "smtp still down").await.unwrap(),
            FailOutcome::Discarded
        );

        assert_eq!(queue.size().await.unwrap(), 0);
        assert_eq!(queue.failed_count(None).await.unwrap(), 1);
        let failed = queue.failed_jobs(None).await.unwrap();
        assert_eq!(failed[0].exception, "smtp still down");
    }

    #[tokio::test]
    async fn retry_reenqueues_a_dead_letter_as_a_fresh_job() {
        let queue = QueueService::with_config(
            InMemoryStore::new(),
            QueueConfig::default().with_retry_delay(TimeDelta::zero()),
        );

        queue.enqueue(&send_email()).await.unwrap();
        let first_id = queue.dequeue().await.unwrap().unwrap().id;
        queue.fail(first_id, "boom").await.unwrap();
        let handle = queue.dequeue().await.unwrap().unwrap();
        queue.fail(handle.id, "boom").await.unwrap();

        let failed_id = queue.failed_jobs(None).await.unwrap()[0].id;
        let new_id = queue.retry(failed_id).await.unwrap();

        assert_ne!(new_id, first_id);
        assert_eq!(queue.failed_count(None).await.unwrap(), 0);

        let handle = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(handle.id, new_id);
        assert_eq!(handle.attempts, 1);
        assert_eq!(handle.descriptor.job, "send_email");
    }

    #[tokio::test]
    async fn dequeue_quarantines_a_corrupt_payload() {
        let store = InMemoryStore::new();
        let queue = QueueService::new(store.clone());

        // A row written by something that is not this codec.
        store
            .insert_job(NewJob {
                queue: DEFAULT_QUEUE.to_owned(),
                payload: "not even json".to_owned(),
                available_at: Utc::now(),
            })
            .await
            .unwrap();
        let good = queue.enqueue(&send_email()).await.unwrap();

        // The corrupt row is first in line; dequeue skips past it.
        let handle = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(handle.id, good);

        assert_eq!(queue.failed_count(None).await.unwrap(), 1);
        let failed = queue.failed_jobs(None).await.unwrap();
        assert!(failed[0].exception.starts_with("corrupt payload:"));
        assert_eq!(failed[0].payload, "not even json");
    }

    #[tokio::test]
    async fn clear_without_a_queue_wipes_every_queue() {
        let queue = QueueService::new(InMemoryStore::new());

        queue.enqueue(&send_email()).await.unwrap();
        queue.enqueue_on("mailers", &send_email()).await.unwrap();

        assert_eq!(queue.clear(None).await.unwrap(), 2);
        assert_eq!(queue.size().await.unwrap(), 0);
        assert_eq!(queue.size_of("mailers").await.unwrap(), 0);
    }

    #[test]
    fn config_builders_override_the_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.default_queue, DEFAULT_QUEUE);
        assert_eq!(config.max_tries, 3);
        assert_eq!(config.retry_delay, TimeDelta::seconds(60));
        assert_eq!(config.lease_time, TimeDelta::minutes(5));

        let config = config
            .with_default_queue("mailers")
            .with_max_tries(5)
            .with_retry_delay(TimeDelta::seconds(5))
            .with_lease_time(TimeDelta::minutes(1));
        assert_eq!(config.default_queue, "mailers");
        assert_eq!(config.max_tries, 5);
        assert_eq!(config.retry_delay, TimeDelta::seconds(5));
        assert_eq!(config.lease_time, TimeDelta::minutes(1));
    }
}
