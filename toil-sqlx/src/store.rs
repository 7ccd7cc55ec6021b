use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use toil::job::{FailedJobId, JobId};
use toil::store::{FailOutcome, FailedJobRow, JobRow, NewJob, Store, StoreError};

use crate::{lease_interval, map_err, PgStore};

#[async_trait]
impl Store for PgStore {
    async fn insert_job(&self, job: NewJob) -> Result<JobId, StoreError> {
        self.insert(&job).await.map(Into::into).map_err(map_err)
    }

    async fn reserve_job(
        &self,
        queue: &str,
        lease: TimeDelta,
    ) -> Result<Option<JobRow>, StoreError> {
        self.claim(queue, lease_interval(lease))
            .await
            .map(|job| job.map(Into::into))
            .map_err(map_err)
    }

    async fn delete_job(&self, id: JobId) -> Result<u64, StoreError> {
        self.delete(id).await.map_err(map_err)
    }

    async fn mark_job_failed(
        &self,
        id: JobId,
        error: &str,
        retry_at: DateTime<Utc>,
        fallback_max_tries: u32,
    ) -> Result<FailOutcome, StoreError> {
        self.settle_failure(id, error, retry_at, fallback_max_tries)
            .await
    }

    async fn discard_job(&self, id: JobId, error: &str) -> Result<(), StoreError> {
        self.quarantine(id, error).await
    }

    async fn retry_failed_job(&self, id: FailedJobId) -> Result<JobId, StoreError> {
        self.reenqueue_failed(id).await
    }

    async fn pending_count(&self, queue: &str) -> Result<u64, StoreError> {
        self.count_pending(queue).await.map_err(map_err)
    }

    async fn failed_count(&self, queue: Option<&str>) -> Result<u64, StoreError> {
        self.count_failed(queue).await.map_err(map_err)
    }

    async fn clear_jobs(&self, queue: Option<&str>) -> Result<u64, StoreError> {
        self.delete_jobs(queue).await.map_err(map_err)
    }

    async fn clear_failed_jobs(&self, queue: Option<&str>) -> Result<u64, StoreError> {
        self.delete_failed_jobs(queue).await.map_err(map_err)
    }

    async fn fetch_job(&self, id: JobId) -> Result<Option<JobRow>, StoreError> {
        self.fetch(id)
            .await
            .map(|job| job.map(Into::into))
            .map_err(map_err)
    }

    async fn list_failed_jobs(&self, queue: Option<&str>) -> Result<Vec<FailedJobRow>, StoreError> {
        self.failed_jobs(queue)
            .await
            .map(|jobs| jobs.into_iter().map(Into::into).collect())
            .map_err(map_err)
    }
}
