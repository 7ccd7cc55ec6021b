//! An in memory implementation of [`Store`].
//!
//! Meant for tests and demos rather than production use: it favours being an
//! obviously correct implementation of the storage contract over being fast.

use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc, RwLock,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use super::{FailOutcome, FailedJobRow, JobRow, NewJob, Store, StoreError};
use crate::{
    job::{FailedJobId, JobId, JobStatus},
    payload,
};

/// An in memory [`Store`].
///
/// Cloning is cheap and clones share the same tables, so a test can hand one
/// clone to a worker and keep another for assertions.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    jobs: Arc<RwLock<Vec<JobRow>>>,
    failed: Arc<RwLock<Vec<FailedJobRow>>>,
    id_counter: Arc<AtomicI64>,
    failed_id_counter: Arc<AtomicI64>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn eligible(job: &JobRow, now: DateTime<Utc>) -> bool {
        match job.status {
            JobStatus::Pending => job.available_at <= now,
            JobStatus::Processing => job
                .lease_expires_at
                .map_or(false, |expires_at| expires_at <= now),
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_job(&self, job: NewJob) -> Result<JobId, StoreError> {
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        self.jobs
            .write()
            .map_err(|_| StoreError::BadState)?
            .push(JobRow {
                id: id.into(),
                queue: job.queue,
                payload: job.payload,
                attempts: 0,
                reserved_at: None,
                lease_expires_at: None,
                available_at: job.available_at,
                created_at: Utc::now(),
                status: JobStatus::Pending,
            });
        Ok(id.into())
    }

    async fn reserve_job(
        &self,
        queue: &str,
        lease: TimeDelta,
    ) -> Result<Option<JobRow>, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let claimed = jobs
            .iter_mut()
            .filter(|job| job.queue == queue && Self::eligible(job, now))
            .min_by_key(|job| (job.created_at, i64::from(job.id)));
        Ok(claimed.map(|job| {
            job.status = JobStatus::Processing;
            job.attempts += 1;
            job.reserved_at = Some(now);
            job.lease_expires_at = Some(now + lease);
            job.clone()
        }))
    }

    async fn delete_job(&self, id: JobId) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let before = jobs.len();
        jobs.retain(|job| job.id != id);
        Ok((before - jobs.len()) as u64)
    }

    async fn mark_job_failed(
        &self,
        id: JobId,
        error: &str,
        retry_at: DateTime<Utc>,
        fallback_max_tries: u32,
    ) -> Result<FailOutcome, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let Some(index) = jobs.iter().position(|job| job.id == id) else {
            return Err(StoreError::JobNotFound(id));
        };
        let ceiling = payload::decode(&jobs[index].payload)
            .ok()
            .and_then(|descriptor| descriptor.max_tries)
            .unwrap_or(fallback_max_tries);
        if jobs[index].attempts < ceiling {
            let job = &mut jobs[index];
            job.status = JobStatus::Pending;
            job.reserved_at = None;
            job.lease_expires_at = None;
            job.available_at = retry_at;
            Ok(FailOutcome::Retried {
                available_at: retry_at,
            })
        } else {
            let job = jobs.remove(index);
            let mut failed = self.failed.write().map_err(|_| StoreError::BadState)?;
            let failed_id = self.failed_id_counter.fetch_add(1, Ordering::SeqCst);
            failed.push(FailedJobRow {
                id: failed_id.into(),
                queue: job.queue,
                payload: job.payload,
                exception: error.to_owned(),
                failed_at: Utc::now(),
            });
            Ok(FailOutcome::Discarded)
        }
    }

    async fn discard_job(&self, id: JobId, error: &str) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let Some(index) = jobs.iter().position(|job| job.id == id) else {
            return Err(StoreError::JobNotFound(id));
        };
        let job = jobs.remove(index);
        let mut failed = self.failed.write().map_err(|_| StoreError::BadState)?;
        let failed_id = self.failed_id_counter.fetch_add(1, Ordering::SeqCst);
        failed.push(FailedJobRow {
            id: failed_id.into(),
            queue: job.queue,
            payload: job.payload,
            exception: error.to_owned(),
            failed_at: Utc::now(),
        });
        Ok(())
    }

    async fn retry_failed_job(&self, id: FailedJobId) -> Result<JobId, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut failed = self.failed.write().map_err(|_| StoreError::BadState)?;
        let Some(index) = failed.iter().position(|job| job.id == id) else {
            return Err(StoreError::FailedJobNotFound(id));
        };
        let row = failed.remove(index);
        let now = Utc::now();
        let new_id = self.id_counter.fetch_add(1, Ordering::SeqCst);
        jobs.push(JobRow {
            id: new_id.into(),
            queue: row.queue,
            payload: row.payload,
            attempts: 0,
            reserved_at: None,
            lease_expires_at: None,
            available_at: now,
            created_at: now,
            status: JobStatus::Pending,
        });
        Ok(new_id.into())
    }

    async fn pending_count(&self, queue: &str) -> Result<u64, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|job| job.queue == queue && job.status == JobStatus::Pending)
            .count() as u64)
    }

    async fn failed_count(&self, queue: Option<&str>) -> Result<u64, StoreError> {
        Ok(self
            .failed
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|job| queue.map_or(true, |queue| job.queue == queue))
            .count() as u64)
    }

    async fn clear_jobs(&self, queue: Option<&str>) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let before = jobs.len();
        jobs.retain(|job| queue.map_or(false, |queue| job.queue != queue));
        Ok((before - jobs.len()) as u64)
    }

    async fn clear_failed_jobs(&self, queue: Option<&str>) -> Result<u64, StoreError> {
        let mut failed = self.failed.write().map_err(|_| StoreError::BadState)?;
        let before = failed.len();
        failed.retain(|job| queue.map_or(false, |queue| job.queue != queue));
        Ok((before - failed.len()) as u64)
    }

    async fn fetch_job(&self, id: JobId) -> Result<Option<JobRow>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .find(|job| job.id == id)
            .cloned())
    }

    async fn list_failed_jobs(
        &self,
        queue: Option<&str>,
    ) -> Result<Vec<FailedJobRow>, StoreError> {
        Ok(self
            .failed
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .rev()
            .filter(|job| queue.map_or(true, |queue| job.queue == queue))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::testing::mock_new_job;
    use crate::store_test_suite;
    use assert_matches::assert_matches;

    store_test_suite!(for: InMemoryStore::new());

    #[tokio::test]
    async fn poisoned_locks_surface_as_bad_state() {
        let store = InMemoryStore::new();
        tokio::task::spawn({
            let store = store.clone();
            async move {
                let _guard = store.jobs.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        let id = JobId::from(0);
        assert_matches!(
            store.insert_job(mock_new_job("memory")).await,
            Err(StoreError::BadState)
        );
        assert_matches!(
            store.reserve_job("memory", TimeDelta::minutes(5)).await,
            Err(StoreError::BadState)
        );
        assert_matches!(store.delete_job(id).await, Err(StoreError::BadState));
        assert_matches!(
            store.mark_job_failed(id, "boom", Utc::now(), 3).await,
            Err(StoreError::BadState)
        );
        assert_matches!(
            store.discard_job(id, "boom").await,
            Err(StoreError::BadState)
        );
        assert_matches!(store.pending_count("memory").await, Err(StoreError::BadState));
        assert_matches!(store.clear_jobs(None).await, Err(StoreError::BadState));
        assert_matches!(store.fetch_job(id).await, Err(StoreError::BadState));
    }
}
