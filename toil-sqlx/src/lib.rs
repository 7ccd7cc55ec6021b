//! A Postgres implementation of the [`toil`] store.
//!
//! [`PgStore`] keeps the queue in two tables, `queue_jobs` and
//! `queue_failed_jobs`, created by this crate's embedded migrations. Claims
//! lean on `FOR UPDATE SKIP LOCKED`, so any number of workers can poll the
//! same queue without ever being handed the same row twice.

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::postgres::types::PgInterval;
use sqlx::{PgPool, Postgres, Transaction};
use toil::job::{FailedJobId, JobId};
use toil::payload;
use toil::store::{FailOutcome, NewJob, StoreError};

mod store;
mod types;

use types::{FailedJobRow, JobRow};

/// The queue's store over a Postgres connection pool.
///
/// Cloning is cheap, clones share the pool.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl From<PgPool> for PgStore {
    fn from(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl PgStore {
    /// Connects to the database at `url` and runs any outstanding migrations.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(url).await.map_err(map_err)?;
        Self::from_pool(pool).await
    }

    /// Wraps an existing pool, running any outstanding migrations.
    ///
    /// When the schema is managed elsewhere, the `From<PgPool>` impl wraps
    /// the pool without touching it.
    pub async fn from_pool(pool: PgPool) -> Result<Self, StoreError> {
        sqlx::migrate!()
            .run(&pool)
            .await
            .map_err(|error| StoreError::Unavailable(error.to_string()))?;
        tracing::debug!("queue tables are up to date");
        Ok(Self { pool })
    }

    async fn insert(&self, job: &NewJob) -> sqlx::Result<i64> {
        sqlx::query_scalar(
            r#"INSERT INTO queue_jobs (queue, payload, available_at)
            VALUES ($1, $2, $3)
            RETURNING id"#,
        )
        .bind(&job.queue)
        .bind(&job.payload)
        .bind(job.available_at)
        .fetch_one(&self.pool)
        .await
    }

    /// Claim the next eligible job on `queue` in a single statement.
    ///
    /// `SKIP LOCKED` makes concurrent claimants pass over each other's
    /// candidate row instead of blocking on it.
    async fn claim(&self, queue: &str, lease: PgInterval) -> sqlx::Result<Option<JobRow>> {
        sqlx::query_as(
            r#"UPDATE queue_jobs
            SET
                status = 'processing',
                attempts = attempts + 1,
                reserved_at = now(),
                lease_expires_at = now() + $2
            WHERE id IN (
                SELECT id
                FROM queue_jobs
                WHERE queue = $1
                AND (
                    (status = 'pending' AND available_at <= now())
                    OR (status = 'processing' AND lease_expires_at <= now())
                )
                ORDER BY created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING
                id,
                queue,
                payload,
                attempts,
                reserved_at,
                lease_expires_at,
                available_at,
                created_at,
                status"#,
        )
        .bind(queue)
        .bind(lease)
        .fetch_optional(&self.pool)
        .await
    }

    async fn delete(&self, id: JobId) -> sqlx::Result<u64> {
        Ok(sqlx::query("DELETE FROM queue_jobs WHERE id = $1")
            .bind(i64::from(id))
            .execute(&self.pool)
            .await?
            .rows_affected())
    }

    /// Settle a failed execution: reschedule below the retry ceiling, move to
    /// the dead-letter table at it. One transaction either way.
    async fn settle_failure(
        &self,
        id: JobId,
        error: &str,
        retry_at: DateTime<Utc>,
        fallback_max_tries: u32,
    ) -> Result<FailOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        let job: Option<JobRow> = sqlx::query_as(
            r#"SELECT
                id,
                queue,
                payload,
                attempts,
                reserved_at,
                lease_expires_at,
                available_at,
                created_at,
                status
            FROM queue_jobs
            WHERE id = $1
            FOR UPDATE"#,
        )
        .bind(i64::from(id))
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_err)?;

        let Some(job) = job else {
            return Err(StoreError::JobNotFound(id));
        };

        let ceiling = payload::decode(&job.payload)
            .ok()
            .and_then(|descriptor| descriptor.max_tries)
            .unwrap_or(fallback_max_tries);

        let outcome = if (job.attempts as u32) < ceiling {
            let available_at = sqlx::query_scalar(
                r#"UPDATE queue_jobs
                SET
                    status = 'pending',
                    reserved_at = NULL,
                    lease_expires_at = NULL,
                    available_at = $2
                WHERE id = $1
                RETURNING available_at"#,
            )
            .bind(i64::from(id))
            .bind(retry_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_err)?;
            FailOutcome::Retried { available_at }
        } else {
            dead_letter(&mut tx, id, error).await?;
            FailOutcome::Discarded
        };

        tx.commit().await.map_err(map_err)?;
        Ok(outcome)
    }

    async fn quarantine(&self, id: JobId, error: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;
        dead_letter(&mut tx, id, error).await?;
        tx.commit().await.map_err(map_err)?;
        Ok(())
    }

    async fn reenqueue_failed(&self, id: FailedJobId) -> Result<JobId, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_err)?;

        let new_id: Option<i64> = sqlx::query_scalar(
            r#"INSERT INTO queue_jobs (queue, payload, available_at)
            SELECT queue, payload, now()
            FROM queue_failed_jobs
            WHERE id = $1
            RETURNING id"#,
        )
        .bind(i64::from(id))
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_err)?;

        let Some(new_id) = new_id else {
            return Err(StoreError::FailedJobNotFound(id));
        };

        sqlx::query("DELETE FROM queue_failed_jobs WHERE id = $1")
            .bind(i64::from(id))
            .execute(&mut *tx)
            .await
            .map_err(map_err)?;

        tx.commit().await.map_err(map_err)?;
        Ok(new_id.into())
    }

    async fn count_pending(&self, queue: &str) -> sqlx::Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM queue_jobs WHERE queue = $1 AND status = 'pending'",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn count_failed(&self, queue: Option<&str>) -> sqlx::Result<u64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT count(*) FROM queue_failed_jobs WHERE $1::text IS NULL OR queue = $1",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn delete_jobs(&self, queue: Option<&str>) -> sqlx::Result<u64> {
        Ok(
            sqlx::query("DELETE FROM queue_jobs WHERE $1::text IS NULL OR queue = $1")
                .bind(queue)
                .execute(&self.pool)
                .await?
                .rows_affected(),
        )
    }

    async fn delete_failed_jobs(&self, queue: Option<&str>) -> sqlx::Result<u64> {
        Ok(
            sqlx::query("DELETE FROM queue_failed_jobs WHERE $1::text IS NULL OR queue = $1")
                .bind(queue)
                .execute(&self.pool)
                .await?
                .rows_affected(),
        )
    }

    async fn fetch(&self, id: JobId) -> sqlx::Result<Option<JobRow>> {
        sqlx::query_as(
            r#"SELECT
                id,
                queue,
                payload,
                attempts,
                reserved_at,
                lease_expires_at,
                available_at,
                created_at,
                status
            FROM queue_jobs
            WHERE id = $1"#,
        )
        .bind(i64::from(id))
        .fetch_optional(&self.pool)
        .await
    }

    async fn failed_jobs(&self, queue: Option<&str>) -> sqlx::Result<Vec<FailedJobRow>> {
        sqlx::query_as(
            r#"SELECT id, queue, payload, exception, failed_at
            FROM queue_failed_jobs
            WHERE $1::text IS NULL OR queue = $1
            ORDER BY failed_at DESC, id DESC"#,
        )
        .bind(queue)
        .fetch_all(&self.pool)
        .await
    }
}

/// Copy a job row into the dead-letter table and delete it, inside the
/// caller's transaction. `failed_at` takes the insertion default.
async fn dead_letter(
    tx: &mut Transaction<'_, Postgres>,
    id: JobId,
    error: &str,
) -> Result<(), StoreError> {
    let copied = sqlx::query(
        r#"INSERT INTO queue_failed_jobs (queue, payload, exception)
        SELECT queue, payload, $2
        FROM queue_jobs
        WHERE id = $1"#,
    )
    .bind(i64::from(id))
    .bind(error)
    .execute(&mut **tx)
    .await
    .map_err(map_err)?
    .rows_affected();

    if copied == 0 {
        return Err(StoreError::JobNotFound(id));
    }

    sqlx::query("DELETE FROM queue_jobs WHERE id = $1")
        .bind(i64::from(id))
        .execute(&mut **tx)
        .await
        .map_err(map_err)?;

    Ok(())
}

fn lease_interval(lease: TimeDelta) -> PgInterval {
    PgInterval {
        months: 0,
        days: 0,
        microseconds: lease.num_microseconds().unwrap_or(i64::MAX),
    }
}

pub(crate) fn map_err(error: sqlx::Error) -> StoreError {
    StoreError::Unavailable(error.to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lease_interval_converts_to_microseconds() {
        let interval = lease_interval(TimeDelta::minutes(5));
        assert_eq!(interval.months, 0);
        assert_eq!(interval.days, 0);
        assert_eq!(interval.microseconds, 5 * 60 * 1_000_000);
    }
}
