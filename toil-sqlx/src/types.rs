//! Database-native shapes of the queue rows.
//!
//! These mirror the `queue_jobs` and `queue_failed_jobs` tables exactly and
//! convert into the store-agnostic rows from [`toil::store`].

use chrono::{DateTime, Utc};
use sqlx::prelude::FromRow;
use toil::job::JobStatus as ToilJobStatus;
use toil::store::{FailedJobRow as ToilFailedJobRow, JobRow as ToilJobRow};

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "queue_job_status", rename_all = "lowercase")]
pub(crate) enum JobStatus {
    Pending,
    Processing,
}

impl From<JobStatus> for ToilJobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Pending => Self::Pending,
            JobStatus::Processing => Self::Processing,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub queue: String,
    pub payload: String,
    pub attempts: i32,
    pub reserved_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub status: JobStatus,
}

impl From<JobRow> for ToilJobRow {
    fn from(value: JobRow) -> Self {
        Self {
            id: value.id.into(),
            queue: value.queue,
            payload: value.payload,
            attempts: value.attempts as u32,
            reserved_at: value.reserved_at,
            lease_expires_at: value.lease_expires_at,
            available_at: value.available_at,
            created_at: value.created_at,
            status: value.status.into(),
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct FailedJobRow {
    pub id: i64,
    pub queue: String,
    pub payload: String,
    pub exception: String,
    pub failed_at: DateTime<Utc>,
}

impl From<FailedJobRow> for ToilFailedJobRow {
    fn from(value: FailedJobRow) -> Self {
        Self {
            id: value.id.into(),
            queue: value.queue,
            payload: value.payload,
            exception: value.exception,
            failed_at: value.failed_at,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn status_maps_onto_the_core_enum() {
        assert_eq!(ToilJobStatus::from(JobStatus::Pending), ToilJobStatus::Pending);
        assert_eq!(
            ToilJobStatus::from(JobStatus::Processing),
            ToilJobStatus::Processing
        );
    }

    #[test]
    fn job_row_converts_field_for_field() {
        let now = Utc::now();
        let row = ToilJobRow::from(JobRow {
            id: 42,
            queue: "default".to_owned(),
            payload: "{}".to_owned(),
            attempts: 3,
            reserved_at: Some(now),
            lease_expires_at: Some(now),
            available_at: now,
            created_at: now,
            status: JobStatus::Processing,
        });

        assert_eq!(row.id, 42.into());
        assert_eq!(row.queue, "default");
        assert_eq!(row.attempts, 3);
        assert_eq!(row.reserved_at, Some(now));
        assert_eq!(row.status, ToilJobStatus::Processing);
    }
}
