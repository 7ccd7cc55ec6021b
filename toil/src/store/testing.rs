//! Test suite for certifying an implementation of [`Store`].
//!
//! Store implementors should include [`store_test_suite!`](crate::store_test_suite)
//! in their test suites. Every case works through the [`Store`] trait alone
//! and keeps to its own queue names, so the suite can run repeatedly against
//! a persistent database without the cases treading on each other.

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;

use super::*;
use crate::payload::{self, JobDescriptor};

const DELTA: TimeDelta = TimeDelta::milliseconds(1);
const LEASE: TimeDelta = TimeDelta::minutes(5);

#[doc(hidden)]
pub fn mock_descriptor() -> JobDescriptor {
    JobDescriptor {
        job: "mock_job".to_owned(),
        data: json!({"value": "data"}),
        max_tries: Some(3),
        timeout: None,
        created_at: Utc::now(),
    }
}

#[doc(hidden)]
pub fn mock_new_job(queue: &str) -> NewJob {
    NewJob {
        queue: queue.to_owned(),
        payload: payload::encode(&mock_descriptor()).unwrap(),
        available_at: Utc::now(),
    }
}

#[doc(hidden)]
pub fn mock_new_job_with_ceiling(queue: &str, max_tries: Option<u32>) -> NewJob {
    let descriptor = JobDescriptor {
        max_tries,
        ..mock_descriptor()
    };
    NewJob {
        queue: queue.to_owned(),
        payload: payload::encode(&descriptor).unwrap(),
        available_at: Utc::now(),
    }
}

#[doc(hidden)]
pub fn mock_new_job_available_at(queue: &str, available_at: DateTime<Utc>) -> NewJob {
    NewJob {
        available_at,
        ..mock_new_job(queue)
    }
}

#[doc(hidden)]
pub async fn reset(store: &impl Store, queues: &[&str]) {
    for queue in queues {
        store.clear_jobs(Some(queue)).await.unwrap();
        store.clear_failed_jobs(Some(queue)).await.unwrap();
    }
}

/// Drive a single fresh job on `queue` into the dead-letter table and return
/// its failed id. Only call on a queue the test has to itself.
#[doc(hidden)]
pub async fn dead_letter(store: &impl Store, queue: &str, error: &str) -> FailedJobId {
    let id = store
        .insert_job(mock_new_job_with_ceiling(queue, Some(1)))
        .await
        .unwrap();
    store
        .reserve_job(queue, LEASE)
        .await
        .unwrap()
        .expect("job should be claimable");
    store
        .mark_job_failed(id, error, Utc::now(), 1)
        .await
        .unwrap();
    store
        .list_failed_jobs(Some(queue))
        .await
        .unwrap()
        .first()
        .expect("job should have been dead lettered")
        .id
}

/// Create the test suite for a queue store.
///
/// For store implementors, it is useful to include this as part of your test
/// suite.
///
/// # Example
///
/// ```
/// use toil::store_test_suite;
/// use toil::store::memory::InMemoryStore;
/// store_test_suite!(for: InMemoryStore::new());
/// ```
///
/// If the store needs async setup, or the tests should be skipped in some
/// environments, the expression can do that work itself:
///
/// ```ignore
/// use toil::store_test_suite;
/// store_test_suite!(
///     attr: tokio::test,
///     args: (),
///     store: match pg_store().await {
///         Some(store) => store,
///         None => return,
///     }
/// );
/// ```
#[macro_export]
macro_rules! store_test_suite {
    (for: $store:expr) => {
        $crate::store_test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        #[$attr]
        async fn insert_job_creates_a_pending_row $args {
            let store = $store;
            $crate::store::testing::insert_job_creates_a_pending_row(store).await;
        }
        #[$attr]
        async fn insert_job_assigns_distinct_ids $args {
            let store = $store;
            $crate::store::testing::insert_job_assigns_distinct_ids(store).await;
        }
        #[$attr]
        async fn reserve_job_returns_none_when_queue_empty $args {
            let store = $store;
            $crate::store::testing::reserve_job_returns_none_when_queue_empty(store).await;
        }
        #[$attr]
        async fn reserve_job_claims_the_row $args {
            let store = $store;
            $crate::store::testing::reserve_job_claims_the_row(store).await;
        }
        #[$attr]
        async fn reserve_job_is_fifo_by_creation $args {
            let store = $store;
            $crate::store::testing::reserve_job_is_fifo_by_creation(store).await;
        }
        #[$attr]
        async fn reserve_job_ignores_other_queues $args {
            let store = $store;
            $crate::store::testing::reserve_job_ignores_other_queues(store).await;
        }
        #[$attr]
        async fn reserve_job_respects_available_at $args {
            let store = $store;
            $crate::store::testing::reserve_job_respects_available_at(store).await;
        }
        #[$attr]
        async fn reserve_job_skips_claimed_rows $args {
            let store = $store;
            $crate::store::testing::reserve_job_skips_claimed_rows(store).await;
        }
        #[$attr]
        async fn reserve_job_is_exclusive_under_races $args {
            let store = $store;
            $crate::store::testing::reserve_job_is_exclusive_under_races(store).await;
        }
        #[$attr]
        async fn reserve_job_reclaims_expired_leases $args {
            let store = $store;
            $crate::store::testing::reserve_job_reclaims_expired_leases(store).await;
        }
        #[$attr]
        async fn delete_job_removes_the_row $args {
            let store = $store;
            $crate::store::testing::delete_job_removes_the_row(store).await;
        }
        #[$attr]
        async fn mark_job_failed_reschedules_below_the_ceiling $args {
            let store = $store;
            $crate::store::testing::mark_job_failed_reschedules_below_the_ceiling(store).await;
        }
        #[$attr]
        async fn mark_job_failed_dead_letters_at_the_ceiling $args {
            let store = $store;
            $crate::store::testing::mark_job_failed_dead_letters_at_the_ceiling(store).await;
        }
        #[$attr]
        async fn mark_job_failed_uses_the_fallback_ceiling $args {
            let store = $store;
            $crate::store::testing::mark_job_failed_uses_the_fallback_ceiling(store).await;
        }
        #[$attr]
        async fn mark_job_failed_not_found $args {
            let store = $store;
            $crate::store::testing::mark_job_failed_not_found(store).await;
        }
        #[$attr]
        async fn discard_job_moves_the_row_immediately $args {
            let store = $store;
            $crate::store::testing::discard_job_moves_the_row_immediately(store).await;
        }
        #[$attr]
        async fn discard_job_not_found $args {
            let store = $store;
            $crate::store::testing::discard_job_not_found(store).await;
        }
        #[$attr]
        async fn retry_failed_job_enqueues_a_fresh_row $args {
            let store = $store;
            $crate::store::testing::retry_failed_job_enqueues_a_fresh_row(store).await;
        }
        #[$attr]
        async fn retry_failed_job_not_found $args {
            let store = $store;
            $crate::store::testing::retry_failed_job_not_found(store).await;
        }
        #[$attr]
        async fn pending_count_counts_only_pending_rows $args {
            let store = $store;
            $crate::store::testing::pending_count_counts_only_pending_rows(store).await;
        }
        #[$attr]
        async fn failed_count_scopes_by_queue $args {
            let store = $store;
            $crate::store::testing::failed_count_scopes_by_queue(store).await;
        }
        #[$attr]
        async fn clear_jobs_scoped_to_a_queue $args {
            let store = $store;
            $crate::store::testing::clear_jobs_scoped_to_a_queue(store).await;
        }
        #[$attr]
        async fn clear_failed_jobs_scoped_to_a_queue $args {
            let store = $store;
            $crate::store::testing::clear_failed_jobs_scoped_to_a_queue(store).await;
        }
    };
}

pub use store_test_suite;

#[doc(hidden)]
pub async fn insert_job_creates_a_pending_row(store: impl Store) {
    let queue = "suite_insert_pending";
    reset(&store, &[queue]).await;

    let job = mock_new_job(queue);
    let id = store.insert_job(job.clone()).await.unwrap();

    let row = store
        .fetch_job(id)
        .await
        .unwrap()
        .expect("inserted job should be fetchable");
    assert_eq!(row.id, id);
    assert_eq!(row.queue, queue);
    assert_eq!(row.payload, job.payload);
    assert_eq!(row.attempts, 0);
    assert_eq!(row.status, JobStatus::Pending);
    assert!(row.reserved_at.is_none());
    assert!(row.lease_expires_at.is_none());
    assert!((row.available_at - job.available_at).abs() < DELTA);
}

#[doc(hidden)]
pub async fn insert_job_assigns_distinct_ids(store: impl Store) {
    let queue = "suite_insert_ids";
    reset(&store, &[queue]).await;

    let id1 = store.insert_job(mock_new_job(queue)).await.unwrap();
    let id2 = store.insert_job(mock_new_job(queue)).await.unwrap();

    assert_ne!(id1, id2);
    assert!(store.fetch_job(id1).await.unwrap().is_some());
    assert!(store.fetch_job(id2).await.unwrap().is_some());
}

#[doc(hidden)]
pub async fn reserve_job_returns_none_when_queue_empty(store: impl Store) {
    let queue = "suite_reserve_empty";
    reset(&store, &[queue]).await;

    assert!(store.reserve_job(queue, LEASE).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn reserve_job_claims_the_row(store: impl Store) {
    let queue = "suite_reserve_claim";
    reset(&store, &[queue]).await;
    let id = store.insert_job(mock_new_job(queue)).await.unwrap();

    let row = store
        .reserve_job(queue, LEASE)
        .await
        .unwrap()
        .expect("pending job should be claimed");

    assert_eq!(row.id, id);
    assert_eq!(row.attempts, 1);
    assert_eq!(row.status, JobStatus::Processing);
    let reserved_at = row.reserved_at.expect("reserved_at should be set");
    let lease_expires_at = row
        .lease_expires_at
        .expect("lease_expires_at should be set");
    assert!((lease_expires_at - reserved_at - LEASE).abs() < DELTA);

    // The returned row is exactly what is now stored.
    let stored = store.fetch_job(id).await.unwrap().unwrap();
    assert_eq!(stored, row);
}

#[doc(hidden)]
pub async fn reserve_job_is_fifo_by_creation(store: impl Store) {
    let queue = "suite_reserve_fifo";
    reset(&store, &[queue]).await;
    let first = store.insert_job(mock_new_job(queue)).await.unwrap();
    let second = store.insert_job(mock_new_job(queue)).await.unwrap();

    let claimed = store.reserve_job(queue, LEASE).await.unwrap().unwrap();
    assert_eq!(claimed.id, first);
    let claimed = store.reserve_job(queue, LEASE).await.unwrap().unwrap();
    assert_eq!(claimed.id, second);
    assert!(store.reserve_job(queue, LEASE).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn reserve_job_ignores_other_queues(store: impl Store) {
    let queue = "suite_reserve_queues";
    let other = "suite_reserve_queues_other";
    reset(&store, &[queue, other]).await;
    let id = store.insert_job(mock_new_job(queue)).await.unwrap();

    assert!(store.reserve_job(other, LEASE).await.unwrap().is_none());
    let claimed = store.reserve_job(queue, LEASE).await.unwrap().unwrap();
    assert_eq!(claimed.id, id);
}

#[doc(hidden)]
pub async fn reserve_job_respects_available_at(store: impl Store) {
    let queue = "suite_reserve_delayed";
    reset(&store, &[queue]).await;

    store
        .insert_job(mock_new_job_available_at(
            queue,
            Utc::now() + TimeDelta::hours(1),
        ))
        .await
        .unwrap();
    assert!(store.reserve_job(queue, LEASE).await.unwrap().is_none());

    // A younger but already available job is claimed instead.
    let ready = store.insert_job(mock_new_job(queue)).await.unwrap();
    let claimed = store.reserve_job(queue, LEASE).await.unwrap().unwrap();
    assert_eq!(claimed.id, ready);
}

#[doc(hidden)]
pub async fn reserve_job_skips_claimed_rows(store: impl Store) {
    let queue = "suite_reserve_claimed";
    reset(&store, &[queue]).await;
    store.insert_job(mock_new_job(queue)).await.unwrap();

    assert!(store.reserve_job(queue, LEASE).await.unwrap().is_some());
    assert!(store.reserve_job(queue, LEASE).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn reserve_job_is_exclusive_under_races(store: impl Store) {
    let queue = "suite_reserve_races";
    reset(&store, &[queue]).await;
    let inserted = 4;
    for _ in 0..inserted {
        store.insert_job(mock_new_job(queue)).await.unwrap();
    }

    // More claimants than jobs; the surplus come back empty handed.
    let claims = futures::future::join_all((0..inserted + 2).map(|_| {
        let store = store.clone();
        async move { store.reserve_job(queue, LEASE).await.unwrap() }
    }))
    .await;

    let mut ids: Vec<i64> = claims
        .into_iter()
        .flatten()
        .map(|row| i64::from(row.id))
        .collect();
    assert_eq!(ids.len(), inserted);
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(
        ids.len(),
        inserted,
        "a job was handed to more than one claimant"
    );
}

#[doc(hidden)]
pub async fn reserve_job_reclaims_expired_leases(store: impl Store) {
    let queue = "suite_reserve_reclaim";
    reset(&store, &[queue]).await;
    let id = store.insert_job(mock_new_job(queue)).await.unwrap();

    let first = store
        .reserve_job(queue, TimeDelta::zero())
        .await
        .unwrap()
        .expect("pending job should be claimed");
    assert_eq!(first.attempts, 1);

    // The lease has already expired, so the claim is not trusted any more
    // and the reservation counts as a fresh attempt.
    let second = store
        .reserve_job(queue, LEASE)
        .await
        .unwrap()
        .expect("expired lease should be reclaimable");
    assert_eq!(second.id, id);
    assert_eq!(second.attempts, 2);
    assert_eq!(second.status, JobStatus::Processing);
}

#[doc(hidden)]
pub async fn delete_job_removes_the_row(store: impl Store) {
    let queue = "suite_delete";
    reset(&store, &[queue]).await;
    let id = store.insert_job(mock_new_job(queue)).await.unwrap();

    assert_eq!(store.delete_job(id).await.unwrap(), 1);
    assert!(store.fetch_job(id).await.unwrap().is_none());
    assert_eq!(store.delete_job(id).await.unwrap(), 0);
}

#[doc(hidden)]
pub async fn mark_job_failed_reschedules_below_the_ceiling(store: impl Store) {
    let queue = "suite_fail_retry";
    reset(&store, &[queue]).await;
    let id = store
        .insert_job(mock_new_job_with_ceiling(queue, Some(3)))
        .await
        .unwrap();
    store.reserve_job(queue, LEASE).await.unwrap();

    let retry_at = Utc::now() + TimeDelta::minutes(10);
    let outcome = store
        .mark_job_failed(id, "went wrong", retry_at, 5)
        .await
        .unwrap();

    let FailOutcome::Retried { available_at } = outcome else {
        panic!("expected a retry, got {outcome:?}");
    };
    assert!((available_at - retry_at).abs() < DELTA);

    let row = store.fetch_job(id).await.unwrap().unwrap();
    assert_eq!(row.status, JobStatus::Pending);
    assert_eq!(row.attempts, 1);
    assert!(row.reserved_at.is_none());
    assert!(row.lease_expires_at.is_none());
    assert!((row.available_at - retry_at).abs() < DELTA);

    // Not claimable again until the retry delay has passed.
    assert!(store.reserve_job(queue, LEASE).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn mark_job_failed_dead_letters_at_the_ceiling(store: impl Store) {
    let queue = "suite_fail_discard";
    reset(&store, &[queue]).await;
    let job = mock_new_job_with_ceiling(queue, Some(1));
    let payload_text = job.payload.clone();
    let id = store.insert_job(job).await.unwrap();
    store.reserve_job(queue, LEASE).await.unwrap();

    let outcome = store
        .mark_job_failed(id, "kept failing", Utc::now(), 5)
        .await
        .unwrap();

    assert_eq!(outcome, FailOutcome::Discarded);
    assert!(store.fetch_job(id).await.unwrap().is_none());
    assert_eq!(store.failed_count(Some(queue)).await.unwrap(), 1);

    let failed = store.list_failed_jobs(Some(queue)).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].queue, queue);
    assert_eq!(failed[0].payload, payload_text);
    assert_eq!(failed[0].exception, "kept failing");
}

#[doc(hidden)]
pub async fn mark_job_failed_uses_the_fallback_ceiling(store: impl Store) {
    let queue = "suite_fail_fallback";
    reset(&store, &[queue]).await;

    // No ceiling in the envelope and a fallback of one: the first failure
    // dead letters the job.
    let id = store
        .insert_job(mock_new_job_with_ceiling(queue, None))
        .await
        .unwrap();
    store.reserve_job(queue, LEASE).await.unwrap();
    let outcome = store
        .mark_job_failed(id, "no ceiling", Utc::now(), 1)
        .await
        .unwrap();
    assert_eq!(outcome, FailOutcome::Discarded);

    // With a fallback of two the same failure is retried.
    let id = store
        .insert_job(mock_new_job_with_ceiling(queue, None))
        .await
        .unwrap();
    store.reserve_job(queue, LEASE).await.unwrap();
    let outcome = store
        .mark_job_failed(id, "no ceiling", Utc::now(), 2)
        .await
        .unwrap();
    assert!(matches!(outcome, FailOutcome::Retried { .. }));
}

#[doc(hidden)]
pub async fn mark_job_failed_not_found(store: impl Store) {
    let queue = "suite_fail_missing";
    reset(&store, &[queue]).await;
    let id = store.insert_job(mock_new_job(queue)).await.unwrap();
    store.delete_job(id).await.unwrap();

    assert!(matches!(
        store.mark_job_failed(id, "gone", Utc::now(), 3).await,
        Err(StoreError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn discard_job_moves_the_row_immediately(store: impl Store) {
    let queue = "suite_discard";
    reset(&store, &[queue]).await;
    let job = mock_new_job(queue);
    let payload_text = job.payload.clone();
    let id = store.insert_job(job).await.unwrap();

    // Retries remain, but a discard does not consult the ceiling.
    store.discard_job(id, "cannot run").await.unwrap();

    assert!(store.fetch_job(id).await.unwrap().is_none());
    let failed = store.list_failed_jobs(Some(queue)).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].payload, payload_text);
    assert_eq!(failed[0].exception, "cannot run");
}

#[doc(hidden)]
pub async fn discard_job_not_found(store: impl Store) {
    let queue = "suite_discard_missing";
    reset(&store, &[queue]).await;
    let id = store.insert_job(mock_new_job(queue)).await.unwrap();
    store.delete_job(id).await.unwrap();

    assert!(matches!(
        store.discard_job(id, "gone").await,
        Err(StoreError::JobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn retry_failed_job_enqueues_a_fresh_row(store: impl Store) {
    let queue = "suite_retry";
    reset(&store, &[queue]).await;
    let job = mock_new_job_with_ceiling(queue, Some(1));
    let payload_text = job.payload.clone();
    let id = store.insert_job(job).await.unwrap();
    store.reserve_job(queue, LEASE).await.unwrap();
    store
        .mark_job_failed(id, "boom", Utc::now(), 1)
        .await
        .unwrap();
    let failed_id = store.list_failed_jobs(Some(queue)).await.unwrap()[0].id;

    let new_id = store.retry_failed_job(failed_id).await.unwrap();

    assert_ne!(new_id, id);
    assert_eq!(store.failed_count(Some(queue)).await.unwrap(), 0);
    let row = store.fetch_job(new_id).await.unwrap().unwrap();
    assert_eq!(row.attempts, 0);
    assert_eq!(row.status, JobStatus::Pending);
    assert_eq!(row.payload, payload_text);

    // And it is immediately claimable like any fresh job.
    let claimed = store
        .reserve_job(queue, LEASE)
        .await
        .unwrap()
        .expect("retried job should be claimable");
    assert_eq!(claimed.id, new_id);
    assert_eq!(claimed.attempts, 1);
}

#[doc(hidden)]
pub async fn retry_failed_job_not_found(store: impl Store) {
    let queue = "suite_retry_missing";
    reset(&store, &[queue]).await;
    let failed_id = dead_letter(&store, queue, "boom").await;
    store.retry_failed_job(failed_id).await.unwrap();

    assert!(matches!(
        store.retry_failed_job(failed_id).await,
        Err(StoreError::FailedJobNotFound(_))
    ));
}

#[doc(hidden)]
pub async fn pending_count_counts_only_pending_rows(store: impl Store) {
    let queue = "suite_pending_count";
    let other = "suite_pending_count_other";
    reset(&store, &[queue, other]).await;

    store.insert_job(mock_new_job(queue)).await.unwrap();
    store.insert_job(mock_new_job(queue)).await.unwrap();
    store.insert_job(mock_new_job(other)).await.unwrap();
    store.reserve_job(queue, LEASE).await.unwrap();

    assert_eq!(store.pending_count(queue).await.unwrap(), 1);
    assert_eq!(store.pending_count(other).await.unwrap(), 1);
}

#[doc(hidden)]
pub async fn failed_count_scopes_by_queue(store: impl Store) {
    let queue = "suite_failed_count";
    let other = "suite_failed_count_other";
    reset(&store, &[queue, other]).await;

    dead_letter(&store, queue, "boom").await;
    dead_letter(&store, other, "boom").await;

    assert_eq!(store.failed_count(Some(queue)).await.unwrap(), 1);
    assert_eq!(store.failed_count(Some(other)).await.unwrap(), 1);
    assert!(store.failed_count(None).await.unwrap() >= 2);
}

#[doc(hidden)]
pub async fn clear_jobs_scoped_to_a_queue(store: impl Store) {
    let queue = "suite_clear";
    let other = "suite_clear_other";
    reset(&store, &[queue, other]).await;

    let reserved = store.insert_job(mock_new_job(queue)).await.unwrap();
    store.insert_job(mock_new_job(queue)).await.unwrap();
    store.insert_job(mock_new_job(other)).await.unwrap();
    store.reserve_job(queue, LEASE).await.unwrap();

    // Both the pending and the processing row go.
    assert_eq!(store.clear_jobs(Some(queue)).await.unwrap(), 2);
    assert_eq!(store.pending_count(queue).await.unwrap(), 0);
    assert!(store.fetch_job(reserved).await.unwrap().is_none());
    assert_eq!(store.pending_count(other).await.unwrap(), 1);
}

#[doc(hidden)]
pub async fn clear_failed_jobs_scoped_to_a_queue(store: impl Store) {
    let queue = "suite_clear_failed";
    let other = "suite_clear_failed_other";
    reset(&store, &[queue, other]).await;

    dead_letter(&store, queue, "boom").await;
    dead_letter(&store, other, "boom").await;

    assert_eq!(store.clear_failed_jobs(Some(queue)).await.unwrap(), 1);
    assert_eq!(store.failed_count(Some(queue)).await.unwrap(), 0);
    assert_eq!(store.failed_count(Some(other)).await.unwrap(), 1);
}
