//! Tests against a real Postgres instance.
//!
//! They need `DATABASE_URL` pointing at a reachable database and skip with a
//! note on stderr when it is unset, so the rest of the workspace stays green
//! without one. Queue names are unique per test, letting the whole file run
//! repeatedly against a persistent database.

use serde::{Deserialize, Serialize};
use toil::job::{Job, JobError};
use toil::queue::{QueueConfig, QueueService};
use toil::store_test_suite;
use toil_sqlx::PgStore;

async fn pg_store() -> Option<PgStore> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set, skipping Postgres store tests");
        return None;
    };
    Some(
        PgStore::connect(&url)
            .await
            .expect("failed to connect to Postgres"),
    )
}

store_test_suite!(
    attr: tokio::test,
    args: (),
    store: match pg_store().await {
        Some(store) => store,
        None => return,
    }
);

#[derive(Serialize, Deserialize)]
struct WelcomeEmail {
    user_id: i64,
}

#[async_trait::async_trait]
impl Job for WelcomeEmail {
    const NAME: &'static str = "welcome_email";
    const MAX_TRIES: Option<u32> = Some(2);

    async fn run(&self) -> Result<(), JobError> {
        Ok(())
    }
}

#[tokio::test]
async fn a_job_lives_through_the_whole_lifecycle() {
    let Some(store) = pg_store().await else { return };
    let queue = QueueService::with_config(
        store,
        QueueConfig::default()
            .with_default_queue("pg_lifecycle")
            .with_retry_delay(chrono::TimeDelta::zero()),
    );
    queue.clear(Some("pg_lifecycle")).await.unwrap();
    queue.clear_failed(Some("pg_lifecycle")).await.unwrap();

    let id = queue.enqueue(&WelcomeEmail { user_id: 7 }).await.unwrap();
    assert_eq!(queue.size().await.unwrap(), 1);

    // First try fails and, with a zero retry delay, is claimable again at
    // once.
    let job = queue
        .dequeue()
        .await
        .unwrap()
        .expect("the job should be claimable");
    assert_eq!(job.id, id);
    assert_eq!(job.attempts, 1);
    queue.fail(job.id, "smtp unreachable").await.unwrap();

    // Second try hits the ceiling of two and is dead lettered.
    let job = queue
        .dequeue()
        .await
        .unwrap()
        .expect("the retry should be claimable");
    assert_eq!(job.attempts, 2);
    queue.fail(job.id, "smtp still unreachable").await.unwrap();

    assert_eq!(queue.size().await.unwrap(), 0);
    let failed = queue.failed_jobs(Some("pg_lifecycle")).await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].exception, "smtp still unreachable");

    // A manual retry starts the job over with a clean slate.
    let retried = queue.retry(failed[0].id).await.unwrap();
    assert_ne!(retried, id);

    let job = queue
        .dequeue()
        .await
        .unwrap()
        .expect("the reenqueued job should be claimable");
    assert_eq!(job.id, retried);
    assert_eq!(job.attempts, 1);
    queue.acknowledge(job.id).await.unwrap();

    assert_eq!(queue.size().await.unwrap(), 0);
    assert_eq!(queue.failed_count(Some("pg_lifecycle")).await.unwrap(), 0);
}
