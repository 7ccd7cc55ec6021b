//! A database backed job queue.
//!
//! Jobs are plain values implementing [`job::Job`]. Enqueueing serializes
//! the value into a JSON envelope stored in the `queue_jobs` table; a
//! polling [`worker::Worker`] claims jobs one at a time, runs them, and
//! settles each one: deleted on success, rescheduled on failure, or moved
//! to the `queue_failed_jobs` dead letter table once the retry ceiling is
//! reached.
//!
//! Storage is behind the [`store::Store`] trait. The `toil-sqlx` crate
//! implements it for Postgres; [`store::memory::InMemoryStore`] backs tests
//! and demos.
//!
//! # Example
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use toil::prelude::*;
//! use toil::store::memory::InMemoryStore;
//!
//! #[derive(Serialize, Deserialize)]
//! struct SendReminder {
//!     user_id: i64,
//! }
//!
//! #[async_trait::async_trait]
//! impl Job for SendReminder {
//!     const NAME: &'static str = "send_reminder";
//!
//!     async fn run(&self) -> Result<(), JobError> {
//!         println!("reminding user {}", self.user_id);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), ToilError> {
//!     let queue = QueueService::new(InMemoryStore::new());
//!     queue.enqueue(&SendReminder { user_id: 7 }).await?;
//!
//!     let worker = Worker::new(queue.clone(), JobRegistry::new().register::<SendReminder>())
//!         .with_config(WorkerConfig::default().shutdown_when_empty());
//!     assert_eq!(worker.run().await, StopReason::QueueEmpty);
//!
//!     assert_eq!(queue.size().await?, 0);
//!     Ok(())
//! }
//! ```

pub mod job;
pub mod payload;
pub mod prelude;
pub mod queue;
pub mod registry;
pub mod store;
pub mod worker;

use chrono::TimeDelta;
use thiserror::Error;

use payload::CodecError;
use store::StoreError;

#[derive(Debug, Error)]
pub enum ToilError {
    #[error("queue store error")]
    Store(#[from] StoreError),
    #[error("error encoding or decoding a job payload")]
    Payload(#[from] CodecError),
    #[error("enqueue delay must not be negative, got {0}")]
    NegativeDelay(TimeDelta),
    #[error("job name must not be empty")]
    EmptyJobName,
    #[error("no job registered under the name {0:?}")]
    UnknownJobType(String),
    #[error("failed to shut the worker down")]
    ShutdownFailed,
}

#[cfg(test)]
mod tests {
    use crate::queue::QueueService;
    use crate::registry::JobRegistry;
    use crate::store::memory::InMemoryStore;
    use crate::worker::Worker;

    #[tokio::test]
    async fn setup() {
        let service = QueueService::new(InMemoryStore::new());
        let _worker = Worker::new(service, JobRegistry::new());
    }
}
