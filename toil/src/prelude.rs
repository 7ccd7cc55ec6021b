//! The purpose of this module is to alleviate the need to import many of the `[toil]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use toil::prelude::*;
//! ```
pub use crate::job::{ErrorKind, ExecutionError, JobError, JobHandle};
pub use crate::job::{FailedJobId, Job, JobId, JobStatus};
pub use crate::queue::{QueueConfig, QueueService, DEFAULT_QUEUE};
pub use crate::registry::JobRegistry;
pub use crate::store::{FailOutcome, Store};
pub use crate::worker::{StopReason, Worker, WorkerConfig, WorkerHandle};
pub use crate::ToilError;
