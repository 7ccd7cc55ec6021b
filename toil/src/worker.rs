//! The worker: a polling loop that claims jobs, runs them, and settles the
//! outcome.
//!
//! A worker polls a single queue through a [`QueueService`], resolves each
//! claimed job against its [`JobRegistry`], and runs jobs one at a time on a
//! spawned task so that panics and deadline overruns are contained. Every
//! claimed job is settled: acknowledged on success, failed (retry or dead
//! letter) on error, discarded when nothing is registered under its name.
//!
//! The loop is cooperative: between jobs it checks its shutdown channel, the
//! job budget, and the memory ceiling, and stops with a [`StopReason`]
//! describing which condition ended it.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::sleep;
use tracing::{debug, error, instrument, trace, warn, Instrument};

use crate::job::{ErrorKind, ExecutionError, JobHandle};
use crate::queue::QueueService;
use crate::registry::JobRegistry;
use crate::store::{FailOutcome, Store};
use crate::ToilError;

const PAGE_BYTES: u64 = 4096;

/// Polling and stop policy for a [`Worker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Queue to poll. The service's default queue when `None`.
    pub queue: Option<String>,
    /// How long to sleep when a poll finds nothing to do.
    pub poll_interval: Duration,
    /// Upper bound of the random extra sleep added to each idle poll.
    pub poll_jitter: Duration,
    /// Stop after settling this many jobs.
    pub max_jobs: Option<u64>,
    /// Stop once the process's resident memory exceeds this many bytes.
    pub max_memory_bytes: Option<u64>,
    /// Stop as soon as a poll finds the queue empty.
    pub shutdown_when_empty: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: None,
            poll_interval: Duration::from_secs(1),
            poll_jitter: Duration::from_millis(100),
            max_jobs: None,
            max_memory_bytes: None,
            shutdown_when_empty: false,
        }
    }
}

impl WorkerConfig {
    pub fn with_queue(self, queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
            ..self
        }
    }

    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            ..self
        }
    }

    pub fn with_poll_jitter(self, poll_jitter: Duration) -> Self {
        Self {
            poll_jitter,
            ..self
        }
    }

    pub fn with_max_jobs(self, max_jobs: u64) -> Self {
        Self {
            max_jobs: Some(max_jobs),
            ..self
        }
    }

    pub fn with_max_memory_bytes(self, max_memory_bytes: u64) -> Self {
        Self {
            max_memory_bytes: Some(max_memory_bytes),
            ..self
        }
    }

    pub fn shutdown_when_empty(self) -> Self {
        Self {
            shutdown_when_empty: true,
            ..self
        }
    }
}

/// Why a worker's run loop ended.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StopReason {
    /// The queue was empty and the worker stops when empty.
    QueueEmpty,
    /// The configured job budget was used up.
    JobLimit,
    /// Resident memory crossed the configured ceiling.
    MemoryLimit,
    /// A shutdown was requested through the [`WorkerHandle`].
    Shutdown,
}

enum Message {
    Terminate,
}

/// Handle to a worker running on its own task.
#[derive(Debug)]
pub struct WorkerHandle {
    sender: mpsc::UnboundedSender<Message>,
    handle: JoinHandle<StopReason>,
}

impl WorkerHandle {
    /// Asks the worker to stop once the in-flight job (if any) has settled,
    /// and waits for it to finish.
    pub async fn shutdown(self) -> Result<StopReason, ToilError> {
        // The send fails when the worker already stopped on its own; the
        // join below still yields its stop reason.
        let _ = self.sender.send(Message::Terminate);
        self.handle.await.map_err(|_| ToilError::ShutdownFailed)
    }
}

/// A single-queue polling worker.
pub struct Worker<S: Store> {
    service: QueueService<S>,
    registry: Arc<JobRegistry>,
    config: WorkerConfig,
}

impl<S> Worker<S>
where
    S: Store,
{
    pub fn new(service: QueueService<S>, registry: JobRegistry) -> Self {
        Self {
            service,
            registry: Arc::new(registry),
            config: WorkerConfig::default(),
        }
    }

    pub fn with_config(self, config: WorkerConfig) -> Self {
        Self { config, ..self }
    }

    fn queue(&self) -> &str {
        self.config
            .queue
            .as_deref()
            .unwrap_or(&self.service.config().default_queue)
    }

    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.config.poll_jitter.is_zero() {
            return self.config.poll_interval;
        }
        let jitter_millis =
            u64::try_from(self.config.poll_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.config.poll_interval + Duration::from_millis(jitter)
    }

    /// Runs the worker on the current task until a stop condition is hit.
    pub async fn run(self) -> StopReason {
        // _sender keeps the channel open; a closed channel reads as a
        // shutdown request.
        let (_sender, receiver) = mpsc::unbounded_channel();
        self.run_with_shutdown(receiver).await
    }

    /// Spawns the worker onto the runtime, returning a handle for graceful
    /// shutdown.
    pub fn spawn(self) -> WorkerHandle {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(self.run_with_shutdown(receiver));
        WorkerHandle { sender, handle }
    }

    async fn run_with_shutdown(self, mut shutdown: mpsc::UnboundedReceiver<Message>) -> StopReason {
        debug!(
            queue = self.queue(),
            jobs = ?self.registry.job_names().collect::<Vec<_>>(),
            "worker started"
        );
        let mut processed: u64 = 0;
        loop {
            match shutdown.try_recv() {
                Ok(Message::Terminate) | Err(TryRecvError::Disconnected) => {
                    debug!("worker shutting down");
                    return StopReason::Shutdown;
                }
                Err(TryRecvError::Empty) => {}
            }
            if let Some(reason) = self.stop_for_budget(processed) {
                return reason;
            }
            match self.service.dequeue_from(self.queue()).await {
                Ok(Some(job)) => {
                    self.execute(job).await;
                    processed += 1;
                }
                Ok(None) if self.config.shutdown_when_empty => {
                    debug!("queue empty, stopping worker");
                    return StopReason::QueueEmpty;
                }
                Ok(None) => {
                    let sleep_duration = self.sleep_duration_with_jitter();
                    trace!("queue empty, polling again in {sleep_duration:?}");
                    tokio::select! {
                        _ = shutdown.recv() => return StopReason::Shutdown,
                        () = sleep(sleep_duration) => {}
                    }
                }
                Err(error) => {
                    error!(%error, "failed to claim a job, backing off");
                    tokio::select! {
                        _ = shutdown.recv() => return StopReason::Shutdown,
                        () = sleep(self.sleep_duration_with_jitter()) => {}
                    }
                }
            }
        }
    }

    fn stop_for_budget(&self, processed: u64) -> Option<StopReason> {
        if let Some(max_jobs) = self.config.max_jobs {
            if processed >= max_jobs {
                debug!(processed, "job budget used up, stopping worker");
                return Some(StopReason::JobLimit);
            }
        }
        if let Some(ceiling) = self.config.max_memory_bytes {
            if let Some(resident) = rss_bytes() {
                if resident > ceiling {
                    warn!(resident, ceiling, "memory ceiling exceeded, stopping worker");
                    return Some(StopReason::MemoryLimit);
                }
            }
        }
        None
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, job = %job.descriptor.job))]
    async fn execute(&self, job: JobHandle) {
        let registered = match self.registry.resolve(&job.descriptor.job) {
            Ok(registered) => registered,
            Err(_) => {
                // Nothing registered under this name can ever run the job,
                // and that will still be true on a later attempt.
                error!("unknown job type, dead lettering");
                let exception = format!("unknown job type: {}", job.descriptor.job);
                if let Err(store_error) = self.service.discard(job.id, &exception).await {
                    error!(%store_error, "failed to discard job");
                }
                return;
            }
        };

        debug!(attempt = job.attempts, "executing job");
        let deadline = job.descriptor.timeout.map(Duration::from_secs);
        let run = registered.run(job.descriptor.data.clone());
        let task = tokio::spawn(
            async move {
                match deadline {
                    Some(deadline) => tokio::time::timeout(deadline, run).await,
                    None => Ok(run.await),
                }
            }
            .in_current_span(),
        );

        let error = match task.await {
            Ok(Ok(Ok(()))) => {
                debug!("job complete");
                if let Err(store_error) = self.service.acknowledge(job.id).await {
                    error!(%store_error, "failed to acknowledge job");
                }
                return;
            }
            Ok(Ok(Err(error))) => ExecutionError::failed(error),
            Ok(Err(_elapsed)) => ExecutionError::timed_out(deadline.unwrap_or_default()),
            Err(join_error) => ExecutionError::from(join_error),
        };
        self.settle_failure(job, error).await;
    }

    async fn settle_failure(&self, job: JobHandle, error: ExecutionError) {
        let outcome = match self.service.fail(job.id, &error.to_string()).await {
            Ok(outcome) => outcome,
            Err(store_error) => {
                // The lease will expire and the job will be reclaimed.
                error!(%store_error, "failed to record job failure");
                return;
            }
        };
        match outcome {
            FailOutcome::Retried { available_at } => {
                warn!(kind = error.kind.as_str(), %error, %available_at, "job failed, will be retried");
            }
            FailOutcome::Discarded => {
                error!(kind = error.kind.as_str(), %error, "job failed, dead lettered");
            }
        }

        // The hook runs on its own task so a panicking hook cannot take the
        // worker down with it.
        if let Ok(registered) = self.registry.resolve(&job.descriptor.job) {
            let hook = registered.on_failure(job.descriptor.data, error);
            if let Err(join_error) = tokio::spawn(hook.in_current_span()).await {
                error!(%join_error, "failure hook panicked");
            }
        }
    }
}

impl From<JoinError> for ExecutionError {
    fn from(value: JoinError) -> Self {
        let message = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(message),
            Err(_) => message,
        };
        Self {
            kind: ErrorKind::Panic,
            message,
        }
    }
}

#[cfg(target_os = "linux")]
fn rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * PAGE_BYTES)
}

#[cfg(not(target_os = "linux"))]
fn rss_bytes() -> Option<u64> {
    None
}
