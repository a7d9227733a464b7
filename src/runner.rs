use crate::config::DispatchConfig;
use crate::delivery::MessageSender;
use crate::delivery_log::DeliveryLogStore;
use crate::directory::{RecipientDirectory, TaskDirectory};
use crate::dispatch::Dispatcher;
use crate::queue::JobQueue;
use crate::worker::Worker;
use futures_util::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

/// Default number of jobs a process works on at the same time.
pub const DEFAULT_NUM_WORKERS: usize = 5;
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_JITTER: Duration = Duration::from_millis(100);

/// The core runner responsible for pulling jobs off the queue and dispatching them
pub struct Runner<Q, L, D, M> {
    queue: Arc<Q>,
    dispatcher: Arc<Dispatcher<L, D, M>>,
    num_workers: usize,
    poll_interval: Duration,
    jitter: Duration,
    shutdown_when_queue_empty: bool,
}

impl<Q, L, D, M> std::fmt::Debug for Runner<Q, L, D, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("num_workers", &self.num_workers)
            .field("poll_interval", &self.poll_interval)
            .field("jitter", &self.jitter)
            .field("shutdown_when_queue_empty", &self.shutdown_when_queue_empty)
            .finish_non_exhaustive()
    }
}

impl<Q, L, D, M> Runner<Q, L, D, M>
where
    Q: JobQueue,
    L: DeliveryLogStore,
    D: RecipientDirectory + TaskDirectory,
    M: MessageSender,
{
    /// Create a new runner pulling from `queue` and dispatching through `dispatcher`.
    pub fn new(queue: Arc<Q>, dispatcher: Arc<Dispatcher<L, D, M>>) -> Self {
        Self {
            queue,
            dispatcher,
            num_workers: DEFAULT_NUM_WORKERS,
            poll_interval: DEFAULT_POLL_INTERVAL,
            jitter: DEFAULT_JITTER,
            shutdown_when_queue_empty: false,
        }
    }

    /// Apply the worker settings from `config`.
    pub fn configure(self, config: &DispatchConfig) -> Self {
        self.num_workers(config.num_workers)
            .poll_interval(config.poll_interval)
            .jitter(config.jitter)
    }

    /// Set the number of jobs processed concurrently.
    pub fn num_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    /// Set how often idle workers poll for due jobs.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Upper bound of the random delay added to each idle poll (`NUDGES_POLL_JITTER_MS`).
    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set the runner to shut down once no job is due.
    ///
    /// Jobs waiting out a retry backoff do not keep the runner alive.
    pub fn shutdown_when_queue_empty(mut self) -> Self {
        self.shutdown_when_queue_empty = true;
        self
    }

    /// Spawn `num_workers` tasks on the current tokio runtime.
    ///
    /// Each task holds at most one job lease at a time, so this is also the
    /// number of notifications in flight.
    pub fn start(&self) -> RunHandle {
        let handles = (1..=self.num_workers)
            .map(|i| {
                let name = format!("notification-worker-{i}");
                info!(worker.name = %name, "Starting worker…");

                let worker = Worker {
                    queue: self.queue.clone(),
                    dispatcher: self.dispatcher.clone(),
                    shutdown_when_queue_empty: self.shutdown_when_queue_empty,
                    poll_interval: self.poll_interval,
                    jitter: self.jitter,
                };

                let span = info_span!("worker", worker.name = %name);
                tokio::spawn(async move { worker.run().instrument(span).await })
            })
            .collect();

        RunHandle { workers: handles }
    }
}

/// The spawned workers of a [`Runner`].
///
/// Dropping the handle detaches the workers; they keep running.
#[derive(Debug)]
pub struct RunHandle {
    workers: Vec<JoinHandle<()>>,
}

impl RunHandle {
    /// Wait until every worker has returned.
    ///
    /// Workers only return on their own with
    /// [`shutdown_when_queue_empty`](Runner::shutdown_when_queue_empty).
    pub async fn wait_for_shutdown(self) {
        for (index, outcome) in join_all(self.workers).await.into_iter().enumerate() {
            if let Err(error) = outcome {
                warn!(worker.name = %format!("notification-worker-{}", index + 1), %error, "Worker task ended abnormally");
            }
        }
    }
}
