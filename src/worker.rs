use crate::delivery::MessageSender;
use crate::delivery_log::DeliveryLogStore;
use crate::directory::{RecipientDirectory, TaskDirectory};
use crate::dispatch::Dispatcher;
use crate::errors::{DispatchError, StorageError};
use crate::queue::JobQueue;
use crate::retry::{self, JobState};
use crate::telemetry;
use crate::util::{panic_message, with_sentry_transaction};
use futures_util::FutureExt;
use rand::Rng;
use sentry_core::{Hub, SentryFutureExt};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info_span, trace, warn};

pub(crate) struct Worker<Q, L, D, M> {
    pub(crate) queue: Arc<Q>,
    pub(crate) dispatcher: Arc<Dispatcher<L, D, M>>,
    pub(crate) shutdown_when_queue_empty: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) jitter: Duration,
}

impl<Q, L, D, M> Worker<Q, L, D, M>
where
    Q: JobQueue,
    L: DeliveryLogStore,
    D: RecipientDirectory + TaskDirectory,
    M: MessageSender,
{
    /// How long an idle worker waits before asking the queue again.
    ///
    /// Workers started together drift apart by up to `jitter`, so they do
    /// not all hit `notification_jobs` on the same tick.
    fn idle_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.poll_interval;
        }
        self.poll_interval + rand::thread_rng().gen_range(Duration::ZERO..=self.jitter)
    }

    /// Work through due notification jobs.
    ///
    /// Idle workers poll again after [`idle_delay`](Self::idle_delay). With
    /// `shutdown_when_queue_empty` the worker instead returns as soon as
    /// nothing is due; jobs still waiting out a backoff do not count.
    pub(crate) async fn run(&self) {
        loop {
            let idle = match self.run_next_job().await {
                Ok(Some(_)) => continue,
                Ok(None) if self.shutdown_when_queue_empty => {
                    debug!("Nothing due, stopping");
                    return;
                }
                Ok(None) => self.idle_delay(),
                Err(error) => {
                    // The lease, if any, went back to the queue with the failed transaction.
                    error!("Queue error, backing off: {error}");
                    self.idle_delay()
                }
            };
            trace!("Polling again in {idle:?}");
            sleep(idle).await;
        }
    }

    /// Run the next due job, if there is one.
    ///
    /// Returns:
    /// - `Ok(Some(job_id))` if a job was run
    /// - `Ok(None)` if no jobs were due
    /// - `Err(...)` if the queue could not be read or updated
    #[allow(clippy::cognitive_complexity)]
    pub(crate) async fn run_next_job(&self) -> Result<Option<i64>, StorageError> {
        let dispatcher = &self.dispatcher;

        trace!("Looking for next notification job…");

        let Some((job, lease)) = self.queue.reserve(dispatcher.now()).await? else {
            return Ok(None);
        };

        let job_id = job.id;
        let attempt = job.next_attempt();
        let span = info_span!("job", job.id = %job_id, job.attempt = attempt);

        debug!(parent: &span, "Running job…");

        let future = with_sentry_transaction("nudges.notification", || async {
            let notification = job.decode().map_err(DispatchError::MalformedJob)?;

            AssertUnwindSafe(dispatcher.dispatch(&notification, attempt, job.delivery_log_id))
                .catch_unwind()
                .await
                .map_err(|e| DispatchError::Panicked(panic_message(&*e)))
                .and_then(std::convert::identity)
        });

        let result = future
            .instrument(span.clone())
            .bind_hub(Hub::current())
            .await;

        let state = retry::next_state(attempt, &result);
        let kind = job.decode().ok().map(|notification| notification.kind);

        async {
            match state {
                JobState::Succeeded { record_id } => {
                    debug!(record.id = record_id, "Notification sent");
                    self.queue.complete(lease).await
                }
                JobState::Skipped(reason) => {
                    debug!(%reason, "Notification skipped");
                    self.queue.complete(lease).await
                }
                JobState::Retrying { delay, error } => {
                    warn!("Attempt {attempt} failed, retrying in {delay:?}: {error}");
                    let record_id = result
                        .as_ref()
                        .err()
                        .and_then(DispatchError::record_id)
                        .or(job.delivery_log_id);
                    let delay = chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::minutes(15));
                    let run_at = dispatcher.now() + delay;
                    self.queue.retry_at(lease, run_at, &error, record_id).await
                }
                JobState::FailedTerminal { error } => {
                    error!("Giving up after {attempt} attempts: {error}");
                    telemetry::record_terminal_failure(kind);
                    let unresolved = result
                        .as_ref()
                        .err()
                        .and_then(DispatchError::unresolved_record);
                    if let Some(record_id) = unresolved {
                        let marked = dispatcher.log().mark_failed(record_id, &error).await;
                        if let Err(mark_error) = marked {
                            warn!(
                                record.id = record_id,
                                "Failed to mark abandoned record as failed: {mark_error}"
                            );
                        }
                    }
                    self.queue.bury(lease, dispatcher.now(), &error).await
                }
                JobState::Rejected { error } => {
                    error!("Rejecting job without retry: {error}");
                    self.queue.bury(lease, dispatcher.now(), &error).await
                }
            }
        }
        .instrument(span)
        .await?;

        Ok(Some(job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDeliveryLog, MemoryQueue, ScriptedSender, StaticDirectory};

    type TestWorker = Worker<MemoryQueue, MemoryDeliveryLog, StaticDirectory, ScriptedSender>;

    fn worker(jitter: Duration) -> TestWorker {
        let dispatcher = Dispatcher::new(
            MemoryDeliveryLog::new(),
            StaticDirectory::new(),
            ScriptedSender::new(),
        );
        Worker {
            queue: Arc::new(MemoryQueue::new()),
            dispatcher: Arc::new(dispatcher),
            shutdown_when_queue_empty: false,
            poll_interval: Duration::from_millis(500),
            jitter,
        }
    }

    #[test]
    fn idle_delay_is_the_poll_interval_without_jitter() {
        assert_eq!(worker(Duration::ZERO).idle_delay(), Duration::from_millis(500));
    }

    #[test]
    fn idle_delay_stays_within_the_jitter_bound() {
        let worker = worker(Duration::from_millis(100));
        for _ in 0..200 {
            let delay = worker.idle_delay();
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(600));
        }
    }
}
