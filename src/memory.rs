//! In-memory implementations of the queue, the delivery log and the
//! collaborators, for tests and local runs without PostgreSQL.

use crate::calendar::LocalDay;
use crate::delivery::{MessageSender, SendReport};
use crate::delivery_log::{DeliveryLogStore, Reservation, Reserved};
use crate::directory::{RecipientDirectory, RecipientProfile, TaskDirectory};
use crate::errors::{EnqueueError, StorageError};
use crate::job::NotificationJob;
use crate::queue::JobQueue;
use crate::schema::{DeliveryLog, DeliveryStatus, QueuedJob};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct QueueState {
    last_id: i64,
    jobs: BTreeMap<i64, QueuedJob>,
    in_flight: HashSet<i64>,
    completed: Vec<QueuedJob>,
}

/// [`JobQueue`] kept in process memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryQueue {
    state: Arc<Mutex<QueueState>>,
}

/// Lease on a [`MemoryQueue`] job. Dropping it releases the job.
#[derive(Debug)]
pub struct MemoryLease {
    state: Arc<Mutex<QueueState>>,
    job_id: i64,
}

impl Drop for MemoryLease {
    fn drop(&mut self) {
        lock(&self.state).in_flight.remove(&self.job_id);
    }
}

impl MemoryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a raw payload, bypassing serialization.
    pub fn enqueue_raw(&self, data: serde_json::Value, run_at: DateTime<Utc>) -> i64 {
        let mut state = lock(&self.state);
        state.last_id += 1;
        let id = state.last_id;
        state.jobs.insert(
            id,
            QueuedJob {
                id,
                data,
                attempts: 0,
                last_error: None,
                delivery_log_id: None,
                run_at,
                created_at: run_at,
                failed_at: None,
            },
        );
        id
    }

    /// Jobs that will still run, in id order.
    pub fn pending(&self) -> Vec<QueuedJob> {
        lock(&self.state)
            .jobs
            .values()
            .filter(|job| job.failed_at.is_none())
            .cloned()
            .collect()
    }

    /// Jobs that failed for good.
    pub fn buried(&self) -> Vec<QueuedJob> {
        lock(&self.state)
            .jobs
            .values()
            .filter(|job| job.failed_at.is_some())
            .cloned()
            .collect()
    }

    /// Jobs that were completed, in completion order.
    pub fn completed(&self) -> Vec<QueuedJob> {
        lock(&self.state).completed.clone()
    }

    fn update(&self, job_id: i64, f: impl FnOnce(&mut QueuedJob)) {
        if let Some(job) = lock(&self.state).jobs.get_mut(&job_id) {
            f(job);
        }
    }
}

impl JobQueue for MemoryQueue {
    type Lease = MemoryLease;

    async fn enqueue(&self, job: &NotificationJob, run_at: DateTime<Utc>) -> Result<i64, EnqueueError> {
        let data = serde_json::to_value(job)?;
        Ok(self.enqueue_raw(data, run_at))
    }

    async fn enqueue_deduplicated(
        &self,
        job: &NotificationJob,
        run_at: DateTime<Utc>,
    ) -> Result<Option<i64>, EnqueueError> {
        let data = serde_json::to_value(job)?;
        {
            let state = lock(&self.state);
            let waiting = state.jobs.values().any(|queued| {
                queued.data == data
                    && queued.attempts == 0
                    && queued.failed_at.is_none()
                    && !state.in_flight.contains(&queued.id)
            });
            if waiting {
                return Ok(None);
            }
        }
        Ok(Some(self.enqueue_raw(data, run_at)))
    }

    async fn reserve(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<(QueuedJob, MemoryLease)>, StorageError> {
        let mut state = lock(&self.state);
        let next = state
            .jobs
            .values()
            .filter(|job| {
                job.failed_at.is_none() && job.run_at <= now && !state.in_flight.contains(&job.id)
            })
            .min_by_key(|job| (job.run_at, job.id))
            .cloned();

        let Some(job) = next else {
            return Ok(None);
        };
        state.in_flight.insert(job.id);
        let lease = MemoryLease {
            state: self.state.clone(),
            job_id: job.id,
        };
        Ok(Some((job, lease)))
    }

    async fn complete(&self, lease: MemoryLease) -> Result<(), StorageError> {
        let mut state = lock(&self.state);
        if let Some(job) = state.jobs.remove(&lease.job_id) {
            state.completed.push(job);
        }
        Ok(())
    }

    async fn retry_at(
        &self,
        lease: MemoryLease,
        run_at: DateTime<Utc>,
        error: &str,
        delivery_log_id: Option<i64>,
    ) -> Result<(), StorageError> {
        self.update(lease.job_id, |job| {
            job.attempts += 1;
            job.run_at = run_at;
            job.last_error = Some(error.to_owned());
            job.delivery_log_id = delivery_log_id.or(job.delivery_log_id);
        });
        Ok(())
    }

    async fn bury(&self, lease: MemoryLease, failed_at: DateTime<Utc>, error: &str) -> Result<(), StorageError> {
        self.update(lease.job_id, |job| {
            job.attempts += 1;
            job.failed_at = Some(failed_at);
            job.last_error = Some(error.to_owned());
        });
        Ok(())
    }
}

/// [`DeliveryLogStore`] kept in process memory.
///
/// A single async mutex stands in for the advisory lock: it is held from the
/// freshness check until the record is written.
#[derive(Debug, Default)]
pub struct MemoryDeliveryLog {
    records: tokio::sync::Mutex<Vec<DeliveryLog>>,
}

impl MemoryDeliveryLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record, in insertion order.
    pub async fn records(&self) -> Vec<DeliveryLog> {
        self.records.lock().await.clone()
    }

    async fn update(
        &self,
        id: i64,
        f: impl FnOnce(&mut DeliveryLog),
    ) -> Result<DeliveryLog, StorageError> {
        let mut records = self.records.lock().await;
        let record = records
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or(StorageError::MissingRecord(id))?;
        f(record);
        Ok(record.clone())
    }
}

impl DeliveryLogStore for MemoryDeliveryLog {
    async fn reserve(&self, reservation: Reservation) -> Result<Reserved, StorageError> {
        let mut records = self.records.lock().await;
        let window_start = reservation.window_start();

        let live = records.iter().any(|record| {
            record.user_id == reservation.user_id
                && record.kind == reservation.kind
                && record.created_at >= window_start
                && record.status.is_live()
                && Some(record.id) != reservation.existing
        });
        if live {
            return Ok(Reserved::Duplicate);
        }

        if let Some(id) = reservation.existing {
            let record = records
                .iter_mut()
                .find(|record| record.id == id)
                .ok_or(StorageError::MissingRecord(id))?;
            record.status = DeliveryStatus::Queued;
            record.body = reservation.body;
            return Ok(Reserved::Accepted(record.clone()));
        }

        let id = records.last().map_or(1, |record| record.id + 1);
        let record = DeliveryLog {
            id,
            user_id: reservation.user_id,
            kind: reservation.kind,
            body: reservation.body,
            status: DeliveryStatus::Queued,
            carrier_reference: None,
            error_message: None,
            created_at: reservation.now,
            sent_at: None,
        };
        records.push(record.clone());
        Ok(Reserved::Accepted(record))
    }

    async fn mark_sent(
        &self,
        id: i64,
        carrier_reference: Option<&str>,
        sent_at: DateTime<Utc>,
    ) -> Result<DeliveryLog, StorageError> {
        self.update(id, |record| {
            record.status = DeliveryStatus::Sent;
            record.carrier_reference = carrier_reference.map(str::to_owned);
            record.sent_at = Some(sent_at);
        })
        .await
    }

    async fn mark_failed(&self, id: i64, error_message: &str) -> Result<DeliveryLog, StorageError> {
        self.update(id, |record| {
            record.status = DeliveryStatus::Failed;
            record.error_message = Some(error_message.to_owned());
        })
        .await
    }

    async fn mark_delivered(
        &self,
        carrier_reference: &str,
    ) -> Result<Option<DeliveryLog>, StorageError> {
        let mut records = self.records.lock().await;
        let record = records.iter_mut().find(|record| {
            record.carrier_reference.as_deref() == Some(carrier_reference)
                && matches!(record.status, DeliveryStatus::Sent | DeliveryStatus::Delivered)
        });
        Ok(record.map(|record| {
            record.status = DeliveryStatus::Delivered;
            record.clone()
        }))
    }

    async fn find(&self, id: i64) -> Result<Option<DeliveryLog>, StorageError> {
        let records = self.records.lock().await;
        Ok(records.iter().find(|record| record.id == id).cloned())
    }

    async fn recent_for_user(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<DeliveryLog>, StorageError> {
        let records = self.records.lock().await;
        let mut recent: Vec<DeliveryLog> = records
            .iter()
            .filter(|record| record.user_id == user_id)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        recent.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(recent)
    }
}

/// Recipient and task lookups backed by plain maps.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    recipients: Mutex<HashMap<i64, RecipientProfile>>,
    pending: Mutex<HashMap<i64, u32>>,
    pending_lookups: Mutex<Vec<(i64, LocalDay)>>,
}

impl StaticDirectory {
    /// Create an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a recipient.
    pub fn with_recipient(self, profile: RecipientProfile) -> Self {
        self.insert(profile);
        self
    }

    /// Set the pending task count for `user_id`.
    pub fn with_pending(self, user_id: i64, pending: u32) -> Self {
        self.set_pending(user_id, pending);
        self
    }

    /// Add or replace a recipient.
    pub fn insert(&self, profile: RecipientProfile) {
        lock(&self.recipients).insert(profile.user_id, profile);
    }

    /// Set the pending task count for `user_id`.
    pub fn set_pending(&self, user_id: i64, pending: u32) {
        lock(&self.pending).insert(user_id, pending);
    }

    /// Every `count_pending` call so far, with the day it asked about.
    pub fn pending_lookups(&self) -> Vec<(i64, LocalDay)> {
        lock(&self.pending_lookups).clone()
    }
}

impl RecipientDirectory for StaticDirectory {
    async fn find_recipient(&self, user_id: i64) -> anyhow::Result<Option<RecipientProfile>> {
        Ok(lock(&self.recipients).get(&user_id).cloned())
    }
}

impl TaskDirectory for StaticDirectory {
    async fn count_pending(&self, user_id: i64, day: &LocalDay) -> anyhow::Result<u32> {
        lock(&self.pending_lookups).push((user_id, *day));
        Ok(lock(&self.pending).get(&user_id).copied().unwrap_or(0))
    }
}

/// One message handed to a [`ScriptedSender`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    /// Destination number.
    pub address: String,
    /// Text.
    pub body: String,
}

/// [`MessageSender`] that replays scripted reports and records every call.
///
/// Scripted replies are used first; once they run out every send gets the
/// fallback report, which by default accepts the message.
#[derive(Debug, Default)]
pub struct ScriptedSender {
    replies: Mutex<VecDeque<SendReport>>,
    fallback: Mutex<Option<SendReport>>,
    calls: Mutex<Vec<SentMessage>>,
}

impl ScriptedSender {
    /// A sender that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue up replies for the next sends.
    pub fn with_replies(self, replies: impl IntoIterator<Item = SendReport>) -> Self {
        lock(&self.replies).extend(replies);
        self
    }

    /// Answer every unscripted send with `report`.
    pub fn always(self, report: SendReport) -> Self {
        *lock(&self.fallback) = Some(report);
        self
    }

    /// Every message sent so far.
    pub fn calls(&self) -> Vec<SentMessage> {
        lock(&self.calls).clone()
    }
}

impl MessageSender for ScriptedSender {
    async fn send(&self, address: &str, body: &str) -> SendReport {
        let sequence = {
            let mut calls = lock(&self.calls);
            calls.push(SentMessage {
                address: address.to_owned(),
                body: body.to_owned(),
            });
            calls.len()
        };

        if let Some(report) = lock(&self.replies).pop_front() {
            return report;
        }
        lock(&self.fallback)
            .clone()
            .unwrap_or_else(|| SendReport::accepted(format!("SM{sequence:06}")))
    }
}
