//! The job queue the scheduler writes to and the workers read from.

use crate::errors::{EnqueueError, StorageError};
use crate::job::NotificationJob;
use crate::schema::{ArchivedJob, QueuedJob};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::future::Future;
use tracing::instrument;

/// A queue of notification jobs with exclusive, lease-based consumption.
///
/// A reserved job belongs to exactly one worker until its lease is resolved
/// through [`complete`](Self::complete), [`retry_at`](Self::retry_at) or
/// [`bury`](Self::bury). A lease dropped without being resolved (e.g. the
/// worker crashed) makes the job available again with its attempt count
/// unchanged.
pub trait JobQueue: Send + Sync + 'static {
    /// Exclusive hold on a reserved job.
    type Lease: Send + 'static;

    /// Add a job that becomes runnable at `run_at`.
    fn enqueue(
        &self,
        job: &NotificationJob,
        run_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<i64, EnqueueError>> + Send;

    /// Add a job unless an identical one is already waiting for its first attempt.
    ///
    /// Returns the job ID if successfully enqueued, or None if deduplicated.
    fn enqueue_deduplicated(
        &self,
        job: &NotificationJob,
        run_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<i64>, EnqueueError>> + Send;

    /// Take the next job that is due at `now`, if any.
    fn reserve(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Option<(QueuedJob, Self::Lease)>, StorageError>> + Send;

    /// The job is done, successfully or skipped.
    fn complete(&self, lease: Self::Lease) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// The attempt failed; run the job again at `run_at`.
    fn retry_at(
        &self,
        lease: Self::Lease,
        run_at: DateTime<Utc>,
        error: &str,
        delivery_log_id: Option<i64>,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    /// The job failed for good. It stays in the queue for operators but is never run again.
    fn bury(
        &self,
        lease: Self::Lease,
        failed_at: DateTime<Utc>,
        error: &str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;
}

/// Lease on a `notification_jobs` row: the row lock of an open transaction.
pub struct PgLease {
    tx: Transaction<'static, Postgres>,
    job_id: i64,
}

impl std::fmt::Debug for PgLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgLease")
            .field("job_id", &self.job_id)
            .finish_non_exhaustive()
    }
}

/// [`JobQueue`] backed by the `notification_jobs` table.
#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    archive_completed_jobs: bool,
}

impl PgJobQueue {
    /// Create a queue on top of `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            archive_completed_jobs: false,
        }
    }

    /// Move finished jobs to `archived_notification_jobs` instead of deleting them.
    pub fn archive_completed_jobs(mut self, archive: bool) -> Self {
        self.archive_completed_jobs = archive;
        self
    }
}

impl JobQueue for PgJobQueue {
    type Lease = PgLease;

    #[instrument(name = "nudges.enqueue", skip(self), fields(user.id = job.user_id, kind = %job.kind))]
    async fn enqueue(&self, job: &NotificationJob, run_at: DateTime<Utc>) -> Result<i64, EnqueueError> {
        let data = serde_json::to_value(job)?;
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO notification_jobs (data, run_at) VALUES ($1, $2) RETURNING id",
        )
        .bind(data)
        .bind(run_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    #[instrument(name = "nudges.enqueue", skip(self), fields(user.id = job.user_id, kind = %job.kind))]
    async fn enqueue_deduplicated(
        &self,
        job: &NotificationJob,
        run_at: DateTime<Utc>,
    ) -> Result<Option<i64>, EnqueueError> {
        let data = serde_json::to_value(job)?;

        // Try to insert only if no similar job is waiting (and not locked)
        let id = sqlx::query_scalar::<_, i64>(
            r"
            INSERT INTO notification_jobs (data, run_at)
            SELECT $1, $2
            WHERE NOT EXISTS (
                SELECT 1 FROM notification_jobs
                WHERE data = $1 AND attempts = 0 AND failed_at IS NULL
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            ",
        )
        .bind(data)
        .bind(run_at)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    async fn reserve(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Option<(QueuedJob, PgLease)>, StorageError> {
        // The transaction holds the row lock for as long as the attempt runs.
        let mut tx = self.pool.begin().await?;

        let job = sqlx::query_as::<_, QueuedJob>(
            r"
            SELECT id, data, attempts, last_error, delivery_log_id, run_at, created_at, failed_at
            FROM notification_jobs
            WHERE failed_at IS NULL AND run_at <= $1
            ORDER BY run_at ASC, id ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            ",
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        match job {
            Some(job) => {
                let job_id = job.id;
                Ok(Some((job, PgLease { tx, job_id })))
            }
            None => {
                tx.rollback().await?;
                Ok(None)
            }
        }
    }

    async fn complete(&self, lease: PgLease) -> Result<(), StorageError> {
        let PgLease { mut tx, job_id } = lease;
        if self.archive_completed_jobs {
            archive_job(&mut tx, job_id).await?;
        } else {
            sqlx::query("DELETE FROM notification_jobs WHERE id = $1")
                .bind(job_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn retry_at(
        &self,
        lease: PgLease,
        run_at: DateTime<Utc>,
        error: &str,
        delivery_log_id: Option<i64>,
    ) -> Result<(), StorageError> {
        let PgLease { mut tx, job_id } = lease;
        sqlx::query(
            r"
            UPDATE notification_jobs
            SET attempts = attempts + 1,
                run_at = $2,
                last_error = $3,
                delivery_log_id = COALESCE($4, delivery_log_id)
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .bind(run_at)
        .bind(error)
        .bind(delivery_log_id)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn bury(&self, lease: PgLease, failed_at: DateTime<Utc>, error: &str) -> Result<(), StorageError> {
        let PgLease { mut tx, job_id } = lease;
        sqlx::query(
            r"
            UPDATE notification_jobs
            SET attempts = attempts + 1, failed_at = $2, last_error = $3
            WHERE id = $1
            ",
        )
        .bind(job_id)
        .bind(failed_at)
        .bind(error)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }
}

/// Moves a finished job from `notification_jobs` to `archived_notification_jobs`.
async fn archive_job(tx: &mut Transaction<'_, Postgres>, job_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query(
        r"
        INSERT INTO archived_notification_jobs
            (id, data, attempts, last_error, delivery_log_id, run_at, created_at, failed_at)
        SELECT id, data, attempts, last_error, delivery_log_id, run_at, created_at, failed_at
        FROM notification_jobs
        WHERE id = $1
        ",
    )
    .bind(job_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM notification_jobs WHERE id = $1")
        .bind(job_id)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

/// Jobs that failed terminally, most recent first.
pub async fn buried_jobs(pool: &PgPool, limit: i64) -> Result<Vec<QueuedJob>, sqlx::Error> {
    sqlx::query_as::<_, QueuedJob>(
        r"
        SELECT id, data, attempts, last_error, delivery_log_id, run_at, created_at, failed_at
        FROM notification_jobs
        WHERE failed_at IS NOT NULL
        ORDER BY failed_at DESC
        LIMIT $1
        ",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Archived jobs, most recently archived first.
pub async fn archived_jobs(pool: &PgPool, limit: Option<i64>) -> Result<Vec<ArchivedJob>, sqlx::Error> {
    let mut query = "SELECT id, data, attempts, last_error, delivery_log_id, run_at, created_at, \
                     failed_at, archived_at FROM archived_notification_jobs ORDER BY archived_at DESC"
        .to_string();

    if limit.is_some() {
        query.push_str(" LIMIT $1");
    }

    let mut query_builder = sqlx::query_as::<_, ArchivedJob>(&query);

    if let Some(limit_val) = limit {
        query_builder = query_builder.bind(limit_val);
    }

    query_builder.fetch_all(pool).await
}

/// The number of jobs that have failed at least once and are still waiting to run.
pub async fn retrying_job_count(pool: &PgPool) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM notification_jobs WHERE attempts > 0 AND failed_at IS NULL",
    )
    .fetch_one(pool)
    .await
}
