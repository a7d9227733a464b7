//! The delivery log and the idempotency guard in front of it.

use crate::errors::StorageError;
use crate::job::MessageKind;
use crate::schema::{DeliveryLog, DeliveryStatus};
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use std::future::Future;
use tracing::{debug, instrument};

/// How far back the guard looks for an earlier send of the same message.
pub const FRESHNESS_WINDOW: Duration = Duration::hours(23);

/// A request to commit to one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    /// The recipient.
    pub user_id: i64,
    /// Which message.
    pub kind: MessageKind,
    /// The composed body to store on the record.
    pub body: String,
    /// Current time; the window ends here.
    pub now: DateTime<Utc>,
    /// Record left behind by an earlier failed attempt of the same job.
    ///
    /// When set, that record is re-armed instead of inserting a new one, so
    /// all attempts of a job accumulate on a single row.
    pub existing: Option<i64>,
}

impl Reservation {
    /// Oldest `created_at` that still counts as recent.
    pub fn window_start(&self) -> DateTime<Utc> {
        self.now - FRESHNESS_WINDOW
    }
}

/// Result of [`DeliveryLogStore::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reserved {
    /// This caller owns the send; the record is `queued`.
    Accepted(DeliveryLog),
    /// Someone else already committed to this message within the window.
    Duplicate,
}

/// Persistence for delivery log records.
///
/// `reserve` must be atomic with respect to every other `reserve` for the
/// same user and kind: concurrent callers wait for each other rather than
/// fail, and at most one of them is accepted per freshness window.
pub trait DeliveryLogStore: Send + Sync + 'static {
    /// Check for a live record in the window and, if there is none, commit to a send.
    fn reserve(
        &self,
        reservation: Reservation,
    ) -> impl Future<Output = Result<Reserved, StorageError>> + Send;

    /// The carrier accepted the message.
    fn mark_sent(
        &self,
        id: i64,
        carrier_reference: Option<&str>,
        sent_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<DeliveryLog, StorageError>> + Send;

    /// The send attempt failed. Overwrites any earlier error.
    fn mark_failed(
        &self,
        id: i64,
        error_message: &str,
    ) -> impl Future<Output = Result<DeliveryLog, StorageError>> + Send;

    /// A carrier delivery receipt arrived for `carrier_reference`.
    ///
    /// Returns `None` when no record carries that reference.
    fn mark_delivered(
        &self,
        carrier_reference: &str,
    ) -> impl Future<Output = Result<Option<DeliveryLog>, StorageError>> + Send;

    /// Fetch a single record.
    fn find(&self, id: i64) -> impl Future<Output = Result<Option<DeliveryLog>, StorageError>> + Send;

    /// Most recent records for a user, newest first.
    fn recent_for_user(
        &self,
        user_id: i64,
        limit: i64,
    ) -> impl Future<Output = Result<Vec<DeliveryLog>, StorageError>> + Send;
}

/// Key for `pg_advisory_xact_lock(int4, int4)`.
///
/// The user id is folded into 32 bits. Two users sharing a key only ever
/// serialize each other, they never see each other's records.
pub fn advisory_lock_key(user_id: i64, kind: MessageKind) -> (i32, i32) {
    #[allow(clippy::cast_possible_truncation)]
    let folded = (user_id ^ (user_id >> 32)) as i32;
    (folded, kind.ordinal())
}

const COLUMNS: &str =
    "id, user_id, kind, body, status, carrier_reference, error_message, created_at, sent_at";

/// [`DeliveryLogStore`] backed by the `delivery_logs` table.
#[derive(Debug, Clone)]
pub struct PgDeliveryLog {
    pool: PgPool,
}

impl PgDeliveryLog {
    /// Create a store on top of `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl DeliveryLogStore for PgDeliveryLog {
    #[instrument(name = "nudges.reserve", skip_all, fields(user.id = reservation.user_id, kind = %reservation.kind))]
    async fn reserve(&self, reservation: Reservation) -> Result<Reserved, StorageError> {
        let mut tx = self.pool.begin().await?;

        // Blocks until every other transaction holding this key has ended.
        let (key, ordinal) = advisory_lock_key(reservation.user_id, reservation.kind);
        sqlx::query("SELECT pg_advisory_xact_lock($1, $2)")
            .bind(key)
            .bind(ordinal)
            .execute(&mut *tx)
            .await?;

        if live_record_exists(&mut tx, &reservation).await? {
            debug!("Found a live delivery log record inside the freshness window");
            tx.rollback().await?;
            return Ok(Reserved::Duplicate);
        }

        let record = match reservation.existing {
            Some(id) => rearm_record(&mut tx, id, &reservation.body).await?,
            None => insert_record(&mut tx, &reservation).await?,
        };
        tx.commit().await?;

        Ok(Reserved::Accepted(record))
    }

    async fn mark_sent(
        &self,
        id: i64,
        carrier_reference: Option<&str>,
        sent_at: DateTime<Utc>,
    ) -> Result<DeliveryLog, StorageError> {
        let query = format!(
            "UPDATE delivery_logs SET status = $2, carrier_reference = $3, sent_at = $4 \
             WHERE id = $1 RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, DeliveryLog>(&query)
            .bind(id)
            .bind(DeliveryStatus::Sent.as_str())
            .bind(carrier_reference)
            .bind(sent_at)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::MissingRecord(id))
    }

    async fn mark_failed(&self, id: i64, error_message: &str) -> Result<DeliveryLog, StorageError> {
        let query = format!(
            "UPDATE delivery_logs SET status = $2, error_message = $3 \
             WHERE id = $1 RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, DeliveryLog>(&query)
            .bind(id)
            .bind(DeliveryStatus::Failed.as_str())
            .bind(error_message)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StorageError::MissingRecord(id))
    }

    async fn mark_delivered(
        &self,
        carrier_reference: &str,
    ) -> Result<Option<DeliveryLog>, StorageError> {
        let query = format!(
            "UPDATE delivery_logs SET status = $2 \
             WHERE carrier_reference = $1 AND status IN ('sent', 'delivered') \
             RETURNING {COLUMNS}"
        );
        Ok(sqlx::query_as::<_, DeliveryLog>(&query)
            .bind(carrier_reference)
            .bind(DeliveryStatus::Delivered.as_str())
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find(&self, id: i64) -> Result<Option<DeliveryLog>, StorageError> {
        let query = format!("SELECT {COLUMNS} FROM delivery_logs WHERE id = $1");
        Ok(sqlx::query_as::<_, DeliveryLog>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn recent_for_user(
        &self,
        user_id: i64,
        limit: i64,
    ) -> Result<Vec<DeliveryLog>, StorageError> {
        let query = format!(
            "SELECT {COLUMNS} FROM delivery_logs WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2"
        );
        Ok(sqlx::query_as::<_, DeliveryLog>(&query)
            .bind(user_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }
}

async fn live_record_exists(
    tx: &mut Transaction<'_, Postgres>,
    reservation: &Reservation,
) -> Result<bool, sqlx::Error> {
    let live: Vec<&str> = DeliveryStatus::LIVE.iter().map(|s| s.as_str()).collect();
    let found = sqlx::query_scalar::<_, i64>(
        r"
        SELECT id FROM delivery_logs
        WHERE user_id = $1
          AND kind = $2
          AND created_at >= $3
          AND status = ANY($4)
          AND ($5::BIGINT IS NULL OR id <> $5)
        LIMIT 1
        ",
    )
    .bind(reservation.user_id)
    .bind(reservation.kind.as_str())
    .bind(reservation.window_start())
    .bind(&live)
    .bind(reservation.existing)
    .fetch_optional(&mut **tx)
    .await?;

    Ok(found.is_some())
}

async fn insert_record(
    tx: &mut Transaction<'_, Postgres>,
    reservation: &Reservation,
) -> Result<DeliveryLog, sqlx::Error> {
    let query = format!(
        "INSERT INTO delivery_logs (user_id, kind, body, status, created_at) \
         VALUES ($1, $2, $3, $4, $5) RETURNING {COLUMNS}"
    );
    sqlx::query_as::<_, DeliveryLog>(&query)
        .bind(reservation.user_id)
        .bind(reservation.kind.as_str())
        .bind(&reservation.body)
        .bind(DeliveryStatus::Queued.as_str())
        .bind(reservation.now)
        .fetch_one(&mut **tx)
        .await
}

/// Puts the record of an earlier failed attempt back into `queued`.
///
/// The previous error message stays until the next outcome overwrites it.
async fn rearm_record(
    tx: &mut Transaction<'_, Postgres>,
    id: i64,
    body: &str,
) -> Result<DeliveryLog, StorageError> {
    let query = format!(
        "UPDATE delivery_logs SET status = $2, body = $3 WHERE id = $1 RETURNING {COLUMNS}"
    );
    sqlx::query_as::<_, DeliveryLog>(&query)
        .bind(id)
        .bind(DeliveryStatus::Queued.as_str())
        .bind(body)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(StorageError::MissingRecord(id))
}
