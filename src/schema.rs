//! Database schema definitions for SQLx.
//!
//! This module contains the row types for the notification job queue and the
//! delivery log.

use crate::job::{MessageKind, NotificationJob};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Represents a notification job record in the queue
#[derive(Debug, Clone, FromRow)]
pub struct QueuedJob {
    /// Unique identifier for the job
    pub id: i64,
    /// JSON payload, expected to decode into a [`NotificationJob`]
    pub data: Value,
    /// Number of attempts that already ran and failed
    pub attempts: i32,
    /// Error reported by the most recent failed attempt
    pub last_error: Option<String>,
    /// Delivery log record created by an earlier attempt of this job
    pub delivery_log_id: Option<i64>,
    /// Earliest time the job may run
    pub run_at: DateTime<Utc>,
    /// Timestamp when the job was created
    pub created_at: DateTime<Utc>,
    /// Set once the job has failed terminally
    pub failed_at: Option<DateTime<Utc>>,
}

impl QueuedJob {
    /// Decode the payload.
    pub fn decode(&self) -> Result<NotificationJob, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }

    /// The 1-based number of the attempt that is about to run.
    pub fn next_attempt(&self) -> u32 {
        u32::try_from(self.attempts).unwrap_or(0) + 1
    }
}

/// Represents an archived job record in the database
#[derive(Debug, Clone, FromRow)]
pub struct ArchivedJob {
    /// The original queue row
    #[sqlx(flatten)]
    pub job: QueuedJob,
    /// Timestamp when the job was archived
    pub archived_at: DateTime<Utc>,
}

/// Where a delivery log record stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryStatus {
    /// Reserved by the idempotency guard, send not yet resolved.
    Queued,
    /// Accepted by the carrier.
    Sent,
    /// The carrier confirmed delivery to the handset.
    Delivered,
    /// The most recent send attempt failed.
    Failed,
}

impl DeliveryStatus {
    /// Statuses that block another send inside the freshness window.
    pub const LIVE: [Self; 3] = [Self::Queued, Self::Sent, Self::Delivered];

    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    /// Whether a record in this status counts as "already sent".
    pub fn is_live(self) -> bool {
        Self::LIVE.contains(&self)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored delivery status we do not recognize.
#[derive(Debug, thiserror::Error)]
#[error("Unknown delivery status {0:?}")]
pub struct UnknownDeliveryStatus(pub String);

impl FromStr for DeliveryStatus {
    type Err = UnknownDeliveryStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "sent" => Ok(Self::Sent),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownDeliveryStatus(other.to_owned())),
        }
    }
}

impl TryFrom<String> for DeliveryStatus {
    type Error = UnknownDeliveryStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Audit and idempotency record for one committed send.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct DeliveryLog {
    /// Unique identifier
    pub id: i64,
    /// The recipient
    pub user_id: i64,
    /// Which message this is
    #[sqlx(try_from = "String")]
    pub kind: MessageKind,
    /// The composed text, deep link included
    pub body: String,
    /// Current status
    #[sqlx(try_from = "String")]
    pub status: DeliveryStatus,
    /// Message id assigned by the carrier
    pub carrier_reference: Option<String>,
    /// Error of the most recent failed attempt
    pub error_message: Option<String>,
    /// When the guard accepted the send
    pub created_at: DateTime<Utc>,
    /// When the carrier accepted the message
    pub sent_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failed_records_do_not_block_a_resend() {
        assert!(DeliveryStatus::Queued.is_live());
        assert!(DeliveryStatus::Sent.is_live());
        assert!(DeliveryStatus::Delivered.is_live());
        assert!(!DeliveryStatus::Failed.is_live());
    }

    #[test]
    fn attempts_are_counted_from_one() {
        let now = Utc::now();
        let mut job = QueuedJob {
            id: 1,
            data: json!({ "user_id": 7, "kind": "morning_nudge" }),
            attempts: 0,
            last_error: None,
            delivery_log_id: None,
            run_at: now,
            created_at: now,
            failed_at: None,
        };
        assert_eq!(job.next_attempt(), 1);
        assert_eq!(
            job.decode().unwrap(),
            NotificationJob::new(7, MessageKind::MorningNudge)
        );

        job.attempts = 3;
        assert_eq!(job.next_attempt(), 4);

        job.data = json!({ "user": 7 });
        assert!(job.decode().is_err());
    }
}
