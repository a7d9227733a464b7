/// Error type for job enqueueing operations.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    /// The job payload could not be serialized.
    #[error("Failed to serialize job: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// The database rejected the insert.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

/// Error type for the job queue and the delivery log.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Any error reported by the database driver.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// An update targeted a delivery log record that does not exist.
    #[error("Delivery log record {0} does not exist")]
    MissingRecord(i64),
}

/// Error type for a single dispatch attempt.
///
/// [`DispatchError::is_retryable`] decides whether the attempt counts
/// against the retry budget or ends the job right away.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The queued payload does not decode into a notification job.
    #[error("Malformed job payload: {0}")]
    MalformedJob(#[source] serde_json::Error),

    /// The recipient's profile names a timezone we do not know.
    #[error("Recipient {user_id} has an unknown timezone {timezone:?}")]
    UnknownTimezone {
        /// The recipient.
        user_id: i64,
        /// The identifier as stored on the profile.
        timezone: String,
    },

    /// The carrier refused or failed the message.
    #[error("Delivery of record {record_id} failed: {message}")]
    Delivery {
        /// Delivery log record that was marked failed.
        record_id: i64,
        /// Carrier error code, when one was reported.
        code: Option<String>,
        /// Human readable reason.
        message: String,
    },

    /// A recipient or task lookup failed.
    #[error("Collaborator lookup failed: {0:#}")]
    Lookup(anyhow::Error),

    /// The queue or the delivery log failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The attempt panicked.
    #[error("Dispatch panicked: {0}")]
    Panicked(String),

    /// Something broke between reserving a record and recording the send outcome.
    ///
    /// The record is still `queued`. The next attempt re-arms it; if there is
    /// none, the worker marks it `failed`.
    #[error("Attempt on delivery log record {record_id} was interrupted: {source}")]
    Interrupted {
        /// The record reserved by this attempt.
        record_id: i64,
        /// What went wrong.
        source: Box<DispatchError>,
    },

    /// The carrier accepted the message but the record could not be marked `sent`.
    ///
    /// The record stays `queued`, so it keeps vetoing resends in the freshness window.
    #[error("Message on delivery log record {record_id} was sent ({carrier_reference:?}) but not recorded: {source}")]
    Unrecorded {
        /// The record reserved by this attempt.
        record_id: i64,
        /// Carrier message id, for reconciling the record by hand.
        carrier_reference: Option<String>,
        /// Why the update failed.
        source: StorageError,
    },
}

impl DispatchError {
    /// Whether another attempt could succeed.
    ///
    /// Contract errors are final: a malformed payload or a broken profile
    /// stays broken no matter how often we retry it.
    ///
    /// A message the carrier already accepted is never retried either.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::MalformedJob(_) | Self::UnknownTimezone { .. } | Self::Unrecorded { .. }
        )
    }

    /// The delivery log record reserved by the failed attempt, if it got that far.
    pub fn record_id(&self) -> Option<i64> {
        match self {
            Self::Delivery { record_id, .. }
            | Self::Interrupted { record_id, .. }
            | Self::Unrecorded { record_id, .. } => Some(*record_id),
            _ => None,
        }
    }

    /// A record this failure left `queued` that nobody will resolve unless
    /// the job is retried.
    pub fn unresolved_record(&self) -> Option<i64> {
        match self {
            Self::Interrupted { record_id, .. } => Some(*record_id),
            _ => None,
        }
    }

    /// Attach the record reserved by this attempt, unless the error already carries one.
    pub(crate) fn on_record(self, record_id: i64) -> Self {
        match self.record_id() {
            Some(_) => self,
            None => Self::Interrupted {
                record_id,
                source: Box::new(self),
            },
        }
    }
}

/// Error type for [`DispatchConfig::from_env`](crate::DispatchConfig::from_env).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A variable is set but does not parse.
    #[error("{name} has an invalid value {value:?}: expected {expected}")]
    Invalid {
        /// The environment variable.
        name: &'static str,
        /// The raw value.
        value: String,
        /// What would have been accepted.
        expected: &'static str,
    },
}
