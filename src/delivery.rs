//! Hands a reserved message to the carrier and records what happened.

use crate::clock::Clock;
use crate::delivery_log::DeliveryLogStore;
use crate::errors::DispatchError;
use crate::schema::DeliveryLog;
use crate::telemetry;
use std::future::Future;
use std::time::Instant;
use tracing::{debug, warn};

/// What the carrier said about one send.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendReport {
    /// Whether the carrier accepted the message.
    pub success: bool,
    /// Carrier message id, used to match delivery receipts later.
    pub carrier_reference: Option<String>,
    /// Carrier specific error code.
    pub error_code: Option<String>,
    /// Human readable error.
    pub error_message: Option<String>,
}

impl SendReport {
    /// An accepted message.
    pub fn accepted(carrier_reference: impl Into<String>) -> Self {
        Self {
            success: true,
            carrier_reference: Some(carrier_reference.into()),
            ..Self::default()
        }
    }

    /// A refused or failed message.
    pub fn failed(error_code: Option<String>, error_message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_code,
            error_message: Some(error_message.into()),
            ..Self::default()
        }
    }
}

/// The outbound SMS capability.
///
/// Implementations report transport problems as a failed [`SendReport`]
/// instead of an error; the retry policy lives with the caller.
pub trait MessageSender: Send + Sync + 'static {
    /// Send `body` to the E.164 number `address`.
    fn send(&self, address: &str, body: &str) -> impl Future<Output = SendReport> + Send;
}

/// Send the message reserved in `record` and persist the outcome.
///
/// A failed send marks the record `failed` and comes back as
/// [`DispatchError::Delivery`]. A send that went out but could not be marked
/// `sent` comes back as [`DispatchError::Unrecorded`].
pub(crate) async fn deliver<L, M>(
    log: &L,
    sender: &M,
    clock: &dyn Clock,
    record: &DeliveryLog,
    address: &str,
) -> Result<DeliveryLog, DispatchError>
where
    L: DeliveryLogStore,
    M: MessageSender,
{
    let started = Instant::now();
    let report = sender.send(address, &record.body).await;
    telemetry::record_send(record.kind, started.elapsed(), report.success);

    if report.success {
        debug!(record.id = record.id, carrier_reference = ?report.carrier_reference, "Message accepted by carrier");
        return log
            .mark_sent(record.id, report.carrier_reference.as_deref(), clock.now())
            .await
            .map_err(|source| DispatchError::Unrecorded {
                record_id: record.id,
                carrier_reference: report.carrier_reference,
                source,
            });
    }

    let message = report
        .error_message
        .unwrap_or_else(|| "carrier reported a failure without a message".to_owned());
    let stored = match &report.error_code {
        Some(code) => format!("{code}: {message}"),
        None => message.clone(),
    };
    warn!(record.id = record.id, error.code = ?report.error_code, "Carrier rejected message: {message}");
    log.mark_failed(record.id, &stored).await?;

    Err(DispatchError::Delivery {
        record_id: record.id,
        code: report.error_code,
        message,
    })
}
