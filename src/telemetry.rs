//! Metric names and the helpers that record them.
//!
//! Only the `metrics` facade is used here; installing a recorder (Prometheus,
//! StatsD, ...) is up to the application.

use crate::eligibility::SkipReason;
use crate::job::MessageKind;
use metrics::{counter, histogram};
use std::time::Duration;

/// Jobs that ended without sending, labelled by `reason`.
pub const SKIPPED_TOTAL: &str = "nudges_skipped_total";
/// Messages accepted by the carrier, labelled by `kind`.
pub const SENT_TOTAL: &str = "nudges_sent_total";
/// Send attempts the carrier rejected, labelled by `kind`.
pub const SEND_FAILED_TOTAL: &str = "nudges_send_failed_total";
/// Time spent inside the send capability, labelled by `kind`.
pub const SEND_DURATION_SECONDS: &str = "nudges_send_duration_seconds";
/// Jobs that exhausted their retries, labelled by `kind`.
pub const TERMINAL_FAILURES_TOTAL: &str = "nudges_terminal_failures_total";

pub(crate) fn record_skip(reason: SkipReason) {
    counter!(SKIPPED_TOTAL, "reason" => reason.as_str()).increment(1);
}

pub(crate) fn record_send(kind: MessageKind, elapsed: Duration, success: bool) {
    histogram!(SEND_DURATION_SECONDS, "kind" => kind.as_str()).record(elapsed.as_secs_f64());
    if success {
        counter!(SENT_TOTAL, "kind" => kind.as_str()).increment(1);
    } else {
        counter!(SEND_FAILED_TOTAL, "kind" => kind.as_str()).increment(1);
    }
}

pub(crate) fn record_terminal_failure(kind: Option<MessageKind>) {
    let kind = kind.map_or("unknown", MessageKind::as_str);
    counter!(TERMINAL_FAILURES_TOTAL, "kind" => kind).increment(1);
}
