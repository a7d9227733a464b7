use crate::calendar::LocalDay;
use crate::clock::{Clock, SystemClock};
use crate::compose::Composer;
use crate::config::DispatchConfig;
use crate::delivery::{MessageSender, deliver};
use crate::delivery_log::{DeliveryLogStore, Reservation, Reserved};
use crate::directory::{RecipientDirectory, TaskDirectory};
use crate::eligibility::{self, SkipReason, Verdict};
use crate::errors::DispatchError;
use crate::job::{MessageKind, NotificationJob};
use crate::telemetry;
use crate::util::panic_message;
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, instrument};

/// How a successful attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The carrier accepted the message.
    Sent {
        /// The delivery log record, now `sent`.
        record_id: i64,
    },
    /// A business rule vetoed the send.
    Skipped(SkipReason),
}

/// Runs one attempt of a notification job through the whole pipeline:
/// eligibility, composition, the idempotency guard and delivery.
pub struct Dispatcher<L, D, M> {
    log: L,
    directory: D,
    sender: M,
    clock: Arc<dyn Clock>,
    composer: Composer,
    quiet_hours_override: bool,
}

impl<L, D, M> std::fmt::Debug for Dispatcher<L, D, M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("composer", &self.composer)
            .field("quiet_hours_override", &self.quiet_hours_override)
            .finish_non_exhaustive()
    }
}

impl<L, D, M> Dispatcher<L, D, M>
where
    L: DeliveryLogStore,
    D: RecipientDirectory + TaskDirectory,
    M: MessageSender,
{
    /// Create a dispatcher using the system clock and the default composer.
    pub fn new(log: L, directory: D, sender: M) -> Self {
        Self {
            log,
            directory,
            sender,
            clock: Arc::new(SystemClock),
            composer: Composer::default(),
            quiet_hours_override: false,
        }
    }

    /// Read the time from `clock` instead of the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use `composer` for message bodies.
    pub fn composer(mut self, composer: Composer) -> Self {
        self.composer = composer;
        self
    }

    /// Ignore quiet hours. Meant for manual or administrative triggers.
    pub fn quiet_hours_override(mut self, enabled: bool) -> Self {
        self.quiet_hours_override = enabled;
        self
    }

    /// Apply the quiet-hours override and the deep-link base from `config`.
    pub fn configure(self, config: &DispatchConfig) -> Self {
        self.quiet_hours_override(config.quiet_hours_override)
            .composer(Composer::new(config.app_url.clone()))
    }

    /// The delivery log this dispatcher writes to.
    pub fn log(&self) -> &L {
        &self.log
    }

    /// The recipient and task lookups.
    pub fn directory(&self) -> &D {
        &self.directory
    }

    /// The outbound SMS capability.
    pub fn sender(&self) -> &M {
        &self.sender
    }

    pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Run attempt number `attempt` of `job`.
    ///
    /// `existing` is the delivery log record of an earlier failed attempt,
    /// if there was one. Vetoes come back as [`Outcome::Skipped`]; only
    /// failures are errors.
    #[instrument(name = "nudges.dispatch", skip(self), fields(user.id = job.user_id, kind = %job.kind))]
    pub async fn dispatch(
        &self,
        job: &NotificationJob,
        attempt: u32,
        existing: Option<i64>,
    ) -> Result<Outcome, DispatchError> {
        let now = self.clock.now();

        let profile = self
            .directory
            .find_recipient(job.user_id)
            .await
            .map_err(DispatchError::Lookup)?;

        let candidate = match eligibility::evaluate(profile.as_ref(), now, self.quiet_hours_override)? {
            Verdict::Eligible(candidate) => candidate,
            Verdict::Skip(reason) => return Ok(skipped(reason)),
        };

        let pending = match job.kind {
            MessageKind::EveningReminder => {
                let today = LocalDay::containing(now, candidate.timezone);
                let pending = self
                    .directory
                    .count_pending(job.user_id, &today)
                    .await
                    .map_err(DispatchError::Lookup)?;
                if let Some(reason) = eligibility::check_pending(job.kind, pending) {
                    return Ok(skipped(reason));
                }
                Some(pending)
            }
            MessageKind::MorningNudge => None,
        };

        let message = self
            .composer
            .compose(job.kind, &candidate.display_name, pending);

        let reservation = Reservation {
            user_id: job.user_id,
            kind: job.kind,
            body: message.body,
            now,
            existing,
        };
        let record = match self.log.reserve(reservation).await? {
            Reserved::Accepted(record) => record,
            Reserved::Duplicate => return Ok(skipped(SkipReason::AlreadySent)),
        };
        debug!(record.id = record.id, "Reserved delivery log record");

        // From here on every error has to carry the record, or the retry
        // would mistake it for somebody else's live send.
        let delivered = AssertUnwindSafe(deliver(
            &self.log,
            &self.sender,
            self.clock.as_ref(),
            &record,
            &candidate.address,
        ))
        .catch_unwind()
        .await
        .map_err(|payload| DispatchError::Panicked(panic_message(&*payload)))
        .and_then(std::convert::identity);

        match delivered {
            Ok(sent) => Ok(Outcome::Sent { record_id: sent.id }),
            Err(error) => Err(error.on_record(record.id)),
        }
    }
}

fn skipped(reason: SkipReason) -> Outcome {
    debug!(%reason, "Skipping notification");
    telemetry::record_skip(reason);
    Outcome::Skipped(reason)
}
