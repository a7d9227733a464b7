#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![forbid(unsafe_code)]

/// Wall-clock arithmetic in the recipient's timezone.
pub mod calendar;
mod clock;
mod compose;
mod config;
mod delivery;
/// The delivery log and the idempotency guard.
pub mod delivery_log;
mod directory;
mod dispatch;
/// Eligibility rules.
pub mod eligibility;
mod errors;
mod job;
/// In-memory backends and collaborators.
pub mod memory;
/// The job queue.
pub mod queue;
/// Retry policy.
pub mod retry;
mod runner;
/// Database schema definitions.
pub mod schema;
/// Metric names.
pub mod telemetry;
mod util;
mod worker;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::compose::{Composer, DEFAULT_APP_URL, Message, first_name};
pub use self::config::DispatchConfig;
pub use self::delivery::{MessageSender, SendReport};
pub use self::delivery_log::{DeliveryLogStore, PgDeliveryLog};
pub use self::directory::{RecipientDirectory, RecipientProfile, TaskDirectory};
pub use self::dispatch::{Dispatcher, Outcome};
pub use self::eligibility::SkipReason;
pub use self::errors::{ConfigError, DispatchError, EnqueueError, StorageError};
pub use self::job::{MessageKind, NotificationJob, UnknownMessageKind};
pub use self::queue::{JobQueue, PgJobQueue};
pub use self::runner::{DEFAULT_NUM_WORKERS, RunHandle, Runner};

/// Run the bundled migrations against `pool`.
pub async fn setup_database(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
