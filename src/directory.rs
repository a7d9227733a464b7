//! Read-only lookups owned by other subsystems.

use crate::calendar::LocalDay;
use std::future::Future;

/// Snapshot of the user account fields a dispatch needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientProfile {
    /// The user.
    pub user_id: i64,
    /// Full display name, e.g. "Ada Lovelace".
    pub display_name: String,
    /// Phone number as entered by the user.
    pub contact_address: String,
    /// Whether the user agreed to receive text messages.
    pub opted_in: bool,
    /// IANA timezone identifier, e.g. "America/Los_Angeles".
    pub timezone: String,
}

/// Looks up recipients by user id.
pub trait RecipientDirectory: Send + Sync + 'static {
    /// Fetch the profile, or `None` if the user does not exist.
    fn find_recipient(
        &self,
        user_id: i64,
    ) -> impl Future<Output = anyhow::Result<Option<RecipientProfile>>> + Send;
}

/// Counts a user's open tasks.
pub trait TaskDirectory: Send + Sync + 'static {
    /// Number of not-yet-completed tasks due inside `day`.
    fn count_pending(
        &self,
        user_id: i64,
        day: &LocalDay,
    ) -> impl Future<Output = anyhow::Result<u32>> + Send;
}
