use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two kinds of text message we ever send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Sent in the morning, points the user at today's plan.
    MorningNudge,
    /// Sent in the evening when the user still has open tasks for today.
    EveningReminder,
}

impl MessageKind {
    /// Both kinds, in ordinal order.
    pub const ALL: [Self; 2] = [Self::MorningNudge, Self::EveningReminder];

    /// Stable storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MorningNudge => "morning_nudge",
            Self::EveningReminder => "evening_reminder",
        }
    }

    /// Stable small integer, used as the second half of the advisory lock key.
    pub fn ordinal(self) -> i32 {
        match self {
            Self::MorningNudge => 0,
            Self::EveningReminder => 1,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored message kind we do not recognize.
#[derive(Debug, thiserror::Error)]
#[error("Unknown message kind {0:?}")]
pub struct UnknownMessageKind(pub String);

impl FromStr for MessageKind {
    type Err = UnknownMessageKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownMessageKind(s.to_owned()))
    }
}

impl TryFrom<String> for MessageKind {
    type Error = UnknownMessageKind;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A scheduling trigger: "send this kind of message to this user".
///
/// This is the payload the external scheduler enqueues. The queue row around
/// it (see [`QueuedJob`](crate::schema::QueuedJob)) owns the attempt count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationJob {
    /// The recipient.
    pub user_id: i64,
    /// Which message to send.
    pub kind: MessageKind,
}

impl NotificationJob {
    /// Create a job for `user_id`.
    pub fn new(user_id: i64, kind: MessageKind) -> Self {
        Self { user_id, kind }
    }
}
