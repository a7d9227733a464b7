use crate::job::MessageKind;

/// Default base for app deep links.
pub const DEFAULT_APP_URL: &str = "nudges://";

/// A composed outbound text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Text as it will be sent, deep link included.
    pub body: String,
    /// The deep link embedded in the body.
    pub deep_link: String,
}

/// Builds message bodies from the two fixed templates.
#[derive(Debug, Clone)]
pub struct Composer {
    app_url: String,
}

impl Default for Composer {
    fn default() -> Self {
        Self::new(DEFAULT_APP_URL)
    }
}

impl Composer {
    /// Create a composer linking into the app at `app_url`.
    ///
    /// Paths are appended after a `/`, which is added if `app_url` lacks one.
    pub fn new(app_url: impl Into<String>) -> Self {
        let mut app_url = app_url.into();
        if !app_url.ends_with('/') {
            app_url.push('/');
        }
        Self { app_url }
    }

    /// Compose the text for `kind`.
    ///
    /// `pending` is only read for evening reminders.
    pub fn compose(&self, kind: MessageKind, display_name: &str, pending: Option<u32>) -> Message {
        let name = first_name(display_name);
        match kind {
            MessageKind::MorningNudge => {
                let deep_link = format!("{}today", self.app_url);
                let body = format!(
                    "Good morning, {name}! Your plan for today is ready. Take a look: {deep_link}"
                );
                Message { body, deep_link }
            }
            MessageKind::EveningReminder => {
                let pending = pending.unwrap_or(0);
                let noun = if pending == 1 { "task" } else { "tasks" };
                let deep_link = format!("{}today?pending_reminder=1", self.app_url);
                let body = format!(
                    "Hi {name}, you still have {pending} {noun} left for today. Finish strong: {deep_link}"
                );
                Message { body, deep_link }
            }
        }
    }
}

/// Everything before the first whitespace, or "there" for a blank name.
pub fn first_name(display_name: &str) -> &str {
    display_name.split_whitespace().next().unwrap_or("there")
}

#[cfg(test)]
mod tests {
    use super::*;
    use insta::assert_snapshot;

    #[test]
    fn first_name_is_the_first_token() {
        assert_eq!(first_name("Ada Lovelace"), "Ada");
        assert_eq!(first_name("Ada\tKing Lovelace"), "Ada");
        assert_eq!(first_name("Cher"), "Cher");
        assert_eq!(first_name("   "), "there");
    }

    #[test]
    fn morning_nudge() {
        let message = Composer::default().compose(MessageKind::MorningNudge, "Ada Lovelace", None);
        assert_eq!(message.deep_link, "nudges://today");
        assert_snapshot!(message.body, @"Good morning, Ada! Your plan for today is ready. Take a look: nudges://today");
    }

    #[test]
    fn evening_reminder_counts_tasks() {
        let composer = Composer::new("https://app.example.com/");

        let one = composer.compose(MessageKind::EveningReminder, "Grace Hopper", Some(1));
        assert_eq!(one.deep_link, "https://app.example.com/today?pending_reminder=1");
        assert_snapshot!(one.body, @"Hi Grace, you still have 1 task left for today. Finish strong: https://app.example.com/today?pending_reminder=1");

        let two = composer.compose(MessageKind::EveningReminder, "Grace Hopper", Some(2));
        assert_snapshot!(two.body, @"Hi Grace, you still have 2 tasks left for today. Finish strong: https://app.example.com/today?pending_reminder=1");
    }

    #[test]
    fn app_url_without_trailing_slash_gets_one() {
        let composer = Composer::new("https://app.example.com");
        let morning = composer.compose(MessageKind::MorningNudge, "Ada", None);
        assert_eq!(morning.deep_link, "https://app.example.com/today");

        let evening = composer.compose(MessageKind::EveningReminder, "Ada", Some(3));
        assert_eq!(evening.deep_link, "https://app.example.com/today?pending_reminder=1");

        let custom_scheme = Composer::new("nudges://");
        let morning = custom_scheme.compose(MessageKind::MorningNudge, "Ada", None);
        assert_eq!(morning.deep_link, "nudges://today");
    }
}
