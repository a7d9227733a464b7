//! Business rules deciding whether a job should be skipped.
//!
//! Nothing in here touches storage: a skipped job leaves no delivery log
//! record behind, only a `nudges_skipped_total` counter increment.

use crate::calendar::{is_quiet_hour, local_hour};
use crate::directory::RecipientProfile;
use crate::errors::DispatchError;
use crate::job::MessageKind;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use regex::Regex;
use std::fmt;
use std::sync::LazyLock;

static E164: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"^\+[1-9][0-9]{7,14}$"));

/// Why a job ended without sending anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// The user does not exist (anymore).
    UserNotFound,
    /// The user did not agree to text messages.
    OptedOut,
    /// The phone number is not a valid E.164 number.
    InvalidAddress,
    /// It is between 22:00 and 06:00 where the user lives.
    QuietHours,
    /// Evening reminder with nothing left to do today.
    NoPendingItems,
    /// The same message was already committed to in the freshness window.
    AlreadySent,
}

impl SkipReason {
    /// Label value used for metrics and logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserNotFound => "user_not_found",
            Self::OptedOut => "opted_out",
            Self::InvalidAddress => "invalid_address",
            Self::QuietHours => "quiet_hours",
            Self::NoPendingItems => "no_pending_items",
            Self::AlreadySent => "already_sent",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recipient that passed the profile checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// The user.
    pub user_id: i64,
    /// Full display name.
    pub display_name: String,
    /// Canonical E.164 phone number.
    pub address: String,
    /// Parsed timezone.
    pub timezone: Tz,
}

/// Outcome of [`evaluate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Go ahead.
    Eligible(Candidate),
    /// Stop here, this is not an error.
    Skip(SkipReason),
}

/// Run the profile checks in order; the first failing one wins.
///
/// `quiet_hours_override` disables the quiet-hours check for manually
/// triggered sends. An unparseable timezone is a contract error rather than
/// a skip.
pub fn evaluate(
    profile: Option<&RecipientProfile>,
    now: DateTime<Utc>,
    quiet_hours_override: bool,
) -> Result<Verdict, DispatchError> {
    let Some(profile) = profile else {
        return Ok(Verdict::Skip(SkipReason::UserNotFound));
    };
    if !profile.opted_in {
        return Ok(Verdict::Skip(SkipReason::OptedOut));
    }
    let Some(address) = canonical_address(&profile.contact_address) else {
        return Ok(Verdict::Skip(SkipReason::InvalidAddress));
    };

    let timezone: Tz = profile
        .timezone
        .parse()
        .map_err(|_| DispatchError::UnknownTimezone {
            user_id: profile.user_id,
            timezone: profile.timezone.clone(),
        })?;

    if !quiet_hours_override && is_quiet_hour(local_hour(now, timezone)) {
        return Ok(Verdict::Skip(SkipReason::QuietHours));
    }

    Ok(Verdict::Eligible(Candidate {
        user_id: profile.user_id,
        display_name: profile.display_name.clone(),
        address,
        timezone,
    }))
}

/// The pending-items gate, which only applies to evening reminders.
pub fn check_pending(kind: MessageKind, pending: u32) -> Option<SkipReason> {
    match kind {
        MessageKind::EveningReminder if pending == 0 => Some(SkipReason::NoPendingItems),
        _ => None,
    }
}

/// Strip common separators and return the number if it is valid E.164.
pub fn canonical_address(raw: &str) -> Option<String> {
    let candidate: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();

    let pattern = E164.as_ref().ok()?;
    pattern.is_match(&candidate).then_some(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use claims::{assert_matches, assert_none, assert_some_eq};

    fn profile() -> RecipientProfile {
        RecipientProfile {
            user_id: 7,
            display_name: "Ada Lovelace".into(),
            contact_address: "+1 (415) 555-0100".into(),
            opted_in: true,
            timezone: "America/Los_Angeles".into(),
        }
    }

    fn local(tz: Tz, h: u32, m: u32) -> DateTime<Utc> {
        tz.with_ymd_and_hms(2024, 6, 3, h, m, 0)
            .single()
            .unwrap()
            .with_timezone(&Utc)
    }

    fn verdict_at(timezone: &str, now: DateTime<Utc>) -> Verdict {
        let profile = RecipientProfile {
            timezone: timezone.into(),
            ..profile()
        };
        evaluate(Some(&profile), now, false).unwrap()
    }

    #[test]
    fn missing_user_is_skipped() {
        assert_eq!(
            evaluate(None, Utc::now(), false).unwrap(),
            Verdict::Skip(SkipReason::UserNotFound)
        );
    }

    #[test]
    fn opt_out_wins_over_everything_else() {
        let profile = RecipientProfile {
            opted_in: false,
            contact_address: "not a number".into(),
            timezone: "Mars/Olympus_Mons".into(),
            ..profile()
        };
        assert_eq!(
            evaluate(Some(&profile), Utc::now(), false).unwrap(),
            Verdict::Skip(SkipReason::OptedOut)
        );
    }

    #[test]
    fn invalid_address_is_skipped_before_quiet_hours() {
        let profile = RecipientProfile {
            contact_address: "555-0100".into(),
            ..profile()
        };
        let midnight = local(chrono_tz::America::Los_Angeles, 0, 30);
        assert_eq!(
            evaluate(Some(&profile), midnight, false).unwrap(),
            Verdict::Skip(SkipReason::InvalidAddress)
        );
    }

    #[test]
    fn unknown_timezone_is_a_contract_error() {
        let profile = RecipientProfile {
            timezone: "Mars/Olympus_Mons".into(),
            ..profile()
        };
        let error = evaluate(Some(&profile), Utc::now(), false).unwrap_err();
        assert_matches!(error, DispatchError::UnknownTimezone { user_id: 7, .. });
        assert!(!error.is_retryable());
    }

    #[test]
    fn quiet_hour_boundaries() {
        for (name, tz) in [
            ("America/Los_Angeles", chrono_tz::America::Los_Angeles),
            ("Asia/Kolkata", chrono_tz::Asia::Kolkata),
            ("Australia/Adelaide", chrono_tz::Australia::Adelaide),
        ] {
            assert_matches!(verdict_at(name, local(tz, 21, 59)), Verdict::Eligible(_));
            assert_eq!(
                verdict_at(name, local(tz, 22, 0)),
                Verdict::Skip(SkipReason::QuietHours)
            );
            assert_eq!(
                verdict_at(name, local(tz, 5, 59)),
                Verdict::Skip(SkipReason::QuietHours)
            );
            assert_matches!(verdict_at(name, local(tz, 6, 0)), Verdict::Eligible(_));
        }
    }

    #[test]
    fn override_bypasses_quiet_hours() {
        let late = local(chrono_tz::America::Los_Angeles, 23, 15);
        let verdict = evaluate(Some(&profile()), late, true).unwrap();
        assert_matches!(verdict, Verdict::Eligible(candidate) if candidate.address == "+14155550100");
    }

    #[test]
    fn only_evening_reminders_need_pending_items() {
        assert_eq!(
            check_pending(MessageKind::EveningReminder, 0),
            Some(SkipReason::NoPendingItems)
        );
        assert_none!(check_pending(MessageKind::EveningReminder, 1));
        assert_none!(check_pending(MessageKind::MorningNudge, 0));
    }

    #[test]
    fn addresses_are_canonicalized() {
        assert_some_eq!(canonical_address(" +44 20 7946 0958 "), "+442079460958");
        assert_some_eq!(canonical_address("+1.415.555.0100"), "+14155550100");
        assert_none!(canonical_address(""));
        assert_none!(canonical_address("4155550100"));
        assert_none!(canonical_address("+0155550100"));
        assert_none!(canonical_address("+1415555abcd"));
        assert_none!(canonical_address("+1234567890123456"));
    }
}
