//! Wall-clock arithmetic in the recipient's timezone.

use chrono::{DateTime, Days, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

/// First hour of the quiet window, inclusive.
pub const QUIET_HOURS_START: u32 = 22;
/// First hour after the quiet window.
pub const QUIET_HOURS_END: u32 = 6;

/// The hour of day `now` falls on in `tz`.
pub fn local_hour(now: DateTime<Utc>, tz: Tz) -> u32 {
    now.with_timezone(&tz).hour()
}

/// Whether `hour` lies in `[22:00, 06:00)`.
pub fn is_quiet_hour(hour: u32) -> bool {
    hour >= QUIET_HOURS_START || hour < QUIET_HOURS_END
}

/// A calendar day in the recipient's timezone, as a half-open UTC interval.
///
/// The interval follows the wall clock, so it is 23 or 25 hours long on days
/// with a DST transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalDay {
    /// The local calendar date.
    pub date: NaiveDate,
    /// First instant of the day.
    pub start: DateTime<Utc>,
    /// First instant of the next day.
    pub end: DateTime<Utc>,
}

impl LocalDay {
    /// The local day `now` falls on in `tz`.
    pub fn containing(now: DateTime<Utc>, tz: Tz) -> Self {
        let date = now.with_timezone(&tz).date_naive();
        let start = start_of_day(date, tz);
        let end = date
            .checked_add_days(Days::new(1))
            .map(|next| start_of_day(next, tz))
            .unwrap_or(start + Duration::days(1));

        Self { date, start, end }
    }

    /// Whether `instant` falls inside this day.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Length of the day on the wall clock.
    pub fn length(&self) -> Duration {
        self.end - self.start
    }
}

/// First instant of `date` in `tz`.
///
/// Midnight is ambiguous when clocks fall back across it (take the earlier
/// instant) and missing when they spring forward over it (take the first
/// minute that exists).
fn start_of_day(date: NaiveDate, tz: Tz) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);

    (0..=24 * 60)
        .map(|minute| midnight + Duration::minutes(minute))
        .find_map(|local| tz.from_local_datetime(&local).earliest())
        .map(|start| start.with_timezone(&Utc))
        .unwrap_or_else(|| midnight.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn quiet_window_is_half_open() {
        let quiet: Vec<u32> = (0..24).filter(|h| is_quiet_hour(*h)).collect();
        assert_eq!(quiet, vec![0, 1, 2, 3, 4, 5, 22, 23]);
    }

    #[test]
    fn local_hour_respects_half_hour_offsets() {
        // Kolkata is UTC+05:30 all year round.
        assert_eq!(local_hour(utc(2024, 6, 1, 16, 29), chrono_tz::Asia::Kolkata), 21);
        assert_eq!(local_hour(utc(2024, 6, 1, 16, 30), chrono_tz::Asia::Kolkata), 22);
    }

    #[test]
    fn ordinary_day_is_24_hours() {
        let day = LocalDay::containing(utc(2024, 6, 1, 20, 0), chrono_tz::America::Los_Angeles);
        assert_eq!(day.date, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        assert_eq!(day.start, utc(2024, 6, 1, 7, 0));
        assert_eq!(day.end, utc(2024, 6, 2, 7, 0));
        assert!(day.contains(utc(2024, 6, 2, 6, 59)));
        assert!(!day.contains(utc(2024, 6, 2, 7, 0)));
    }

    #[test]
    fn utc_evening_can_be_the_next_local_day() {
        let day = LocalDay::containing(utc(2024, 6, 1, 20, 0), chrono_tz::Asia::Kolkata);
        assert_eq!(day.date, NaiveDate::from_ymd_opt(2024, 6, 2).unwrap());
        assert_eq!(day.start, utc(2024, 6, 1, 18, 30));
    }

    #[test]
    fn spring_forward_day_is_23_hours() {
        let day = LocalDay::containing(utc(2024, 3, 10, 18, 0), chrono_tz::America::New_York);
        assert_eq!(day.start, utc(2024, 3, 10, 5, 0));
        assert_eq!(day.end, utc(2024, 3, 11, 4, 0));
        assert_eq!(day.length(), Duration::hours(23));
    }

    #[test]
    fn fall_back_day_is_25_hours() {
        let day = LocalDay::containing(utc(2024, 11, 3, 18, 0), chrono_tz::America::New_York);
        assert_eq!(day.start, utc(2024, 11, 3, 4, 0));
        assert_eq!(day.end, utc(2024, 11, 4, 5, 0));
        assert_eq!(day.length(), Duration::hours(25));
    }

    #[test]
    fn missing_midnight_starts_the_day_at_the_transition() {
        // Santiago springs forward at local midnight, so 2024-09-08 starts at 01:00.
        let day = LocalDay::containing(utc(2024, 9, 8, 15, 0), chrono_tz::America::Santiago);
        assert_eq!(day.date, NaiveDate::from_ymd_opt(2024, 9, 8).unwrap());
        assert_eq!(day.start, utc(2024, 9, 8, 4, 0));
        assert_eq!(day.end, utc(2024, 9, 9, 3, 0));
        assert_eq!(day.length(), Duration::hours(23));
    }
}
