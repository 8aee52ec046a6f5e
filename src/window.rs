//! Calendar-window classification.
//!
//! Every timestamp is first projected onto a calendar day in a single reference
//! timezone, then onto the window (week) that day belongs to. Working on calendar
//! days rather than raw offsets keeps keys stable across DST transitions.

use std::fmt;

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc, Weekday};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{Result, SyncError};

/// Source of "now" for everything that classifies against the current window.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Identifies one window: the calendar date of its first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct WindowKey(NaiveDate);

impl WindowKey {
    pub fn start(&self) -> NaiveDate {
        self.0
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

const WINDOW_DAYS: u64 = 7;

/// Maps timestamps to calendar days and week-long windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowClassifier {
    anchor: Weekday,
    tz: Tz,
}

impl Default for WindowClassifier {
    fn default() -> Self {
        Self::new(Weekday::Mon, Tz::UTC)
    }
}

impl WindowClassifier {
    pub fn new(anchor: Weekday, tz: Tz) -> Self {
        Self { anchor, tz }
    }

    pub fn anchor(&self) -> Weekday {
        self.anchor
    }

    pub fn timezone(&self) -> Tz {
        self.tz
    }

    /// Calendar day of `ts` in the reference timezone.
    pub fn day_key(&self, ts: DateTime<Utc>) -> NaiveDate {
        ts.with_timezone(&self.tz).date_naive()
    }

    pub fn window_key(&self, ts: DateTime<Utc>) -> WindowKey {
        self.window_for_day(self.day_key(ts))
    }

    pub fn window_for_day(&self, day: NaiveDate) -> WindowKey {
        let offset = (day.weekday().num_days_from_monday() + 7
            - self.anchor.num_days_from_monday())
            % 7;
        // Only unrepresentable dates near NaiveDate::MIN can fail here.
        let start = day
            .checked_sub_days(Days::new(u64::from(offset)))
            .unwrap_or(day);
        WindowKey(start)
    }

    pub fn same_window(&self, a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        self.window_key(a) == self.window_key(b)
    }

    /// Whether `ts` falls in the window containing `now`.
    pub fn is_current(&self, ts: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.same_window(ts, now)
    }

    /// Half-open `[first_day, first_day_of_next_window)` date range.
    pub fn window_bounds(&self, key: WindowKey) -> (NaiveDate, NaiveDate) {
        let end = key
            .0
            .checked_add_days(Days::new(WINDOW_DAYS))
            .unwrap_or(NaiveDate::MAX);
        (key.0, end)
    }
}

/// Parse a weekday name such as `monday` or `Sun`.
pub fn parse_weekday(value: &str) -> Result<Weekday> {
    value
        .trim()
        .parse::<Weekday>()
        .map_err(|_| SyncError::Config(format!("unknown weekday: {value}")))
}

/// Parse an IANA timezone name. `local` resolves to the system zone, or UTC when
/// the system zone cannot be determined.
pub fn parse_timezone(value: &str) -> Result<Tz> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("local") {
        return Ok(iana_time_zone::get_timezone()
            .ok()
            .and_then(|name| name.parse::<Tz>().ok())
            .unwrap_or(Tz::UTC));
    }
    value
        .parse::<Tz>()
        .map_err(|_| SyncError::Config(format!("unknown timezone: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn monday_anchor_matches_iso_weeks() {
        let classifier = WindowClassifier::default();
        // 2025-01-15 is a Wednesday.
        assert_eq!(classifier.window_key(utc(2025, 1, 15, 12)).start(), date(2025, 1, 13));
        // Monday starts its own window, Sunday closes the previous one.
        assert_eq!(classifier.window_key(utc(2025, 1, 13, 0)).start(), date(2025, 1, 13));
        assert_eq!(classifier.window_key(utc(2025, 1, 19, 23)).start(), date(2025, 1, 13));
        assert_eq!(classifier.window_key(utc(2025, 1, 20, 0)).start(), date(2025, 1, 20));
    }

    #[test]
    fn sunday_anchor_shifts_boundaries() {
        let classifier = WindowClassifier::new(Weekday::Sun, Tz::UTC);
        assert_eq!(classifier.window_key(utc(2025, 1, 19, 8)).start(), date(2025, 1, 19));
        assert_eq!(classifier.window_key(utc(2025, 1, 18, 8)).start(), date(2025, 1, 12));
    }

    #[test]
    fn window_crosses_year_boundary() {
        let classifier = WindowClassifier::default();
        // 2025-01-01 is a Wednesday; its window began Monday 2024-12-30.
        let key = classifier.window_key(utc(2025, 1, 1, 10));
        assert_eq!(key.start(), date(2024, 12, 30));
        assert!(classifier.same_window(utc(2024, 12, 31, 10), utc(2025, 1, 5, 10)));
        assert_eq!(key.to_string(), "2024-12-30");
    }

    #[test]
    fn keys_follow_calendar_order() {
        let classifier = WindowClassifier::default();
        let earlier = classifier.window_key(utc(2025, 2, 2, 0));
        let later = classifier.window_key(utc(2025, 2, 3, 0));
        assert!(earlier < later);
        let (start, end) = classifier.window_bounds(later);
        assert_eq!(start, date(2025, 2, 3));
        assert_eq!(end, date(2025, 2, 10));
    }

    #[test]
    fn reference_timezone_decides_the_calendar_day() {
        let new_york: Tz = "America/New_York".parse().unwrap();
        let classifier = WindowClassifier::new(Weekday::Mon, new_york);
        // 03:00 UTC Monday is still Sunday evening in New York.
        let ts = utc(2025, 1, 20, 3);
        assert_eq!(classifier.day_key(ts), date(2025, 1, 19));
        assert_eq!(classifier.window_key(ts).start(), date(2025, 1, 13));
        assert_eq!(WindowClassifier::default().window_key(ts).start(), date(2025, 1, 20));
    }

    #[test]
    fn dst_transition_does_not_split_a_day() {
        let new_york: Tz = "America/New_York".parse().unwrap();
        let classifier = WindowClassifier::new(Weekday::Mon, new_york);
        // Clocks jump forward on 2025-03-09 at 02:00 local.
        let before = utc(2025, 3, 9, 6); // 01:00 EST
        let after = utc(2025, 3, 9, 8); // 04:00 EDT
        assert_eq!(classifier.day_key(before), classifier.day_key(after));
        assert!(classifier.same_window(before, after));
    }

    #[test]
    fn past_window_is_not_current() {
        let classifier = WindowClassifier::default();
        let now = utc(2025, 1, 15, 12);
        assert!(classifier.is_current(utc(2025, 1, 13, 0), now));
        assert!(!classifier.is_current(utc(2025, 1, 12, 23), now));
    }

    #[test]
    fn parses_config_values() {
        assert_eq!(parse_weekday("monday").unwrap(), Weekday::Mon);
        assert_eq!(parse_weekday(" Sun ").unwrap(), Weekday::Sun);
        assert!(parse_weekday("someday").is_err());

        assert_eq!(parse_timezone("UTC").unwrap(), Tz::UTC);
        assert_eq!(
            parse_timezone("Europe/Berlin").unwrap(),
            "Europe/Berlin".parse::<Tz>().unwrap()
        );
        assert!(parse_timezone("local").is_ok());
        let err = parse_timezone("Mars/Olympus").unwrap_err();
        assert!(err.to_string().contains("unknown timezone"));
    }

    #[test]
    fn fixed_clock_advances() {
        let clock = FixedClock::new(utc(2025, 1, 1, 0));
        clock.advance(chrono::Duration::hours(36));
        assert_eq!(clock.now(), utc(2025, 1, 2, 12));
        clock.set(utc(2024, 6, 1, 0));
        assert_eq!(clock.now(), utc(2024, 6, 1, 0));
    }
}
