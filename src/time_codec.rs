//! Conversions between the feed's `DD/MM/YYYY HH:MM` timestamps and the
//! `YYYY-MM-DD HH:MM:SS` form stored in the database.
//!
//! Canonical strings sort lexicographically in time order, which the store
//! relies on for its `date > ?` window queries.

use chrono::{DateTime, Datelike, Duration, Local, NaiveDateTime};

const FEED_FORMAT: &str = "%d/%m/%Y %H:%M";
const CANONICAL_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Max delay before a late train is considered a different train
pub const DEFAULT_DEDUP_WINDOW_HOURS: i64 = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeError {
    #[error("Malformed timestamp: {0:?}")]
    MalformedTimestamp(String),
}

/// Parse a feed timestamp, e.g. `22/07/2015 10:23`
pub fn parse_feed_time(s: &str) -> Result<NaiveDateTime, TimeError> {
    NaiveDateTime::parse_from_str(s.trim(), FEED_FORMAT)
        .map_err(|_| TimeError::MalformedTimestamp(s.to_string()))
}

pub fn to_canonical(dt: &NaiveDateTime) -> String {
    dt.format(CANONICAL_FORMAT).to_string()
}

pub fn parse_canonical(s: &str) -> Result<NaiveDateTime, TimeError> {
    NaiveDateTime::parse_from_str(s, CANONICAL_FORMAT)
        .map_err(|_| TimeError::MalformedTimestamp(s.to_string()))
}

/// ISO weekday, Monday = 1 .. Sunday = 7
pub fn weekday_of(dt: &NaiveDateTime) -> u8 {
    dt.weekday().number_from_monday() as u8
}

/// Oldest date a record may have and still be the same physical train
pub fn dedup_window_start(now: NaiveDateTime, window: Duration) -> NaiveDateTime {
    now - window
}

/// Local wall-clock time; the feed reports local times without offset.
pub fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

/// Local time of a unix timestamp, as used by the `since` query parameter
pub fn from_unix_seconds(secs: i64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp(secs, 0).map(|dt| dt.with_timezone(&Local).naive_local())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Weekday};

    #[test]
    fn test_parse_feed_time() {
        let dt = parse_feed_time("23/05/2012 12:14").unwrap();
        assert_eq!(
            dt,
            NaiveDate::from_ymd_opt(2012, 5, 23)
                .unwrap()
                .and_hms_opt(12, 14, 0)
                .unwrap()
        );
    }

    #[test]
    fn test_parse_feed_time_rejects_other_formats() {
        for bad in ["2012-05-23 12:14", "23/05/2012", "32/05/2012 12:14", "", "X"] {
            assert_eq!(
                parse_feed_time(bad),
                Err(TimeError::MalformedTimestamp(bad.to_string())),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_canonical_has_zero_seconds() {
        let dt = parse_feed_time("01/01/2020 08:02").unwrap();
        assert_eq!(to_canonical(&dt), "2020-01-01 08:02:00");
        assert_eq!(parse_canonical("2020-01-01 08:02:00").unwrap(), dt);
    }

    #[test]
    fn test_weekday_matches_calendar() {
        // 2017-02-12 was a Sunday, 2020-01-01 a Wednesday
        let sunday = parse_feed_time("12/02/2017 01:01").unwrap();
        assert_eq!(weekday_of(&sunday), 7);
        let wednesday = parse_feed_time("01/01/2020 00:00").unwrap();
        assert_eq!(weekday_of(&wednesday), 3);
    }

    #[test]
    fn test_round_trip_weekday_over_a_year() {
        let mut day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        while day.year() == 2024 {
            let feed = day.format("%d/%m/%Y 23:59").to_string();
            let canonical = to_canonical(&parse_feed_time(&feed).unwrap());
            let back = parse_canonical(&canonical).unwrap();
            let expected = match day.weekday() {
                Weekday::Mon => 1,
                Weekday::Tue => 2,
                Weekday::Wed => 3,
                Weekday::Thu => 4,
                Weekday::Fri => 5,
                Weekday::Sat => 6,
                Weekday::Sun => 7,
            };
            assert_eq!(weekday_of(&back), expected, "{feed}");
            day = day.succ_opt().unwrap();
        }
    }

    #[test]
    fn test_from_unix_seconds_is_local_time() {
        let dt = from_unix_seconds(1_577_865_600).unwrap();
        let expected = DateTime::from_timestamp(1_577_865_600, 0)
            .unwrap()
            .with_timezone(&Local)
            .naive_local();
        assert_eq!(dt, expected);
        assert!(from_unix_seconds(i64::MAX).is_none());
    }

    #[test]
    fn test_dedup_window_start() {
        let now = parse_canonical("2020-01-01 08:00:00").unwrap();
        let start = dedup_window_start(now, Duration::hours(DEFAULT_DEDUP_WINDOW_HOURS));
        assert_eq!(to_canonical(&start), "2020-01-01 04:00:00");
    }
}
