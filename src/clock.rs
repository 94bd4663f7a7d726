//! User-local wall-clock resolution.
//!
//! Daily cadences and quiet hours are specified as local wall times, which
//! do not always map cleanly onto UTC instants. Around DST transitions a
//! local time can exist twice or not at all. Policy: an ambiguous time
//! resolves to the later instant, a nonexistent time rolls to the next day.
//! Either way a wall time fires at most once.

use chrono::{DateTime, Duration, LocalResult, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::EngineError;

/// Parse an IANA timezone name.
pub fn parse_tz(name: &str) -> Result<Tz, EngineError> {
    name.parse()
        .map_err(|_| EngineError::InvalidTimezone(name.to_string()))
}

/// The first UTC instant strictly after `after` whose wall time in `tz` is
/// `hour:minute`.
pub fn next_local_occurrence(
    tz: Tz,
    after: DateTime<Utc>,
    hour: u8,
    minute: u8,
) -> DateTime<Utc> {
    let wall = NaiveTime::from_hms_opt(hour as u32, minute as u32, 0)
        .unwrap_or(NaiveTime::MIN);
    let local_after = after.with_timezone(&tz);
    let mut date = local_after.date_naive();

    // At most two extra days: one because today's occurrence may have
    // passed, one more if a DST gap swallows the wall time.
    for _ in 0..3 {
        let candidate = match tz.from_local_datetime(&date.and_time(wall)) {
            LocalResult::Single(dt) => Some(dt),
            LocalResult::Ambiguous(_, later) => {
                log::info!(
                    "Local time {:02}:{:02} on {} is ambiguous in {}, using later instant",
                    hour,
                    minute,
                    date,
                    tz
                );
                Some(later)
            }
            LocalResult::None => {
                log::info!(
                    "Local time {:02}:{:02} does not exist on {} in {}, rolling to next day",
                    hour,
                    minute,
                    date,
                    tz
                );
                None
            }
        };
        if let Some(dt) = candidate {
            let utc = dt.with_timezone(&Utc);
            if utc > after {
                return utc;
            }
        }
        date += Duration::days(1);
    }

    // Unreachable: three consecutive days cannot all skip the same wall time
    after + Duration::days(1)
}

/// Local hour (0-23) of a UTC instant in `tz`.
pub fn local_hour(tz: Tz, at: DateTime<Utc>) -> u8 {
    use chrono::Timelike;
    at.with_timezone(&tz).hour() as u8
}

/// Local calendar day of a UTC instant in `tz`, formatted YYYY-MM-DD.
pub fn local_day(tz: Tz, at: DateTime<Utc>) -> String {
    at.with_timezone(&tz).date_naive().format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_tz() {
        assert!(parse_tz("Europe/London").is_ok());
        assert!(parse_tz("Not/AZone").is_err());
    }

    #[test]
    fn test_next_occurrence_same_day() {
        let tz: Tz = "Europe/London".parse().unwrap();
        // 2026-06-15 06:00 UTC is 07:00 BST
        let after = Utc.with_ymd_and_hms(2026, 6, 15, 6, 0, 0).unwrap();
        let next = next_local_occurrence(tz, after, 8, 0);
        // 08:00 BST = 07:00 UTC, same day
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 6, 15, 7, 0, 0).unwrap());
    }

    #[test]
    fn test_next_occurrence_rolls_to_tomorrow() {
        let tz: Tz = "Europe/London".parse().unwrap();
        // 10:00 BST, so today's 08:00 has passed
        let after = Utc.with_ymd_and_hms(2026, 6, 15, 9, 0, 0).unwrap();
        let next = next_local_occurrence(tz, after, 8, 0);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 6, 16, 7, 0, 0).unwrap());
    }

    #[test]
    fn test_ambiguous_time_uses_later_instant() {
        let tz: Tz = "Europe/London".parse().unwrap();
        // UK clocks go back 2026-10-25 02:00 BST -> 01:00 GMT; 01:30 happens twice
        let after = Utc.with_ymd_and_hms(2026, 10, 24, 12, 0, 0).unwrap();
        let next = next_local_occurrence(tz, after, 1, 30);
        // Later instant: 01:30 GMT = 01:30 UTC
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 10, 25, 1, 30, 0).unwrap());
    }

    #[test]
    fn test_skipped_time_rolls_to_next_day() {
        let tz: Tz = "Europe/London".parse().unwrap();
        // UK clocks go forward 2026-03-29 01:00 GMT -> 02:00 BST; 01:30 never happens
        let after = Utc.with_ymd_and_hms(2026, 3, 28, 12, 0, 0).unwrap();
        let next = next_local_occurrence(tz, after, 1, 30);
        // Next day's 01:30 BST = 00:30 UTC
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 30, 0, 30, 0).unwrap());
    }

    #[test]
    fn test_result_is_strictly_after() {
        let tz: Tz = "UTC".parse().unwrap();
        let after = Utc.with_ymd_and_hms(2026, 6, 15, 8, 0, 0).unwrap();
        let next = next_local_occurrence(tz, after, 8, 0);
        assert!(next > after);
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 6, 16, 8, 0, 0).unwrap());
    }

    #[test]
    fn test_local_day_crosses_date_line() {
        let tz: Tz = "Asia/Kolkata".parse().unwrap();
        // 20:00 UTC is already the next day in Kolkata (+05:30)
        let at = Utc.with_ymd_and_hms(2026, 8, 24, 20, 0, 0).unwrap();
        assert_eq!(local_day(tz, at), "2026-08-25");
        assert_eq!(local_hour(tz, at), 1);
    }
}
