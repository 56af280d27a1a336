use crate::components::ics_feed::models::QueryWindow;
use crate::components::ics_feed::time::resolve_local;
use crate::error::{Error, FeedResult};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use chrono_tz::Tz;

/// Parse a caller-supplied instant.
///
/// Accepts RFC 3339 (`2024-01-10T09:00:00Z`), a date (`2024-01-10`, midnight)
/// or a minute-precision local time (`2024-01-10T09:00`). The last two are
/// read in `tz`.
pub fn parse_instant(input: &str, tz: Tz) -> FeedResult<DateTime<Utc>> {
    let input = input.trim();

    if let Ok(instant) = DateTime::parse_from_rfc3339(input) {
        return Ok(instant.with_timezone(&Utc));
    }

    let local = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map(|date| date.and_time(chrono::NaiveTime::MIN))
        .or_else(|_| NaiveDateTime::parse_from_str(input, "%Y-%m-%dT%H:%M"))
        .or_else(|_| NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M"))
        .map_err(|_| Error::Other(format!("Invalid time: {}", input)))?;

    resolve_local(tz, local).ok_or_else(|| Error::Other(format!("Invalid local time: {}", input)))
}

/// Fill in missing window ends: `from` defaults to `now`, `to` to `from + range_days`
pub fn default_window(
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
    range_days: i64,
    now: DateTime<Utc>,
) -> QueryWindow {
    let from = from.unwrap_or(now);
    let to = to.unwrap_or_else(|| from + Duration::days(range_days));
    QueryWindow::new(from, to)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_instant_forms() {
        let helsinki: Tz = "Europe/Helsinki".parse().unwrap();

        assert_eq!(
            parse_instant("2024-01-10T09:00:00Z", helsinki).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 10, 9, 0, 0).unwrap()
        );
        assert_eq!(
            parse_instant("2024-01-10T09:00:00+02:00", Tz::UTC).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 10, 7, 0, 0).unwrap()
        );
        assert_eq!(
            parse_instant("2024-01-10", helsinki).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 9, 22, 0, 0).unwrap()
        );
        assert_eq!(
            parse_instant("2024-07-10T09:30", helsinki).unwrap(),
            Utc.with_ymd_and_hms(2024, 7, 10, 6, 30, 0).unwrap()
        );
        assert!(parse_instant("next tuesday", Tz::UTC).is_err());
    }

    #[test]
    fn test_default_window() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let window = default_window(None, None, 30, now);
        assert_eq!(window.from, now);
        assert_eq!(window.to, now + Duration::days(30));

        let from = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let window = default_window(Some(from), None, 7, now);
        assert_eq!(window.to, from + Duration::days(7));

        let to = Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap();
        let window = default_window(None, Some(to), 7, now);
        assert_eq!((window.from, window.to), (now, to));
    }
}
