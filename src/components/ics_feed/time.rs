use super::models::EventTime;
use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Parse a `DATE` or `DATE-TIME` value into its tagged shape.
///
/// `value_is_date` is true when the property carried `VALUE=DATE`.
pub fn parse_event_time(value: &str, value_is_date: bool, tzid: Option<&str>) -> Option<EventTime> {
    let value = value.trim();

    if value_is_date || (value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit())) {
        let date = NaiveDate::parse_from_str(value.get(..8)?, "%Y%m%d").ok()?;
        return Some(EventTime::DateOnly { date });
    }

    if let Some(stripped) = value.strip_suffix('Z').or_else(|| value.strip_suffix('z')) {
        let naive = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").ok()?;
        return Some(EventTime::DateTimeUtc {
            instant: Utc.from_utc_datetime(&naive),
        });
    }

    let local = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok()?;
    Some(EventTime::DateTimeLocal {
        local,
        tzid: tzid.map(|t| t.trim_matches('"').to_string()),
    })
}

/// Parse a comma-separated list value (`EXDATE`, `RDATE`), skipping bad entries
pub fn parse_event_time_list(
    value: &str,
    value_is_date: bool,
    tzid: Option<&str>,
) -> Vec<EventTime> {
    value
        .split(',')
        .filter(|item| !item.trim().is_empty())
        .filter_map(|item| parse_event_time(item, value_is_date, tzid))
        .collect()
}

/// Parse an RFC 5545 duration such as `PT1H30M`, `P2D` or `-P1W`
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let (negative, rest) = match value.as_bytes().first()? {
        b'-' => (true, &value[1..]),
        b'+' => (false, &value[1..]),
        _ => (false, value),
    };
    let rest = rest.strip_prefix('P').or_else(|| rest.strip_prefix('p'))?;

    let mut total = Duration::zero();
    let mut number = String::new();
    let mut in_time = false;
    let mut seen_unit = false;

    for ch in rest.chars() {
        match ch.to_ascii_uppercase() {
            'T' => in_time = true,
            digit if digit.is_ascii_digit() => number.push(digit),
            unit => {
                let amount: i64 = number.parse().ok()?;
                number.clear();
                total += match (unit, in_time) {
                    ('W', false) => Duration::weeks(amount),
                    ('D', false) => Duration::days(amount),
                    ('H', true) => Duration::hours(amount),
                    ('M', true) => Duration::minutes(amount),
                    ('S', true) => Duration::seconds(amount),
                    _ => return None,
                };
                seen_unit = true;
            }
        }
    }

    if !number.is_empty() || !seen_unit {
        return None;
    }

    Some(if negative { -total } else { total })
}

/// Resolve a wall-clock time in `tz`.
///
/// Ambiguous times (DST fall-back) take the earlier instant; times inside a
/// DST gap are shifted forward by one hour.
pub fn resolve_local(tz: Tz, naive: NaiveDateTime) -> Option<DateTime<Utc>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt.with_timezone(&Utc)),
        LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
        LocalResult::None => tz
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc)),
    }
}

/// The timezone a value's wall-clock time should be read in
pub fn zone_for(time: &EventTime, default_tz: Tz) -> Tz {
    match time {
        EventTime::DateTimeUtc { .. } => Tz::UTC,
        EventTime::DateTimeLocal { tzid: Some(tzid), .. } => tzid.parse().unwrap_or(default_tz),
        _ => default_tz,
    }
}

/// Convert a value to an instant; dates and floating times use `default_tz`
pub fn to_instant(time: &EventTime, default_tz: Tz) -> Option<DateTime<Utc>> {
    match time {
        EventTime::DateTimeUtc { instant } => Some(*instant),
        other => resolve_local(zone_for(other, default_tz), other.naive()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_shapes() {
        assert_eq!(
            parse_event_time("20240101", false, None),
            Some(EventTime::DateOnly {
                date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
            })
        );
        assert_eq!(
            parse_event_time("20240101T090000Z", false, None),
            Some(EventTime::DateTimeUtc {
                instant: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap()
            })
        );
        match parse_event_time("20240101T090000", false, Some("Europe/Helsinki")) {
            Some(EventTime::DateTimeLocal { local, tzid }) => {
                assert_eq!(local.hour(), 9);
                assert_eq!(tzid.as_deref(), Some("Europe/Helsinki"));
            }
            other => panic!("unexpected value: {:?}", other),
        }
        assert_eq!(parse_event_time("not a date", false, None), None);
    }

    #[test]
    fn test_value_date_param_wins() {
        assert!(parse_event_time("20240101", true, None).unwrap().is_date_only());
    }

    #[test]
    fn test_parse_list_skips_garbage() {
        let values = parse_event_time_list("20240101T090000Z,junk,20240108T090000Z", false, None);
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("PT1H30M"), Some(Duration::minutes(90)));
        assert_eq!(parse_duration("P2D"), Some(Duration::days(2)));
        assert_eq!(parse_duration("P1W"), Some(Duration::weeks(1)));
        assert_eq!(parse_duration("-PT15M"), Some(Duration::minutes(-15)));
        assert_eq!(parse_duration("P1DT12H"), Some(Duration::hours(36)));
        assert_eq!(parse_duration("PT"), None);
        assert_eq!(parse_duration("P1H"), None);
        assert_eq!(parse_duration("1H"), None);
    }

    #[test]
    fn test_resolve_local_dst() {
        let tz: Tz = "Europe/Helsinki".parse().unwrap();

        // Winter: UTC+2
        let winter = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap().and_hms_opt(9, 0, 0).unwrap();
        assert_eq!(
            resolve_local(tz, winter),
            Some(Utc.with_ymd_and_hms(2024, 1, 15, 7, 0, 0).unwrap())
        );

        // 03:30 does not exist on 2024-03-31 in Helsinki
        let gap = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap().and_hms_opt(3, 30, 0).unwrap();
        assert_eq!(
            resolve_local(tz, gap),
            Some(Utc.with_ymd_and_hms(2024, 3, 31, 1, 30, 0).unwrap())
        );
    }

    #[test]
    fn test_unknown_tzid_uses_default() {
        let time =
            parse_event_time("20240101T090000", false, Some("W. Europe Standard Time")).unwrap();
        assert_eq!(
            to_instant(&time, Tz::UTC),
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap())
        );
    }
}
