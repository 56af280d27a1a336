use super::time::resolve_local;
use chrono::{
    DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Utc, Weekday,
};
use chrono_tz::Tz;
use thiserror::Error;
use tracing::warn;

/// Reasons a recurrence rule cannot be expanded
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecurrenceError {
    #[error("recurrence rule has no FREQ")]
    MissingFrequency,

    #[error("invalid recurrence rule part {part}: {value}")]
    InvalidPart { part: String, value: String },

    #[error("unsupported recurrence rule part: {0}")]
    Unsupported(String),

    #[error("event has no start value")]
    MissingStart,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Frequency {
    Secondly,
    Minutely,
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

/// Weekday with optional occurrence number (`-1FR`, `2MO`, `TU`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeekdayNum {
    pub weekday: Weekday,
    pub occurrence: Option<i32>,
}

/// Parsed `RRULE` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecurrenceRule {
    pub freq: Frequency,
    pub interval: u32,
    pub count: Option<u32>,
    /// Raw `UNTIL` value; interpreted against the event's start shape
    pub until: Option<String>,
    pub by_second: Vec<u32>,
    pub by_minute: Vec<u32>,
    pub by_hour: Vec<u32>,
    pub by_day: Vec<WeekdayNum>,
    pub by_month_day: Vec<i32>,
    pub by_month: Vec<u32>,
    pub by_set_pos: Vec<i32>,
    pub week_start: Weekday,
}

impl RecurrenceRule {
    /// Parse an `RRULE` value such as `FREQ=WEEKLY;BYDAY=MO,WE;COUNT=10`
    pub fn parse(value: &str) -> Result<Self, RecurrenceError> {
        let mut freq = None;
        let mut rule = RecurrenceRule {
            freq: Frequency::Daily,
            interval: 1,
            count: None,
            until: None,
            by_second: Vec::new(),
            by_minute: Vec::new(),
            by_hour: Vec::new(),
            by_day: Vec::new(),
            by_month_day: Vec::new(),
            by_month: Vec::new(),
            by_set_pos: Vec::new(),
            week_start: Weekday::Mon,
        };

        // Some producers keep the property name in the value
        let value = value.trim();
        let value = value
            .strip_prefix("RRULE:")
            .or_else(|| value.strip_prefix("rrule:"))
            .unwrap_or(value);

        for part in value.split(';').filter(|p| !p.trim().is_empty()) {
            let (key, val) = part.split_once('=').ok_or_else(|| invalid("RRULE", part))?;
            let key = key.trim().to_ascii_uppercase();
            let val = val.trim();

            match key.as_str() {
                "FREQ" => freq = Some(parse_frequency(val)?),
                "INTERVAL" => {
                    rule.interval = parse_number::<u32>(&key, val)?;
                    if rule.interval == 0 {
                        return Err(invalid(&key, val));
                    }
                }
                "COUNT" => rule.count = Some(parse_number(&key, val)?),
                "UNTIL" => rule.until = Some(val.to_string()),
                "BYSECOND" => rule.by_second = parse_list(&key, val, 0, 60)?,
                "BYMINUTE" => rule.by_minute = parse_list(&key, val, 0, 59)?,
                "BYHOUR" => rule.by_hour = parse_list(&key, val, 0, 23)?,
                "BYMONTH" => rule.by_month = parse_list(&key, val, 1, 12)?,
                "BYMONTHDAY" => rule.by_month_day = parse_signed_list(&key, val, 31)?,
                "BYSETPOS" => rule.by_set_pos = parse_signed_list(&key, val, 366)?,
                "BYDAY" => {
                    rule.by_day = val
                        .split(',')
                        .map(|item| parse_weekday_num(item).ok_or_else(|| invalid(&key, item)))
                        .collect::<Result<_, _>>()?;
                }
                "WKST" => rule.week_start = parse_weekday(val).ok_or_else(|| invalid(&key, val))?,
                "BYYEARDAY" | "BYWEEKNO" => return Err(RecurrenceError::Unsupported(key)),
                // Vendor extensions such as X-NAME are ignored
                _ if key.starts_with("X-") => {}
                _ => return Err(invalid(&key, val)),
            }
        }

        rule.freq = freq.ok_or(RecurrenceError::MissingFrequency)?;
        Ok(rule)
    }
}

/// Upper bound on periods walked for one rule
const MAX_PERIODS: u64 = 500_000;
/// Upper bound on instances returned for one rule and window
const MAX_INSTANCES: usize = 5_000;

/// Instant range an expansion pass is interested in
#[derive(Debug, Clone, Copy)]
pub struct ExpansionBounds {
    /// Earliest instance start worth returning
    pub lower: DateTime<Utc>,
    /// Latest instance start worth returning
    pub upper: DateTime<Utc>,
    /// Resolved `UNTIL`, inclusive
    pub until: Option<DateTime<Utc>>,
}

impl RecurrenceRule {
    /// Generate instance starts of this rule within `bounds`.
    ///
    /// The rule is evaluated on wall-clock time in `zone` starting at `dtstart`;
    /// `COUNT` counts every instance from `dtstart`, including ones before
    /// `bounds.lower`.
    pub fn instances(
        &self,
        dtstart: NaiveDateTime,
        date_only: bool,
        zone: Tz,
        bounds: &ExpansionBounds,
    ) -> Vec<DateTime<Utc>> {
        let upper_local = bounds.upper.with_timezone(&zone).naive_local();
        let limit_local = match bounds.until {
            Some(until) => upper_local.min(until.with_timezone(&zone).naive_local()),
            None => upper_local,
        };

        // Without COUNT nothing before the window matters, so skip ahead
        let first = match self.count {
            Some(_) => 0,
            None => self.periods_before(dtstart, bounds.lower.with_timezone(&zone).naive_local()),
        };

        let mut found = Vec::new();
        let mut emitted: u32 = 0;

        for k in first..first.saturating_add(MAX_PERIODS) {
            let Some((period_start, candidates)) = self.period(dtstart, date_only, k) else {
                break;
            };
            if period_start > limit_local {
                break;
            }

            for candidate in candidates {
                if candidate < dtstart {
                    continue;
                }
                let Some(instant) = resolve_local(zone, candidate) else {
                    continue;
                };
                if bounds.until.is_some_and(|until| instant > until) || instant > bounds.upper {
                    return found;
                }

                emitted += 1;
                if instant >= bounds.lower {
                    found.push(instant);
                    if found.len() >= MAX_INSTANCES {
                        warn!(
                            limit = MAX_INSTANCES,
                            "Recurrence produced too many instances, truncating"
                        );
                        return found;
                    }
                }
                if self.count.is_some_and(|count| emitted >= count) {
                    return found;
                }
            }
        }

        found
    }

    /// Whole periods that lie entirely before `lower`, less one for safety
    fn periods_before(&self, dtstart: NaiveDateTime, lower: NaiveDateTime) -> u64 {
        if lower <= dtstart {
            return 0;
        }
        let elapsed = lower - dtstart;
        let units = match self.freq {
            Frequency::Secondly => elapsed.num_seconds(),
            Frequency::Minutely => elapsed.num_minutes(),
            Frequency::Hourly => elapsed.num_hours(),
            Frequency::Daily => elapsed.num_days(),
            Frequency::Weekly => elapsed.num_days() / 7,
            Frequency::Monthly => {
                (lower.year() as i64 * 12 + lower.month0() as i64)
                    - (dtstart.year() as i64 * 12 + dtstart.month0() as i64)
            }
            Frequency::Yearly => (lower.year() - dtstart.year()) as i64,
        };
        let periods = units / self.interval as i64;
        u64::try_from(periods - 1).unwrap_or(0)
    }

    /// The `k`-th period: its first moment and its sorted candidate starts
    fn period(
        &self,
        dtstart: NaiveDateTime,
        date_only: bool,
        k: u64,
    ) -> Option<(NaiveDateTime, Vec<NaiveDateTime>)> {
        let step = i64::try_from(k).ok()?.checked_mul(self.interval as i64)?;
        let start_date = dtstart.date();

        let (period_start, dates) = match self.freq {
            Frequency::Yearly => {
                let year = i32::try_from(start_date.year() as i64 + step).ok()?;
                let first = NaiveDate::from_ymd_opt(year, 1, 1)?;
                (first, self.yearly_dates(year, start_date))
            }
            Frequency::Monthly => {
                let index = start_date.year() as i64 * 12 + start_date.month0() as i64 + step;
                let year = i32::try_from(index.div_euclid(12)).ok()?;
                let month = index.rem_euclid(12) as u32 + 1;
                let first = NaiveDate::from_ymd_opt(year, month, 1)?;
                (first, self.monthly_dates(year, month, start_date))
            }
            Frequency::Weekly => {
                let offset = days_since_week_start(start_date.weekday(), self.week_start);
                let first = start_date
                    .checked_sub_signed(Duration::days(offset))?
                    .checked_add_signed(Duration::days(step.checked_mul(7)?))?;
                (first, self.weekly_dates(first, start_date))
            }
            Frequency::Daily => {
                let date = start_date.checked_add_signed(Duration::days(step))?;
                let dates = if self.date_matches(date) { vec![date] } else { Vec::new() };
                (date, dates)
            }
            Frequency::Hourly | Frequency::Minutely | Frequency::Secondly => {
                let offset = match self.freq {
                    Frequency::Hourly => Duration::try_hours(step)?,
                    Frequency::Minutely => Duration::try_minutes(step)?,
                    _ => Duration::try_seconds(step)?,
                };
                let moment = dtstart.checked_add_signed(offset)?;
                let keep = self.date_matches(moment.date())
                    && (self.by_hour.is_empty() || self.by_hour.contains(&moment.hour()))
                    && (self.by_minute.is_empty() || self.by_minute.contains(&moment.minute()))
                    && (self.by_second.is_empty() || self.by_second.contains(&moment.second()));
                let candidates = if keep { vec![moment] } else { Vec::new() };
                return Some((moment, self.apply_set_pos(candidates)));
            }
        };

        let candidates = self.with_times(dates, dtstart, date_only);
        Some((period_start.and_time(NaiveTime::MIN), self.apply_set_pos(candidates)))
    }

    fn yearly_dates(&self, year: i32, start_date: NaiveDate) -> Vec<NaiveDate> {
        let months: Vec<u32> = if self.by_month.is_empty() {
            (1..=12).collect()
        } else {
            self.by_month.clone()
        };

        if !self.by_month_day.is_empty() {
            return months
                .into_iter()
                .flat_map(|month| self.month_day_dates(year, month))
                .filter(|date| self.weekday_matches(*date))
                .collect();
        }

        if !self.by_day.is_empty() {
            if self.by_month.is_empty() {
                let first = NaiveDate::from_ymd_opt(year, 1, 1);
                let last = NaiveDate::from_ymd_opt(year, 12, 31);
                return match (first, last) {
                    (Some(first), Some(last)) => self.weekdays_between(first, last),
                    _ => Vec::new(),
                };
            }
            return months
                .into_iter()
                .flat_map(|month| self.weekdays_in_month(year, month))
                .collect();
        }

        if !self.by_month.is_empty() {
            return months
                .into_iter()
                .filter_map(|month| NaiveDate::from_ymd_opt(year, month, start_date.day()))
                .collect();
        }

        NaiveDate::from_ymd_opt(year, start_date.month(), start_date.day())
            .into_iter()
            .collect()
    }

    fn monthly_dates(&self, year: i32, month: u32, start_date: NaiveDate) -> Vec<NaiveDate> {
        if !self.by_month.is_empty() && !self.by_month.contains(&month) {
            return Vec::new();
        }

        if !self.by_month_day.is_empty() {
            return self
                .month_day_dates(year, month)
                .into_iter()
                .filter(|date| self.weekday_matches(*date))
                .collect();
        }

        if !self.by_day.is_empty() {
            return self.weekdays_in_month(year, month);
        }

        // Months without the start's day (e.g. the 31st) are skipped
        NaiveDate::from_ymd_opt(year, month, start_date.day())
            .into_iter()
            .collect()
    }

    fn weekly_dates(&self, week_start: NaiveDate, start_date: NaiveDate) -> Vec<NaiveDate> {
        (0..7)
            .filter_map(|offset| week_start.checked_add_signed(Duration::days(offset)))
            .filter(|date| {
                if self.by_day.is_empty() {
                    date.weekday() == start_date.weekday()
                } else {
                    self.weekday_matches(*date)
                }
            })
            .filter(|date| self.by_month.is_empty() || self.by_month.contains(&date.month()))
            .collect()
    }

    /// Limit-style filters used by DAILY and finer frequencies
    fn date_matches(&self, date: NaiveDate) -> bool {
        (self.by_month.is_empty() || self.by_month.contains(&date.month()))
            && (self.by_month_day.is_empty()
                || self.by_month_day.iter().any(|day| {
                    resolve_month_day(date.year(), date.month(), *day) == Some(date.day())
                }))
            && self.weekday_matches(date)
    }

    fn weekday_matches(&self, date: NaiveDate) -> bool {
        self.by_day.is_empty() || self.by_day.iter().any(|wd| wd.weekday == date.weekday())
    }

    fn month_day_dates(&self, year: i32, month: u32) -> Vec<NaiveDate> {
        let mut dates: Vec<NaiveDate> = self
            .by_month_day
            .iter()
            .filter_map(|day| resolve_month_day(year, month, *day))
            .filter_map(|day| NaiveDate::from_ymd_opt(year, month, day))
            .collect();
        dates.sort();
        dates.dedup();
        dates
    }

    fn weekdays_in_month(&self, year: i32, month: u32) -> Vec<NaiveDate> {
        let first = NaiveDate::from_ymd_opt(year, month, 1);
        let last = NaiveDate::from_ymd_opt(year, month, days_in_month(year, month));
        match (first, last) {
            (Some(first), Some(last)) => self.weekdays_between(first, last),
            _ => Vec::new(),
        }
    }

    /// Expand `BYDAY` (with ordinals) over an inclusive date range
    fn weekdays_between(&self, first: NaiveDate, last: NaiveDate) -> Vec<NaiveDate> {
        let mut dates = Vec::new();

        for wd in &self.by_day {
            let lead = (wd.weekday.num_days_from_monday() + 7
                - first.weekday().num_days_from_monday())
                % 7;
            let matching: Vec<NaiveDate> = (0..)
                .map_while(|week: i64| {
                    first
                        .checked_add_signed(Duration::days(lead as i64 + week * 7))
                        .filter(|date| *date <= last)
                })
                .collect();

            match wd.occurrence {
                None => dates.extend(matching),
                Some(n) if n > 0 => dates.extend(matching.get(n as usize - 1).copied()),
                Some(n) => {
                    let back = n.unsigned_abs() as usize;
                    if back <= matching.len() {
                        dates.push(matching[matching.len() - back]);
                    }
                }
            }
        }

        dates.sort();
        dates.dedup();
        dates
    }

    /// Combine dates with `BYHOUR`/`BYMINUTE`/`BYSECOND` or the start's time of day
    fn with_times(
        &self,
        dates: Vec<NaiveDate>,
        dtstart: NaiveDateTime,
        date_only: bool,
    ) -> Vec<NaiveDateTime> {
        if date_only {
            return dates.into_iter().map(|d| d.and_time(NaiveTime::MIN)).collect();
        }

        let pick = |values: &[u32], fallback: u32| -> Vec<u32> {
            if values.is_empty() {
                vec![fallback]
            } else {
                values.to_vec()
            }
        };
        let hours = pick(&self.by_hour, dtstart.hour());
        let minutes = pick(&self.by_minute, dtstart.minute());
        let seconds = pick(&self.by_second, dtstart.second());

        let mut candidates = Vec::new();
        for date in dates {
            for hour in &hours {
                for minute in &minutes {
                    for second in &seconds {
                        if let Some(time) = NaiveTime::from_hms_opt(*hour, *minute, *second) {
                            candidates.push(date.and_time(time));
                        }
                    }
                }
            }
        }
        candidates.sort();
        candidates.dedup();
        candidates
    }

    fn apply_set_pos(&self, candidates: Vec<NaiveDateTime>) -> Vec<NaiveDateTime> {
        if self.by_set_pos.is_empty() || candidates.is_empty() {
            return candidates;
        }

        let len = candidates.len() as i64;
        let mut picked: Vec<NaiveDateTime> = self
            .by_set_pos
            .iter()
            .filter_map(|pos| {
                let index = if *pos > 0 { *pos as i64 - 1 } else { len + *pos as i64 };
                usize::try_from(index).ok().and_then(|i| candidates.get(i).copied())
            })
            .collect();
        picked.sort();
        picked.dedup();
        picked
    }
}

fn days_since_week_start(day: Weekday, week_start: Weekday) -> i64 {
    ((day.num_days_from_monday() + 7 - week_start.num_days_from_monday()) % 7) as i64
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// Map a possibly negative `BYMONTHDAY` value to a day of the given month
fn resolve_month_day(year: i32, month: u32, day: i32) -> Option<u32> {
    let length = days_in_month(year, month) as i32;
    let resolved = if day > 0 { day } else { length + day + 1 };
    (1..=length).contains(&resolved).then_some(resolved as u32)
}

fn invalid(part: &str, value: &str) -> RecurrenceError {
    RecurrenceError::InvalidPart {
        part: part.to_string(),
        value: value.to_string(),
    }
}

fn parse_frequency(value: &str) -> Result<Frequency, RecurrenceError> {
    match value.to_ascii_uppercase().as_str() {
        "SECONDLY" => Ok(Frequency::Secondly),
        "MINUTELY" => Ok(Frequency::Minutely),
        "HOURLY" => Ok(Frequency::Hourly),
        "DAILY" => Ok(Frequency::Daily),
        "WEEKLY" => Ok(Frequency::Weekly),
        "MONTHLY" => Ok(Frequency::Monthly),
        "YEARLY" => Ok(Frequency::Yearly),
        _ => Err(invalid("FREQ", value)),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, RecurrenceError> {
    value.parse::<T>().map_err(|_| invalid(key, value))
}

fn parse_list(key: &str, value: &str, min: u32, max: u32) -> Result<Vec<u32>, RecurrenceError> {
    value
        .split(',')
        .map(|item| {
            let n: u32 = parse_number(key, item.trim())?;
            if n < min || n > max {
                return Err(invalid(key, item));
            }
            Ok(n)
        })
        .collect()
}

fn parse_signed_list(key: &str, value: &str, max_abs: i32) -> Result<Vec<i32>, RecurrenceError> {
    value
        .split(',')
        .map(|item| {
            let n: i32 = parse_number(key, item.trim().trim_start_matches('+'))?;
            if n == 0 || n.abs() > max_abs {
                return Err(invalid(key, item));
            }
            Ok(n)
        })
        .collect()
}

fn parse_weekday(value: &str) -> Option<Weekday> {
    match value.trim().to_ascii_uppercase().as_str() {
        "MO" => Some(Weekday::Mon),
        "TU" => Some(Weekday::Tue),
        "WE" => Some(Weekday::Wed),
        "TH" => Some(Weekday::Thu),
        "FR" => Some(Weekday::Fri),
        "SA" => Some(Weekday::Sat),
        "SU" => Some(Weekday::Sun),
        _ => None,
    }
}

fn parse_weekday_num(value: &str) -> Option<WeekdayNum> {
    let value = value.trim();
    if value.len() < 2 || !value.is_char_boundary(value.len() - 2) {
        return None;
    }
    let (ordinal, day) = value.split_at(value.len() - 2);
    let weekday = parse_weekday(day)?;

    let occurrence = if ordinal.is_empty() {
        None
    } else {
        let n: i32 = ordinal.trim_start_matches('+').parse().ok()?;
        if n == 0 || n.abs() > 53 {
            return None;
        }
        Some(n)
    };

    Some(WeekdayNum { weekday, occurrence })
}
