use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Placeholder summary for events that carry none
pub const NO_TITLE: &str = "(No title)";

/// A named remote calendar feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSource {
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl CalendarSource {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            url: url.to_string(),
            color: None,
        }
    }
}

/// A date or date-time value as it appeared in the feed.
///
/// Floating date-times and date-times with a `TZID` are both kept as wall-clock
/// values; they are only turned into instants when a timezone is applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventTime {
    DateOnly {
        date: NaiveDate,
    },
    DateTimeUtc {
        instant: DateTime<Utc>,
    },
    DateTimeLocal {
        local: NaiveDateTime,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tzid: Option<String>,
    },
}

impl EventTime {
    /// Whether this value is a date without a time of day
    pub fn is_date_only(&self) -> bool {
        matches!(self, EventTime::DateOnly { .. })
    }

    /// The value as wall-clock time (midnight for dates, UTC clock for UTC values)
    pub fn naive(&self) -> NaiveDateTime {
        match self {
            EventTime::DateOnly { date } => date.and_time(chrono::NaiveTime::MIN),
            EventTime::DateTimeUtc { instant } => instant.naive_utc(),
            EventTime::DateTimeLocal { local, .. } => *local,
        }
    }
}

/// An organizer or attendee address with its optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partstat: Option<String>,
}

/// One event definition from a parsed feed, before any recurrence expansion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<EventTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<EventTime>,
    /// `DURATION` in seconds, used when there is no `DTEND`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rrule: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rdates: Vec<EventTime>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exdates: Vec<EventTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence_id: Option<EventTime>,
    /// Modified instances of this series, in document order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub overrides: Vec<RawEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer: Option<Party>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attendees: Vec<Party>,
}

/// One structural record of a parsed document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RawComponent {
    Event(RawEvent),
    /// Any non-event component (todo, journal, ...); ignored by expansion
    Other { name: String },
}

/// Parsed feed: component identifier to component record
pub type Document = BTreeMap<String, RawComponent>;

/// Query window; both ends inclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl QueryWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    /// Inclusive overlap test: `end >= from && start <= to`
    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        end >= self.from && start <= self.to
    }
}

/// A concrete, dated event instance produced for a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Occurrence {
    pub uid: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub all_day: bool,
    pub recurring: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attendees: Vec<String>,
    pub source_name: String,
}

impl Occurrence {
    /// Case-insensitive substring test against summary, description and location
    pub fn matches_text(&self, needle_lower: &str) -> bool {
        let contains = |field: Option<&str>| {
            field
                .map(|value| value.to_lowercase().contains(needle_lower))
                .unwrap_or(false)
        };
        contains(Some(self.summary.as_str()))
            || contains(self.description.as_deref())
            || contains(self.location.as_deref())
    }
}
