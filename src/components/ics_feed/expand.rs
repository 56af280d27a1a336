use super::models::{
    Document, EventTime, Occurrence, Party, QueryWindow, RawComponent, RawEvent, NO_TITLE,
};
use super::rrule::{ExpansionBounds, RecurrenceError, RecurrenceRule};
use super::time::{parse_event_time, resolve_local, to_instant, zone_for};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

/// Turns parsed documents into concrete occurrences for a window
#[derive(Debug, Clone, Copy)]
pub struct Expander {
    default_tz: Tz,
}

impl Default for Expander {
    fn default() -> Self {
        Self::new(Tz::UTC)
    }
}

impl Expander {
    /// `default_tz` anchors date-only values, floating times and unknown TZIDs
    pub fn new(default_tz: Tz) -> Self {
        Self { default_tz }
    }

    /// Expand every event of `document` that touches `window`.
    ///
    /// Output order is unspecified. A series whose rule cannot be expanded is
    /// reported once, as its base event, instead of failing the document.
    /// A series without a usable `DTSTART` has no base event and yields nothing.
    pub fn expand(
        &self,
        document: &Document,
        window: &QueryWindow,
        source_name: &str,
    ) -> Vec<Occurrence> {
        let mut occurrences = Vec::new();

        for component in document.values() {
            let RawComponent::Event(event) = component else {
                continue;
            };

            if event.rrule.is_none() {
                if let Some(single) = self.base_occurrence(event, source_name) {
                    if window.overlaps(single.start, single.end) {
                        occurrences.push(single);
                    }
                }
                continue;
            }

            match self.expand_series(event, window, source_name) {
                Ok(series) => occurrences.extend(series),
                Err(e) => {
                    debug!(
                        uid = %event.uid,
                        error = %e,
                        "Recurrence expansion failed, using base event"
                    );
                    occurrences.extend(self.base_occurrence(event, source_name));
                }
            }
        }

        occurrences
    }

    /// The event as written, without applying its recurrence rule.
    ///
    /// `None` when the start is missing or cannot be resolved.
    fn base_occurrence(&self, event: &RawEvent, source_name: &str) -> Option<Occurrence> {
        let start_value = event.start.as_ref()?;
        let start = to_instant(start_value, self.default_tz)?;
        let end = start + self.duration(event, start);
        let all_day = start_value.is_date_only();
        Some(build_occurrence(event, None, start, end, all_day, false, source_name))
    }

    fn expand_series(
        &self,
        event: &RawEvent,
        window: &QueryWindow,
        source_name: &str,
    ) -> Result<Vec<Occurrence>, RecurrenceError> {
        let rule = RecurrenceRule::parse(event.rrule.as_deref().unwrap_or_default())?;
        let start_value = event.start.as_ref().ok_or(RecurrenceError::MissingStart)?;
        let zone = zone_for(start_value, self.default_tz);
        let all_day = start_value.is_date_only();
        let start = to_instant(start_value, self.default_tz).ok_or(RecurrenceError::MissingStart)?;
        let duration = self.duration(event, start);

        let until = match rule.until.as_deref() {
            Some(raw) => Some(resolve_until(raw, zone).ok_or_else(|| RecurrenceError::InvalidPart {
                part: "UNTIL".to_string(),
                value: raw.to_string(),
            })?),
            None => None,
        };

        // Instances that started before the window but still run into it count
        let bounds = ExpansionBounds {
            lower: window.from - duration.max(Duration::zero()),
            upper: window.to,
            until,
        };

        let mut starts: BTreeSet<DateTime<Utc>> = rule
            .instances(start_value.naive(), all_day, zone, &bounds)
            .into_iter()
            .collect();
        starts.extend(
            event
                .rdates
                .iter()
                .filter_map(|rdate| to_instant(rdate, self.default_tz))
                .filter(|instant| *instant >= bounds.lower && *instant <= bounds.upper),
        );

        let exclusions = Exclusions::new(&event.exdates, self.default_tz);
        let overrides: HashMap<DateTime<Utc>, &RawEvent> = event
            .overrides
            .iter()
            .filter_map(|o| {
                let rid = to_instant(o.recurrence_id.as_ref()?, self.default_tz)?;
                Some((rid, o))
            })
            .collect();

        let mut occurrences = Vec::new();

        for instance in starts {
            if exclusions.contains(instance, zone) || overrides.contains_key(&instance) {
                continue;
            }
            let end = instance + duration;
            if window.overlaps(instance, end) {
                occurrences.push(build_occurrence(
                    event,
                    None,
                    instance,
                    end,
                    all_day,
                    true,
                    source_name,
                ));
            }
        }

        // Modified instances replace the generated one with the same original start
        for (rid, modified) in overrides {
            if exclusions.contains(rid, zone) {
                continue;
            }
            let moved_start = modified
                .start
                .as_ref()
                .and_then(|s| to_instant(s, self.default_tz))
                .unwrap_or(rid);
            let moved_end = match (&modified.end, modified.duration_secs) {
                (None, None) => moved_start + duration,
                _ => moved_start + self.duration(modified, moved_start),
            };
            let modified_all_day = modified
                .start
                .as_ref()
                .map(EventTime::is_date_only)
                .unwrap_or(all_day);

            if window.overlaps(moved_start, moved_end) {
                occurrences.push(build_occurrence(
                    modified,
                    Some(event),
                    moved_start,
                    moved_end,
                    modified_all_day,
                    true,
                    source_name,
                ));
            }
        }

        Ok(occurrences)
    }

    /// Event length from `DTEND`, else `DURATION`, else zero
    fn duration(&self, event: &RawEvent, start: DateTime<Utc>) -> Duration {
        if let Some(end) = event.end.as_ref().and_then(|e| to_instant(e, self.default_tz)) {
            return end - start;
        }
        event
            .duration_secs
            .map(Duration::seconds)
            .unwrap_or_else(Duration::zero)
    }
}

/// `EXDATE` values, split by shape
struct Exclusions {
    instants: HashSet<DateTime<Utc>>,
    dates: HashSet<NaiveDate>,
}

impl Exclusions {
    fn new(exdates: &[EventTime], default_tz: Tz) -> Self {
        let mut instants = HashSet::new();
        let mut dates = HashSet::new();

        for exdate in exdates {
            match exdate {
                EventTime::DateOnly { date } => {
                    dates.insert(*date);
                }
                other => instants.extend(to_instant(other, default_tz)),
            }
        }

        Self { instants, dates }
    }

    fn contains(&self, instant: DateTime<Utc>, zone: Tz) -> bool {
        self.instants.contains(&instant)
            || (!self.dates.is_empty()
                && self.dates.contains(&instant.with_timezone(&zone).date_naive()))
    }
}

/// Resolve an `UNTIL` value in the series' zone
fn resolve_until(raw: &str, zone: Tz) -> Option<DateTime<Utc>> {
    match parse_event_time(raw, false, None)? {
        EventTime::DateTimeUtc { instant } => Some(instant),
        other => resolve_local(zone, other.naive()),
    }
}

fn build_occurrence(
    event: &RawEvent,
    series: Option<&RawEvent>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    all_day: bool,
    recurring: bool,
    source_name: &str,
) -> Occurrence {
    let organizer = event
        .organizer
        .as_ref()
        .or_else(|| series.and_then(|s| s.organizer.as_ref()));
    let attendees = match (event.attendees.is_empty(), series) {
        (true, Some(series)) => &series.attendees,
        _ => &event.attendees,
    };

    Occurrence {
        uid: event.uid.clone(),
        summary: inherited(&event.summary, series.map(|s| &s.summary))
            .unwrap_or_else(|| NO_TITLE.to_string()),
        description: inherited(&event.description, series.map(|s| &s.description)),
        location: inherited(&event.location, series.map(|s| &s.location)),
        start,
        end,
        all_day,
        recurring,
        status: inherited(&event.status, series.map(|s| &s.status)),
        organizer: organizer.map(display_name),
        attendees: attendees.iter().map(attendee_label).collect(),
        source_name: source_name.to_string(),
    }
}

/// Modified instances inherit what they leave out from their series
fn inherited(own: &Option<String>, series: Option<&Option<String>>) -> Option<String> {
    own.clone().or_else(|| series.cloned().flatten())
}

fn display_name(party: &Party) -> String {
    party.name.clone().unwrap_or_else(|| party.address.clone())
}

fn attendee_label(party: &Party) -> String {
    match &party.partstat {
        Some(status) => format!("{} ({})", display_name(party), status),
        None => display_name(party),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::ics_feed::parser::parse_document;
    use chrono::TimeZone;

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn window(from: DateTime<Utc>, to: DateTime<Utc>) -> QueryWindow {
        QueryWindow::new(from, to)
    }

    /// One VEVENT block from its property lines
    fn event(lines: &[&str]) -> String {
        format!("BEGIN:VEVENT\r\n{}\r\nEND:VEVENT\r\n", lines.join("\r\n"))
    }

    fn calendar(body: &str) -> Document {
        let text = format!("BEGIN:VCALENDAR\r\nVERSION:2.0\r\n{}END:VCALENDAR\r\n", body);
        parse_document(&text).unwrap()
    }

    fn expand_in(document: &Document, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Occurrence> {
        let mut occurrences = Expander::default().expand(document, &window(from, to), "x");
        occurrences.sort_by_key(|o| o.start);
        occurrences
    }

    #[test]
    fn test_single_event_boundary_overlap() {
        let document = calendar(&event(&[
            "UID:trip",
            "DTSTART:20240110T000000Z",
            "DTEND:20240112T000000Z",
            "SUMMARY:Trip",
        ]));
        let expander = Expander::default();

        let touching = window(utc(2024, 1, 12, 0, 0), utc(2024, 1, 20, 0, 0));
        let hit = expander.expand(&document, &touching, "home");
        assert_eq!(hit.len(), 1);
        assert!(!hit[0].recurring);
        assert_eq!(hit[0].source_name, "home");

        let later = window(utc(2024, 1, 13, 0, 0), utc(2024, 1, 20, 0, 0));
        assert!(expander.expand(&document, &later, "home").is_empty());
    }

    #[test]
    fn test_event_without_end_is_instant() {
        let document = calendar(&event(&["UID:ping", "DTSTART:20240105T120000Z"]));
        let found = expand_in(&document, utc(2024, 1, 5, 12, 0), utc(2024, 1, 6, 0, 0));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].start, found[0].end);
        assert_eq!(found[0].summary, NO_TITLE);
    }

    #[test]
    fn test_duration_sets_end_of_single_event() {
        let document = calendar(&event(&[
            "UID:standup",
            "DTSTART:20240105T090000Z",
            "DURATION:PT45M",
            "SUMMARY:Standup",
        ]));
        let found = expand_in(&document, utc(2024, 1, 5, 0, 0), utc(2024, 1, 6, 0, 0));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].end, utc(2024, 1, 5, 9, 45));

        // Overlap is judged on the derived end
        let after_start = expand_in(&document, utc(2024, 1, 5, 9, 30), utc(2024, 1, 6, 0, 0));
        assert_eq!(after_start.len(), 1);
    }

    #[test]
    fn test_duration_sets_end_of_series_instances() {
        let document = calendar(&event(&[
            "UID:standup",
            "DTSTART:20240105T090000Z",
            "DURATION:PT45M",
            "RRULE:FREQ=DAILY;COUNT=2",
        ]));
        let found = expand_in(&document, utc(2024, 1, 1, 0, 0), utc(2024, 2, 1, 0, 0));
        let spans: Vec<_> = found.iter().map(|o| (o.start, o.end)).collect();
        assert_eq!(
            spans,
            vec![
                (utc(2024, 1, 5, 9, 0), utc(2024, 1, 5, 9, 45)),
                (utc(2024, 1, 6, 9, 0), utc(2024, 1, 6, 9, 45)),
            ]
        );
    }

    #[test]
    fn test_unparseable_rule_falls_back_to_base_event() {
        let document = calendar(&event(&[
            "UID:broken",
            "DTSTART:20240101T090000Z",
            "RRULE:FREQ=SOMETIMES;BYDAY=XX",
            "SUMMARY:Broken",
        ]));
        let found = expand_in(&document, utc(2030, 1, 1, 0, 0), utc(2030, 2, 1, 0, 0));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].summary, "Broken");
        assert_eq!(found[0].start, utc(2024, 1, 1, 9, 0));
        assert!(!found[0].recurring);
    }

    #[test]
    fn test_series_without_start_yields_nothing() {
        let missing = calendar(&event(&["UID:nostart", "RRULE:FREQ=DAILY", "SUMMARY:Lost"]));
        let garbled = calendar(&event(&[
            "UID:badstart",
            "DTSTART:tomorrow",
            "RRULE:FREQ=DAILY",
            "SUMMARY:Lost",
        ]));

        for document in [missing, garbled] {
            let found = expand_in(&document, utc(1970, 1, 1, 0, 0), utc(2100, 1, 1, 0, 0));
            assert!(found.is_empty());
        }
    }

    #[test]
    fn test_weekly_series_with_exdate_and_override() {
        let series = event(&[
            "UID:sync",
            "DTSTART:20240101T090000Z",
            "DTEND:20240101T100000Z",
            "RRULE:FREQ=WEEKLY;COUNT=4",
            "EXDATE:20240108T090000Z",
            "SUMMARY:Sync",
            "LOCATION:Room 1",
        ]);
        let moved = event(&[
            "UID:sync",
            "RECURRENCE-ID:20240115T090000Z",
            "DTSTART:20240115T130000Z",
            "DTEND:20240115T140000Z",
            "SUMMARY:Sync (afternoon)",
        ]);
        let document = calendar(&format!("{}{}", series, moved));
        let found = expand_in(&document, utc(2024, 1, 1, 0, 0), utc(2024, 2, 1, 0, 0));

        let starts: Vec<_> = found.iter().map(|o| o.start).collect();
        assert_eq!(
            starts,
            vec![utc(2024, 1, 1, 9, 0), utc(2024, 1, 15, 13, 0), utc(2024, 1, 22, 9, 0)]
        );
        assert!(found.iter().all(|o| o.recurring));
        assert_eq!(found[1].summary, "Sync (afternoon)");
        // Inherited from the series
        assert_eq!(found[1].location.as_deref(), Some("Room 1"));
        assert_eq!(found[1].end, utc(2024, 1, 15, 14, 0));
    }

    #[test]
    fn test_cancelled_override_keeps_its_status() {
        let series = event(&[
            "UID:club",
            "DTSTART:20240102T170000Z",
            "DTEND:20240102T180000Z",
            "RRULE:FREQ=WEEKLY;COUNT=3",
            "SUMMARY:Book club",
            "STATUS:CONFIRMED",
        ]);
        let cancelled = event(&[
            "UID:club",
            "RECURRENCE-ID:20240109T170000Z",
            "DTSTART:20240109T170000Z",
            "DTEND:20240109T180000Z",
            "STATUS:CANCELLED",
        ]);
        let document = calendar(&format!("{}{}", series, cancelled));
        let found = expand_in(&document, utc(2024, 1, 1, 0, 0), utc(2024, 2, 1, 0, 0));

        assert_eq!(found.len(), 3);
        let statuses: Vec<_> = found.iter().map(|o| o.status.as_deref()).collect();
        assert_eq!(statuses, vec![Some("confirmed"), Some("cancelled"), Some("confirmed")]);
        assert!(found[1].recurring);
        assert_eq!(found[1].summary, "Book club");
        assert_eq!(found[1].start, utc(2024, 1, 9, 17, 0));
    }

    #[test]
    fn test_ongoing_instance_is_included() {
        let document = calendar(&event(&[
            "UID:shift",
            "DTSTART:20240101T220000Z",
            "DTEND:20240102T060000Z",
            "RRULE:FREQ=DAILY",
            "SUMMARY:Night shift",
        ]));
        let found = expand_in(&document, utc(2024, 1, 10, 2, 0), utc(2024, 1, 10, 12, 0));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].start, utc(2024, 1, 9, 22, 0));
    }

    #[test]
    fn test_all_day_series_with_date_exdate() {
        let document = calendar(&event(&[
            "UID:bins",
            "DTSTART;VALUE=DATE:20240101",
            "DTEND;VALUE=DATE:20240102",
            "RRULE:FREQ=WEEKLY;UNTIL=20240122",
            "EXDATE;VALUE=DATE:20240108",
            "SUMMARY:Bins",
        ]));
        let found = expand_in(&document, utc(2024, 1, 1, 0, 0), utc(2024, 3, 1, 0, 0));
        let starts: Vec<_> = found.iter().map(|o| o.start).collect();
        assert_eq!(
            starts,
            vec![utc(2024, 1, 1, 0, 0), utc(2024, 1, 15, 0, 0), utc(2024, 1, 22, 0, 0)]
        );
        assert!(found.iter().all(|o| o.all_day));
    }

    #[test]
    fn test_series_in_named_zone() {
        let document = calendar(&event(&[
            "UID:tz",
            "DTSTART;TZID=Europe/Helsinki:20240325T090000",
            "DTEND;TZID=Europe/Helsinki:20240325T093000",
            "RRULE:FREQ=WEEKLY;COUNT=2",
        ]));
        let found = expand_in(&document, utc(2024, 3, 1, 0, 0), utc(2024, 5, 1, 0, 0));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].start, utc(2024, 3, 25, 7, 0));
        assert_eq!(found[1].start, utc(2024, 4, 1, 6, 0));
        assert_eq!(found[1].end, utc(2024, 4, 1, 6, 30));
    }

    #[test]
    fn test_rdate_adds_instance() {
        let document = calendar(&event(&[
            "UID:extra",
            "DTSTART:20240101T090000Z",
            "RRULE:FREQ=MONTHLY;COUNT=2",
            "RDATE:20240120T090000Z",
        ]));
        let found = expand_in(&document, utc(2024, 1, 1, 0, 0), utc(2024, 12, 31, 0, 0));
        assert_eq!(found.len(), 3);
    }

    #[test]
    fn test_people_are_labelled() {
        let document = calendar(&event(&[
            "UID:meet",
            "DTSTART:20240101T090000Z",
            "ORGANIZER:mailto:boss@example.com",
            "ATTENDEE;CN=Aino;PARTSTAT=TENTATIVE:mailto:aino@example.com",
            "ATTENDEE:mailto:bob@example.com",
            "STATUS:CONFIRMED",
        ]));
        let found = expand_in(&document, utc(2024, 1, 1, 0, 0), utc(2024, 1, 2, 0, 0));
        assert_eq!(found[0].organizer.as_deref(), Some("boss@example.com"));
        assert_eq!(found[0].attendees, vec!["Aino (tentative)", "bob@example.com"]);
        assert_eq!(found[0].status.as_deref(), Some("confirmed"));
    }

    #[test]
    fn test_non_event_components_are_ignored() {
        let document =
            calendar("BEGIN:VTODO\r\nUID:t\r\nDTSTART:20240101T090000Z\r\nEND:VTODO\r\n");
        let found = expand_in(&document, utc(2024, 1, 1, 0, 0), utc(2024, 1, 2, 0, 0));
        assert!(found.is_empty());
    }
}
