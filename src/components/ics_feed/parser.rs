use super::models::{Document, EventTime, Party, RawComponent, RawEvent};
use super::time::{parse_duration, parse_event_time, parse_event_time_list};
use crate::error::{parse_error, FeedResult};
use ical::parser::ical::IcalParser;
use ical::property::Property;
use std::collections::BTreeMap;
use std::io::BufReader;
use tracing::debug;

/// Parse sanitized calendar text into components keyed by identifier.
///
/// Events are keyed by `UID`; instances carrying a `RECURRENCE-ID` are attached
/// to their series as overrides, or kept on their own when the series is absent.
pub fn parse_document(text: &str) -> FeedResult<Document> {
    let parser = IcalParser::new(BufReader::new(text.as_bytes()));

    let mut masters: Vec<RawEvent> = Vec::new();
    let mut instances: Vec<RawEvent> = Vec::new();
    let mut others: Vec<String> = Vec::new();
    let mut calendars = 0;

    for calendar in parser {
        let calendar = calendar.map_err(|e| parse_error(&e.to_string()))?;
        calendars += 1;

        for (index, event) in calendar.events.iter().enumerate() {
            let raw = raw_event(&event.properties, index);
            if raw.recurrence_id.is_some() {
                instances.push(raw);
            } else {
                masters.push(raw);
            }
        }

        others.extend(calendar.todos.iter().map(|_| "VTODO".to_string()));
        others.extend(calendar.journals.iter().map(|_| "VJOURNAL".to_string()));
    }

    if calendars == 0 {
        return Err(parse_error("document contains no VCALENDAR"));
    }

    let mut document = Document::new();
    let mut by_uid: BTreeMap<String, String> = BTreeMap::new();

    for master in masters {
        let key = unique_key(&document, &master.uid);
        by_uid.entry(master.uid.clone()).or_insert_with(|| key.clone());
        document.insert(key, RawComponent::Event(master));
    }

    for instance in instances {
        let series_key = by_uid.get(&instance.uid).filter(|key| {
            matches!(
                document.get(key.as_str()),
                Some(RawComponent::Event(series)) if series.rrule.is_some()
            )
        });

        if let Some(key) = series_key {
            if let Some(RawComponent::Event(series)) = document.get_mut(key.as_str()) {
                series.overrides.push(instance);
            }
            continue;
        }

        debug!(uid = %instance.uid, "Keeping override without a recurring series");
        let key = unique_key(&document, &instance_key(&instance));
        document.insert(key, RawComponent::Event(instance));
    }

    for (index, name) in others.into_iter().enumerate() {
        let key = format!("{}-{}", name.to_lowercase(), index);
        document.insert(key, RawComponent::Other { name });
    }

    Ok(document)
}

fn unique_key(document: &Document, base: &str) -> String {
    if !document.contains_key(base) {
        return base.to_string();
    }
    (2..)
        .map(|n| format!("{}#{}", base, n))
        .find(|candidate| !document.contains_key(candidate))
        .unwrap_or_else(|| base.to_string())
}

fn instance_key(instance: &RawEvent) -> String {
    match &instance.recurrence_id {
        Some(rid) => format!("{}@{}", instance.uid, rid.naive().format("%Y%m%dT%H%M%S")),
        None => instance.uid.clone(),
    }
}

fn raw_event(properties: &[Property], index: usize) -> RawEvent {
    let mut event = RawEvent::default();

    for property in properties {
        let Some(value) = property.value.as_deref() else {
            continue;
        };

        match property.name.to_ascii_uppercase().as_str() {
            "UID" => event.uid = value.trim().to_string(),
            "SUMMARY" => event.summary = non_empty(unescape_text(value)),
            "DESCRIPTION" => event.description = non_empty(unescape_text(value)),
            "LOCATION" => event.location = non_empty(unescape_text(value)),
            "STATUS" => event.status = non_empty(value.trim().to_lowercase()),
            "DTSTART" => event.start = time_value(property, value),
            "DTEND" => event.end = time_value(property, value),
            "DURATION" => event.duration_secs = parse_duration(value).map(|d| d.num_seconds()),
            "RRULE" => event.rrule = non_empty(value.trim().to_string()),
            "RECURRENCE-ID" => event.recurrence_id = time_value(property, value),
            "EXDATE" => event.exdates.extend(time_list(property, value)),
            "RDATE" => event.rdates.extend(time_list(property, value)),
            "ORGANIZER" => event.organizer = Some(party(property, value)),
            "ATTENDEE" => event.attendees.push(party(property, value)),
            _ => {}
        }
    }

    if event.uid.is_empty() {
        event.uid = format!("event-{}", index);
    }

    event
}

fn param<'a>(property: &'a Property, name: &str) -> Option<&'a str> {
    property
        .params
        .as_ref()?
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .and_then(|(_, values)| values.first())
        .map(String::as_str)
}

fn is_date_valued(property: &Property) -> bool {
    param(property, "VALUE").is_some_and(|v| v.eq_ignore_ascii_case("DATE"))
}

fn time_value(property: &Property, value: &str) -> Option<EventTime> {
    parse_event_time(value, is_date_valued(property), param(property, "TZID"))
}

fn time_list(property: &Property, value: &str) -> Vec<EventTime> {
    // PERIOD values are not instants
    if param(property, "VALUE").is_some_and(|v| v.eq_ignore_ascii_case("PERIOD")) {
        return Vec::new();
    }
    parse_event_time_list(value, is_date_valued(property), param(property, "TZID"))
}

fn party(property: &Property, value: &str) -> Party {
    Party {
        address: strip_scheme(value.trim()).to_string(),
        name: param(property, "CN")
            .map(|cn| cn.trim_matches('"').trim().to_string())
            .filter(|cn| !cn.is_empty()),
        partstat: param(property, "PARTSTAT").map(|p| p.to_lowercase()),
    }
}

/// Strip a leading URI scheme such as `mailto:`
fn strip_scheme(address: &str) -> &str {
    match address.split_once(':') {
        Some((scheme, rest))
            if !scheme.is_empty()
                && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.')) =>
        {
            rest
        }
        _ => address,
    }
}

/// Undo TEXT escaping (`\n`, `\,`, `\;`, `\\`)
pub fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();

    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') | Some('N') => out.push('\n'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }

    out
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
