//! Pre-parse repair of raw calendar text.
//!
//! Feeds in the wild often give a recurrence rule an `UNTIL` value whose type
//! does not match the event's `DTSTART` (date vs date-time, UTC vs floating).
//! Strict parsers reject that and expansion goes wrong, so the termination
//! value is rewritten to the shape of the start value before parsing.

/// Join continuation lines (leading space or tab) onto the previous logical line
pub fn unfold_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();

    for raw in text.split('\n') {
        let line = raw.strip_suffix('\r').unwrap_or(raw);

        if let Some(rest) = line.strip_prefix(' ').or_else(|| line.strip_prefix('\t')) {
            if let Some(previous) = lines.last_mut() {
                previous.push_str(rest);
                continue;
            }
        }

        lines.push(line.to_string());
    }

    // A trailing newline leaves one empty segment behind
    if text.ends_with('\n') && lines.last().map(|l| l.is_empty()).unwrap_or(false) {
        lines.pop();
    }

    lines
}

/// Repair a raw calendar document, returning CRLF-terminated unfolded text
pub fn sanitize(text: &str) -> String {
    let mut output: Vec<String> = Vec::new();
    let mut block: Option<Vec<String>> = None;

    for line in unfold_lines(text) {
        match block.as_mut() {
            Some(lines) => {
                let closes = line.trim().eq_ignore_ascii_case("END:VEVENT");
                lines.push(line);
                if closes {
                    if let Some(finished) = block.take() {
                        output.extend(repair_event_block(finished));
                    }
                }
            }
            None => {
                if line.trim().eq_ignore_ascii_case("BEGIN:VEVENT") {
                    block = Some(vec![line]);
                } else {
                    output.push(line);
                }
            }
        }
    }

    // Unterminated block at end of input
    if let Some(unfinished) = block {
        output.extend(repair_event_block(unfinished));
    }

    let mut result = String::with_capacity(text.len());
    for line in output {
        result.push_str(&line);
        result.push_str("\r\n");
    }
    result
}

/// Shape of an event's start value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StartShape {
    is_date_only: bool,
    has_utc_marker: bool,
}

fn repair_event_block(lines: Vec<String>) -> Vec<String> {
    let shape = lines
        .iter()
        .filter_map(|line| split_content_line(line))
        .find(|(name, _, _)| name.eq_ignore_ascii_case("DTSTART"))
        .map(|(_, params, value)| start_shape(params, value));

    let Some(shape) = shape else {
        return lines;
    };

    lines
        .into_iter()
        .map(|line| repair_rrule_line(&line, shape).unwrap_or(line))
        .collect()
}

fn start_shape(params: &str, value: &str) -> StartShape {
    let value = value.trim();
    let has_date_param = params
        .split(';')
        .any(|param| param.trim().eq_ignore_ascii_case("VALUE=DATE"));

    StartShape {
        is_date_only: has_date_param || is_bare_date(value),
        has_utc_marker: value.ends_with('Z') || value.ends_with('z'),
    }
}

/// Rewrite the `UNTIL` part of an `RRULE` line; `None` when nothing changes
fn repair_rrule_line(line: &str, shape: StartShape) -> Option<String> {
    let (name, params, value) = split_content_line(line)?;
    if !name.eq_ignore_ascii_case("RRULE") {
        return None;
    }

    let mut changed = false;
    let parts: Vec<String> = value
        .split(';')
        .map(|part| {
            let Some((key, until)) = part.split_once('=') else {
                return part.to_string();
            };
            if !key.trim().eq_ignore_ascii_case("UNTIL") {
                return part.to_string();
            }
            match repair_until(until.trim(), shape) {
                Some(fixed) => {
                    changed = true;
                    format!("{}={}", key, fixed)
                }
                None => part.to_string(),
            }
        })
        .collect();

    if !changed {
        return None;
    }

    let head_len = name.len() + params.len();
    Some(format!("{}:{}", &line[..head_len], parts.join(";")))
}

fn repair_until(until: &str, shape: StartShape) -> Option<String> {
    let has_time = until.contains('T') || until.contains('t');

    if shape.is_date_only && has_time {
        return until.get(..8).map(str::to_string);
    }

    if !shape.is_date_only && is_bare_date(until) {
        let suffix = if shape.has_utc_marker { "T000000Z" } else { "T000000" };
        return Some(format!("{}{}", until, suffix));
    }

    None
}

fn is_bare_date(value: &str) -> bool {
    value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit())
}

/// Split a content line into name, parameter section (with leading `;`) and value.
///
/// The value starts at the first colon outside double quotes, so quoted
/// parameter values such as `TZID="Europe/Helsinki:x"` are kept intact.
fn split_content_line(line: &str) -> Option<(&str, &str, &str)> {
    let mut in_quotes = false;
    let mut colon = None;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ':' if !in_quotes => {
                colon = Some(index);
                break;
            }
            _ => {}
        }
    }

    let colon = colon?;
    let head = &line[..colon];
    let value = &line[colon + 1..];
    let name_end = head.find(';').unwrap_or(head.len());

    Some((&head[..name_end], &head[name_end..], value))
}
