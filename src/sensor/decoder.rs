//! # Sensor Line Decoder
//!
//! Turns raw line bytes from the serial link into samples or status events.
//! Malformed lines are dropped, never reported as errors.

use std::borrow::Cow;

use super::protocol::*;
use tracing::debug;

/// Decode raw bytes into text
///
/// Tries UTF-8 first. Bytes that are not valid UTF-8 are decoded as ASCII
/// with every non-ASCII byte dropped. That step cannot fail, so no further
/// fallback is needed.
pub fn decode_text(raw: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(raw) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => Cow::Owned(raw.iter().filter(|b| b.is_ascii()).map(|&b| b as char).collect()),
    }
}

/// Parse one raw line from the sensor
///
/// # Arguments
///
/// * `raw` - Line bytes, with or without the trailing newline
///
/// # Returns
///
/// * `Some(ParsedLine::Status(..))` for `Started`/`Stopped`/`Loop: N`/`Complete: ...`
/// * `Some(ParsedLine::Sample(..))` for exactly three numeric comma-separated fields
/// * `None` for empty or malformed lines
///
/// # Examples
///
/// ```
/// use moisture_logger::sensor::decoder::parse_line;
/// use moisture_logger::sensor::protocol::{ParsedLine, SensorSample};
///
/// let parsed = parse_line(b"42.5,21.3,60.1\n");
/// assert_eq!(
///     parsed,
///     Some(ParsedLine::Sample(SensorSample {
///         moisture_percent: 42.5,
///         temperature: 21.3,
///         humidity: 60.1,
///     }))
/// );
/// ```
pub fn parse_line(raw: &[u8]) -> Option<ParsedLine> {
    let text = decode_text(raw);
    let line = text.trim();

    if line.is_empty() {
        return None;
    }

    if let Some(status) = parse_status(line) {
        return status.map(ParsedLine::Status);
    }

    match parse_sample(line) {
        Some(sample) => Some(ParsedLine::Sample(sample)),
        None => {
            debug!("Discarding unparsable line: {:?}", line);
            None
        }
    }
}

/// Classify a trimmed line as a status message
///
/// The outer `Option` says whether the line is a status line at all; the
/// inner one is `None` when it is but its payload is malformed.
fn parse_status(line: &str) -> Option<Option<StatusEvent>> {
    if line.contains(STARTED_MARKER) {
        return Some(Some(StatusEvent::Started(line.to_string())));
    }

    if line.contains(STOPPED_MARKER) {
        return Some(Some(StatusEvent::Stopped(line.to_string())));
    }

    if let Some(rest) = line.strip_prefix(LOOP_PREFIX) {
        let event = match rest.trim().parse::<u32>() {
            Ok(n) => Some(StatusEvent::Loop(n)),
            Err(e) => {
                debug!("Invalid loop message {:?}: {}", line, e);
                None
            }
        };
        return Some(event);
    }

    if let Some(rest) = line.strip_prefix(COMPLETE_PREFIX) {
        return Some(Some(StatusEvent::Complete(rest.trim().to_string())));
    }

    None
}

fn parse_sample(line: &str) -> Option<SensorSample> {
    let fields: Vec<&str> = line.split(FIELD_SEPARATOR).collect();

    if fields.len() != DATA_FIELD_COUNT {
        debug!("Expected {} values, got {}", DATA_FIELD_COUNT, fields.len());
        return None;
    }

    let mut values = [0.0f64; DATA_FIELD_COUNT];
    for (slot, field) in values.iter_mut().zip(&fields) {
        *slot = field.trim().parse().ok()?;
    }

    Some(SensorSample {
        moisture_percent: values[0],
        temperature: values[1],
        humidity: values[2],
    })
}
