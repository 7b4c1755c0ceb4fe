use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::event::{value_as_u64, CanonicalUpdate, EventKind};
use crate::frame::{decode_json_frame, FrameError};

/// Maps one decoded frame onto a [`CanonicalUpdate`].
///
/// Frames without a `session_id` or `type` yield `None` and are meant to be
/// dropped by the caller. The payload is taken from `data`, then `result`,
/// then the frame itself. `received_at` stands in for a missing timestamp, so
/// the same frame and arrival time always produce the same update.
pub fn normalize(raw: &Value, received_at: DateTime<Utc>) -> Option<CanonicalUpdate> {
    let frame = raw.as_object()?;
    let session_id = non_blank_str(frame.get("session_id"))?;
    let kind = non_blank_str(frame.get("type")).map(EventKind::parse)?;

    let data = frame
        .get("data")
        .filter(|value| !value.is_null())
        .or_else(|| frame.get("result").filter(|value| !value.is_null()))
        .cloned()
        .unwrap_or_else(|| raw.clone());

    let iteration = frame
        .get("iteration")
        .and_then(iteration_number)
        .or_else(|| data.get("iteration").and_then(iteration_number));
    let phase = non_blank_str(frame.get("phase"))
        .or_else(|| non_blank_str(data.get("phase")))
        .map(str::to_string);
    let message = non_blank_str(frame.get("message"))
        .or_else(|| non_blank_str(data.get("message")))
        .or_else(|| non_blank_str(frame.get("error_message")))
        .map(str::to_string);
    let timestamp = frame
        .get("timestamp")
        .and_then(parse_timestamp)
        .or_else(|| data.get("timestamp").and_then(parse_timestamp))
        .unwrap_or(received_at);
    let id = match frame.get("id") {
        Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => derived_id(raw),
    };

    Some(CanonicalUpdate {
        id,
        kind,
        session_id: session_id.to_string(),
        iteration,
        phase,
        message,
        data,
        timestamp,
    })
}

/// Decodes a text frame and normalizes it. Malformed JSON is an error, a
/// well-formed frame missing its envelope keys is `Ok(None)`.
pub fn normalize_text(
    text: &str,
    max_frame_bytes: usize,
    received_at: DateTime<Utc>,
) -> Result<Option<CanonicalUpdate>, FrameError> {
    let value = decode_json_frame(text, max_frame_bytes)?;
    Ok(normalize(&value, received_at))
}

pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => {
            let text = text.trim();
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Some(parsed.with_timezone(&Utc));
            }
            NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f"))
                .ok()
                .map(|naive| Utc.from_utc_datetime(&naive))
        }
        Value::Number(number) => {
            let raw = number.as_f64()?;
            let millis = if raw.abs() >= 1e12 { raw } else { raw * 1000.0 };
            Utc.timestamp_millis_opt(millis as i64).single()
        }
        _ => None,
    }
}

fn non_blank_str(value: Option<&Value>) -> Option<&str> {
    value
        .and_then(Value::as_str)
        .filter(|text| !text.trim().is_empty())
}

fn iteration_number(value: &Value) -> Option<u32> {
    value_as_u64(value).and_then(|n| u32::try_from(n).ok())
}

fn derived_id(raw: &Value) -> String {
    let canonical = canonicalize_value(raw.clone());
    let rendered = canonical.to_string();
    let mut hasher = Sha256::new();
    hasher.update(rendered.as_bytes());
    let digest = hasher.finalize();
    let mut output = String::from("evt-");
    for byte in digest.iter().take(12) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

fn canonicalize_value(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut entries: Vec<(String, Value)> = object.into_iter().collect();
            entries.sort_by(|left, right| left.0.cmp(&right.0));

            let mut sorted = Map::new();
            for (key, value) in entries {
                sorted.insert(key, canonicalize_value(value));
            }
            Value::Object(sorted)
        }
        Value::Array(values) => Value::Array(values.into_iter().map(canonicalize_value).collect()),
        scalar => scalar,
    }
}
