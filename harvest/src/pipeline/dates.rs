use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::models::provider::RawTimestamp;
use crate::models::ConversationRecord;

/// Integers above this are read as epoch milliseconds rather than seconds.
/// As seconds it would be roughly the year 5138.
const EPOCH_MILLIS_THRESHOLD: i64 = 100_000_000_000;

const NAIVE_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

const OFFSET_FORMATS: &[&str] = &["%Y-%m-%d %H:%M:%S%.f%:z", "%Y-%m-%d %H:%M:%S%.f %z"];

/// Interpret a wire timestamp as a UTC instant.
///
/// Accepts epoch seconds (integer or fractional), epoch milliseconds, RFC 3339
/// strings in any offset, naive datetimes (taken as UTC) and bare dates
/// (midnight UTC). Returns `None` for anything else.
pub fn normalize_timestamp(raw: &RawTimestamp) -> Option<DateTime<Utc>> {
    match raw {
        RawTimestamp::Integer(value) => from_epoch_integer(*value),
        RawTimestamp::Float(value) => from_epoch_float(*value),
        RawTimestamp::Text(text) => parse_datetime_text(text),
    }
}

pub fn parse_datetime_text(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(value) = text.parse::<i64>() {
        return from_epoch_integer(value);
    }
    if let Ok(value) = text.parse::<f64>() {
        return from_epoch_float(value);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in OFFSET_FORMATS {
        if let Ok(dt) = DateTime::parse_from_str(text, format) {
            return Some(dt.with_timezone(&Utc));
        }
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

fn from_epoch_integer(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= EPOCH_MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    }
}

fn from_epoch_float(value: f64) -> Option<DateTime<Utc>> {
    if !value.is_finite() {
        return None;
    }
    if value.abs() >= EPOCH_MILLIS_THRESHOLD as f64 {
        return DateTime::from_timestamp_millis(value.round() as i64);
    }
    let secs = value.floor();
    let nanos = ((value - secs) * 1_000_000_000.0).round() as u32;
    DateTime::from_timestamp(secs as i64, nanos.min(999_999_999))
}

/// Outcome of filtering a batch of records against a window.
#[derive(Debug, Default)]
pub struct WindowFilter {
    pub kept: Vec<ConversationRecord>,
    pub dropped: usize,
}

/// Drop records whose `created_at` falls outside `[start, end]`.
///
/// Timestamps are already canonical UTC by the time a record exists, so this
/// guards against the search API returning items beyond the requested range.
pub fn filter_to_window(
    records: Vec<ConversationRecord>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> WindowFilter {
    let mut outcome = WindowFilter::default();
    for record in records {
        if record.created_at >= start && record.created_at <= end {
            outcome.kept.push(record);
        } else {
            tracing::debug!(
                conversation_id = %record.id,
                created_at = %record.created_at,
                "Dropping conversation outside requested window"
            );
            outcome.dropped += 1;
        }
    }
    if outcome.dropped > 0 {
        tracing::info!(
            dropped = outcome.dropped,
            kept = outcome.kept.len(),
            "Filtered out-of-window conversations"
        );
    }
    outcome
}
