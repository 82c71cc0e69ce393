//! Frequency parsing, timestamp formatting, and window slicing.

use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TimeError {
    #[error("invalid frequency '{0}' (expected <integer><unit>, unit in s|min|h|d|w|m)")]
    InvalidFrequency(String),

    #[error("failed to parse timestamp '{value}' with format '{format}': {message}")]
    ParseError {
        value: String,
        format: String,
        message: String,
    },
}

/// Sentinel format meaning integer seconds since the Unix epoch. Detected by
/// exact match so it is never handed to strftime.
pub const EPOCH_FORMAT: &str = "%s";

/// Parse a frequency expression such as `30s`, `5min`, `1h`, `2d`, `1w`, `1m`.
/// The `m` unit means 30-day months for interval arithmetic.
pub fn parse_frequency(expr: &str) -> Result<Duration, TimeError> {
    let trimmed = expr.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .filter(|&i| i > 0)
        .ok_or_else(|| TimeError::InvalidFrequency(expr.to_string()))?;
    let (digits, unit) = trimmed.split_at(split);
    let value: i64 = digits
        .parse()
        .map_err(|_| TimeError::InvalidFrequency(expr.to_string()))?;
    if value == 0 {
        return Err(TimeError::InvalidFrequency(expr.to_string()));
    }
    let duration = match unit {
        "s" => Duration::seconds(value),
        "min" => Duration::minutes(value),
        "h" => Duration::hours(value),
        "d" => Duration::days(value),
        "w" => Duration::weeks(value),
        "m" => Duration::days(value * 30),
        _ => return Err(TimeError::InvalidFrequency(expr.to_string())),
    };
    Ok(duration)
}

/// Format a timestamp with an optional strftime-style format. `None` renders
/// RFC 3339; `%s` renders epoch seconds.
pub fn format_datetime(dt: DateTime<Utc>, format: Option<&str>) -> String {
    match format {
        None => dt.to_rfc3339(),
        Some(EPOCH_FORMAT) => dt.timestamp().to_string(),
        Some(fmt) => dt.format(fmt).to_string(),
    }
}

/// Parse a timestamp with an optional strftime-style format.
///
/// With no format the value must be RFC 3339. `%s` parses epoch seconds. A
/// format carrying a zone directive parses as an aware timestamp and is
/// converted to UTC; otherwise the value is taken as naive UTC.
pub fn parse_datetime(value: &str, format: Option<&str>) -> Result<DateTime<Utc>, TimeError> {
    let err = |format: &str, message: String| TimeError::ParseError {
        value: value.to_string(),
        format: format.to_string(),
        message,
    };
    match format {
        None => DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| err("rfc3339", e.to_string())),
        Some(EPOCH_FORMAT) => {
            let seconds: i64 = value
                .parse()
                .map_err(|e: std::num::ParseIntError| err(EPOCH_FORMAT, e.to_string()))?;
            Utc.timestamp_opt(seconds, 0)
                .single()
                .ok_or_else(|| err(EPOCH_FORMAT, "timestamp out of range".to_string()))
        }
        Some(fmt) if fmt.contains("%z") || fmt.contains("%Z") || fmt.contains("%:z") => {
            DateTime::parse_from_str(value, fmt)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| err(fmt, e.to_string()))
        }
        Some(fmt) => NaiveDateTime::parse_from_str(value, fmt)
            .map(|ndt| Utc.from_utc_datetime(&ndt))
            .map_err(|e| err(fmt, e.to_string())),
    }
}

/// Split `[start, end)` into consecutive half-open slices of `delta`, the
/// last possibly shorter. Without a delta, or with one larger than the
/// range, a single slice covers the whole range.
pub fn window_slices(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    delta: Option<Duration>,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let Some(delta) = delta.filter(|d| *d > Duration::zero()) else {
        return vec![(start, end)];
    };
    let mut slices = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next = std::cmp::min(cursor + delta, end);
        slices.push((cursor, next));
        cursor = next;
    }
    if slices.is_empty() {
        slices.push((start, end));
    }
    slices
}
