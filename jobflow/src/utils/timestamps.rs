//! Timestamp helpers for record bookkeeping.
//!
//! Record timestamps are stored as RFC 3339 strings with microsecond
//! precision so they sort lexicographically and can serve as optimistic-lock
//! tokens.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Errors that can occur during timestamp parsing.
#[derive(Debug, Error)]
pub enum TimestampError {
    /// The timestamp string is empty.
    #[error("Empty timestamp string")]
    EmptyString,

    /// The timestamp value is invalid.
    #[error("Invalid timestamp: {0}")]
    InvalidFormat(String),
}

/// Returns the current UTC time as an RFC 3339 string.
///
/// Format: `YYYY-MM-DDTHH:MM:SS.ffffff+00:00`
///
/// # Examples
///
/// ```
/// use jobflow::utils::iso_timestamp;
///
/// let ts = iso_timestamp();
/// assert!(ts.contains('T'));
/// assert!(ts.ends_with("+00:00"));
/// ```
#[must_use]
pub fn iso_timestamp() -> String {
    format_iso8601(&Utc::now())
}

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Formats a timestamp as an RFC 3339 string with microsecond precision.
#[must_use]
pub fn format_iso8601(dt: &Timestamp) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Parses an RFC 3339 timestamp (accepts a trailing `Z`).
pub fn parse_timestamp(value: &str) -> Result<Timestamp, TimestampError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(TimestampError::EmptyString);
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| TimestampError::InvalidFormat(trimmed.to_string()))
}

/// Returns a timestamp strictly later than `previous`.
///
/// Two writes within the same microsecond would otherwise produce identical
/// `updated_at` values and defeat the conditional write guard.
#[must_use]
pub fn next_after(previous: &str) -> String {
    let now = Utc::now();
    match parse_timestamp(previous) {
        Ok(prev) if prev >= now => format_iso8601(&(prev + Duration::microseconds(1))),
        _ => format_iso8601(&now),
    }
}

/// Returns the timestamp `days` days from now.
#[must_use]
pub fn days_from_now(days: i64) -> String {
    format_iso8601(&(Utc::now() + Duration::days(days)))
}

/// Returns true if an RFC 3339 expiry lies in the past relative to `now`.
#[must_use]
pub fn is_expired(expires_at: &str, now: &Timestamp) -> bool {
    parse_timestamp(expires_at).is_ok_and(|at| at <= *now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_iso_timestamp_format() {
        let ts = iso_timestamp();
        assert!(ts.contains('T'));
        assert!(ts.ends_with("+00:00"));
    }

    #[test]
    fn test_parse_rfc3339() {
        let dt = parse_timestamp("2023-10-05T14:30:00Z").unwrap();
        assert_eq!(dt.year(), 2023);
        assert_eq!(dt.month(), 10);
        assert_eq!(dt.day(), 5);
    }

    #[test]
    fn test_parse_empty_string() {
        assert!(matches!(parse_timestamp("  "), Err(TimestampError::EmptyString)));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(TimestampError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_next_after_is_strictly_later() {
        let future = format_iso8601(&(Utc::now() + Duration::seconds(60)));
        let next = next_after(&future);
        assert!(next > future);

        let past = "2020-01-01T00:00:00.000000+00:00";
        assert!(next_after(past).as_str() > past);
    }

    #[test]
    fn test_format_round_trip_sorts() {
        let a = format_iso8601(&(Utc::now()));
        let b = format_iso8601(&(Utc::now() + Duration::milliseconds(5)));
        assert!(a < b);
    }

    #[test]
    fn test_is_expired() {
        let now = Utc::now();
        assert!(is_expired("2020-01-01T00:00:00Z", &now));
        assert!(!is_expired(&days_from_now(1), &now));
        assert!(!is_expired("garbage", &now));
    }
}
