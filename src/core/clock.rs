//! UTC timestamp helpers shared by the record, state, and metrics layers.

use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};

/// Wall-clock instant used everywhere in the engine.
pub type Timestamp = DateTime<Utc>;

/// Format a timestamp as RFC 3339 with millisecond precision and a `Z` suffix.
#[must_use]
pub fn format_utc(ts: Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current UTC time formatted for log lines.
#[must_use]
pub fn format_utc_now() -> String {
    format_utc(Utc::now())
}

/// Parse an RFC 3339 timestamp (`Z` or numeric offset) into UTC.
#[must_use]
pub fn parse_utc(raw: &str) -> Option<Timestamp> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Whole seconds as a signed duration, saturating instead of overflowing.
#[must_use]
pub fn secs(seconds: u64) -> TimeDelta {
    i64::try_from(seconds)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .unwrap_or(TimeDelta::MAX)
}
