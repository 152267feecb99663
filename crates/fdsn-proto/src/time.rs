//! FDSN time grammar.
//!
//! Accepted shapes: `YYYY-MM-DD`, `YYYY-MM-DDThh:mm:ss`, and the latter
//! with fractional seconds up to microseconds. A trailing `Z` is allowed;
//! any other timezone designator is rejected rather than converted.
//! Instants are UTC with microsecond precision throughout the suite.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

/// Sentinel used by the catalog for open-ended epochs.
pub fn far_future() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2500, 1, 1, 0, 0, 0).unwrap()
}

/// Counterpart sentinel for windows unbounded below.
pub fn far_past() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(1900, 1, 1, 0, 0, 0).unwrap()
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TimeError {
    #[error("invalid time '{0}'")]
    Invalid(String),
    #[error("non-UTC timezone in '{0}'")]
    NonUtc(String),
}

/// Parse an FDSN request time into a UTC instant.
pub fn parse_time(s: &str) -> Result<DateTime<Utc>, TimeError> {
    let trimmed = s.trim();
    let bare = trimmed.strip_suffix('Z').unwrap_or(trimmed);

    // Offsets like `+02:00` or `-05:00` carry a sign after the date part.
    if bare.len() > 10 {
        let tail = &bare.as_bytes()[10..];
        if tail.contains(&b'+') || tail.contains(&b'-') {
            return Err(TimeError::NonUtc(s.to_owned()));
        }
    }

    if let Ok(dt) = NaiveDateTime::parse_from_str(bare, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(bare, "%Y-%m-%dT%H:%M:%S") {
        return Ok(DateTime::from_naive_utc_and_offset(dt, Utc));
    }
    if let Ok(d) = NaiveDate::parse_from_str(bare, "%Y-%m-%d") {
        let midnight = d.and_hms_opt(0, 0, 0).ok_or_else(|| TimeError::Invalid(s.to_owned()))?;
        return Ok(DateTime::from_naive_utc_and_offset(midnight, Utc));
    }

    Err(TimeError::Invalid(s.to_owned()))
}

/// Render an instant in the canonical FDSN form with microsecond precision.
pub fn format_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}
