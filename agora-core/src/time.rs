//! RFC3339 UTC timestamp helpers.
//!
//! All persisted and wire-visible timestamps use second precision with the
//! `Z` suffix, e.g. `2026-03-01T12:00:00Z`.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{ServiceError, ServiceResult};

/// Current UTC time as an RFC3339 string with second precision
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Format a datetime as RFC3339 with second precision
pub fn to_iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse an RFC3339 timestamp into a UTC datetime
pub fn parse_iso(value: &str) -> ServiceResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| ServiceError::internal(format!("Invalid timestamp '{value}': {err}")))
}

/// Add whole seconds to an RFC3339 timestamp
pub fn add_seconds(base: &str, seconds: i64) -> ServiceResult<DateTime<Utc>> {
    Ok(parse_iso(base)? + chrono::Duration::seconds(seconds))
}
