//! Timestamp storage helpers
//!
//! All timestamps are stored as fixed-width RFC 3339 strings in UTC with
//! microsecond precision, so SQL string comparison orders them chronologically.

use chrono::{DateTime, SecondsFormat, Utc};

/// Format a timestamp for storage
pub fn to_db(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp
pub fn from_db(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

/// Parse an optional stored timestamp, dropping unparseable values
pub fn from_db_opt(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.and_then(|s| from_db(s).ok())
}
