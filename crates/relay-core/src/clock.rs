//! UTC timestamps in the RFC 3339 wire format.

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Current UTC time.
#[must_use]
pub fn now() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

/// Format a timestamp for the wire.
#[must_use]
pub fn to_rfc3339(timestamp: OffsetDateTime) -> String {
    timestamp
        .format(&Rfc3339)
        .unwrap_or_else(|_| timestamp.unix_timestamp().to_string())
}

/// Current UTC time, formatted for the wire.
#[must_use]
pub fn now_rfc3339() -> String {
    to_rfc3339(now())
}

/// Parse an RFC 3339 timestamp.
///
/// # Errors
///
/// Returns the parse error for anything that is not RFC 3339.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, time::error::Parse> {
    OffsetDateTime::parse(value, &Rfc3339)
}
