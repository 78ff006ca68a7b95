//! Shared storage helper functions.
//!
//! Text encodings for timestamps and decimals used by the SQL backend, plus
//! the window arithmetic shared by both backends.

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;

use super::{Result, StorageError};

/// Format a timestamp as fixed-width RFC 3339 UTC with microseconds.
///
/// Every stored timestamp has the same width, so lexical comparison in SQL
/// matches chronological order.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a timestamp written by [`format_timestamp`].
pub fn parse_timestamp(column: &'static str, text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidValue {
            column,
            value: text.to_string(),
        })
}

pub fn parse_optional_timestamp(
    column: &'static str,
    text: Option<String>,
) -> Result<Option<DateTime<Utc>>> {
    text.map(|t| parse_timestamp(column, &t)).transpose()
}

/// Decimals are stored as their canonical text so no precision is lost.
pub fn format_decimal(value: Decimal) -> String {
    value.normalize().to_string()
}

pub fn parse_decimal(column: &'static str, text: &str) -> Result<Decimal> {
    text.parse::<Decimal>().map_err(|_| StorageError::InvalidValue {
        column,
        value: text.to_string(),
    })
}

/// Parse a stored enum through its `parse` function.
pub fn parse_enum<T>(column: &'static str, text: &str, parse: fn(&str) -> Option<T>) -> Result<T> {
    parse(text).ok_or_else(|| StorageError::InvalidValue {
        column,
        value: text.to_string(),
    })
}
