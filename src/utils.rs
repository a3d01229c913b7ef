/// Utility functions for formatting and advertisement filtering
use time::macros::format_description;
use time::OffsetDateTime;

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    dt.format(format_description!(
        "[day].[month].[year] - [hour]:[minute]:[second]"
    ))
    .unwrap_or_else(|_| dt.to_string())
}

/// Decide whether an advertised name passes the configured filter
///
/// Matching is a case-insensitive substring test. Without a filter every
/// advertisement passes; with one, nameless advertisements never do.
pub fn matches_name_filter(filter: Option<&str>, name: Option<&str>) -> bool {
    match (filter, name) {
        (None, _) => true,
        (Some(_), None) => false,
        (Some(filter), Some(name)) => name.to_lowercase().contains(&filter.to_lowercase()),
    }
}
