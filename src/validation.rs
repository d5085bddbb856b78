//! Validation helpers for configuration values and database payloads.
//!
//! Table and function names end up in request paths, so they are checked
//! against a conservative SQL identifier pattern before any request is sent.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::fmt;

/// Validation error type.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

impl std::error::Error for ValidationError {}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validate that a string is not empty or whitespace-only.
pub fn validate_not_empty(value: &str, field_name: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        Err(ValidationError {
            field: field_name.to_string(),
            message: "cannot be empty".to_string(),
        })
    } else {
        Ok(())
    }
}

/// Validate a SQL identifier (table, column or function name).
///
/// # Example
/// ```
/// use subkeeper::validation::validate_identifier;
///
/// assert!(validate_identifier("user_subscriptions", "table").is_ok());
/// assert!(validate_identifier("users; drop table", "table").is_err());
/// ```
pub fn validate_identifier(value: &str, field_name: &str) -> ValidationResult<()> {
    let ident_regex = regex::Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}$").unwrap();

    if ident_regex.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError {
            field: field_name.to_string(),
            message: format!("'{value}' is not a valid identifier"),
        })
    }
}

/// Validate a service base URL (must be http or https).
pub fn validate_base_url(value: &str, field_name: &str) -> ValidationResult<()> {
    validate_not_empty(value, field_name)?;

    let url_regex = regex::Regex::new(r"^https?://[^\s/?#]+(/[^\s?#]*)?$").unwrap();

    if url_regex.is_match(value) {
        Ok(())
    } else {
        Err(ValidationError {
            field: field_name.to_string(),
            message: "must be an http:// or https:// URL".to_string(),
        })
    }
}

/// Validate a value is within an inclusive range.
pub fn validate_range(value: u64, min: u64, max: u64, field_name: &str) -> ValidationResult<()> {
    if value < min || value > max {
        return Err(ValidationError {
            field: field_name.to_string(),
            message: format!("must be between {min} and {max}, got {value}"),
        });
    }
    Ok(())
}

/// Parse a timestamp as returned by the database.
///
/// Accepts RFC 3339 (with `Z` or an offset), timestamps without an offset
/// (taken as UTC) and bare dates (midnight UTC).
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    // Postgres `timestamptz` text output uses a space separator and a short offset.
    if let Ok(dt) = DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
