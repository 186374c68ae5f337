//! Input validation shared by the lifecycle and generator code.

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use crate::errors::{LicenseError, LicenseResult};

/// Longest plaintext key accepted for storage.
pub const MAX_LICENSE_KEY_LENGTH: usize = 255;

fn invalid(field_name: &str, message: impl Into<String>) -> LicenseError {
    LicenseError::ValidationError {
        field: field_name.to_string(),
        message: message.into(),
    }
}

/// Validate that a string is not empty or whitespace only.
///
/// # Example
/// ```
/// use keyward::validation::validate_not_empty;
///
/// assert!(validate_not_empty("hello", "name").is_ok());
/// assert!(validate_not_empty("", "name").is_err());
/// assert!(validate_not_empty("   ", "name").is_err());
/// ```
pub fn validate_not_empty(value: &str, field_name: &str) -> LicenseResult<()> {
    if value.trim().is_empty() {
        Err(invalid(field_name, "cannot be empty"))
    } else {
        Ok(())
    }
}

/// Validate string length (in characters) is within bounds.
pub fn validate_length(
    value: &str,
    min: usize,
    max: usize,
    field_name: &str,
) -> LicenseResult<()> {
    let len = value.chars().count();
    if len < min {
        Err(invalid(field_name, format!("must be at least {min} characters")))
    } else if len > max {
        Err(invalid(field_name, format!("must be at most {max} characters")))
    } else {
        Ok(())
    }
}

/// Validate a plaintext license key before it is hashed and stored.
pub fn validate_license_key(value: &str) -> LicenseResult<()> {
    validate_not_empty(value, "license_key")?;
    validate_length(value, 1, MAX_LICENSE_KEY_LENGTH, "license_key")
}

/// Parse a date-time string.
///
/// Accepts formats:
/// - RFC 3339: `2025-12-31T23:59:59Z` (converted to UTC)
/// - Without timezone: `2025-12-31T23:59:59` or `2025-12-31 23:59:59`
/// - Date only: `2025-12-31` (end of that day)
pub fn parse_datetime(value: &str) -> LicenseResult<NaiveDateTime> {
    let value = value.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.naive_utc());
    }

    for format in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(value, format) {
            return Ok(dt);
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(end_of_day) = date.and_hms_opt(23, 59, 59) {
            return Ok(end_of_day);
        }
    }

    Err(LicenseError::InvalidDateError(format!(
        "'{value}' is not a date-time \
         (expected ISO 8601, e.g. '2025-12-31T23:59:59Z' or '2025-12-31')"
    )))
}
