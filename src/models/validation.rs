//! Reusable validators for component options
//!
//! Each validator returns the accepted value or a [`ValidationError`] naming
//! the option, so builders can collect every violation in one pass.

use std::time::Duration;

use super::error::{ValidationError, ValidationErrorKind, ValidationResult};

/// Validate that a string option is not blank
pub fn validate_non_empty(value: &str, field_name: &str) -> ValidationResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(ValidationError::new(ValidationErrorKind::RequiredField, field_name))
    } else {
        Ok(trimmed.to_string())
    }
}

/// Validate a list option: at least one entry and no blank entries
pub fn validate_non_empty_list(values: &[String], field_name: &str) -> ValidationResult<Vec<String>> {
    if values.is_empty() {
        return Err(ValidationError::new(ValidationErrorKind::RequiredField, field_name));
    }

    values
        .iter()
        .enumerate()
        .map(|(idx, value)| {
            validate_non_empty(value, field_name).map_err(|_| {
                ValidationError::with_context(
                    ValidationErrorKind::RequiredField,
                    field_name,
                    format!("entry {} is empty", idx),
                )
            })
        })
        .collect()
}

/// Validate that a count is at least `min`
pub fn validate_min(value: usize, min: usize, field_name: &str) -> ValidationResult<usize> {
    if value < min {
        Err(ValidationError::with_context(
            ValidationErrorKind::BelowMinimum { min: min as u64 },
            field_name,
            format!("got {}", value),
        ))
    } else {
        Ok(value)
    }
}

/// Validate that a duration is strictly positive
pub fn validate_positive_duration(value: Duration, field_name: &str) -> ValidationResult<Duration> {
    if value.is_zero() {
        Err(ValidationError::new(ValidationErrorKind::ZeroDuration, field_name))
    } else {
        Ok(value)
    }
}

/// Split a comma separated list, dropping surrounding whitespace and blanks
pub fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
