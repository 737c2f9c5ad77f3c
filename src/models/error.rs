//! Validation error types for component options
//!
//! Option validation never stops at the first problem: every violated
//! constraint is collected into [`ValidationErrors`] and reported together
//! when the component is built.

use std::fmt;
use thiserror::Error;

/// A single violated option constraint
#[derive(Error, Debug, Clone)]
pub struct ValidationError {
    /// The kind of validation error
    pub kind: ValidationErrorKind,
    /// The option that failed validation
    pub field: String,
    /// Optional additional context
    pub context: Option<String>,
}

impl ValidationError {
    /// Create a new validation error
    pub fn new(kind: ValidationErrorKind, field: impl Into<String>) -> Self {
        Self {
            kind,
            field: field.into(),
            context: None,
        }
    }

    /// Create a validation error with additional context
    pub fn with_context(
        kind: ValidationErrorKind,
        field: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            field: field.into(),
            context: Some(context.into()),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(ctx) => write!(f, "option '{}': {} ({})", self.field, self.kind, ctx),
            None => write!(f, "option '{}': {}", self.field, self.kind),
        }
    }
}

/// Specific validation error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationErrorKind {
    /// Field is required but empty
    #[error("value is required")]
    RequiredField,

    /// Numeric value is below its allowed minimum
    #[error("value must be at least {min}")]
    BelowMinimum { min: u64 },

    /// Duration must be strictly positive
    #[error("duration must be greater than zero")]
    ZeroDuration,

    /// Unknown failure strategy name
    #[error("invalid failure strategy (expected: exit or skip)")]
    InvalidFailStrategy,

    /// Option is not supported by this component variant
    #[error("not supported by this component")]
    Unsupported,

    /// Custom validation error
    #[error("{0}")]
    Custom(String),
}

/// Result type alias for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Collection of validation errors
#[derive(Debug, Default, Clone)]
pub struct ValidationErrors {
    errors: Vec<ValidationError>,
}

impl ValidationErrors {
    /// Create a new empty collection
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a validation error to the collection
    pub fn add(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    /// Record the error of a validator, if any
    pub fn check<T>(&mut self, result: ValidationResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(error) => {
                self.add(error);
                None
            },
        }
    }

    /// Check if there are any errors
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Get the number of errors
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Get all errors
    pub fn errors(&self) -> &[ValidationError] {
        &self.errors
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.errors.is_empty() {
            write!(f, "No validation errors")
        } else {
            write!(f, "validation failed with {} error(s):", self.errors.len())?;
            for error in &self.errors {
                write!(f, "\n  - {}", error)?;
            }
            Ok(())
        }
    }
}

impl std::error::Error for ValidationErrors {}

impl From<ValidationErrors> for crate::error::Error {
    fn from(err: ValidationErrors) -> Self {
        crate::error::Error::config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let error = ValidationError::new(ValidationErrorKind::RequiredField, "brokers");
        let display = error.to_string();
        assert!(display.contains("brokers"));
        assert!(display.contains("required"));

        let error = ValidationError::with_context(
            ValidationErrorKind::BelowMinimum { min: 1 },
            "batch_size",
            "got 0",
        );
        assert!(error.to_string().contains("at least 1"));
        assert!(error.to_string().contains("got 0"));
    }

    #[test]
    fn test_check_collects_errors() {
        let mut errors = ValidationErrors::new();
        let ok: ValidationResult<u32> = Ok(3);
        assert_eq!(errors.check(ok), Some(3));
        assert!(errors.is_empty());

        let failed: ValidationResult<u32> =
            Err(ValidationError::new(ValidationErrorKind::ZeroDuration, "retry_wait"));
        assert_eq!(errors.check(failed), None);
        assert_eq!(errors.len(), 1);
    }

    #[test]
    fn test_aggregated_display_lists_every_error() {
        let mut errors = ValidationErrors::new();
        errors.add(ValidationError::new(ValidationErrorKind::RequiredField, "name"));
        errors.add(ValidationError::new(ValidationErrorKind::InvalidFailStrategy, "failure_strategy"));

        let display = errors.to_string();
        assert!(display.contains("2 error(s)"));
        assert!(display.contains("'name'"));
        assert!(display.contains("'failure_strategy'"));

        let app_error: crate::error::Error = errors.into();
        assert!(matches!(app_error, crate::error::Error::Config(_)));
    }
}
