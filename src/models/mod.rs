//! Data models for the consumer components
//!
//! This module contains the delivery units handed to processors and the
//! validation machinery used when building components.

pub mod error;
pub mod message;
pub mod validation;

// Re-export commonly used types
pub use error::{ValidationError, ValidationErrorKind, ValidationErrors, ValidationResult};
pub use message::{Batch, DecodeError, Decoder, Message, CORRELATION_ID_HEADER};
pub use validation::{
    split_list, validate_min, validate_non_empty, validate_non_empty_list,
    validate_positive_duration,
};
