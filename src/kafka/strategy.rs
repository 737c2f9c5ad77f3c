//! Failure strategies for batches the processor rejected

use std::fmt;
use std::str::FromStr;

use crate::models::{Batch, ValidationError, ValidationErrorKind};

/// What a component does when the processor fails a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailStrategy {
    /// Stop the cycle without advancing offsets; the run loop decides on retries
    #[default]
    Exit,
    /// Record the failure, advance offsets as if the batch succeeded and continue
    Skip,
}

impl FailStrategy {
    /// Route a processing failure
    ///
    /// Returns `Ok(())` when the caller should advance offsets and continue,
    /// or the original error when the cycle must stop.
    pub fn handle(&self, batch: &Batch, error: anyhow::Error) -> Result<(), anyhow::Error> {
        match self {
            FailStrategy::Exit => Err(error),
            FailStrategy::Skip => {
                let first = batch.messages().first();
                tracing::warn!(
                    error = %format!("{:#}", error),
                    batch_size = batch.len(),
                    first_topic = first.map(|m| m.topic()).unwrap_or_default(),
                    first_offset = first.map(|m| m.offset()).unwrap_or_default(),
                    "Skipping failed batch"
                );
                Ok(())
            },
        }
    }
}

impl fmt::Display for FailStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailStrategy::Exit => f.write_str("exit"),
            FailStrategy::Skip => f.write_str("skip"),
        }
    }
}

impl FromStr for FailStrategy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exit" => Ok(FailStrategy::Exit),
            "skip" => Ok(FailStrategy::Skip),
            other => Err(ValidationError::with_context(
                ValidationErrorKind::InvalidFailStrategy,
                "failure_strategy",
                format!("got '{}'", other),
            )),
        }
    }
}
