//! Kafka consumer components
//!
//! Batching consumer-group and simple partition consumers with size and
//! timeout triggered flushes, exit/skip failure strategies, whole-cycle
//! retries and time based start offsets.

pub mod config;
pub mod error;
pub mod kafka;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod shutdown;
pub mod test_utils;

// Re-export commonly used types at the crate root
pub use config::Config;
pub use error::{Error, Result, Stage};

pub use kafka::{
    BatchProcessor, FailStrategy, GroupComponent, GroupComponentBuilder, LatestOffsetNotifier, SimpleComponent,
    SimpleComponentBuilder, StartOffset,
};
pub use models::{Batch, Message, ValidationError, ValidationErrorKind, ValidationErrors};
pub use shutdown::{cancel_on_shutdown, shutdown_signal};
