//! Error handling module for the consumer components
//!
//! This module defines the error types used throughout the crate. Errors are
//! tagged with the stage of the consumption cycle they came from so that the
//! single error returned by a component run is diagnostic on its own.

use std::fmt;
use thiserror::Error;

use crate::kafka::BrokerError;

/// Result type alias for component operations
pub type Result<T> = std::result::Result<T, Error>;

/// Stage of a consumption cycle an error was raised in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Creating the broker client
    Connect,
    /// Pre-flight topic existence check
    CheckTopic,
    /// Listing partitions of a topic
    DiscoverPartitions,
    /// Resolving starting offsets
    ResolveOffsets,
    /// Joining the consumer group
    JoinGroup,
    /// Reading records from a partition
    Consume,
    /// Committing offsets
    Commit,
    /// Closing the client or its consumers
    Close,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Connect => "connect",
            Stage::CheckTopic => "check_topic",
            Stage::DiscoverPartitions => "discover_partitions",
            Stage::ResolveOffsets => "resolve_offsets",
            Stage::JoinGroup => "join_group",
            Stage::Consume => "consume",
            Stage::Commit => "commit",
            Stage::Close => "close",
        };
        f.write_str(name)
    }
}

/// Main error type for the consumer components
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors, aggregated at build time
    #[error("Configuration error: {0}")]
    Config(String),

    /// Broker client errors, tagged with the failing stage
    #[error("Kafka error during {stage}: {source}")]
    Broker {
        stage: Stage,
        #[source]
        source: BrokerError,
    },

    /// A configured topic does not exist on the broker
    #[error("Topic check failed: {0}")]
    TopicCheck(String),

    /// Partition discovery returned nothing for a topic
    #[error("No partitions found for topic '{0}'")]
    NoPartitions(String),

    /// Time based offset resolution failed for one partition
    #[error("Offset resolution failed for {topic}/{partition}: {reason}")]
    OffsetResolution {
        topic: String,
        partition: i32,
        reason: String,
    },

    /// The user processor returned an error under the exit strategy
    #[error("Batch processing failed in component '{component}': {reason:#}")]
    Processing {
        component: String,
        reason: anyhow::Error,
    },

    /// A whole consumption cycle failed
    #[error("Component '{component}' failed consuming {topics} (group: {group}): {source}")]
    Cycle {
        component: String,
        group: String,
        topics: String,
        #[source]
        source: Box<Error>,
    },

    /// The operation was cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// Generic internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Wrap a broker error with the stage it happened in
    pub fn broker(stage: Stage, source: BrokerError) -> Self {
        Error::Broker { stage, source }
    }

    /// Stage of the cycle the error came from, if it is a broker error
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::Broker { stage, .. } => Some(*stage),
            Error::TopicCheck(_) => Some(Stage::CheckTopic),
            Error::NoPartitions(_) => Some(Stage::DiscoverPartitions),
            Error::OffsetResolution { .. } => Some(Stage::ResolveOffsets),
            Error::Cycle { source, .. } => source.stage(),
            _ => None,
        }
    }

    /// Check if this error came from the user processor
    pub fn is_processing(&self) -> bool {
        match self {
            Error::Processing { .. } => true,
            Error::Cycle { source, .. } => source.is_processing(),
            _ => false,
        }
    }

    /// Check if this error is a caller initiated cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Cycle { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Convert from envconfig::Error to our Error type
impl From<envconfig::Error> for Error {
    fn from(err: envconfig::Error) -> Self {
        Error::Config(err.to_string())
    }
}
