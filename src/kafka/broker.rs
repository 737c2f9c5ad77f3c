//! Broker client adapter
//!
//! The components never talk to a Kafka client library directly. They go
//! through the traits in this module, which expose exactly what a
//! consumption cycle needs: topic and partition discovery, watermark
//! queries, single-record fetches for offset resolution, per-partition record
//! streams, consumer-group sessions and offset commits.
//!
//! [`crate::kafka::RdKafkaConnector`] implements them over `rdkafka`;
//! [`crate::test_utils::MockBroker`] implements them in memory.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Result type for broker operations
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Errors reported by a broker client
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The requested offset is outside the retained range of the partition
    #[error("offset {offset} out of range for {topic}/{partition}")]
    OffsetOutOfRange {
        topic: String,
        partition: i32,
        offset: i64,
    },

    /// The topic is unknown to the broker
    #[error("unknown topic '{0}'")]
    UnknownTopic(String),

    /// The client, consumer or session has been closed
    #[error("client closed")]
    Closed,

    /// The broker could not be reached or did not answer in time
    #[error("broker unavailable: {0}")]
    Unavailable(String),

    /// Error reported by the Kafka client library
    #[error("Kafka client error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

impl BrokerError {
    /// Whether the error means the offset aged out of retention
    pub fn is_offset_out_of_range(&self) -> bool {
        matches!(self, BrokerError::OffsetOutOfRange { .. })
    }
}

/// How processed offsets are handed back to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommitMode {
    /// Commit synchronously after every batch
    Sync,
    /// Store offsets and let the client's background auto-commit send them
    #[default]
    Auto,
}

/// Where a consumer starts reading when no resumable position is known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// Committed group offset (group consumers only)
    Stored,
    /// Oldest retained offset
    Oldest,
    /// Next offset to be produced
    Newest,
    /// First record at or after `now - duration`
    Since(std::time::Duration),
}

/// One record as delivered by the broker
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Position to commit for one partition (the next offset to read)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl PartitionOffset {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

impl fmt::Display for PartitionOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// Ordered record stream of a single partition
///
/// The stream is fed by a background task; dropping the stream closes the
/// channel and stops that task.
pub struct PartitionStream {
    pub topic: String,
    pub partition: i32,
    records: mpsc::Receiver<BrokerResult<RawRecord>>,
    feeder: Option<JoinHandle<()>>,
}

impl PartitionStream {
    /// Build a stream over a channel fed by `feeder`
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        records: mpsc::Receiver<BrokerResult<RawRecord>>,
        feeder: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            records,
            feeder,
        }
    }

    /// Next record; `None` once the upstream closed the channel
    pub async fn recv(&mut self) -> Option<BrokerResult<RawRecord>> {
        self.records.recv().await
    }

    /// Stop the feeder and close the channel
    pub fn close(&mut self) {
        self.records.close();
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

impl Drop for PartitionStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for PartitionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionStream")
            .field("topic", &self.topic)
            .field("partition", &self.partition)
            .finish()
    }
}

/// A partition handed to this member of a consumer group
#[derive(Debug)]
pub struct PartitionClaim {
    pub stream: PartitionStream,
    /// Offset the stream begins at, when the broker knows it up front
    pub start: Option<i64>,
}

/// Hands processed offsets back to the broker
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    /// Commit (`Sync`) or store for auto-commit (`Auto`) the given positions
    async fn commit(&self, offsets: &[PartitionOffset], mode: CommitMode) -> BrokerResult<()>;
}

/// Membership of one consumer group generation
#[async_trait]
pub trait GroupSession: Send {
    /// Next partition claim; `None` once the generation ended (rebalance or close)
    async fn next_claim(&mut self) -> Option<PartitionClaim>;

    /// Committer bound to this session
    fn committer(&self) -> Arc<dyn OffsetCommitter>;

    /// Leave the group and release the session's resources
    async fn close(&mut self) -> BrokerResult<()>;
}

/// Connection to a broker cluster
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Names of all topics known to the cluster
    async fn list_topics(&self) -> BrokerResult<Vec<String>>;

    /// Whether the cluster creates topics on first use
    async fn auto_creates_topics(&self) -> BrokerResult<bool>;

    /// Partition ids of a topic
    async fn partitions(&self, topic: &str) -> BrokerResult<Vec<i32>>;

    /// Oldest retained offset and next offset to be produced
    async fn watermarks(&self, topic: &str, partition: i32) -> BrokerResult<(i64, i64)>;

    /// Fetch the record at `offset` (or the first one after it)
    async fn fetch_record(&self, topic: &str, partition: i32, offset: i64) -> BrokerResult<RawRecord>;

    /// Stream a partition starting at `offset`, outside of any group
    async fn consume_partition(&self, topic: &str, partition: i32, offset: i64) -> BrokerResult<PartitionStream>;

    /// Join a consumer group for `topics`
    ///
    /// `start_offsets` overrides the group's stored position for the listed
    /// partitions when they are claimed.
    async fn join_group(
        &self,
        group: &str,
        topics: &[String],
        start_offsets: &HashMap<(String, i32), i64>,
        commit_mode: CommitMode,
    ) -> BrokerResult<Box<dyn GroupSession>>;

    /// Release the client
    async fn close(&self) -> BrokerResult<()>;
}

/// Builds a fresh broker client for every consumption cycle
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_out_of_range_detection() {
        let err = BrokerError::OffsetOutOfRange {
            topic: "orders".to_string(),
            partition: 1,
            offset: 4,
        };
        assert!(err.is_offset_out_of_range());
        assert!(!BrokerError::Closed.is_offset_out_of_range());
        assert_eq!(err.to_string(), "offset 4 out of range for orders/1");
    }

    #[test]
    fn test_partition_offset_display() {
        assert_eq!(PartitionOffset::new("orders", 3, 42).to_string(), "orders/3@42");
    }

    #[tokio::test]
    async fn test_partition_stream_close_stops_feeder() {
        let (tx, rx) = mpsc::channel(1);
        let feeder = tokio::spawn(async move {
            let _tx = tx;
            std::future::pending::<()>().await;
        });
        let mut stream = PartitionStream::new("orders", 0, rx, Some(feeder));

        stream.close();
        assert!(stream.recv().await.is_none());
    }
}
