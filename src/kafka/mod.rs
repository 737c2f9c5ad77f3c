//! Kafka consumer components
//!
//! This module provides:
//! - A consumer-group batch component ([`GroupComponent`])
//! - A simple partition-consumer component ([`SimpleComponent`])
//! - Size and time triggered batching with exit/skip failure strategies
//! - Whole-cycle retries and time based start offsets
//! - A one-shot signal once every partition drained its startup backlog

mod broker;
mod buffer;
mod client;
mod component;
mod config;
mod group;
mod options;
mod partition;
mod processor;
mod retry;
mod seek;
mod simple;
mod strategy;

pub use broker::{
    BrokerClient, BrokerConnector, BrokerError, BrokerResult, CommitMode, GroupSession, OffsetCommitter,
    PartitionClaim, PartitionOffset, PartitionStream, RawRecord, StartOffset,
};
pub use buffer::{BatchBuffer, BufferSettings, CycleProgress, OffsetState};
pub use client::{RdKafkaClient, RdKafkaConnector};
pub use config::KafkaConfig;
pub use group::GroupComponent;
pub use options::{
    BatchScope, ComponentBuilder, ComponentConfig, Group, GroupComponentBuilder, Simple, SimpleComponentBuilder,
    Variant, DEFAULT_BATCH_SIZE, DEFAULT_BATCH_TIMEOUT, DEFAULT_RETRY_WAIT,
};
pub use partition::{LatestOffsetNotifier, LatestOffsetTracker, LatestOffsets, LoopContext, LoopSet, PartitionLoop};
pub use processor::{BatchProcessor, SharedProcessor};
pub use retry::{run_with_retries, CycleOutcome, RetryPolicy};
pub use seek::{broker_timestamp, resolve_offsets, TimeExtractor};
pub use simple::SimpleComponent;
pub use strategy::FailStrategy;
