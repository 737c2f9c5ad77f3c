//! Kafka settings read from the environment

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::options::{ComponentBuilder, GroupComponentBuilder, SimpleComponentBuilder, Variant};
use super::seek::broker_timestamp;
use crate::models::split_list;

/// Kafka configuration settings
#[derive(Debug, Clone, Deserialize, Serialize, Envconfig)]
pub struct KafkaConfig {
    /// Kafka broker addresses (comma-separated)
    #[serde(default = "default_brokers")]
    #[envconfig(from = "KAFKA_BROKERS", default = "localhost:9092")]
    pub brokers: String,

    /// Consumer group ID
    #[serde(default = "default_group_id")]
    #[envconfig(from = "KAFKA_GROUP_ID", default = "kafka-components")]
    pub group_id: String,

    /// Topics to consume (comma-separated)
    #[serde(default = "default_topics")]
    #[envconfig(from = "KAFKA_TOPICS", default = "events")]
    pub topics: String,

    /// Messages per batch
    #[serde(default = "default_batch_size")]
    #[envconfig(from = "KAFKA_BATCH_SIZE", default = "100")]
    pub batch_size: usize,

    /// Flush interval for partial batches in milliseconds
    #[serde(default = "default_batch_timeout_ms")]
    #[envconfig(from = "KAFKA_BATCH_TIMEOUT_MS", default = "1000")]
    pub batch_timeout_ms: u64,

    /// Extra consumption cycles after a failure
    #[serde(default = "default_retries")]
    #[envconfig(from = "KAFKA_RETRIES", default = "3")]
    pub retries: u32,

    /// Pause between cycles in milliseconds
    #[serde(default = "default_retry_wait_ms")]
    #[envconfig(from = "KAFKA_RETRY_WAIT_MS", default = "1000")]
    pub retry_wait_ms: u64,

    /// What to do with a failed batch (exit, skip)
    #[serde(default = "default_failure_strategy")]
    #[envconfig(from = "KAFKA_FAILURE_STRATEGY", default = "exit")]
    pub failure_strategy: String,

    /// Commit after every batch instead of auto-committing
    #[serde(default)]
    #[envconfig(from = "KAFKA_COMMIT_SYNC", default = "false")]
    pub commit_sync: bool,

    /// Verify topics exist before consuming
    #[serde(default)]
    #[envconfig(from = "KAFKA_CHECK_TOPIC", default = "false")]
    pub check_topic: bool,

    /// Start from messages produced in the last N seconds (0 disables)
    #[serde(default)]
    #[envconfig(from = "KAFKA_SINCE_SECS", default = "0")]
    pub since_secs: u64,

    /// Drop re-delivered messages below the processed position
    #[serde(default)]
    #[envconfig(from = "KAFKA_DEDUP", default = "false")]
    pub dedup: bool,

    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout")]
    #[envconfig(from = "KAFKA_SESSION_TIMEOUT_MS", default = "30000")]
    pub session_timeout_ms: u32,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: default_brokers(),
            group_id: default_group_id(),
            topics: default_topics(),
            batch_size: default_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            retries: default_retries(),
            retry_wait_ms: default_retry_wait_ms(),
            failure_strategy: default_failure_strategy(),
            commit_sync: false,
            check_topic: false,
            since_secs: 0,
            dedup: false,
            session_timeout_ms: default_session_timeout(),
        }
    }
}

impl KafkaConfig {
    /// Create a new KafkaConfig from environment variables
    pub fn from_env() -> Result<Self, envconfig::Error> {
        <Self as envconfig::Envconfig>::init_from_env()
    }

    pub fn brokers_list(&self) -> Vec<String> {
        split_list(&self.brokers)
    }

    pub fn topics_list(&self) -> Vec<String> {
        split_list(&self.topics)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }

    /// Group component builder preloaded with these settings
    ///
    /// Invalid values surface as validation errors from `build()`.
    pub fn group_builder(&self, name: &str) -> GroupComponentBuilder {
        self.apply(GroupComponentBuilder::new(name)).group_id(&self.group_id)
    }

    /// Simple component builder preloaded with these settings
    pub fn simple_builder(&self, name: &str) -> SimpleComponentBuilder {
        self.apply(SimpleComponentBuilder::new(name))
    }

    fn apply<V: Variant>(&self, builder: ComponentBuilder<V>) -> ComponentBuilder<V> {
        let builder = builder
            .brokers(self.brokers_list())
            .topics(self.topics_list())
            .batch_size(self.batch_size)
            .batch_timeout(self.batch_timeout())
            .retries(self.retries)
            .retry_wait(self.retry_wait())
            .failure_strategy_name(&self.failure_strategy)
            .commit_sync(self.commit_sync)
            .check_topic(self.check_topic)
            .dedup(self.dedup)
            .client_config("session.timeout.ms", self.session_timeout_ms.to_string());

        if self.since_secs > 0 {
            builder.duration_offset(Duration::from_secs(self.since_secs), broker_timestamp())
        } else {
            builder
        }
    }
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_group_id() -> String {
    "kafka-components".to_string()
}

fn default_topics() -> String {
    "events".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_timeout_ms() -> u64 {
    1000
}

fn default_retries() -> u32 {
    3
}

fn default_retry_wait_ms() -> u64 {
    1000
}

fn default_failure_strategy() -> String {
    "exit".to_string()
}

fn default_session_timeout() -> u32 {
    30000 // 30 seconds
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::kafka::{FailStrategy, StartOffset};
    use crate::test_utils::{noop_processor, MockBroker};

    #[test]
    fn test_default_config() {
        let config = KafkaConfig::default();
        assert_eq!(config.brokers_list(), vec!["localhost:9092"]);
        assert_eq!(config.topics_list(), vec!["events"]);
        assert_eq!(config.batch_timeout(), Duration::from_secs(1));
        assert_eq!(config.retry_wait(), Duration::from_secs(1));
        assert!(!config.commit_sync);
    }

    #[test]
    fn test_group_builder_carries_settings() {
        let config = KafkaConfig {
            topics: "orders, refunds".to_string(),
            failure_strategy: "skip".to_string(),
            since_secs: 60,
            commit_sync: true,
            ..KafkaConfig::default()
        };
        let component = config
            .group_builder("billing")
            .shared_processor(noop_processor())
            .connector(MockBroker::new().connector())
            .build()
            .unwrap();

        let built = component.config();
        assert_eq!(built.topics, vec!["orders", "refunds"]);
        assert_eq!(built.group, "kafka-components");
        assert_eq!(built.strategy, FailStrategy::Skip);
        assert_eq!(built.start_offset, StartOffset::Since(Duration::from_secs(60)));
        assert!(built.time_extractor.is_some());
        assert_eq!(built.client_config["session.timeout.ms"], "30000");
    }

    #[test]
    fn test_invalid_settings_are_aggregated() {
        let config = KafkaConfig {
            brokers: " ".to_string(),
            batch_size: 0,
            failure_strategy: "retry".to_string(),
            ..KafkaConfig::default()
        };
        let err = config
            .simple_builder("billing")
            .shared_processor(noop_processor())
            .build()
            .err()
            .unwrap();

        let Error::Config(message) = err else {
            panic!("expected config error");
        };
        assert!(message.contains("3 error(s)"), "{}", message);
        assert!(message.contains("brokers"));
        assert!(message.contains("batch_size"));
    }
}
