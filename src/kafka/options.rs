//! Validating builders for the consumer components
//!
//! Every option is validated as it is applied; violations are collected
//! instead of returned, and [`ComponentBuilder::build`] reports all of them
//! at once. A successful build yields an immutable [`ComponentConfig`]
//! wrapped in the variant's component.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use super::broker::{BrokerConnector, CommitMode, StartOffset};
use super::client::RdKafkaConnector;
use super::group::GroupComponent;
use super::partition::LatestOffsetNotifier;
use super::processor::{BatchProcessor, SharedProcessor};
use super::seek::TimeExtractor;
use super::simple::SimpleComponent;
use super::strategy::FailStrategy;
use crate::error::Result;
use crate::metrics::{ConsumerMetrics, PrometheusMetrics};
use crate::models::{
    validate_min, validate_non_empty, validate_non_empty_list, validate_positive_duration,
    ValidationError, ValidationErrorKind, ValidationErrors,
};

pub const DEFAULT_BATCH_SIZE: usize = 1;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_RETRY_WAIT: Duration = Duration::from_secs(1);

/// How messages are grouped into batches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchScope {
    /// One buffer shared by every partition of the component
    Component,
    /// One buffer per partition; batches never mix partitions
    Partition,
}

/// Differences between the component variants
pub trait Variant: Send + Sync + 'static {
    /// Label used in logs
    const KIND: &'static str;
    /// Whether a zero batch timeout (no periodic flush) is accepted
    const ZERO_TIMEOUT_ALLOWED: bool;
    /// Whether the variant joins a consumer group
    const USES_GROUP: bool;
    const DEFAULT_START: StartOffset;
    const DEFAULT_SCOPE: BatchScope;
}

/// Consumer-group batch component
#[derive(Debug)]
pub enum Group {}

/// Simple partition-consumer component
#[derive(Debug)]
pub enum Simple {}

impl Variant for Group {
    const KIND: &'static str = "group";
    const ZERO_TIMEOUT_ALLOWED: bool = true;
    const USES_GROUP: bool = true;
    const DEFAULT_START: StartOffset = StartOffset::Stored;
    const DEFAULT_SCOPE: BatchScope = BatchScope::Component;
}

impl Variant for Simple {
    const KIND: &'static str = "simple";
    const ZERO_TIMEOUT_ALLOWED: bool = false;
    const USES_GROUP: bool = false;
    const DEFAULT_START: StartOffset = StartOffset::Oldest;
    const DEFAULT_SCOPE: BatchScope = BatchScope::Partition;
}

/// Immutable, validated component configuration
#[derive(Clone)]
pub struct ComponentConfig {
    pub name: String,
    pub brokers: Vec<String>,
    pub topics: Vec<String>,
    /// Consumer group id; empty for the simple variant
    pub group: String,
    pub processor: SharedProcessor,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub retries: u32,
    pub retry_wait: Duration,
    pub strategy: FailStrategy,
    pub commit_mode: CommitMode,
    pub dedup: bool,
    pub batch_scope: BatchScope,
    pub start_offset: StartOffset,
    pub time_extractor: Option<TimeExtractor>,
    pub notifier: Option<Arc<LatestOffsetNotifier>>,
    pub check_topic: bool,
    pub client_config: HashMap<String, String>,
    pub metrics: Arc<dyn ConsumerMetrics>,
    pub connector: Arc<dyn BrokerConnector>,
}

impl ComponentConfig {
    /// Topics joined for log and error context
    pub fn topics_label(&self) -> String {
        self.topics.join(",")
    }
}

impl fmt::Debug for ComponentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentConfig")
            .field("name", &self.name)
            .field("brokers", &self.brokers)
            .field("topics", &self.topics)
            .field("group", &self.group)
            .field("batch_size", &self.batch_size)
            .field("batch_timeout", &self.batch_timeout)
            .field("retries", &self.retries)
            .field("retry_wait", &self.retry_wait)
            .field("strategy", &self.strategy)
            .field("commit_mode", &self.commit_mode)
            .field("dedup", &self.dedup)
            .field("batch_scope", &self.batch_scope)
            .field("start_offset", &self.start_offset)
            .field("check_topic", &self.check_topic)
            .finish_non_exhaustive()
    }
}

/// Builder for [`GroupComponent`]
pub type GroupComponentBuilder = ComponentBuilder<Group>;

/// Builder for [`SimpleComponent`]
pub type SimpleComponentBuilder = ComponentBuilder<Simple>;

/// Option pipeline shared by both component variants
pub struct ComponentBuilder<V: Variant> {
    name: String,
    brokers: Vec<String>,
    topics: Vec<String>,
    group: String,
    processor: Option<SharedProcessor>,
    batch_size: usize,
    batch_timeout: Duration,
    retries: u32,
    retry_wait: Duration,
    strategy: FailStrategy,
    commit_mode: CommitMode,
    dedup: bool,
    batch_scope: BatchScope,
    start_offset: StartOffset,
    time_extractor: Option<TimeExtractor>,
    notifier: Option<Arc<LatestOffsetNotifier>>,
    check_topic: bool,
    client_config: HashMap<String, String>,
    metrics: Option<Arc<dyn ConsumerMetrics>>,
    connector: Option<Arc<dyn BrokerConnector>>,
    errors: ValidationErrors,
    _variant: PhantomData<V>,
}

impl<V: Variant> ComponentBuilder<V> {
    /// Start a builder for a component called `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            brokers: Vec::new(),
            topics: Vec::new(),
            group: String::new(),
            processor: None,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            retries: 0,
            retry_wait: DEFAULT_RETRY_WAIT,
            strategy: FailStrategy::default(),
            commit_mode: CommitMode::default(),
            dedup: false,
            batch_scope: V::DEFAULT_SCOPE,
            start_offset: V::DEFAULT_START,
            time_extractor: None,
            notifier: None,
            check_topic: false,
            client_config: HashMap::new(),
            metrics: None,
            connector: None,
            errors: ValidationErrors::new(),
            _variant: PhantomData,
        }
    }

    pub fn brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.brokers = brokers.into_iter().map(Into::into).collect();
        self
    }

    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    /// Single-topic shorthand
    pub fn topic(self, topic: impl Into<String>) -> Self {
        self.topics([topic.into()])
    }

    pub fn processor(mut self, processor: impl BatchProcessor + 'static) -> Self {
        self.processor = Some(Arc::new(processor));
        self
    }

    pub fn shared_processor(mut self, processor: SharedProcessor) -> Self {
        self.processor = Some(processor);
        self
    }

    /// Maximum number of messages per batch (at least 1)
    pub fn batch_size(mut self, size: usize) -> Self {
        if let Some(size) = self.errors.check(validate_min(size, 1, "batch_size")) {
            self.batch_size = size;
        }
        self
    }

    /// Period of the time-triggered flush
    pub fn batch_timeout(mut self, timeout: Duration) -> Self {
        if timeout.is_zero() && !V::ZERO_TIMEOUT_ALLOWED {
            self.errors.add(ValidationError::with_context(
                ValidationErrorKind::ZeroDuration,
                "batch_timeout",
                format!("the {} component needs a periodic flush", V::KIND),
            ));
        } else {
            self.batch_timeout = timeout;
        }
        self
    }

    /// Whole-cycle retries after a failure
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Pause between retry cycles
    pub fn retry_wait(mut self, wait: Duration) -> Self {
        if let Some(wait) = self.errors.check(validate_positive_duration(wait, "retry_wait")) {
            self.retry_wait = wait;
        }
        self
    }

    pub fn failure_strategy(mut self, strategy: FailStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Failure strategy by name (`exit` or `skip`)
    pub fn failure_strategy_name(mut self, name: &str) -> Self {
        if let Some(strategy) = self.errors.check(name.parse::<FailStrategy>()) {
            self.strategy = strategy;
        }
        self
    }

    /// Commit after every batch instead of relying on auto-commit
    pub fn commit_sync(mut self, sync: bool) -> Self {
        self.commit_mode = if sync { CommitMode::Sync } else { CommitMode::Auto };
        self
    }

    /// Drop re-delivered messages below the processed position
    pub fn dedup(mut self, dedup: bool) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn batch_scope(mut self, scope: BatchScope) -> Self {
        self.batch_scope = scope;
        self
    }

    /// Where to start when no processed position is known
    pub fn start_offset(mut self, start: StartOffset) -> Self {
        match start {
            StartOffset::Stored if !V::USES_GROUP => {
                self.errors.add(ValidationError::with_context(
                    ValidationErrorKind::Unsupported,
                    "start_offset",
                    "stored offsets need a consumer group",
                ));
            },
            StartOffset::Since(duration) if duration.is_zero() => {
                self.errors
                    .add(ValidationError::new(ValidationErrorKind::ZeroDuration, "duration_offset"));
            },
            start => self.start_offset = start,
        }
        self
    }

    /// Start from the first message not older than `duration`
    pub fn duration_offset(self, duration: Duration, extractor: TimeExtractor) -> Self {
        let mut builder = self.start_offset(StartOffset::Since(duration));
        builder.time_extractor = Some(extractor);
        builder
    }

    /// Signal `notifier` once every partition reached its startup latest offset
    pub fn notify_on_latest_offset(mut self, notifier: Arc<LatestOffsetNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Verify the topics exist before the first cycle
    pub fn check_topic(mut self, check: bool) -> Self {
        self.check_topic = check;
        self
    }

    /// Extra librdkafka property
    pub fn client_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if let Some(key) = self.errors.check(validate_non_empty(&key, "client_config")) {
            self.client_config.insert(key, value.into());
        }
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn ConsumerMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Broker connection factory; defaults to rdkafka
    pub fn connector(mut self, connector: Arc<dyn BrokerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Record an error found outside the builder, e.g. while reading settings
    pub fn invalid(mut self, error: ValidationError) -> Self {
        self.errors.add(error);
        self
    }

    fn into_config(self) -> std::result::Result<ComponentConfig, ValidationErrors> {
        let mut errors = self.errors;

        let name = errors.check(validate_non_empty(&self.name, "name"));
        let brokers = errors.check(validate_non_empty_list(&self.brokers, "brokers"));
        let topics = errors.check(validate_non_empty_list(&self.topics, "topics"));
        let group = if V::USES_GROUP {
            errors.check(validate_non_empty(&self.group, "group_id"))
        } else {
            Some(String::new())
        };

        if self.processor.is_none() {
            errors.add(ValidationError::new(ValidationErrorKind::RequiredField, "processor"));
        }
        if matches!(self.start_offset, StartOffset::Since(_)) && self.time_extractor.is_none() {
            errors.add(ValidationError::with_context(
                ValidationErrorKind::RequiredField,
                "time_extractor",
                "duration offsets need a time extractor",
            ));
        }

        let (Some(name), Some(brokers), Some(topics), Some(group), Some(processor), true) =
            (name, brokers, topics, group, self.processor, errors.is_empty())
        else {
            return Err(errors);
        };

        let connector = self.connector.unwrap_or_else(|| {
            Arc::new(RdKafkaConnector::new(brokers.clone(), self.client_config.clone()))
        });

        Ok(ComponentConfig {
            name,
            brokers,
            topics,
            group,
            processor,
            batch_size: self.batch_size,
            batch_timeout: self.batch_timeout,
            retries: self.retries,
            retry_wait: self.retry_wait,
            strategy: self.strategy,
            commit_mode: self.commit_mode,
            dedup: self.dedup,
            batch_scope: self.batch_scope,
            start_offset: self.start_offset,
            time_extractor: self.time_extractor,
            notifier: self.notifier,
            check_topic: self.check_topic,
            client_config: self.client_config,
            metrics: self.metrics.unwrap_or_else(|| Arc::new(PrometheusMetrics)),
            connector,
        })
    }
}

impl ComponentBuilder<Group> {
    /// Consumer group to join
    pub fn group_id(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Validate every option and create the component
    pub fn build(self) -> Result<GroupComponent> {
        let config = self.into_config()?;
        Ok(GroupComponent::new(config))
    }
}

impl ComponentBuilder<Simple> {
    /// Validate every option and create the component
    pub fn build(self) -> Result<SimpleComponent> {
        let config = self.into_config()?;
        Ok(SimpleComponent::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::Batch;
    use crate::kafka::broker_timestamp;

    async fn noop(_batch: Batch) -> anyhow::Result<()> {
        Ok(())
    }

    fn group() -> GroupComponentBuilder {
        GroupComponentBuilder::new("orders")
            .brokers(["localhost:9092"])
            .topic("orders")
            .group_id("billing")
            .processor(noop)
    }

    fn simple() -> SimpleComponentBuilder {
        SimpleComponentBuilder::new("orders")
            .brokers(["localhost:9092"])
            .topic("orders")
            .processor(noop)
    }

    fn config_errors(err: Error) -> String {
        match err {
            Error::Config(message) => message,
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_group_defaults() {
        let config = group().into_config().unwrap();
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.batch_timeout, Duration::from_secs(1));
        assert_eq!(config.retries, 0);
        assert_eq!(config.strategy, FailStrategy::Exit);
        assert_eq!(config.commit_mode, CommitMode::Auto);
        assert_eq!(config.start_offset, StartOffset::Stored);
        assert_eq!(config.batch_scope, BatchScope::Component);
        assert_eq!(config.group, "billing");
    }

    #[test]
    fn test_simple_defaults() {
        let config = simple().into_config().unwrap();
        assert_eq!(config.start_offset, StartOffset::Oldest);
        assert_eq!(config.batch_scope, BatchScope::Partition);
        assert!(config.group.is_empty());
    }

    #[test]
    fn test_timeout_bounds_differ_per_variant() {
        let group = group().batch_timeout(Duration::ZERO).into_config().unwrap();
        assert!(group.batch_timeout.is_zero());

        let err = simple().batch_timeout(Duration::ZERO).into_config().unwrap_err();
        assert_eq!(err.len(), 1);
        assert_eq!(err.errors()[0].field, "batch_timeout");
    }

    #[test]
    fn test_errors_are_aggregated() {
        let err = GroupComponentBuilder::new(" ")
            .brokers(Vec::<String>::new())
            .topics(["orders", ""])
            .batch_size(0)
            .retry_wait(Duration::ZERO)
            .failure_strategy_name("retry")
            .client_config("", "x")
            .build()
            .unwrap_err();

        let message = config_errors(err);
        for field in [
            "'name'",
            "'brokers'",
            "'topics'",
            "'group_id'",
            "'processor'",
            "'batch_size'",
            "'retry_wait'",
            "'failure_strategy'",
            "'client_config'",
        ] {
            assert!(message.contains(field), "missing {} in {}", field, message);
        }
        assert!(message.contains("9 error(s)"), "{}", message);
    }

    #[test]
    fn test_stored_offset_rejected_for_simple() {
        let err = simple().start_offset(StartOffset::Stored).into_config().unwrap_err();
        assert_eq!(err.errors()[0].kind, ValidationErrorKind::Unsupported);
    }

    #[test]
    fn test_duration_offset_needs_extractor_and_positive_duration() {
        let err = group()
            .start_offset(StartOffset::Since(Duration::from_secs(60)))
            .into_config()
            .unwrap_err();
        assert_eq!(err.errors()[0].field, "time_extractor");

        let err = group()
            .duration_offset(Duration::ZERO, broker_timestamp())
            .into_config()
            .unwrap_err();
        assert_eq!(err.errors()[0].kind, ValidationErrorKind::ZeroDuration);

        let config = group()
            .duration_offset(Duration::from_secs(60), broker_timestamp())
            .into_config()
            .unwrap();
        assert_eq!(config.start_offset, StartOffset::Since(Duration::from_secs(60)));
    }

    #[test]
    fn test_options_applied() {
        let config = group()
            .batch_size(50)
            .batch_timeout(Duration::from_millis(200))
            .retries(3)
            .retry_wait(Duration::from_millis(10))
            .failure_strategy_name("skip")
            .commit_sync(true)
            .dedup(true)
            .check_topic(true)
            .client_config("fetch.min.bytes", "1024")
            .into_config()
            .unwrap();

        assert_eq!(config.batch_size, 50);
        assert_eq!(config.batch_timeout, Duration::from_millis(200));
        assert_eq!(config.retries, 3);
        assert_eq!(config.retry_wait, Duration::from_millis(10));
        assert_eq!(config.strategy, FailStrategy::Skip);
        assert_eq!(config.commit_mode, CommitMode::Sync);
        assert!(config.dedup && config.check_topic);
        assert_eq!(config.client_config["fetch.min.bytes"], "1024");
    }
}
