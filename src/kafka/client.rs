//! rdkafka-backed broker client
//!
//! Metadata, watermark and single-record fetches go through `BaseConsumer`s
//! driven on the blocking pool. Partition streams are `StreamConsumer`s with
//! a manual assignment. Group sessions subscribe a `StreamConsumer` whose
//! context turns rebalance callbacks into partition claims.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rdkafka::admin::{AdminClient, AdminOptions, ResourceSpecifier};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{Headers, Message as KafkaMessage};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::broker::{
    BrokerClient, BrokerConnector, BrokerError, BrokerResult, CommitMode, GroupSession, OffsetCommitter,
    PartitionClaim, PartitionOffset, PartitionStream, RawRecord,
};

/// Records buffered between a consumer and its partition loop
const RECORD_CHANNEL_CAPACITY: usize = 256;

const AUTO_CREATE_TOPICS: &str = "auto.create.topics.enable";

/// Budget for reading committed offsets inside a rebalance callback
const COMMITTED_TIMEOUT: Duration = Duration::from_secs(5);

type Routes = Arc<Mutex<HashMap<(String, i32), mpsc::Sender<BrokerResult<RawRecord>>>>>;

/// Connects [`RdKafkaClient`]s to a cluster
#[derive(Debug, Clone)]
pub struct RdKafkaConnector {
    brokers: Vec<String>,
    overrides: HashMap<String, String>,
    timeout: Duration,
}

impl RdKafkaConnector {
    /// `overrides` are applied on top of every generated client configuration
    pub fn new(brokers: Vec<String>, overrides: HashMap<String, String>) -> Self {
        Self {
            brokers,
            overrides,
            timeout: Duration::from_secs(10),
        }
    }

    /// Timeout of metadata, watermark and fetch requests
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn base_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.brokers.join(","))
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "30000");
        for (key, value) in &self.overrides {
            config.set(key, value);
        }
        config
    }
}

#[async_trait]
impl BrokerConnector for RdKafkaConnector {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerClient>> {
        let client = RdKafkaClient::new(self.base_config(), self.timeout)?;
        Ok(Arc::new(client))
    }
}

/// One connection to the cluster, rebuilt for every consumption cycle
pub struct RdKafkaClient {
    config: ClientConfig,
    metadata: Arc<BaseConsumer>,
    seekers: Mutex<HashMap<(String, i32), Arc<BaseConsumer>>>,
    timeout: Duration,
    closed: AtomicBool,
}

impl RdKafkaClient {
    pub fn new(config: ClientConfig, timeout: Duration) -> BrokerResult<Self> {
        let metadata: BaseConsumer = standalone(&config).create()?;
        Ok(Self {
            config,
            metadata: Arc::new(metadata),
            seekers: Mutex::new(HashMap::new()),
            timeout,
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    /// Cached consumer used for offset-addressed single fetches
    fn seeker(&self, topic: &str, partition: i32) -> BrokerResult<Arc<BaseConsumer>> {
        let mut seekers = self.seekers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(seeker) = seekers.get(&(topic.to_string(), partition)) {
            return Ok(Arc::clone(seeker));
        }

        let mut config = standalone(&self.config);
        config.set("auto.offset.reset", "error");
        let seeker: Arc<BaseConsumer> = Arc::new(config.create()?);
        seekers.insert((topic.to_string(), partition), Arc::clone(&seeker));
        Ok(seeker)
    }

    async fn broker_id(&self) -> BrokerResult<i32> {
        let metadata = Arc::clone(&self.metadata);
        let timeout = self.timeout;
        blocking(move || {
            let metadata = metadata.fetch_metadata(None, timeout)?;
            metadata
                .brokers()
                .first()
                .map(|broker| broker.id())
                .ok_or_else(|| BrokerError::Unavailable("cluster metadata lists no brokers".to_string()))
        })
        .await
    }
}

#[async_trait]
impl BrokerClient for RdKafkaClient {
    async fn list_topics(&self) -> BrokerResult<Vec<String>> {
        self.ensure_open()?;
        let metadata = Arc::clone(&self.metadata);
        let timeout = self.timeout;
        blocking(move || {
            let metadata = metadata.fetch_metadata(None, timeout)?;
            Ok(metadata
                .topics()
                .iter()
                .map(|topic| topic.name().to_string())
                .collect())
        })
        .await
    }

    async fn auto_creates_topics(&self) -> BrokerResult<bool> {
        self.ensure_open()?;
        let broker_id = self.broker_id().await?;
        let admin: AdminClient<DefaultClientContext> = self.config.create()?;
        let options = AdminOptions::new().request_timeout(Some(self.timeout));

        let resources = admin
            .describe_configs(&[ResourceSpecifier::Broker(broker_id)], &options)
            .await?;
        for resource in resources {
            let resource = resource.map_err(KafkaError::AdminOp)?;
            if let Some(entry) = resource.entries.iter().find(|entry| entry.name == AUTO_CREATE_TOPICS) {
                return Ok(entry.value.as_deref() == Some("true"));
            }
        }

        // Kafka's own default
        Ok(true)
    }

    async fn partitions(&self, topic: &str) -> BrokerResult<Vec<i32>> {
        self.ensure_open()?;
        let metadata = Arc::clone(&self.metadata);
        let timeout = self.timeout;
        let topic = topic.to_string();
        blocking(move || {
            let metadata = metadata.fetch_metadata(Some(&topic), timeout)?;
            let found = metadata
                .topics()
                .iter()
                .find(|candidate| candidate.name() == topic)
                .ok_or_else(|| BrokerError::UnknownTopic(topic.clone()))?;
            if found.error().is_some() {
                return Err(BrokerError::UnknownTopic(topic.clone()));
            }
            Ok(found.partitions().iter().map(|partition| partition.id()).collect())
        })
        .await
    }

    async fn watermarks(&self, topic: &str, partition: i32) -> BrokerResult<(i64, i64)> {
        self.ensure_open()?;
        let metadata = Arc::clone(&self.metadata);
        let timeout = self.timeout;
        let topic = topic.to_string();
        blocking(move || Ok(metadata.fetch_watermarks(&topic, partition, timeout)?)).await
    }

    async fn fetch_record(&self, topic: &str, partition: i32, offset: i64) -> BrokerResult<RawRecord> {
        self.ensure_open()?;
        let seeker = self.seeker(topic, partition)?;
        let timeout = self.timeout;
        let topic = topic.to_string();

        blocking(move || {
            let mut assignment = TopicPartitionList::new();
            assignment.add_partition_offset(&topic, partition, Offset::Offset(offset))?;
            seeker.assign(&assignment)?;

            let deadline = std::time::Instant::now() + timeout;
            while std::time::Instant::now() < deadline {
                match seeker.poll(Duration::from_millis(100)) {
                    Some(Ok(message)) if message.partition() == partition => return Ok(to_record(&message)),
                    Some(Ok(_)) | None => continue,
                    Some(Err(err)) if is_out_of_range(&err) => {
                        return Err(BrokerError::OffsetOutOfRange {
                            topic: topic.clone(),
                            partition,
                            offset,
                        })
                    },
                    Some(Err(err)) => return Err(err.into()),
                }
            }

            Err(BrokerError::Unavailable(format!(
                "timed out fetching {}/{}@{}",
                topic, partition, offset
            )))
        })
        .await
    }

    async fn consume_partition(&self, topic: &str, partition: i32, offset: i64) -> BrokerResult<PartitionStream> {
        self.ensure_open()?;
        let consumer: StreamConsumer = standalone(&self.config).create()?;
        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(topic, partition, Offset::Offset(offset))?;
        consumer.assign(&assignment)?;

        let (tx, rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);
        let owner = topic.to_string();
        let feeder = tokio::spawn(async move {
            loop {
                let next = match consumer.recv().await {
                    Ok(message) => Ok(to_record(&message)),
                    Err(err) if is_out_of_range(&err) => Err(BrokerError::OffsetOutOfRange {
                        topic: owner.clone(),
                        partition,
                        offset,
                    }),
                    Err(err) => Err(BrokerError::from(err)),
                };
                let failed = next.is_err();
                if tx.send(next).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(PartitionStream::new(topic, partition, rx, Some(feeder)))
    }

    async fn join_group(
        &self,
        group: &str,
        topics: &[String],
        start_offsets: &HashMap<(String, i32), i64>,
        commit_mode: CommitMode,
    ) -> BrokerResult<Box<dyn GroupSession>> {
        self.ensure_open()?;
        let mut config = self.config.clone();
        config
            .set("group.id", group)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", (commit_mode == CommitMode::Auto).to_string());

        let (claims_tx, claims_rx) = mpsc::unbounded_channel();
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let context = GroupContext {
            overrides: Mutex::new(start_offsets.clone()),
            routes: Arc::clone(&routes),
            claims: Mutex::new(Some(claims_tx)),
        };

        let consumer: StreamConsumer<GroupContext> = config.create_with_context(context)?;
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs)?;
        let consumer = Arc::new(consumer);

        let token = CancellationToken::new();
        let pump = tokio::spawn(pump(Arc::clone(&consumer), routes, token.clone()));
        info!(group, topics = %topics.join(","), "Subscribed to consumer group");

        Ok(Box::new(RdKafkaGroupSession {
            consumer,
            claims: claims_rx,
            pump: Some(pump),
            token,
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.seekers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        Ok(())
    }
}

/// Turns rebalance callbacks into partition claims
struct GroupContext {
    overrides: Mutex<HashMap<(String, i32), i64>>,
    routes: Routes,
    claims: Mutex<Option<mpsc::UnboundedSender<PartitionClaim>>>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Revoke(partitions) = rebalance {
            if partitions.count() == 0 {
                return;
            }
            info!(partitions = partitions.count(), "Partitions revoked, ending generation");
            // Closing the routes ends every partition stream of this generation
            self.routes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clear();
            self.claims
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
        }
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(partitions) if partitions.count() > 0 => {
                info!(partitions = partitions.count(), "Partitions assigned");
                let starts = self.start_positions(base_consumer, partitions);

                let claims = self.claims.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let Some(claims) = claims.as_ref() else {
                    return;
                };
                let mut routes = self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                for element in partitions.elements() {
                    let key = (element.topic().to_string(), element.partition());
                    let (tx, rx) = mpsc::channel(RECORD_CHANNEL_CAPACITY);
                    let start = starts.get(&key).copied();
                    routes.insert(key, tx);
                    let stream = PartitionStream::new(element.topic(), element.partition(), rx, None);
                    if claims.send(PartitionClaim { stream, start }).is_err() {
                        debug!("Session closed before the claim was taken");
                    }
                }
            },
            Rebalance::Error(err) => warn!(error = %err, "Rebalance failed"),
            _ => {},
        }
    }
}

impl GroupContext {
    /// Where each assigned partition starts: its override, else its committed offset
    fn start_positions(
        &self,
        consumer: &BaseConsumer<Self>,
        assigned: &TopicPartitionList,
    ) -> HashMap<(String, i32), i64> {
        let mut starts = match self.apply_overrides(consumer, assigned) {
            Ok(applied) => applied,
            Err(err) => {
                warn!(error = %err, "Failed to apply start offsets, using stored offsets");
                HashMap::new()
            },
        };

        match consumer.committed_offsets(assigned.clone(), COMMITTED_TIMEOUT) {
            Ok(committed) => {
                for element in committed.elements() {
                    if let Offset::Offset(offset) = element.offset() {
                        starts
                            .entry((element.topic().to_string(), element.partition()))
                            .or_insert(offset);
                    }
                }
            },
            Err(err) => debug!(error = %err, "Committed offsets unavailable, start positions unknown"),
        }
        starts
    }

    /// Re-assign partitions that have a start offset override
    fn apply_overrides(
        &self,
        consumer: &BaseConsumer<Self>,
        assigned: &TopicPartitionList,
    ) -> KafkaResult<HashMap<(String, i32), i64>> {
        let mut overrides = self.overrides.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut applied = HashMap::new();
        if overrides.is_empty() {
            return Ok(applied);
        }

        let mut assignment = assigned.clone();
        for element in assigned.elements() {
            let key = (element.topic().to_string(), element.partition());
            if let Some(offset) = overrides.remove(&key) {
                assignment.set_partition_offset(element.topic(), element.partition(), Offset::Offset(offset))?;
                debug!(topic = element.topic(), partition = element.partition(), offset, "Overriding start offset");
                applied.insert(key, offset);
            }
        }

        if !applied.is_empty() {
            consumer.assign(&assignment)?;
        }
        Ok(applied)
    }
}

/// Routes group records to the stream of their partition
async fn pump(consumer: Arc<StreamConsumer<GroupContext>>, routes: Routes, token: CancellationToken) {
    loop {
        let record = tokio::select! {
            _ = token.cancelled() => break,
            received = consumer.recv() => match received {
                Ok(message) => to_record(&message),
                Err(err) => {
                    warn!(error = %err, "Group consumer error");
                    continue;
                },
            },
        };

        let key = (record.topic.clone(), record.partition);
        let route = routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
            .cloned();
        let Some(route) = route else {
            debug!(topic = %key.0, partition = key.1, "Dropping record of unclaimed partition");
            continue;
        };

        // Blocks the whole group while one partition loop is busy
        if route.send(Ok(record)).await.is_err() {
            routes
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&key);
        }
    }
}

struct RdKafkaGroupSession {
    consumer: Arc<StreamConsumer<GroupContext>>,
    claims: mpsc::UnboundedReceiver<PartitionClaim>,
    pump: Option<JoinHandle<()>>,
    token: CancellationToken,
}

#[async_trait]
impl GroupSession for RdKafkaGroupSession {
    async fn next_claim(&mut self) -> Option<PartitionClaim> {
        self.claims.recv().await
    }

    fn committer(&self) -> Arc<dyn OffsetCommitter> {
        Arc::new(RdKafkaCommitter {
            consumer: Arc::clone(&self.consumer),
        })
    }

    async fn close(&mut self) -> BrokerResult<()> {
        self.token.cancel();
        if let Some(pump) = self.pump.take() {
            if let Err(err) = pump.await {
                warn!(error = %err, "Group pump ended abnormally");
            }
        }
        self.consumer.unsubscribe();
        Ok(())
    }
}

struct RdKafkaCommitter {
    consumer: Arc<StreamConsumer<GroupContext>>,
}

#[async_trait]
impl OffsetCommitter for RdKafkaCommitter {
    async fn commit(&self, offsets: &[PartitionOffset], mode: CommitMode) -> BrokerResult<()> {
        let mut positions = TopicPartitionList::new();
        for position in offsets {
            positions.add_partition_offset(&position.topic, position.partition, Offset::Offset(position.offset))?;
        }

        match mode {
            CommitMode::Auto => Ok(self.consumer.store_offsets(&positions)?),
            CommitMode::Sync => {
                let consumer = Arc::clone(&self.consumer);
                blocking(move || Ok(consumer.commit(&positions, rdkafka::consumer::CommitMode::Sync)?)).await
            },
        }
    }
}

/// Client configuration for consumers outside any group
fn standalone(config: &ClientConfig) -> ClientConfig {
    let mut config = config.clone();
    config
        .set("group.id", format!("kafka-components-{}", Uuid::new_v4()))
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false");
    config
}

async fn blocking<T, F>(work: F) -> BrokerResult<T>
where
    F: FnOnce() -> BrokerResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| BrokerError::Unavailable(format!("blocking broker call failed: {}", e)))?
}

fn is_out_of_range(err: &KafkaError) -> bool {
    matches!(
        err.rdkafka_error_code(),
        Some(RDKafkaErrorCode::OffsetOutOfRange) | Some(RDKafkaErrorCode::AutoOffsetReset)
    )
}

fn to_record<M: KafkaMessage>(message: &M) -> RawRecord {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|header| {
                    header
                        .value
                        .map(|value| (header.key.to_string(), String::from_utf8_lossy(value).into_owned()))
                })
                .collect()
        })
        .unwrap_or_default();

    RawRecord {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        headers,
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
    }
}
