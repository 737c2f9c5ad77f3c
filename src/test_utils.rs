//! Test utilities for the consumer components
//!
//! [`MockBroker`] is an in-memory cluster implementing the broker traits,
//! so components can be driven end to end without Kafka. It also provides
//! recording processors and metrics sinks for assertions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::kafka::{
    BatchProcessor, BrokerClient, BrokerConnector, BrokerError, BrokerResult, CommitMode, GroupSession,
    OffsetCommitter, PartitionClaim, PartitionOffset, PartitionStream, RawRecord, SharedProcessor,
};
use crate::metrics::{ConsumerMetrics, MessageStatus};
use crate::models::Batch;

#[derive(Debug, Default)]
struct PartitionLog {
    records: Vec<RawRecord>,
    /// Low watermark reported to clients
    oldest: i64,
    /// First offset that can actually be fetched
    readable: i64,
}

impl PartitionLog {
    fn next(&self) -> i64 {
        self.records.len() as i64
    }
}

enum Step {
    Record(RawRecord),
    Gone,
    Drained,
}

#[derive(Debug, Default)]
struct State {
    topics: BTreeMap<String, Vec<PartitionLog>>,
    auto_create: bool,
    close_when_drained: bool,
    failing_connects: usize,
    connects: usize,
    committed: HashMap<(String, String, i32), i64>,
    commit_log: Vec<(String, PartitionOffset, CommitMode)>,
}

impl State {
    fn log(&self, topic: &str, partition: i32) -> BrokerResult<&PartitionLog> {
        self.topics
            .get(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?
            .get(partition as usize)
            .ok_or_else(|| BrokerError::Unavailable(format!("unknown partition {}/{}", topic, partition)))
    }

    fn step(&self, topic: &str, partition: i32, offset: i64) -> BrokerResult<Step> {
        let log = self.log(topic, partition)?;
        if offset < log.readable {
            return Ok(Step::Gone);
        }
        Ok(match log.records.get(offset as usize) {
            Some(record) => Step::Record(record.clone()),
            None => Step::Drained,
        })
    }
}

struct Shared {
    state: Mutex<State>,
    /// Bumped on every produce
    appends: watch::Sender<u64>,
    /// Bumped on every rebalance
    generations: watch::Sender<u64>,
}

/// In-memory broker cluster
///
/// Clones share the same cluster. Records are kept forever unless expired
/// explicitly; streams tail new records until dropped, or end once drained
/// when [`MockBroker::close_streams_when_drained`] is set.
#[derive(Clone)]
pub struct MockBroker {
    shared: Arc<Shared>,
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                appends: watch::channel(0).0,
                generations: watch::channel(0).0,
            }),
        }
    }

    /// Create (or replace) a topic with `partitions` empty partitions
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        let mut state = self.shared.state.lock().unwrap();
        state.topics.insert(
            topic.to_string(),
            (0..partitions).map(|_| PartitionLog::default()).collect(),
        );
    }

    /// Append a record stamped with the current time, returning its offset
    pub fn produce(&self, topic: &str, partition: i32, payload: impl Into<Vec<u8>>) -> i64 {
        self.append(topic, partition, payload.into(), HashMap::new(), Utc::now())
    }

    /// Append a record with an explicit broker timestamp
    pub fn produce_at(&self, topic: &str, partition: i32, payload: impl Into<Vec<u8>>, timestamp: DateTime<Utc>) -> i64 {
        self.append(topic, partition, payload.into(), HashMap::new(), timestamp)
    }

    pub fn produce_with_headers(
        &self,
        topic: &str,
        partition: i32,
        payload: impl Into<Vec<u8>>,
        headers: &[(&str, &str)],
    ) -> i64 {
        let headers = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self.append(topic, partition, payload.into(), headers, Utc::now())
    }

    fn append(
        &self,
        topic: &str,
        partition: i32,
        payload: Vec<u8>,
        headers: HashMap<String, String>,
        timestamp: DateTime<Utc>,
    ) -> i64 {
        let offset = {
            let mut state = self.shared.state.lock().unwrap();
            let log = state
                .topics
                .get_mut(topic)
                .and_then(|partitions| partitions.get_mut(partition as usize))
                .unwrap_or_else(|| panic!("produce to unknown partition {}/{}", topic, partition));
            let offset = log.next();
            log.records.push(RawRecord {
                topic: topic.to_string(),
                partition,
                offset,
                key: None,
                payload,
                headers,
                timestamp: Some(timestamp),
            });
            offset
        };
        self.shared.appends.send_modify(|version| *version += 1);
        offset
    }

    /// Drop the first `count` records and advance the reported low watermark
    pub fn expire_before(&self, topic: &str, partition: i32, count: i64) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(log) = state.topics.get_mut(topic).and_then(|p| p.get_mut(partition as usize)) {
            log.oldest = count;
            log.readable = count;
        }
    }

    /// Drop the first `count` records without updating the reported low
    /// watermark, as happens when retention runs between a watermark query
    /// and a fetch
    pub fn expire_silently(&self, topic: &str, partition: i32, count: i64) {
        let mut state = self.shared.state.lock().unwrap();
        if let Some(log) = state.topics.get_mut(topic).and_then(|p| p.get_mut(partition as usize)) {
            log.readable = count;
        }
    }

    pub fn set_auto_create(&self, enabled: bool) {
        self.shared.state.lock().unwrap().auto_create = enabled;
    }

    /// End partition streams once they reach the end of the log
    pub fn close_streams_when_drained(&self, enabled: bool) {
        self.shared.state.lock().unwrap().close_when_drained = enabled;
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_connects(&self, count: usize) {
        self.shared.state.lock().unwrap().failing_connects = count;
    }

    /// Number of connection attempts so far, failed ones included
    pub fn connect_count(&self) -> usize {
        self.shared.state.lock().unwrap().connects
    }

    /// Committed position of a group on one partition
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.shared
            .state
            .lock()
            .unwrap()
            .committed
            .get(&(group.to_string(), topic.to_string(), partition))
            .copied()
    }

    /// Overwrite a group's committed position, as if later commits were lost
    pub fn rewind_committed(&self, group: &str, topic: &str, partition: i32, offset: i64) {
        self.shared
            .state
            .lock()
            .unwrap()
            .committed
            .insert((group.to_string(), topic.to_string(), partition), offset);
    }

    /// Every commit in order, with the group and mode it was made with
    pub fn commit_log(&self) -> Vec<(String, PartitionOffset, CommitMode)> {
        self.shared.state.lock().unwrap().commit_log.clone()
    }

    /// End the current group generation: claims are revoked and sessions
    /// stop handing out partitions
    pub fn simulate_rebalance(&self) {
        self.shared.generations.send_modify(|generation| *generation += 1);
    }

    /// A connected client, bypassing the connector
    pub fn client(&self) -> Arc<dyn BrokerClient> {
        Arc::new(MockClient {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn connector(&self) -> Arc<dyn BrokerConnector> {
        Arc::new(self.clone())
    }

    fn stream(&self, topic: &str, partition: i32, offset: i64, generation: Option<u64>) -> PartitionStream {
        let (tx, rx) = mpsc::channel(64);
        let shared = Arc::clone(&self.shared);
        let mut appends = shared.appends.subscribe();
        let mut generations = shared.generations.subscribe();
        let owned_topic = topic.to_string();

        let feeder = tokio::spawn(async move {
            let mut next = offset;
            loop {
                let _ = appends.borrow_and_update();
                if generation.is_some_and(|g| *generations.borrow_and_update() != g) {
                    return;
                }

                let (step, close_when_drained) = {
                    let state = shared.state.lock().unwrap();
                    (state.step(&owned_topic, partition, next), state.close_when_drained)
                };

                match step {
                    Ok(Step::Record(record)) => {
                        next = record.offset + 1;
                        if tx.send(Ok(record)).await.is_err() {
                            return;
                        }
                    },
                    Ok(Step::Gone) => {
                        let _ = tx
                            .send(Err(BrokerError::OffsetOutOfRange {
                                topic: owned_topic.clone(),
                                partition,
                                offset: next,
                            }))
                            .await;
                        return;
                    },
                    Ok(Step::Drained) if close_when_drained => return,
                    Ok(Step::Drained) => {
                        tokio::select! {
                            _ = tx.closed() => return,
                            changed = appends.changed() => if changed.is_err() { return },
                            changed = generations.changed(), if generation.is_some() => {
                                if changed.is_err() {
                                    return;
                                }
                            },
                        }
                    },
                    Err(err) => {
                        let _ = tx.send(Err(err)).await;
                        return;
                    },
                }
            }
        });

        PartitionStream::new(topic, partition, rx, Some(feeder))
    }
}

#[async_trait]
impl BrokerConnector for MockBroker {
    async fn connect(&self) -> BrokerResult<Arc<dyn BrokerClient>> {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.connects += 1;
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                return Err(BrokerError::Unavailable("connection refused".to_string()));
            }
        }
        Ok(self.client())
    }
}

struct MockClient {
    broker: MockBroker,
    closed: AtomicBool,
}

impl MockClient {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.broker.shared.state.lock().unwrap()
    }
}

#[async_trait]
impl BrokerClient for MockClient {
    async fn list_topics(&self) -> BrokerResult<Vec<String>> {
        self.ensure_open()?;
        Ok(self.state().topics.keys().cloned().collect())
    }

    async fn auto_creates_topics(&self) -> BrokerResult<bool> {
        self.ensure_open()?;
        Ok(self.state().auto_create)
    }

    async fn partitions(&self, topic: &str) -> BrokerResult<Vec<i32>> {
        self.ensure_open()?;
        let state = self.state();
        let partitions = state
            .topics
            .get(topic)
            .ok_or_else(|| BrokerError::UnknownTopic(topic.to_string()))?;
        Ok((0..partitions.len() as i32).collect())
    }

    async fn watermarks(&self, topic: &str, partition: i32) -> BrokerResult<(i64, i64)> {
        self.ensure_open()?;
        let state = self.state();
        let log = state.log(topic, partition)?;
        Ok((log.oldest, log.next()))
    }

    async fn fetch_record(&self, topic: &str, partition: i32, offset: i64) -> BrokerResult<RawRecord> {
        self.ensure_open()?;
        let state = self.state();
        match state.step(topic, partition, offset)? {
            Step::Record(record) => Ok(record),
            Step::Gone | Step::Drained => Err(BrokerError::OffsetOutOfRange {
                topic: topic.to_string(),
                partition,
                offset,
            }),
        }
    }

    async fn consume_partition(&self, topic: &str, partition: i32, offset: i64) -> BrokerResult<PartitionStream> {
        self.ensure_open()?;
        self.state().log(topic, partition)?;
        Ok(self.broker.stream(topic, partition, offset, None))
    }

    async fn join_group(
        &self,
        group: &str,
        topics: &[String],
        start_offsets: &HashMap<(String, i32), i64>,
        commit_mode: CommitMode,
    ) -> BrokerResult<Box<dyn GroupSession>> {
        self.ensure_open()?;
        let mut pending = VecDeque::new();
        {
            let state = self.state();
            for topic in topics {
                let partitions = state
                    .topics
                    .get(topic)
                    .ok_or_else(|| BrokerError::UnknownTopic(topic.clone()))?;
                for (index, log) in partitions.iter().enumerate() {
                    let partition = index as i32;
                    let key = (topic.clone(), partition);
                    let offset = start_offsets
                        .get(&key)
                        .or_else(|| state.committed.get(&(group.to_string(), topic.clone(), partition)))
                        .copied()
                        .unwrap_or(log.oldest);
                    pending.push_back((topic.clone(), partition, offset));
                }
            }
        }

        let generations = self.broker.shared.generations.subscribe();
        let generation = *generations.borrow();
        Ok(Box::new(MockSession {
            broker: self.broker.clone(),
            group: group.to_string(),
            commit_mode,
            pending,
            generation,
            generations,
            closed: false,
        }))
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct MockSession {
    broker: MockBroker,
    group: String,
    commit_mode: CommitMode,
    pending: VecDeque<(String, i32, i64)>,
    generation: u64,
    generations: watch::Receiver<u64>,
    closed: bool,
}

#[async_trait]
impl GroupSession for MockSession {
    async fn next_claim(&mut self) -> Option<PartitionClaim> {
        if self.closed {
            return None;
        }
        if let Some((topic, partition, offset)) = self.pending.pop_front() {
            let stream = self.broker.stream(&topic, partition, offset, Some(self.generation));
            return Some(PartitionClaim {
                stream,
                start: Some(offset),
            });
        }

        let generation = self.generation;
        let _ = self.generations.wait_for(|current| *current != generation).await;
        None
    }

    fn committer(&self) -> Arc<dyn OffsetCommitter> {
        Arc::new(MockCommitter {
            broker: self.broker.clone(),
            group: self.group.clone(),
            expected_mode: self.commit_mode,
        })
    }

    async fn close(&mut self) -> BrokerResult<()> {
        self.closed = true;
        self.pending.clear();
        Ok(())
    }
}

struct MockCommitter {
    broker: MockBroker,
    group: String,
    expected_mode: CommitMode,
}

#[async_trait]
impl OffsetCommitter for MockCommitter {
    async fn commit(&self, offsets: &[PartitionOffset], mode: CommitMode) -> BrokerResult<()> {
        debug_assert_eq!(mode, self.expected_mode, "commit mode differs from the joined session");
        let mut state = self.broker.shared.state.lock().unwrap();
        for offset in offsets {
            state.committed.insert(
                (self.group.clone(), offset.topic.clone(), offset.partition),
                offset.offset,
            );
            state.commit_log.push((self.group.clone(), offset.clone(), mode));
        }
        Ok(())
    }
}

/// Processor accepting every batch
pub fn noop_processor() -> SharedProcessor {
    Arc::new(|_batch: Batch| async { Ok::<(), anyhow::Error>(()) })
}

type FailRule = Box<dyn Fn(&Batch) -> bool + Send + Sync>;

/// Processor recording every batch it sees, optionally rejecting some
#[derive(Clone, Default)]
pub struct RecordingProcessor {
    attempts: Arc<Mutex<Vec<Vec<PartitionOffset>>>>,
    processed: Arc<Mutex<Vec<Vec<PartitionOffset>>>>,
    fail_rule: Arc<Mutex<Option<FailRule>>>,
    delay: Duration,
}

impl RecordingProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject batches for which `rule` returns true
    pub fn fail_when(self, rule: impl Fn(&Batch) -> bool + Send + Sync + 'static) -> Self {
        *self.fail_rule.lock().unwrap() = Some(Box::new(rule));
        self
    }

    /// Reject every batch containing `offset`
    pub fn fail_on_offset(self, offset: i64) -> Self {
        self.fail_when(move |batch| batch.iter().any(|message| message.offset() == offset))
    }

    /// Spend `delay` on every batch before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn shared(&self) -> SharedProcessor {
        Arc::new(self.clone())
    }

    /// Every batch handed to the processor, failed ones included
    pub fn attempts(&self) -> Vec<Vec<PartitionOffset>> {
        self.attempts.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    /// Sizes of the batches processed successfully
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.processed.lock().unwrap().iter().map(Vec::len).collect()
    }

    /// Offsets processed successfully, in processing order
    pub fn processed_offsets(&self) -> Vec<i64> {
        self.processed
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|position| position.offset)
            .collect()
    }

    pub fn processed_count(&self) -> usize {
        self.processed.lock().unwrap().iter().map(Vec::len).sum()
    }
}

#[async_trait]
impl BatchProcessor for RecordingProcessor {
    async fn process(&self, batch: Batch) -> anyhow::Result<()> {
        let positions: Vec<PartitionOffset> = batch
            .iter()
            .map(|message| PartitionOffset::new(message.topic(), message.partition(), message.offset()))
            .collect();
        self.attempts.lock().unwrap().push(positions.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let rejected = self
            .fail_rule
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|rule| rule(&batch));
        if rejected {
            anyhow::bail!("batch rejected");
        }

        self.processed.lock().unwrap().push(positions);
        Ok(())
    }
}

/// Metrics sink keeping every reported value
#[derive(Debug, Default)]
pub struct RecordingMetrics {
    statuses: Mutex<HashMap<MessageStatus, u64>>,
    lags: Mutex<HashMap<(String, i32), i64>>,
    batches: Mutex<Vec<(usize, bool)>>,
    calls: AtomicUsize,
}

impl RecordingMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self, status: MessageStatus) -> u64 {
        self.statuses.lock().unwrap().get(&status).copied().unwrap_or(0)
    }

    /// Last lag reported for a partition
    pub fn lag(&self, topic: &str, partition: i32) -> Option<i64> {
        self.lags
            .lock()
            .unwrap()
            .get(&(topic.to_string(), partition))
            .copied()
    }

    /// Size and outcome of every processor call
    pub fn batches(&self) -> Vec<(usize, bool)> {
        self.batches.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ConsumerMetrics for RecordingMetrics {
    fn message_status(&self, _component: &str, _topic: &str, _partition: i32, status: MessageStatus) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.statuses.lock().unwrap().entry(status).or_default() += 1;
    }

    fn offset_lag(&self, _component: &str, topic: &str, partition: i32, lag: i64) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.lags
            .lock()
            .unwrap()
            .insert((topic.to_string(), partition), lag);
    }

    fn batch_duration(&self, _component: &str, size: usize, success: bool, _duration: Duration) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().unwrap().push((size, success));
    }
}

/// Poll `condition` until it holds or five seconds pass
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    wait_until(Duration::from_secs(5), condition).await
}

pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Run `future` to completion, failing the test if it takes over five seconds
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .unwrap_or_else(|_| panic!("operation did not finish within 5s"))
}
