//! Partition consumption loops
//!
//! One [`PartitionLoop`] runs per partition (simple component) or per group
//! claim. Each loop multiplexes cancellation, the flush ticker and the next
//! broker record, feeding a [`BatchBuffer`]. Loops of one cycle live in a
//! [`LoopSet`], which cancels the survivors once any of them fails.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::broker::{PartitionStream, RawRecord};
use super::buffer::BatchBuffer;
use crate::error::{Error, Result, Stage};
use crate::message_span;
use crate::metrics::{ConsumerMetrics, MessageStatus};
use crate::models::Message;

/// Next offset to be produced per partition, captured when a cycle starts
pub type LatestOffsets = HashMap<(String, i32), i64>;

/// Single-fire signal that every partition caught up with its startup backlog
///
/// Shared by every loop and every retry cycle of a component; only the first
/// [`LatestOffsetNotifier::notify`] call has an effect.
#[derive(Debug)]
pub struct LatestOffsetNotifier {
    sender: Mutex<Option<oneshot::Sender<()>>>,
}

impl LatestOffsetNotifier {
    /// Create a notifier and the receiver the caller waits on
    pub fn channel() -> (Arc<Self>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let notifier = Self {
            sender: Mutex::new(Some(tx)),
        };
        (Arc::new(notifier), rx)
    }

    /// Fire the signal; returns whether this call was the one that fired it
    pub fn notify(&self) -> bool {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        match sender {
            Some(sender) => {
                // A dropped receiver just means nobody is waiting any more
                let _ = sender.send(());
                true
            },
            None => false,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_none()
    }
}

/// Partitions that still have to reach their startup latest offset
#[derive(Debug)]
pub struct LatestOffsetTracker {
    remaining: Mutex<HashMap<(String, i32), i64>>,
    notifier: Arc<LatestOffsetNotifier>,
}

impl LatestOffsetTracker {
    /// Track every partition of `latest`; empty partitions count as reached
    pub fn new(latest: &LatestOffsets, oldest: &LatestOffsets, notifier: Arc<LatestOffsetNotifier>) -> Self {
        let remaining = latest
            .iter()
            .filter(|(key, next)| oldest.get(*key).map_or(**next > 0, |first| *next > first))
            .map(|(key, next)| (key.clone(), next - 1))
            .collect();

        let tracker = Self {
            remaining: Mutex::new(remaining),
            notifier,
        };
        tracker.fire_if_done();
        tracker
    }

    /// Record where a partition's consumption begins
    ///
    /// A start at or past the latest offset has no backlog left to read.
    pub fn start_at(&self, topic: &str, partition: i32, start: i64) {
        self.observe(topic, partition, start - 1);
    }

    /// Record that `offset` was received on a partition
    pub fn observe(&self, topic: &str, partition: i32, offset: i64) {
        {
            let mut remaining = self
                .remaining
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let key = (topic.to_string(), partition);
            match remaining.get(&key) {
                Some(target) if offset >= *target => {
                    remaining.remove(&key);
                },
                _ => return,
            }
        }
        self.fire_if_done();
    }

    fn fire_if_done(&self) {
        let done = self
            .remaining
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_empty();
        if done && self.notifier.notify() {
            info!("All partitions reached their latest offset");
        }
    }
}

/// Everything a partition loop shares with its cycle
#[derive(Clone)]
pub struct LoopContext {
    pub component: String,
    pub buffer: Arc<BatchBuffer>,
    pub batch_timeout: Duration,
    pub latest: Arc<LatestOffsets>,
    pub tracker: Option<Arc<LatestOffsetTracker>>,
    pub metrics: Arc<dyn ConsumerMetrics>,
}

/// Consumption loop of one partition
pub struct PartitionLoop {
    context: LoopContext,
    stream: PartitionStream,
}

impl PartitionLoop {
    pub fn new(context: LoopContext, stream: PartitionStream) -> Self {
        Self { context, stream }
    }

    /// Run until cancelled, the stream ends or a batch fails
    ///
    /// Cancellation and stream closure drain the buffer with one final flush.
    pub async fn run(mut self, token: CancellationToken) -> Result<()> {
        let topic = self.stream.topic.clone();
        let partition = self.stream.partition;
        debug!(component = %self.context.component, topic = %topic, partition, "Partition loop started");

        let mut ticker = flush_ticker(self.context.batch_timeout);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(topic = %topic, partition, "Partition loop cancelled, draining");
                    break;
                },
                _ = tick(&mut ticker) => {
                    self.context.buffer.flush().await?;
                },
                next = self.stream.recv() => match next {
                    Some(Ok(_)) if self.context.buffer.is_halted() => {
                        debug!(topic = %topic, partition, "Buffer halted by a failed batch, stopping");
                        break;
                    },
                    Some(Ok(record)) => self.handle(record).await?,
                    Some(Err(err)) => {
                        warn!(topic = %topic, partition, error = %err, "Partition stream failed");
                        self.stream.close();
                        self.context.buffer.flush().await?;
                        return Err(Error::broker(Stage::Consume, err));
                    },
                    None => {
                        debug!(topic = %topic, partition, "Partition stream closed, draining");
                        break;
                    },
                },
            }
        }

        self.stream.close();
        self.context.buffer.flush().await?;
        debug!(topic = %topic, partition, "Partition loop stopped");
        Ok(())
    }

    async fn handle(&self, record: RawRecord) -> Result<()> {
        let ctx = &self.context;
        ctx.metrics
            .message_status(&ctx.component, &record.topic, record.partition, MessageStatus::Received);

        if let Some(next) = ctx.latest.get(&(record.topic.clone(), record.partition)) {
            let lag = (next - 1 - record.offset).max(0);
            ctx.metrics
                .offset_lag(&ctx.component, &record.topic, record.partition, lag);
        }

        if let Some(tracker) = &ctx.tracker {
            tracker.observe(&record.topic, record.partition, record.offset);
        }

        let span = message_span!(ctx.component, record.topic, record.partition, record.offset);
        ctx.buffer.insert(Message::new(span, record)).await
    }
}

fn flush_ticker(period: Duration) -> Option<Interval> {
    if period.is_zero() {
        return None;
    }
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    Some(ticker)
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        },
        None => std::future::pending::<()>().await,
    }
}

/// Concurrent partition loops of one cycle
///
/// The first failing loop cancels the others, which drain and stop; that
/// failure is the set's result.
pub struct LoopSet {
    loops: JoinSet<Result<()>>,
    token: CancellationToken,
    first_error: Option<Error>,
}

impl LoopSet {
    /// Loops run under a child of `parent`
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            loops: JoinSet::new(),
            token: parent.child_token(),
            first_error: None,
        }
    }

    pub fn spawn(&mut self, partition_loop: PartitionLoop) {
        let token = self.token.clone();
        self.loops.spawn(partition_loop.run(token));
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn has_failed(&self) -> bool {
        self.first_error.is_some()
    }

    /// Stop every loop; they drain their buffers before ending
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the next loop to end; `None` when no loop is running
    pub async fn join_next(&mut self) -> Option<()> {
        let joined = self.loops.join_next().await?;
        let outcome = joined.unwrap_or_else(|e| Err(Error::internal(format!("partition loop aborted: {}", e))));

        if let Err(err) = outcome {
            if self.first_error.is_none() {
                self.token.cancel();
                self.first_error = Some(err);
            } else {
                debug!(error = %err, "Additional partition loop failure");
            }
        }
        Some(())
    }

    /// Wait for every loop and return the first failure
    pub async fn finish(mut self) -> Result<()> {
        while self.join_next().await.is_some() {}
        match self.first_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::broker::{BrokerResult, CommitMode};
    use crate::kafka::buffer::{BufferSettings, CycleProgress, OffsetState};
    use crate::kafka::processor::SharedProcessor;
    use crate::kafka::strategy::FailStrategy;
    use crate::metrics::NoopMetrics;
    use crate::models::Batch;
    use crate::test_utils::RecordingMetrics;
    use tokio::sync::mpsc;

    fn raw(partition: i32, offset: i64) -> RawRecord {
        RawRecord {
            topic: "orders".to_string(),
            partition,
            offset,
            key: None,
            payload: b"{}".to_vec(),
            headers: HashMap::new(),
            timestamp: None,
        }
    }

    fn context(batch_size: usize, timeout: Duration, processor: SharedProcessor) -> LoopContext {
        let settings = BufferSettings {
            component: "orders".to_string(),
            batch_size,
            strategy: FailStrategy::Exit,
            commit_mode: CommitMode::Auto,
            dedup: false,
        };
        LoopContext {
            component: "orders".to_string(),
            buffer: Arc::new(BatchBuffer::new(
                settings,
                processor,
                None,
                OffsetState::new(),
                CycleProgress::new(),
                Arc::new(NoopMetrics),
            )),
            batch_timeout: timeout,
            latest: Arc::new(HashMap::new()),
            tracker: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    fn sizes_processor() -> (SharedProcessor, Arc<Mutex<Vec<usize>>>) {
        let sizes = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&sizes);
        let processor: SharedProcessor = Arc::new(move |batch: Batch| {
            log.lock().unwrap().push(batch.len());
            async { Ok::<(), anyhow::Error>(()) }
        });
        (processor, sizes)
    }

    fn stream(partition: i32) -> (mpsc::Sender<BrokerResult<RawRecord>>, PartitionStream) {
        let (tx, rx) = mpsc::channel(64);
        (tx, PartitionStream::new("orders", partition, rx, None))
    }

    #[tokio::test]
    async fn test_notifier_fires_once() {
        let (notifier, rx) = LatestOffsetNotifier::channel();
        assert!(!notifier.has_fired());
        assert!(notifier.notify());
        assert!(!notifier.notify());
        assert!(notifier.has_fired());
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_notifier_concurrent_callers() {
        let (notifier, _rx) = LatestOffsetNotifier::channel();
        let mut tasks = JoinSet::new();
        for _ in 0..16 {
            let notifier = Arc::clone(&notifier);
            tasks.spawn(async move { notifier.notify() });
        }
        let mut fired = 0;
        while let Some(result) = tasks.join_next().await {
            if result.unwrap() {
                fired += 1;
            }
        }
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_tracker_waits_for_every_partition() {
        let (notifier, _rx) = LatestOffsetNotifier::channel();
        let latest: LatestOffsets = [(("orders".to_string(), 0), 10), (("orders".to_string(), 1), 5)].into();
        let oldest: LatestOffsets = [(("orders".to_string(), 0), 0), (("orders".to_string(), 1), 0)].into();
        let tracker = LatestOffsetTracker::new(&latest, &oldest, Arc::clone(&notifier));

        tracker.observe("orders", 0, 9);
        assert!(!notifier.has_fired());
        tracker.observe("orders", 1, 3);
        assert!(!notifier.has_fired());
        tracker.observe("orders", 1, 4);
        assert!(notifier.has_fired());
    }

    #[test]
    fn test_tracker_empty_partitions_are_reached() {
        let (notifier, _rx) = LatestOffsetNotifier::channel();
        let latest: LatestOffsets = [(("orders".to_string(), 0), 7)].into();
        let oldest: LatestOffsets = [(("orders".to_string(), 0), 7)].into();
        let _tracker = LatestOffsetTracker::new(&latest, &oldest, Arc::clone(&notifier));
        assert!(notifier.has_fired());
    }

    #[test]
    fn test_tracker_start_at_the_end_counts_as_reached() {
        let (notifier, _rx) = LatestOffsetNotifier::channel();
        let latest: LatestOffsets = [(("orders".to_string(), 0), 10), (("orders".to_string(), 1), 5)].into();
        let oldest: LatestOffsets = [(("orders".to_string(), 0), 0), (("orders".to_string(), 1), 0)].into();
        let tracker = LatestOffsetTracker::new(&latest, &oldest, Arc::clone(&notifier));

        tracker.start_at("orders", 0, 0);
        tracker.start_at("orders", 1, 5);
        assert!(!notifier.has_fired());
        tracker.start_at("orders", 0, 12);
        assert!(notifier.has_fired());
    }

    #[tokio::test]
    async fn test_loop_stops_once_buffer_is_halted() {
        let processor: SharedProcessor = Arc::new(|_batch: Batch| async { Err::<(), anyhow::Error>(anyhow::anyhow!("rejected")) });
        let metrics = RecordingMetrics::new();
        let mut ctx = context(1, Duration::ZERO, processor);
        ctx.metrics = metrics.clone();

        let err = ctx.buffer.insert(Message::new(tracing::Span::none(), raw(0, 0))).await.unwrap_err();
        assert!(err.is_processing());
        assert!(ctx.buffer.is_halted());

        let (tx, stream) = stream(1);
        for offset in 0..3 {
            tx.send(Ok(raw(1, offset))).await.unwrap();
        }

        PartitionLoop::new(ctx, stream)
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(metrics.count(MessageStatus::Received), 0);
        drop(tx);
    }

    #[tokio::test]
    async fn test_loop_drains_on_stream_close() {
        let (processor, sizes) = sizes_processor();
        let (tx, stream) = stream(0);
        for offset in 0..25 {
            tx.send(Ok(raw(0, offset))).await.unwrap();
        }
        drop(tx);

        PartitionLoop::new(context(10, Duration::from_secs(5), processor), stream)
            .run(CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(*sizes.lock().unwrap(), vec![10, 10, 5]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_flushes_on_timeout() {
        let (processor, sizes) = sizes_processor();
        let (tx, stream) = stream(0);
        for offset in 0..3 {
            tx.send(Ok(raw(0, offset))).await.unwrap();
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(
            PartitionLoop::new(context(10, Duration::from_secs(1), processor), stream).run(token.clone()),
        );

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(*sizes.lock().unwrap(), vec![3]);

        token.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(*sizes.lock().unwrap(), vec![3]);
        drop(tx);
    }

    #[tokio::test]
    async fn test_loop_drains_on_cancel() {
        let (processor, sizes) = sizes_processor();
        let (tx, stream) = stream(0);
        for offset in 0..4 {
            tx.send(Ok(raw(0, offset))).await.unwrap();
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(
            PartitionLoop::new(context(10, Duration::ZERO, processor), stream).run(token.clone()),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sizes.lock().unwrap().is_empty());

        token.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(*sizes.lock().unwrap(), vec![4]);
        drop(tx);
    }

    #[tokio::test]
    async fn test_stream_error_is_consume_stage() {
        let (processor, _) = sizes_processor();
        let (tx, stream) = stream(0);
        tx.send(Err(crate::kafka::BrokerError::Unavailable("gone".into())))
            .await
            .unwrap();

        let err = PartitionLoop::new(context(1, Duration::ZERO, processor), stream)
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Consume));
    }

    #[tokio::test]
    async fn test_loop_set_first_error_cancels_siblings() {
        let processor: SharedProcessor = Arc::new(|batch: Batch| async move {
            if batch.iter().any(|m| m.partition() == 1) {
                anyhow::bail!("partition 1 rejected");
            }
            Ok(())
        });
        let ctx = context(1, Duration::ZERO, processor);
        let parent = CancellationToken::new();
        let mut set = LoopSet::new(&parent);

        let (_healthy_tx, healthy) = stream(0);
        let (failing_tx, failing) = stream(1);
        set.spawn(PartitionLoop::new(ctx.clone(), healthy));
        set.spawn(PartitionLoop::new(ctx, failing));
        failing_tx.send(Ok(raw(1, 0))).await.unwrap();

        let err = set.finish().await.unwrap_err();
        assert!(err.is_processing());
        assert!(!parent.is_cancelled());
    }
}
