//! Batching buffer and offset bookkeeping
//!
//! A [`BatchBuffer`] accumulates messages until either the configured batch
//! size is reached or the owning loop's flush ticker fires, then hands the
//! snapshot to the processor. Results are routed through the failure
//! strategy and, on success or skip, advance the shared [`OffsetState`] and
//! the broker's committed position.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tracing::{debug, error, Instrument};

use super::broker::{CommitMode, OffsetCommitter, PartitionOffset};
use super::processor::SharedProcessor;
use super::strategy::FailStrategy;
use crate::batch_span;
use crate::error::{Error, Result, Stage};
use crate::metrics::{ConsumerMetrics, MessageStatus};
use crate::models::{Batch, Message};

/// Next offset to read per (topic, partition)
///
/// Only advanced after a batch succeeded or was skipped. Cloning shares the
/// underlying map, so one state can outlive many cycles of a component.
#[derive(Debug, Clone, Default)]
pub struct OffsetState {
    inner: Arc<Mutex<HashMap<(String, i32), i64>>>,
}

impl OffsetState {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, i32), i64>> {
        // A poisoned map still holds valid offsets
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Next offset to read, if the partition made progress before
    pub fn next_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.lock().get(&(topic.to_string(), partition)).copied()
    }

    /// Move a partition forward; never moves backwards
    pub fn advance(&self, topic: &str, partition: i32, next: i64) {
        let mut offsets = self.lock();
        let entry = offsets.entry((topic.to_string(), partition)).or_insert(next);
        if *entry < next {
            *entry = next;
        }
    }

    /// Copy of every tracked position
    pub fn snapshot(&self) -> HashMap<(String, i32), i64> {
        self.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Whether a cycle processed at least one message successfully
#[derive(Debug, Clone, Default)]
pub struct CycleProgress {
    succeeded: Arc<AtomicBool>,
}

impl CycleProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark(&self) {
        self.succeeded.store(true, Ordering::SeqCst);
    }

    pub fn made_progress(&self) -> bool {
        self.succeeded.load(Ordering::SeqCst)
    }
}

/// Static settings of a buffer
#[derive(Debug, Clone)]
pub struct BufferSettings {
    pub component: String,
    pub batch_size: usize,
    pub strategy: FailStrategy,
    pub commit_mode: CommitMode,
    pub dedup: bool,
}

/// Size-or-time triggered batch accumulator
pub struct BatchBuffer {
    settings: BufferSettings,
    pending: Mutex<Vec<Message>>,
    // Serialises dispatches so batches of one partition commit in order
    dispatch: tokio::sync::Mutex<()>,
    halted: AtomicBool,
    processor: SharedProcessor,
    committer: Option<Arc<dyn OffsetCommitter>>,
    offsets: OffsetState,
    progress: CycleProgress,
    metrics: Arc<dyn ConsumerMetrics>,
}

impl BatchBuffer {
    /// Create a buffer
    ///
    /// Without a committer, offsets are tracked in `offsets` only.
    pub fn new(
        settings: BufferSettings,
        processor: SharedProcessor,
        committer: Option<Arc<dyn OffsetCommitter>>,
        offsets: OffsetState,
        progress: CycleProgress,
        metrics: Arc<dyn ConsumerMetrics>,
    ) -> Self {
        let capacity = settings.batch_size.min(1024);
        Self {
            settings,
            pending: Mutex::new(Vec::with_capacity(capacity)),
            dispatch: tokio::sync::Mutex::new(()),
            halted: AtomicBool::new(false),
            processor,
            committer,
            offsets,
            progress,
            metrics,
        }
    }

    fn pending(&self) -> MutexGuard<'_, Vec<Message>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of buffered messages
    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    /// Whether an exit-strategy failure stopped this buffer
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Append a message, flushing synchronously once the batch is full
    ///
    /// Inserts wait for an in-flight dispatch, so the buffer never holds
    /// more than `batch_size` messages.
    pub async fn insert(&self, message: Message) -> Result<()> {
        if self.is_halted() {
            debug!(
                topic = message.topic(),
                partition = message.partition(),
                offset = message.offset(),
                "Buffer halted, dropping message"
            );
            return Ok(());
        }

        if self.settings.dedup {
            if let Some(next) = self.offsets.next_offset(message.topic(), message.partition()) {
                if message.offset() < next {
                    debug!(
                        topic = message.topic(),
                        partition = message.partition(),
                        offset = message.offset(),
                        "Dropping already processed message"
                    );
                    return Ok(());
                }
            }
        }

        let _turn = self.dispatch.lock().await;
        if self.is_halted() {
            return Ok(());
        }

        let full = {
            let mut pending = self.pending();
            pending.push(message);
            pending.len() >= self.settings.batch_size
        };

        if full {
            self.dispatch_pending().await?;
        }
        Ok(())
    }

    /// Dispatch whatever is buffered; no-op when empty
    pub async fn flush(&self) -> Result<()> {
        let _turn = self.dispatch.lock().await;
        self.dispatch_pending().await
    }

    /// Hand up to one batch to the processor; callers hold the dispatch turn
    async fn dispatch_pending(&self) -> Result<()> {
        if self.is_halted() {
            return Ok(());
        }

        let batch = {
            let mut pending = self.pending();
            if pending.is_empty() {
                return Ok(());
            }
            let take = pending.len().min(self.settings.batch_size);
            Batch::new(pending.drain(..take).collect())
        };

        let span = batch_span!(self.settings.component, batch.len());
        let started = Instant::now();
        let result = self
            .processor
            .process(batch.clone())
            .instrument(span.clone())
            .await;
        let elapsed = started.elapsed();

        span.record("success", result.is_ok());
        span.record("duration_ms", elapsed.as_millis() as u64);
        self.metrics
            .batch_duration(&self.settings.component, batch.len(), result.is_ok(), elapsed);

        match result {
            Ok(()) => {
                self.record(&batch, MessageStatus::Processed);
                self.advance(&batch).await?;
                self.progress.mark();
                debug!(
                    component = %self.settings.component,
                    batch_size = batch.len(),
                    duration_ms = elapsed.as_millis() as u64,
                    "Batch processed"
                );
                Ok(())
            },
            Err(err) => {
                self.record(&batch, MessageStatus::Errored);
                match self.settings.strategy.handle(&batch, err) {
                    Ok(()) => {
                        self.record(&batch, MessageStatus::Skipped);
                        self.advance(&batch).await
                    },
                    Err(err) => {
                        self.halted.store(true, Ordering::SeqCst);
                        self.pending().clear();
                        error!(
                            component = %self.settings.component,
                            batch_size = batch.len(),
                            error = %format!("{:#}", err),
                            "Batch failed, stopping consumption"
                        );
                        Err(Error::Processing {
                            component: self.settings.component.clone(),
                            reason: err,
                        })
                    },
                }
            },
        }
    }

    fn record(&self, batch: &Batch, status: MessageStatus) {
        for message in batch {
            self.metrics.message_status(
                &self.settings.component,
                message.topic(),
                message.partition(),
                status,
            );
        }
    }

    async fn advance(&self, batch: &Batch) -> Result<()> {
        let positions: Vec<PartitionOffset> = batch
            .partition_offsets()
            .into_iter()
            .map(|(topic, partition, last)| PartitionOffset::new(topic, partition, last + 1))
            .collect();

        for position in &positions {
            self.offsets
                .advance(&position.topic, position.partition, position.offset);
        }

        if let Some(committer) = &self.committer {
            committer
                .commit(&positions, self.settings.commit_mode)
                .await
                .map_err(|e| Error::broker(Stage::Commit, e))?;
        }
        Ok(())
    }
}
