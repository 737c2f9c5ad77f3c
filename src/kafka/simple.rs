//! Simple partition-consumer component
//!
//! Reads every partition of the configured topics directly, without a
//! consumer group. Processed positions live in the component's
//! [`OffsetState`], so a retried cycle resumes where the previous one stopped
//! while only the partition consumers are rebuilt.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::broker::{BrokerClient, StartOffset};
use super::buffer::{CycleProgress, OffsetState};
use super::component::{self, PartitionSnapshot};
use super::options::{BatchScope, ComponentConfig};
use super::partition::{LatestOffsetTracker, LoopContext, LoopSet, PartitionLoop};
use super::retry::{run_with_retries, CycleOutcome, RetryPolicy};
use crate::error::{Error, Result, Stage};

/// Broker client carried from one cycle to the next
type Connection = Mutex<Option<Arc<dyn BrokerClient>>>;

/// Consumes every partition of its topics independently
#[derive(Debug)]
pub struct SimpleComponent {
    config: Arc<ComponentConfig>,
    offsets: OffsetState,
}

impl SimpleComponent {
    pub(crate) fn new(config: ComponentConfig) -> Self {
        Self {
            config: Arc::new(config),
            offsets: OffsetState::new(),
        }
    }

    pub fn config(&self) -> &ComponentConfig {
        &self.config
    }

    /// Next offset to read per partition
    pub fn offsets(&self) -> &OffsetState {
        &self.offsets
    }

    /// Consume until every partition stream ends, `token` is cancelled or
    /// the retry budget is spent
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let config = &self.config;
        info!(
            component = %config.name,
            topics = %config.topics_label(),
            batch_size = config.batch_size,
            batch_timeout_ms = config.batch_timeout.as_millis() as u64,
            retries = config.retries,
            strategy = %config.strategy,
            "Starting simple component"
        );

        if config.check_topic {
            component::check_topics(config)
                .await
                .map_err(|e| component::wrap_error(config, e))?;
        }

        let policy = RetryPolicy {
            retries: config.retries,
            wait: config.retry_wait,
        };
        let connection = Mutex::new(None);
        let result = run_with_retries(policy, &token, |cycle| {
            self.cycle(cycle, &connection, token.child_token())
        })
        .await;

        let client = connection
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let result = match client {
            Some(client) => component::close_client(client.as_ref(), result).await,
            None => result,
        };

        result.map_err(|err| {
            error!(component = %config.name, error = %err, "Simple component failed");
            component::wrap_error(config, err)
        })
    }

    /// One pass over every partition
    ///
    /// The client survives processing failures; only a broker-side failure
    /// closes it so the next cycle reconnects.
    async fn cycle(&self, number: u64, connection: &Connection, token: CancellationToken) -> CycleOutcome {
        debug!(component = %self.config.name, cycle = number, "Starting consumption cycle");
        let progress = CycleProgress::new();

        let reused = connection
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let client = match reused {
            Some(client) => Ok(client),
            None => component::connect(&self.config).await,
        };

        let result = match client {
            Ok(client) => match self.consume(&client, &progress, &token).await {
                Err(err) if err.stage().is_some() => {
                    debug!(component = %self.config.name, stage = ?err.stage(), "Broker failure, dropping client");
                    component::close_client(client.as_ref(), Err(err)).await
                },
                consumed => {
                    *connection.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(client);
                    consumed
                },
            },
            Err(err) => Err(err),
        };

        CycleOutcome {
            result,
            made_progress: progress.made_progress(),
        }
    }

    async fn consume(
        &self,
        client: &Arc<dyn BrokerClient>,
        progress: &CycleProgress,
        token: &CancellationToken,
    ) -> Result<()> {
        let config = &self.config;
        let snapshot = component::snapshot(client.as_ref(), &config.topics).await?;
        let starts = self.start_offsets(client, &snapshot, token).await?;

        let tracker = config
            .notifier
            .as_ref()
            .map(|notifier| Arc::new(LatestOffsetTracker::new(&snapshot.latest, &snapshot.oldest, Arc::clone(notifier))));
        let latest = Arc::new(snapshot.latest.clone());
        let shared = match config.batch_scope {
            BatchScope::Component => Some(component::new_buffer(config, None, &self.offsets, progress)),
            BatchScope::Partition => None,
        };

        let mut loops = LoopSet::new(token);
        for key in &snapshot.partitions {
            let (topic, partition) = (key.0.as_str(), key.1);
            let start = starts.get(key).copied().unwrap_or_default();

            let stream = match client.consume_partition(topic, partition, start).await {
                Ok(stream) => stream,
                Err(err) => {
                    loops.cancel();
                    // Loops already started only drain; the open failure is the result
                    let _ = loops.finish().await;
                    return Err(Error::broker(Stage::Consume, err));
                },
            };
            debug!(topic, partition, offset = start, "Partition consumer started");
            if let Some(tracker) = &tracker {
                tracker.start_at(topic, partition, start);
            }

            let buffer = match &shared {
                Some(buffer) => Arc::clone(buffer),
                None => component::new_buffer(config, None, &self.offsets, progress),
            };
            let context = LoopContext {
                component: config.name.clone(),
                buffer,
                batch_timeout: config.batch_timeout,
                latest: Arc::clone(&latest),
                tracker: tracker.clone(),
                metrics: Arc::clone(&config.metrics),
            };
            loops.spawn(PartitionLoop::new(context, stream));
        }

        info!(component = %config.name, partitions = loops.len(), "Consuming partitions");
        loops.finish().await
    }

    /// Resume from processed positions, else apply the start strategy
    async fn start_offsets(
        &self,
        client: &Arc<dyn BrokerClient>,
        snapshot: &PartitionSnapshot,
        token: &CancellationToken,
    ) -> Result<HashMap<(String, i32), i64>> {
        let mut fresh = PartitionSnapshot::default();
        let mut starts = HashMap::new();
        for key in &snapshot.partitions {
            match self.offsets.next_offset(&key.0, key.1) {
                Some(next) => {
                    starts.insert(key.clone(), next);
                },
                None => fresh.partitions.push(key.clone()),
            }
        }

        if !fresh.partitions.is_empty() {
            let strategy_starts = match self.config.start_offset {
                StartOffset::Since(duration) => {
                    component::resolve_since(client, &self.config, &fresh, duration, token).await?
                },
                StartOffset::Newest => pick(&fresh, &snapshot.latest),
                // Stored is rejected at build time for this variant
                StartOffset::Oldest | StartOffset::Stored => pick(&fresh, &snapshot.oldest),
            };
            starts.extend(strategy_starts);
        }

        Ok(starts
            .into_iter()
            .map(|(key, offset)| {
                let offset = component::clamp_to_retained(snapshot, &key, offset);
                (key, offset)
            })
            .collect())
    }
}

fn pick(fresh: &PartitionSnapshot, offsets: &HashMap<(String, i32), i64>) -> HashMap<(String, i32), i64> {
    fresh
        .partitions
        .iter()
        .filter_map(|key| offsets.get(key).map(|offset| (key.clone(), *offset)))
        .collect()
}
