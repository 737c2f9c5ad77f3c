//! Consumer-group batch component
//!
//! Each cycle connects a fresh client, resolves optional start overrides,
//! joins the group and runs one partition loop per claim. A rebalance ends
//! the generation: loops drain, and the cycle rejoins with the same client.

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::broker::{BrokerClient, GroupSession, StartOffset};
use super::buffer::{BatchBuffer, CycleProgress, OffsetState};
use super::component::{self, PartitionSnapshot};
use super::options::{BatchScope, ComponentConfig};
use super::partition::{LatestOffsetTracker, LatestOffsets, LoopContext, LoopSet, PartitionLoop};
use super::retry::{run_with_retries, CycleOutcome, RetryPolicy};
use crate::error::{Error, Result, Stage};

/// Consumes topics as a member of a consumer group, in batches
#[derive(Debug)]
pub struct GroupComponent {
    config: Arc<ComponentConfig>,
    offsets: OffsetState,
}

impl GroupComponent {
    pub(crate) fn new(config: ComponentConfig) -> Self {
        Self {
            config: Arc::new(config),
            offsets: OffsetState::new(),
        }
    }

    pub fn config(&self) -> &ComponentConfig {
        &self.config
    }

    /// Positions processed by this component so far
    pub fn offsets(&self) -> &OffsetState {
        &self.offsets
    }

    /// Consume until `token` is cancelled or the retry budget is spent
    ///
    /// Cancellation drains every partition and returns `Ok(())`.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let config = &self.config;
        info!(
            component = %config.name,
            group = %config.group,
            topics = %config.topics_label(),
            batch_size = config.batch_size,
            retries = config.retries,
            strategy = %config.strategy,
            "Starting group component"
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
        let result = run_with_retries(policy, &token, |cycle| self.cycle(cycle, token.child_token())).await;

        match result {
            Ok(()) => {
                info!(component = %config.name, "Group component stopped");
                Ok(())
            },
            Err(err) => {
                error!(component = %config.name, error = %err, "Group component failed");
                Err(component::wrap_error(config, err))
            },
        }
    }

    async fn cycle(&self, number: u64, token: CancellationToken) -> CycleOutcome {
        debug!(component = %self.config.name, cycle = number, "Starting consumption cycle");
        let progress = CycleProgress::new();

        let result = match component::connect(&self.config).await {
            Ok(client) => {
                let consumed = self.consume(&client, &progress, &token).await;
                component::close_client(client.as_ref(), consumed).await
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
        let overrides = self.start_overrides(client, &snapshot, token).await?;

        let tracker = config
            .notifier
            .as_ref()
            .map(|notifier| Arc::new(LatestOffsetTracker::new(&snapshot.latest, &snapshot.oldest, Arc::clone(notifier))));
        let latest = Arc::new(snapshot.latest);

        loop {
            // Overrides only apply until a partition has processed positions
            let pending: HashMap<(String, i32), i64> = overrides
                .iter()
                .filter(|(key, _)| self.offsets.next_offset(&key.0, key.1).is_none())
                .map(|(key, offset)| (key.clone(), *offset))
                .collect();

            let mut session = client
                .join_group(&config.group, &config.topics, &pending, config.commit_mode)
                .await
                .map_err(|e| Error::broker(Stage::JoinGroup, e))?;
            info!(component = %config.name, group = %config.group, "Joined consumer group");

            let generation = self
                .run_generation(session.as_mut(), &latest, &tracker, progress, token)
                .await;
            let closed = session.close().await;

            generation?;
            closed.map_err(|e| Error::broker(Stage::Close, e))?;

            if token.is_cancelled() {
                return Ok(());
            }
            info!(component = %config.name, group = %config.group, "Group generation ended, rejoining");
        }
    }

    async fn run_generation(
        &self,
        session: &mut dyn GroupSession,
        latest: &Arc<LatestOffsets>,
        tracker: &Option<Arc<LatestOffsetTracker>>,
        progress: &CycleProgress,
        token: &CancellationToken,
    ) -> Result<()> {
        let committer = session.committer();
        let shared: Option<Arc<BatchBuffer>> = match self.config.batch_scope {
            BatchScope::Component => Some(component::new_buffer(
                &self.config,
                Some(Arc::clone(&committer)),
                &self.offsets,
                progress,
            )),
            BatchScope::Partition => None,
        };

        let mut loops = LoopSet::new(token);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                Some(()) = loops.join_next(), if !loops.is_empty() => {
                    if loops.has_failed() {
                        break;
                    }
                },
                claim = session.next_claim() => match claim {
                    Some(claim) => {
                        debug!(
                            topic = %claim.stream.topic,
                            partition = claim.stream.partition,
                            start = ?claim.start,
                            "Partition claimed"
                        );
                        if let (Some(tracker), Some(start)) = (tracker, claim.start) {
                            tracker.start_at(&claim.stream.topic, claim.stream.partition, start);
                        }
                        let buffer = match &shared {
                            Some(buffer) => Arc::clone(buffer),
                            None => component::new_buffer(
                                &self.config,
                                Some(Arc::clone(&committer)),
                                &self.offsets,
                                progress,
                            ),
                        };
                        let context = LoopContext {
                            component: self.config.name.clone(),
                            buffer,
                            batch_timeout: self.config.batch_timeout,
                            latest: Arc::clone(latest),
                            tracker: tracker.clone(),
                            metrics: Arc::clone(&self.config.metrics),
                        };
                        loops.spawn(PartitionLoop::new(context, claim.stream));
                    },
                    None => break,
                },
            }
        }

        loops.cancel();
        loops.finish().await
    }

    async fn start_overrides(
        &self,
        client: &Arc<dyn BrokerClient>,
        snapshot: &PartitionSnapshot,
        token: &CancellationToken,
    ) -> Result<HashMap<(String, i32), i64>> {
        let overrides = match self.config.start_offset {
            StartOffset::Stored => HashMap::new(),
            StartOffset::Oldest => snapshot.oldest.clone(),
            StartOffset::Newest => snapshot.latest.clone(),
            StartOffset::Since(duration) => {
                component::resolve_since(client, &self.config, snapshot, duration, token).await?
            },
        };
        Ok(overrides)
    }
}
