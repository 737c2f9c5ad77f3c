//! Building blocks shared by the group and simple components

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::try_join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::broker::{BrokerClient, OffsetCommitter};
use super::buffer::{BatchBuffer, BufferSettings, CycleProgress, OffsetState};
use super::options::ComponentConfig;
use super::partition::LatestOffsets;
use super::seek::resolve_offsets;
use crate::error::{Error, Result, Stage};
use crate::logging::Timer;

/// Partitions of the configured topics and their watermarks at cycle start
#[derive(Debug, Default)]
pub(crate) struct PartitionSnapshot {
    pub partitions: Vec<(String, i32)>,
    pub oldest: LatestOffsets,
    pub latest: LatestOffsets,
}

impl PartitionSnapshot {
    fn partitions_of(&self, topic: &str) -> Vec<i32> {
        self.partitions
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, partition)| *partition)
            .collect()
    }
}

pub(crate) async fn connect(config: &ComponentConfig) -> Result<Arc<dyn BrokerClient>> {
    config
        .connector
        .connect()
        .await
        .map_err(|e| Error::broker(Stage::Connect, e))
}

/// Fail fast when a configured topic is missing and the broker will not create it
pub(crate) async fn check_topics(config: &ComponentConfig) -> Result<()> {
    let client = connect(config).await?;
    let result = verify_topics(client.as_ref(), &config.topics).await;
    close_client(client.as_ref(), result).await
}

async fn verify_topics(client: &dyn BrokerClient, topics: &[String]) -> Result<()> {
    let existing = client
        .list_topics()
        .await
        .map_err(|e| Error::broker(Stage::CheckTopic, e))?;
    let auto_create = client
        .auto_creates_topics()
        .await
        .map_err(|e| Error::broker(Stage::CheckTopic, e))?;

    if auto_create {
        debug!("Broker auto-creates topics, skipping existence check");
        return Ok(());
    }

    let missing: Vec<&str> = topics
        .iter()
        .filter(|topic| !existing.contains(topic))
        .map(String::as_str)
        .collect();

    if missing.is_empty() {
        info!(topics = %topics.join(","), "All topics exist");
        Ok(())
    } else {
        Err(Error::TopicCheck(format!(
            "topic(s) {} do not exist and the broker does not auto-create topics",
            missing.join(", ")
        )))
    }
}

/// Discover partitions and capture their watermarks
pub(crate) async fn snapshot(client: &dyn BrokerClient, topics: &[String]) -> Result<PartitionSnapshot> {
    let mut snapshot = PartitionSnapshot::default();

    for topic in topics {
        let partitions = client
            .partitions(topic)
            .await
            .map_err(|e| Error::broker(Stage::DiscoverPartitions, e))?;
        if partitions.is_empty() {
            return Err(Error::NoPartitions(topic.clone()));
        }

        let watermarks = try_join_all(partitions.iter().map(|&partition| async move {
            client
                .watermarks(topic, partition)
                .await
                .map(|marks| (partition, marks))
        }))
        .await
        .map_err(|e| Error::broker(Stage::DiscoverPartitions, e))?;

        for (partition, (oldest, next)) in watermarks {
            let key = (topic.clone(), partition);
            snapshot.partitions.push(key.clone());
            snapshot.oldest.insert(key.clone(), oldest);
            snapshot.latest.insert(key, next);
        }
    }

    debug!(partitions = snapshot.partitions.len(), "Captured partition watermarks");
    Ok(snapshot)
}

/// Starting offsets implied by a duration offset, for every partition of the snapshot
pub(crate) async fn resolve_since(
    client: &Arc<dyn BrokerClient>,
    config: &ComponentConfig,
    snapshot: &PartitionSnapshot,
    duration: std::time::Duration,
    token: &CancellationToken,
) -> Result<HashMap<(String, i32), i64>> {
    let extractor = config
        .time_extractor
        .clone()
        .ok_or_else(|| Error::config("duration offsets need a time extractor"))?;
    let window = chrono::Duration::from_std(duration)
        .map_err(|e| Error::config(format!("duration offset out of range: {}", e)))?;
    let since = Utc::now() - window;
    let timer = Timer::start("resolve_duration_offsets");

    let mut offsets = HashMap::new();
    for topic in &config.topics {
        let partitions = snapshot.partitions_of(topic);
        let resolved = resolve_offsets(Arc::clone(client), topic, &partitions, since, extractor.clone(), token).await?;
        offsets.extend(
            resolved
                .into_iter()
                .map(|(partition, offset)| ((topic.clone(), partition), offset)),
        );
    }

    let elapsed = timer.stop();
    info!(
        since = %since,
        partitions = offsets.len(),
        duration_ms = elapsed.as_millis() as u64,
        "Resolved duration offsets"
    );
    Ok(offsets)
}

/// Starting offset clamped into the retained range of the partition
pub(crate) fn clamp_to_retained(snapshot: &PartitionSnapshot, key: &(String, i32), offset: i64) -> i64 {
    match (snapshot.oldest.get(key), snapshot.latest.get(key)) {
        (Some(&oldest), _) if offset < oldest => {
            warn!(
                topic = %key.0,
                partition = key.1,
                offset,
                oldest,
                "Start offset aged out of retention, using oldest"
            );
            oldest
        },
        (_, Some(&next)) if offset > next => next,
        _ => offset,
    }
}

pub(crate) fn new_buffer(
    config: &ComponentConfig,
    committer: Option<Arc<dyn OffsetCommitter>>,
    offsets: &OffsetState,
    progress: &CycleProgress,
) -> Arc<BatchBuffer> {
    let settings = BufferSettings {
        component: config.name.clone(),
        batch_size: config.batch_size,
        strategy: config.strategy,
        commit_mode: config.commit_mode,
        dedup: config.dedup,
    };
    Arc::new(BatchBuffer::new(
        settings,
        Arc::clone(&config.processor),
        committer,
        offsets.clone(),
        progress.clone(),
        Arc::clone(&config.metrics),
    ))
}

/// Close the client, keeping the first error of the cycle
pub(crate) async fn close_client(client: &dyn BrokerClient, result: Result<()>) -> Result<()> {
    let closed = client.close().await;
    match (result, closed) {
        (Err(err), Err(close_err)) => {
            warn!(error = %close_err, "Failed to close broker client");
            Err(err)
        },
        (Err(err), Ok(())) => Err(err),
        (Ok(()), Err(close_err)) => Err(Error::broker(Stage::Close, close_err)),
        (Ok(()), Ok(())) => Ok(()),
    }
}

/// Attach component context to a run failure
pub(crate) fn wrap_error(config: &ComponentConfig, err: Error) -> Error {
    Error::Cycle {
        component: config.name.clone(),
        group: if config.group.is_empty() {
            "-".to_string()
        } else {
            config.group.clone()
        },
        topics: config.topics_label(),
        source: Box::new(err),
    }
}
