//! Time based offset resolution
//!
//! Brokers only seek by offset, so "start from time T" is translated into a
//! per-partition offset with a lower-bound binary search over the retained
//! range, assuming timestamps never decrease within a partition.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::broker::{BrokerClient, RawRecord};
use crate::error::{Error, Result, Stage};

/// Extracts the event time of a record for time based seeking
pub type TimeExtractor = Arc<dyn Fn(&RawRecord) -> anyhow::Result<DateTime<Utc>> + Send + Sync>;

/// Extractor reading the broker timestamp of a record
pub fn broker_timestamp() -> TimeExtractor {
    Arc::new(|record: &RawRecord| {
        record
            .timestamp
            .ok_or_else(|| anyhow::anyhow!("record at offset {} has no timestamp", record.offset))
    })
}

/// Resolve, for every partition, the first offset whose time is at or after `since`
///
/// Partitions are searched concurrently. The first hard error aborts the
/// whole resolution; cancellation yields [`Error::Cancelled`].
pub async fn resolve_offsets(
    client: Arc<dyn BrokerClient>,
    topic: &str,
    partitions: &[i32],
    since: DateTime<Utc>,
    extractor: TimeExtractor,
    token: &CancellationToken,
) -> Result<HashMap<i32, i64>> {
    let (tx, mut rx) = mpsc::channel(partitions.len().max(1));
    let search_token = token.child_token();

    for &partition in partitions {
        let tx = tx.clone();
        let client = Arc::clone(&client);
        let extractor = Arc::clone(&extractor);
        let topic = topic.to_string();
        let token = search_token.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::Cancelled),
                result = search_partition(client.as_ref(), &topic, partition, since, &extractor) => result,
            };
            // Receiver gone means the resolution already failed
            let _ = tx.send((partition, result)).await;
        });
    }
    drop(tx);

    let mut resolved = HashMap::with_capacity(partitions.len());
    while resolved.len() < partitions.len() {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => {
                search_token.cancel();
                return Err(Error::Cancelled);
            },
            received = rx.recv() => received,
        };

        match received {
            Some((partition, Ok(offset))) => {
                debug!(topic, partition, offset, since = %since, "Resolved start offset");
                resolved.insert(partition, offset);
            },
            Some((_, Err(err))) => {
                search_token.cancel();
                return Err(err);
            },
            None => {
                return Err(Error::internal(format!(
                    "offset resolution for '{}' ended with {} of {} partitions",
                    topic,
                    resolved.len(),
                    partitions.len()
                )))
            },
        }
    }

    Ok(resolved)
}

/// Lower-bound search of one partition
async fn search_partition(
    client: &dyn BrokerClient,
    topic: &str,
    partition: i32,
    since: DateTime<Utc>,
    extractor: &TimeExtractor,
) -> Result<i64> {
    let (oldest, next) = client
        .watermarks(topic, partition)
        .await
        .map_err(|e| Error::broker(Stage::ResolveOffsets, e))?;

    let mut left = oldest;
    let mut right = next - 1;

    while left <= right {
        let mid = left + (right - left) / 2;

        let record = match client.fetch_record(topic, partition, mid).await {
            Ok(record) => record,
            Err(err) if err.is_offset_out_of_range() => {
                // Aged out of retention, so older than anything we want
                left = mid + 1;
                continue;
            },
            Err(err) => {
                return Err(Error::OffsetResolution {
                    topic: topic.to_string(),
                    partition,
                    reason: format!("fetching offset {}: {}", mid, err),
                })
            },
        };

        let time = match extractor(&record) {
            Ok(time) => time,
            Err(err) => {
                warn!(
                    topic,
                    partition,
                    offset = mid,
                    error = %err,
                    "Could not read record time, narrowing search"
                );
                left += 1;
                continue;
            },
        };

        if time == since {
            return Ok(mid);
        } else if time < since {
            left = mid + 1;
        } else {
            right = mid - 1;
        }
    }

    Ok(left)
}
