//! Metrics sink for consumer components
//!
//! Components never touch the global recorder directly. They report through
//! an injected [`ConsumerMetrics`] so tests can substitute [`NoopMetrics`] or a
//! recording sink. [`PrometheusMetrics`] forwards to the `metrics` facade,
//! which is a no-op until [`install_prometheus`] installed a recorder.

use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{Error, Result};

/// Counter of consumed messages, labelled by status
pub const MESSAGES_COUNTER: &str = "component_kafka_messages_total";
/// Gauge of records between the consumed offset and the startup high watermark
pub const OFFSET_LAG_GAUGE: &str = "component_kafka_offset_lag";
/// Histogram of processor call durations
pub const BATCH_DURATION_HISTOGRAM: &str = "component_kafka_batch_duration_ms";

static RECORDER_INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Lifecycle state of a message, as exported in the `status` label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageStatus {
    Received,
    Processed,
    Errored,
    Skipped,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Received => "received",
            MessageStatus::Processed => "processed",
            MessageStatus::Errored => "errored",
            MessageStatus::Skipped => "skipped",
        }
    }
}

/// Side-effecting metric calls emitted by the components
pub trait ConsumerMetrics: Send + Sync {
    /// Count one message reaching `status`
    fn message_status(&self, component: &str, topic: &str, partition: i32, status: MessageStatus);

    /// Report how far behind the startup high watermark a partition is
    fn offset_lag(&self, component: &str, topic: &str, partition: i32, lag: i64);

    /// Report one processor call
    fn batch_duration(&self, component: &str, size: usize, success: bool, duration: Duration);
}

/// Sink writing to the process-wide `metrics` recorder
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetrics;

impl ConsumerMetrics for PrometheusMetrics {
    fn message_status(&self, component: &str, topic: &str, partition: i32, status: MessageStatus) {
        metrics::counter!(
            MESSAGES_COUNTER,
            "component" => component.to_string(),
            "topic" => topic.to_string(),
            "partition" => partition.to_string(),
            "status" => status.as_str()
        )
        .increment(1);
    }

    fn offset_lag(&self, component: &str, topic: &str, partition: i32, lag: i64) {
        metrics::gauge!(
            OFFSET_LAG_GAUGE,
            "component" => component.to_string(),
            "topic" => topic.to_string(),
            "partition" => partition.to_string()
        )
        .set(lag as f64);
    }

    fn batch_duration(&self, component: &str, size: usize, success: bool, duration: Duration) {
        metrics::histogram!(
            BATCH_DURATION_HISTOGRAM,
            "component" => component.to_string(),
            "success" => success.to_string()
        )
        .record(duration.as_secs_f64() * 1000.0);
        tracing::trace!(component, size, success, "Batch duration recorded");
    }
}

/// Sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl ConsumerMetrics for NoopMetrics {
    fn message_status(&self, _: &str, _: &str, _: i32, _: MessageStatus) {}

    fn offset_lag(&self, _: &str, _: &str, _: i32, _: i64) {}

    fn batch_duration(&self, _: &str, _: usize, _: bool, _: Duration) {}
}

/// Install the Prometheus recorder and its scrape endpoint, once per process
///
/// Later calls are no-ops that return the address bound by the first one.
pub fn install_prometheus(addr: SocketAddr) -> Result<SocketAddr> {
    if let Some(bound) = RECORDER_INSTALLED.get() {
        return Ok(*bound);
    }

    const BUCKETS: &[f64] = &[
        1.0, 5.0, 10.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2000.0, 5000.0, 10000.0,
    ];

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets(BUCKETS)
        .map_err(|e| Error::config(format!("Invalid metrics buckets: {}", e)))?
        .install()
        .map_err(|e| Error::internal(format!("Failed to install metrics recorder: {}", e)))?;

    let bound = *RECORDER_INSTALLED.get_or_init(|| addr);
    tracing::info!(address = %bound, "Prometheus exporter listening");
    Ok(bound)
}
