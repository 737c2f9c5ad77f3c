//! Delivery units handed to batch processors
//!
//! A [`Message`] wraps one broker record together with its correlation id,
//! its tracing span and the decoder bound to its content type. Messages are
//! grouped into an immutable [`Batch`] for each processor invocation.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::Span;
use uuid::Uuid;

use crate::kafka::RawRecord;

/// Header carrying the correlation id of a message
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-Id";

/// Header carrying the content type of the payload
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";

/// Content type assumed when a message carries none
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Errors raised while decoding a payload
#[derive(Debug, Error)]
pub enum DecodeError {
    /// No decoder exists for the declared content type
    #[error("unsupported content type '{0}'")]
    UnsupportedContentType(String),

    /// The payload does not match the expected shape
    #[error("failed to decode JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Payload decoder resolved from the content type header
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoder {
    Json,
    Unsupported(String),
}

impl Decoder {
    /// Resolve the decoder for a content type such as `application/json; charset=utf-8`
    pub fn for_content_type(content_type: &str) -> Self {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match mime.as_str() {
            "" | "application/json" | "text/json" => Decoder::Json,
            _ => Decoder::Unsupported(content_type.to_string()),
        }
    }

    fn decode<T: DeserializeOwned>(&self, payload: &[u8]) -> Result<T, DecodeError> {
        match self {
            Decoder::Json => Ok(serde_json::from_slice(payload)?),
            Decoder::Unsupported(content_type) => {
                Err(DecodeError::UnsupportedContentType(content_type.clone()))
            },
        }
    }
}

/// One consumed record as seen by a batch processor
#[derive(Debug, Clone)]
pub struct Message {
    record: RawRecord,
    correlation_id: String,
    span: Span,
    decoder: Decoder,
}

impl Message {
    /// Wrap a raw record; never performs I/O
    pub fn new(span: Span, record: RawRecord) -> Self {
        let correlation_id = correlation_id(&record.headers);
        let decoder = Decoder::for_content_type(
            header_value(&record.headers, CONTENT_TYPE_HEADER).unwrap_or(DEFAULT_CONTENT_TYPE),
        );
        span.record("correlation_id", correlation_id.as_str());

        Self {
            record,
            correlation_id,
            span,
            decoder,
        }
    }

    /// Topic the record was read from
    pub fn topic(&self) -> &str {
        &self.record.topic
    }

    /// Partition the record was read from
    pub fn partition(&self) -> i32 {
        self.record.partition
    }

    /// Offset of the record within its partition
    pub fn offset(&self) -> i64 {
        self.record.offset
    }

    /// Record key, if any
    pub fn key(&self) -> Option<&[u8]> {
        self.record.key.as_deref()
    }

    /// Raw payload bytes
    pub fn payload(&self) -> &[u8] {
        &self.record.payload
    }

    /// All record headers
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.record.headers
    }

    /// Look up a header, ignoring ASCII case
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.record.headers, name)
    }

    /// Broker timestamp of the record
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.record.timestamp
    }

    /// Correlation id, never empty
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Tracing span attached to this message
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// The underlying broker record
    pub fn record(&self) -> &RawRecord {
        &self.record
    }

    /// Decode the payload with the decoder bound to its content type
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, DecodeError> {
        self.decoder.decode(&self.record.payload)
    }
}

/// Ordered, immutable group of messages for one processor call
#[derive(Debug, Clone)]
pub struct Batch {
    messages: Arc<[Message]>,
}

impl Batch {
    /// Build a batch from messages in arrival order
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages: messages.into(),
        }
    }

    /// Messages in arrival order
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Iterate over the messages
    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Highest offset seen per (topic, partition), in first-seen order
    pub fn partition_offsets(&self) -> Vec<(String, i32, i64)> {
        let mut offsets: Vec<(String, i32, i64)> = Vec::new();
        for message in self.iter() {
            match offsets
                .iter_mut()
                .find(|(topic, partition, _)| topic == message.topic() && *partition == message.partition())
            {
                Some(entry) => entry.2 = entry.2.max(message.offset()),
                None => offsets.push((message.topic().to_string(), message.partition(), message.offset())),
            }
        }
        offsets
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

fn header_value<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Correlation id from the headers, or a fresh one when missing or blank
fn correlation_id(headers: &HashMap<String, String>) -> String {
    match header_value(headers, CORRELATION_ID_HEADER) {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => Uuid::new_v4().to_string(),
    }
}
