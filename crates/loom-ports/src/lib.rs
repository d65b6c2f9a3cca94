//! Loom Substrate Port
//!
//! This crate defines the trait the coordination engine speaks to the
//! messaging substrate through. One implementation wraps NATS JetStream;
//! a second, in-process implementation backs the engine's behavioral
//! tests. The surface is deliberately small:
//! - append-only streams, bounded by count/bytes/age
//! - durable pull consumers with explicit acknowledgement and a
//!   redelivery budget
//! - key-value buckets with last-writer-wins semantics and watch
//! - publish and core (non-durable) subscribe
//!
//! Keeping this surface minimal lets the inbox, work queue, and channel
//! components share one storage story with different retention and
//! consumer disciplines.

use std::future::Future;
use std::time::Duration;

use futures::stream::BoxStream;
use loom_domain::{LoomError, RetentionSpec};

/// Substrate-level failures, mapped onto the engine error taxonomy at the
/// component boundary
#[derive(Debug, thiserror::Error)]
pub enum SubstrateError {
    #[error("stream {name} not found")]
    StreamNotFound { name: String },

    #[error("consumer {name} not found on stream {stream}")]
    ConsumerNotFound { stream: String, name: String },

    #[error("bucket {name} not found")]
    BucketNotFound { name: String },

    #[error("{resource} already in use")]
    Conflict { resource: String },

    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Publish failed: {message}")]
    Publish { message: String },

    #[error("Fetch failed: {message}")]
    Fetch { message: String },

    #[error("Key-value error: {message}")]
    KeyValue { message: String },
}

impl From<SubstrateError> for LoomError {
    fn from(e: SubstrateError) -> Self {
        match e {
            SubstrateError::StreamNotFound { name } => {
                LoomError::not_found(format!("stream {name}"))
            }
            SubstrateError::ConsumerNotFound { stream, name } => {
                LoomError::not_found(format!("consumer {name} on stream {stream}"))
            }
            SubstrateError::BucketNotFound { name } => {
                LoomError::not_found(format!("bucket {name}"))
            }
            SubstrateError::Conflict { resource } => {
                LoomError::conflict(format!("{resource} already in use"))
            }
            SubstrateError::Connection { message } => LoomError::connection(message),
            SubstrateError::Publish { message }
            | SubstrateError::Fetch { message }
            | SubstrateError::KeyValue { message } => LoomError::internal(message),
        }
    }
}

/// How acknowledgement interacts with retention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDiscipline {
    /// Messages are evicted by the retention limits only; acknowledgement
    /// just advances consumer positions. Inboxes, channels, the DLQ.
    Limits,
    /// Acknowledgement deletes the message. Capability queues.
    WorkQueue,
}

/// Everything needed to (idempotently) create a stream
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
    pub retention: RetentionSpec,
    pub discipline: StreamDiscipline,
}

impl StreamSpec {
    pub fn limits(name: impl Into<String>, subject: impl Into<String>, retention: RetentionSpec) -> Self {
        StreamSpec {
            name: name.into(),
            subjects: vec![subject.into()],
            retention,
            discipline: StreamDiscipline::Limits,
        }
    }

    pub fn work_queue(
        name: impl Into<String>,
        subject: impl Into<String>,
        retention: RetentionSpec,
    ) -> Self {
        StreamSpec {
            name: name.into(),
            subjects: vec![subject.into()],
            retention,
            discipline: StreamDiscipline::WorkQueue,
        }
    }
}

/// Everything needed to (idempotently) create a durable pull consumer
#[derive(Debug, Clone)]
pub struct ConsumerSpec {
    pub stream: String,
    pub name: String,
    /// How long a fetched message may stay unacknowledged before it is
    /// redelivered
    pub ack_wait: Duration,
    /// Total delivery budget per message; <= 0 means unlimited
    pub max_deliver: i64,
}

/// Acknowledgement for a persisted publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
}

/// Counters reported for one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStats {
    pub messages: u64,
    pub bytes: u64,
    pub first_sequence: u64,
    pub last_sequence: u64,
}

/// A message read directly by sequence
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub sequence: u64,
    pub payload: Vec<u8>,
}

/// One key-value change observed through a watch
#[derive(Debug, Clone)]
pub struct KvWatchEvent {
    pub key: String,
    /// `None` for a delete
    pub value: Option<Vec<u8>>,
}

/// A message handed out by a durable consumer, pending disposition
pub trait FetchedMessage: Send + Sync {
    fn payload(&self) -> &[u8];

    /// How many times this message has been delivered, including this one.
    fn delivery_count(&self) -> u64;

    /// Successful processing; under work-queue discipline this deletes the
    /// message.
    fn ack(&self) -> impl Future<Output = Result<(), SubstrateError>> + Send;

    /// Negative acknowledgement: redeliver as soon as possible.
    fn nak(&self) -> impl Future<Output = Result<(), SubstrateError>> + Send;

    /// Poison-pill disposition: never redeliver.
    fn term(&self) -> impl Future<Output = Result<(), SubstrateError>> + Send;
}

/// The substrate the engine is generic over.
///
/// Every method may suspend; no caller holds a lock across these calls.
pub trait Substrate: Send + Sync + 'static {
    type Message: FetchedMessage;

    /// Idempotent stream creation. Success if the stream already exists
    /// with any configuration; "already in use" from the substrate is
    /// success too.
    fn ensure_stream(
        &self,
        spec: &StreamSpec,
    ) -> impl Future<Output = Result<(), SubstrateError>> + Send;

    fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<PublishAck, SubstrateError>> + Send;

    /// Inclusive range read. Missing sequences (deleted or expired) are
    /// skipped silently; other per-sequence failures are logged and
    /// skipped.
    fn read_by_range(
        &self,
        stream: &str,
        from_seq: u64,
        to_seq: u64,
    ) -> impl Future<Output = Result<Vec<StoredMessage>, SubstrateError>> + Send;

    fn stream_info(
        &self,
        stream: &str,
    ) -> impl Future<Output = Result<StreamStats, SubstrateError>> + Send;

    fn stream_names(&self) -> impl Future<Output = Result<Vec<String>, SubstrateError>> + Send;

    fn delete_message(
        &self,
        stream: &str,
        sequence: u64,
    ) -> impl Future<Output = Result<(), SubstrateError>> + Send;

    /// Idempotent durable consumer creation with explicit acknowledgement.
    fn ensure_consumer(
        &self,
        spec: &ConsumerSpec,
    ) -> impl Future<Output = Result<(), SubstrateError>> + Send;

    /// Bounded batch fetch. Returns early with fewer (possibly zero)
    /// messages once `timeout` elapses; the consumer retains its position.
    fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        max_messages: usize,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<Self::Message>, SubstrateError>> + Send;

    /// Core (non-durable) subscription; the stream ends when the
    /// connection drains.
    fn subscribe(
        &self,
        subject: &str,
    ) -> impl Future<Output = Result<BoxStream<'static, Vec<u8>>, SubstrateError>> + Send;

    /// Idempotent bucket creation. `history` is revisions retained per key.
    fn ensure_bucket(
        &self,
        bucket: &str,
        history: usize,
        max_age: Option<Duration>,
    ) -> impl Future<Output = Result<(), SubstrateError>> + Send;

    fn kv_get(
        &self,
        bucket: &str,
        key: &str,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, SubstrateError>> + Send;

    fn kv_put(
        &self,
        bucket: &str,
        key: &str,
        value: Vec<u8>,
    ) -> impl Future<Output = Result<(), SubstrateError>> + Send;

    fn kv_delete(
        &self,
        bucket: &str,
        key: &str,
    ) -> impl Future<Output = Result<(), SubstrateError>> + Send;

    fn kv_keys(
        &self,
        bucket: &str,
    ) -> impl Future<Output = Result<Vec<String>, SubstrateError>> + Send;

    /// Watch keys under `prefix` (empty prefix watches the whole bucket).
    fn kv_watch(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> impl Future<Output = Result<BoxStream<'static, KvWatchEvent>, SubstrateError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_substrate_error_maps_to_engine_kinds() {
        let e: LoomError = SubstrateError::StreamNotFound {
            name: "INBOX_X".to_string(),
        }
        .into();
        assert!(matches!(e, LoomError::NotFound { .. }));

        let e: LoomError = SubstrateError::Conflict {
            resource: "stream WORKQUEUE_RUST".to_string(),
        }
        .into();
        assert!(matches!(e, LoomError::Conflict { .. }));

        let e: LoomError = SubstrateError::Connection {
            message: "refused".to_string(),
        }
        .into();
        assert!(matches!(e, LoomError::Connection { .. }));
    }

    #[test]
    fn test_stream_spec_constructors() {
        let s = StreamSpec::work_queue("WORKQUEUE_RUST", "global.work.rust", RetentionSpec::default());
        assert_eq!(s.discipline, StreamDiscipline::WorkQueue);
        assert_eq!(s.subjects, vec!["global.work.rust".to_string()]);

        let s = StreamSpec::limits("INBOX_A", "global.agent.a", RetentionSpec::default());
        assert_eq!(s.discipline, StreamDiscipline::Limits);
    }
}
