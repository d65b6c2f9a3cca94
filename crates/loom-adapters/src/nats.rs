//! NATS JetStream substrate
//!
//! Maps the substrate port onto JetStream:
//! - streams via idempotent get-or-create, never reconfiguring an existing
//!   stream
//! - durable pull consumers with explicit acknowledgement
//! - by-sequence reads via the raw message API, skipping gaps
//! - KV buckets with a cached store handle per bucket
//!
//! Connection policy: 10 s connect timeout; unlimited reconnects with a
//! 1 s wait at runtime; at startup an exponential backoff loop (1 s
//! doubling to 60 s, ten attempts) before giving up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, PullConsumer},
    kv,
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
    AckKind, Context as JetStreamContext,
};
use async_nats::Client;
use futures::stream::BoxStream;
use futures::StreamExt;
use loom_ports::{
    ConsumerSpec, FetchedMessage, KvWatchEvent, PublishAck, StoredMessage, StreamDiscipline,
    StreamSpec, StreamStats, Substrate, SubstrateError,
};
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Connection settings for the JetStream substrate
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URL, e.g. "nats://localhost:4222"
    pub url: String,
    pub connect_timeout: Duration,
    /// Wait between runtime reconnect attempts
    pub reconnect_wait: Duration,
    /// Startup retry budget before the process gives up
    pub startup_attempts: u32,
}

impl Default for NatsConfig {
    fn default() -> Self {
        NatsConfig {
            url: "nats://localhost:4222".to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnect_wait: Duration::from_secs(1),
            startup_attempts: 10,
        }
    }
}

/// JetStream-backed substrate
pub struct NatsSubstrate {
    client: Client,
    jetstream: JetStreamContext,
    /// Store handles are cheap but not free; cache one per bucket.
    kv_handles: RwLock<HashMap<String, kv::Store>>,
}

impl NatsSubstrate {
    /// Connect once. Runtime reconnection is handled by the client itself
    /// (unlimited attempts, fixed wait).
    pub async fn connect(config: &NatsConfig) -> Result<Self, SubstrateError> {
        info!(url = %config.url, "Connecting to NATS");

        let wait = config.reconnect_wait;
        let client = async_nats::ConnectOptions::new()
            .connection_timeout(config.connect_timeout)
            .reconnect_delay_callback(move |_attempts| wait)
            .connect(&config.url)
            .await
            .map_err(|e| SubstrateError::Connection {
                message: format!("failed to connect to {}: {e}", config.url),
            })?;

        Ok(Self::from_client(client))
    }

    /// Connect with the startup retry budget: exponential backoff from 1 s
    /// doubling to a 60 s cap, lightly jittered.
    pub async fn connect_with_retry(config: &NatsConfig) -> Result<Self, SubstrateError> {
        let mut delay = Duration::from_secs(1);
        let mut last_error = None;

        for attempt in 1..=config.startup_attempts.max(1) {
            match Self::connect(config).await {
                Ok(substrate) => return Ok(substrate),
                Err(e) => {
                    warn!(
                        attempt,
                        max_attempts = config.startup_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "NATS connect failed; retrying"
                    );
                    last_error = Some(e);
                }
            }
            if attempt < config.startup_attempts {
                let jitter = rand::thread_rng().gen_range(0..250);
                tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                delay = (delay * 2).min(Duration::from_secs(60));
            }
        }

        Err(last_error.unwrap_or(SubstrateError::Connection {
            message: "startup retry budget exhausted".to_string(),
        }))
    }

    pub fn from_client(client: Client) -> Self {
        let jetstream = jetstream::new(client.clone());
        NatsSubstrate {
            client,
            jetstream,
            kv_handles: RwLock::new(HashMap::new()),
        }
    }

    /// Flush pending publishes and drain the connection. Consumer iterators
    /// observe end-of-stream once the drain completes.
    pub async fn shutdown(&self) {
        if let Err(e) = self.client.drain().await {
            warn!(error = %e, "Error draining NATS connection");
        }
    }

    async fn get_stream(
        &self,
        name: &str,
    ) -> Result<jetstream::stream::Stream, SubstrateError> {
        self.jetstream
            .get_stream(name)
            .await
            .map_err(|_| SubstrateError::StreamNotFound {
                name: name.to_string(),
            })
    }

    async fn kv_store(&self, bucket: &str) -> Result<kv::Store, SubstrateError> {
        {
            let handles = self.kv_handles.read().await;
            if let Some(store) = handles.get(bucket) {
                return Ok(store.clone());
            }
        }
        let store = self
            .jetstream
            .get_key_value(bucket)
            .await
            .map_err(|_| SubstrateError::BucketNotFound {
                name: bucket.to_string(),
            })?;
        self.kv_handles
            .write()
            .await
            .insert(bucket.to_string(), store.clone());
        Ok(store)
    }
}

fn is_already_in_use(message: &str) -> bool {
    message.contains("already in use")
}

impl Substrate for NatsSubstrate {
    type Message = NatsFetchedMessage;

    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<(), SubstrateError> {
        if self.jetstream.get_stream(&spec.name).await.is_ok() {
            debug!(stream = %spec.name, "Stream exists");
            return Ok(());
        }

        let config = StreamConfig {
            name: spec.name.clone(),
            subjects: spec.subjects.clone(),
            retention: match spec.discipline {
                StreamDiscipline::Limits => RetentionPolicy::Limits,
                StreamDiscipline::WorkQueue => RetentionPolicy::WorkQueue,
            },
            max_messages: spec.retention.max_messages,
            max_bytes: spec.retention.max_bytes,
            max_age: spec.retention.max_age,
            storage: StorageType::File,
            num_replicas: 1,
            ..Default::default()
        };

        match self.jetstream.create_stream(config).await {
            Ok(_) => {
                info!(stream = %spec.name, "Created stream");
                Ok(())
            }
            Err(e) if is_already_in_use(&e.to_string()) => {
                debug!(stream = %spec.name, "Stream raced into existence");
                Ok(())
            }
            Err(e) => Err(SubstrateError::Connection {
                message: format!("failed to create stream {}: {e}", spec.name),
            }),
        }
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
    ) -> Result<PublishAck, SubstrateError> {
        let ack = self
            .jetstream
            .publish(subject.to_string(), payload.into())
            .await
            .map_err(|e| SubstrateError::Publish {
                message: format!("publish to {subject} failed: {e}"),
            })?
            .await
            .map_err(|e| SubstrateError::Publish {
                message: format!("publish to {subject} was not acknowledged: {e}"),
            })?;

        Ok(PublishAck {
            stream: ack.stream.clone(),
            sequence: ack.sequence,
        })
    }

    async fn read_by_range(
        &self,
        stream: &str,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<Vec<StoredMessage>, SubstrateError> {
        let handle = self.get_stream(stream).await?;
        let mut out = Vec::new();

        for sequence in from_seq..=to_seq {
            match handle.get_raw_message(sequence).await {
                Ok(raw) => out.push(StoredMessage {
                    sequence,
                    payload: raw.payload.to_vec(),
                }),
                Err(e) => {
                    let text = e.to_string();
                    // Deleted and expired sequences are expected gaps.
                    if !text.contains("no message found") {
                        debug!(stream, sequence, error = %text, "Skipping unreadable sequence");
                    }
                }
            }
        }

        Ok(out)
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamStats, SubstrateError> {
        let mut handle = self.get_stream(stream).await?;
        let info = handle.info().await.map_err(|e| SubstrateError::Connection {
            message: format!("stream info for {stream} failed: {e}"),
        })?;

        Ok(StreamStats {
            messages: info.state.messages,
            bytes: info.state.bytes,
            first_sequence: info.state.first_sequence,
            last_sequence: info.state.last_sequence,
        })
    }

    async fn stream_names(&self) -> Result<Vec<String>, SubstrateError> {
        let mut names = self.jetstream.stream_names();
        let mut out = Vec::new();
        while let Some(name) = names.next().await {
            match name {
                Ok(n) => out.push(n),
                Err(e) => {
                    return Err(SubstrateError::Connection {
                        message: format!("stream name listing failed: {e}"),
                    })
                }
            }
        }
        Ok(out)
    }

    async fn delete_message(&self, stream: &str, sequence: u64) -> Result<(), SubstrateError> {
        let handle = self.get_stream(stream).await?;
        handle
            .delete_message(sequence)
            .await
            .map(|_| ())
            .map_err(|e| SubstrateError::Connection {
                message: format!("delete {stream}#{sequence} failed: {e}"),
            })
    }

    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> Result<(), SubstrateError> {
        let stream = self.get_stream(&spec.stream).await?;
        let config = pull::Config {
            durable_name: Some(spec.name.clone()),
            ack_policy: AckPolicy::Explicit,
            ack_wait: spec.ack_wait,
            max_deliver: spec.max_deliver,
            ..Default::default()
        };
        stream
            .get_or_create_consumer(&spec.name, config)
            .await
            .map(|_| ())
            .map_err(|e| SubstrateError::Connection {
                message: format!(
                    "failed to ensure consumer {} on {}: {e}",
                    spec.name, spec.stream
                ),
            })
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<Self::Message>, SubstrateError> {
        let handle = self.get_stream(stream).await?;
        let consumer: PullConsumer =
            handle
                .get_consumer(consumer)
                .await
                .map_err(|_| SubstrateError::ConsumerNotFound {
                    stream: stream.to_string(),
                    name: consumer.to_string(),
                })?;

        let mut messages = consumer
            .fetch()
            .max_messages(max_messages)
            .expires(timeout)
            .messages()
            .await
            .map_err(|e| SubstrateError::Fetch {
                message: format!("fetch from {stream} failed: {e}"),
            })?;

        let mut out = Vec::new();
        while let Some(message) = messages.next().await {
            match message {
                Ok(inner) => {
                    let delivered = inner
                        .info()
                        .map(|i| i.delivered.max(1) as u64)
                        .unwrap_or(1);
                    out.push(NatsFetchedMessage { inner, delivered });
                }
                Err(e) => {
                    warn!(stream, error = %e, "Failed to receive fetched message");
                }
            }
        }
        Ok(out)
    }

    async fn subscribe(
        &self,
        subject: &str,
    ) -> Result<BoxStream<'static, Vec<u8>>, SubstrateError> {
        let subscriber = self
            .client
            .subscribe(subject.to_string())
            .await
            .map_err(|e| SubstrateError::Connection {
                message: format!("subscribe to {subject} failed: {e}"),
            })?;
        Ok(subscriber.map(|msg| msg.payload.to_vec()).boxed())
    }

    async fn ensure_bucket(
        &self,
        bucket: &str,
        history: usize,
        max_age: Option<Duration>,
    ) -> Result<(), SubstrateError> {
        if self.kv_store(bucket).await.is_ok() {
            return Ok(());
        }

        let store = self
            .jetstream
            .create_key_value(kv::Config {
                bucket: bucket.to_string(),
                history: history as i64,
                max_age: max_age.unwrap_or_default(),
                ..Default::default()
            })
            .await
            .map_err(|e| SubstrateError::KeyValue {
                message: format!("failed to create bucket {bucket}: {e}"),
            })?;

        self.kv_handles
            .write()
            .await
            .insert(bucket.to_string(), store);
        Ok(())
    }

    async fn kv_get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, SubstrateError> {
        let store = self.kv_store(bucket).await?;
        store
            .get(key)
            .await
            .map(|v| v.map(|b| b.to_vec()))
            .map_err(|e| SubstrateError::KeyValue {
                message: format!("get {bucket}/{key} failed: {e}"),
            })
    }

    async fn kv_put(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<(), SubstrateError> {
        let store = self.kv_store(bucket).await?;
        store
            .put(key, value.into())
            .await
            .map(|_| ())
            .map_err(|e| SubstrateError::KeyValue {
                message: format!("put {bucket}/{key} failed: {e}"),
            })
    }

    async fn kv_delete(&self, bucket: &str, key: &str) -> Result<(), SubstrateError> {
        let store = self.kv_store(bucket).await?;
        store
            .delete(key)
            .await
            .map_err(|e| SubstrateError::KeyValue {
                message: format!("delete {bucket}/{key} failed: {e}"),
            })
    }

    async fn kv_keys(&self, bucket: &str) -> Result<Vec<String>, SubstrateError> {
        let store = self.kv_store(bucket).await?;
        let mut keys = store.keys().await.map_err(|e| SubstrateError::KeyValue {
            message: format!("key listing for {bucket} failed: {e}"),
        })?;

        let mut out = Vec::new();
        while let Some(key) = keys.next().await {
            match key {
                Ok(k) => out.push(k),
                Err(e) => {
                    warn!(bucket, error = %e, "Skipping unreadable key");
                }
            }
        }
        Ok(out)
    }

    async fn kv_watch(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<BoxStream<'static, KvWatchEvent>, SubstrateError> {
        let store = self.kv_store(bucket).await?;
        let pattern = if prefix.is_empty() {
            ">".to_string()
        } else {
            format!("{prefix}>")
        };
        let watch = store
            .watch(&pattern)
            .await
            .map_err(|e| SubstrateError::KeyValue {
                message: format!("watch on {bucket} failed: {e}"),
            })?;

        Ok(watch
            .filter_map(|entry| async move {
                match entry {
                    Ok(entry) => {
                        let value = match entry.operation {
                            kv::Operation::Put => Some(entry.value.to_vec()),
                            kv::Operation::Delete | kv::Operation::Purge => None,
                        };
                        Some(KvWatchEvent {
                            key: entry.key,
                            value,
                        })
                    }
                    Err(e) => {
                        warn!(error = %e, "Dropping unreadable watch event");
                        None
                    }
                }
            })
            .boxed())
    }
}

/// A JetStream message pending disposition
pub struct NatsFetchedMessage {
    inner: jetstream::Message,
    delivered: u64,
}

impl FetchedMessage for NatsFetchedMessage {
    fn payload(&self) -> &[u8] {
        &self.inner.payload
    }

    fn delivery_count(&self) -> u64 {
        self.delivered
    }

    async fn ack(&self) -> Result<(), SubstrateError> {
        self.inner.ack().await.map_err(|e| SubstrateError::Fetch {
            message: format!("ack failed: {e}"),
        })
    }

    async fn nak(&self) -> Result<(), SubstrateError> {
        self.inner
            .ack_with(AckKind::Nak(None))
            .await
            .map_err(|e| SubstrateError::Fetch {
                message: format!("nak failed: {e}"),
            })
    }

    async fn term(&self) -> Result<(), SubstrateError> {
        self.inner
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| SubstrateError::Fetch {
                message: format!("term failed: {e}"),
            })
    }
}
