//! In-process substrate
//!
//! A faithful, hermetic implementation of the substrate port used by the
//! engine's behavioral tests and by local development without a NATS
//! server. It reproduces the semantics the engine depends on:
//! - per-consumer delivery counts, ack-wait redelivery, delivery budgets
//! - work-queue discipline (acknowledgement deletes) vs limits discipline
//! - retention eviction by count and bytes
//! - subject wildcards (`*`, `>`) for core subscriptions
//! - KV buckets with watch fan-out

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::stream::BoxStream;
use futures::StreamExt;
use loom_ports::{
    ConsumerSpec, FetchedMessage, KvWatchEvent, PublishAck, StoredMessage, StreamDiscipline,
    StreamSpec, StreamStats, Substrate, SubstrateError,
};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

const FETCH_POLL: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct MemorySubstrate {
    inner: Arc<Mutex<State>>,
}

impl Default for MemorySubstrate {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct State {
    streams: HashMap<String, MemStream>,
    buckets: HashMap<String, BTreeMap<String, Vec<u8>>>,
    subscribers: Vec<(String, mpsc::UnboundedSender<Vec<u8>>)>,
    kv_watchers: Vec<(String, String, mpsc::UnboundedSender<KvWatchEvent>)>,
}

struct MemStream {
    subjects: Vec<String>,
    max_messages: i64,
    max_bytes: i64,
    discipline: StreamDiscipline,
    next_seq: u64,
    messages: BTreeMap<u64, Vec<u8>>,
    consumers: HashMap<String, MemConsumer>,
}

struct MemConsumer {
    ack_wait: Duration,
    max_deliver: i64,
    delivered: HashMap<u64, u64>,
    inflight: HashMap<u64, Instant>,
    acked: HashSet<u64>,
    terminated: HashSet<u64>,
}

fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), _) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

impl MemorySubstrate {
    pub fn new() -> Self {
        MemorySubstrate {
            inner: Arc::new(Mutex::new(State::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        // A panic while holding this lock is a test bug; propagate it.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn try_fetch(
        &self,
        stream: &str,
        consumer: &str,
        max_messages: usize,
    ) -> Result<Vec<MemoryFetchedMessage>, SubstrateError> {
        let mut state = self.lock();
        let mem = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| SubstrateError::StreamNotFound {
                name: stream.to_string(),
            })?;

        let sequences: Vec<u64> = mem.messages.keys().copied().collect();
        let cons = mem
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| SubstrateError::ConsumerNotFound {
                stream: stream.to_string(),
                name: consumer.to_string(),
            })?;

        let now = Instant::now();
        let mut picked = Vec::new();
        for seq in sequences {
            if picked.len() >= max_messages {
                break;
            }
            if cons.acked.contains(&seq) || cons.terminated.contains(&seq) {
                continue;
            }
            if let Some(deadline) = cons.inflight.get(&seq) {
                if *deadline > now {
                    continue;
                }
            }
            let delivered = cons.delivered.get(&seq).copied().unwrap_or(0);
            if cons.max_deliver > 0 && delivered >= cons.max_deliver as u64 {
                continue;
            }
            cons.delivered.insert(seq, delivered + 1);
            cons.inflight.insert(seq, now + cons.ack_wait);
            picked.push((seq, delivered + 1));
        }

        let out = picked
            .into_iter()
            .map(|(seq, delivered)| MemoryFetchedMessage {
                substrate: self.clone(),
                stream: stream.to_string(),
                consumer: consumer.to_string(),
                sequence: seq,
                payload: mem.messages.get(&seq).cloned().unwrap_or_default(),
                delivered,
            })
            .collect();
        Ok(out)
    }

    fn dispose(&self, message: &MemoryFetchedMessage, disposition: Disposition) {
        let mut state = self.lock();
        let Some(mem) = state.streams.get_mut(&message.stream) else {
            return;
        };
        match disposition {
            Disposition::Ack => {
                if mem.discipline == StreamDiscipline::WorkQueue {
                    mem.messages.remove(&message.sequence);
                    for cons in mem.consumers.values_mut() {
                        cons.delivered.remove(&message.sequence);
                        cons.inflight.remove(&message.sequence);
                        cons.acked.remove(&message.sequence);
                        cons.terminated.remove(&message.sequence);
                    }
                } else if let Some(cons) = mem.consumers.get_mut(&message.consumer) {
                    cons.acked.insert(message.sequence);
                    cons.inflight.remove(&message.sequence);
                }
            }
            Disposition::Nak => {
                if let Some(cons) = mem.consumers.get_mut(&message.consumer) {
                    cons.inflight.remove(&message.sequence);
                }
            }
            Disposition::Term => {
                if let Some(cons) = mem.consumers.get_mut(&message.consumer) {
                    cons.terminated.insert(message.sequence);
                    cons.inflight.remove(&message.sequence);
                }
            }
        }
    }
}

enum Disposition {
    Ack,
    Nak,
    Term,
}

impl Substrate for MemorySubstrate {
    type Message = MemoryFetchedMessage;

    async fn ensure_stream(&self, spec: &StreamSpec) -> Result<(), SubstrateError> {
        let mut state = self.lock();
        state
            .streams
            .entry(spec.name.clone())
            .or_insert_with(|| MemStream {
                subjects: spec.subjects.clone(),
                max_messages: spec.retention.max_messages,
                max_bytes: spec.retention.max_bytes,
                discipline: spec.discipline,
                next_seq: 1,
                messages: BTreeMap::new(),
                consumers: HashMap::new(),
            });
        Ok(())
    }

    async fn publish(
        &self,
        subject: &str,
        payload: Vec<u8>,
    ) -> Result<PublishAck, SubstrateError> {
        let mut state = self.lock();

        state.subscribers.retain(|(pattern, sender)| {
            if subject_matches(pattern, subject) {
                sender.send(payload.clone()).is_ok()
            } else {
                !sender.is_closed()
            }
        });

        let mut ack = None;
        for (name, mem) in state.streams.iter_mut() {
            if !mem.subjects.iter().any(|p| subject_matches(p, subject)) {
                continue;
            }
            let seq = mem.next_seq;
            mem.next_seq += 1;
            mem.messages.insert(seq, payload.clone());

            if mem.max_messages > 0 {
                while mem.messages.len() as i64 > mem.max_messages {
                    mem.messages.pop_first();
                }
            }
            if mem.max_bytes > 0 {
                while mem.messages.values().map(|m| m.len() as i64).sum::<i64>() > mem.max_bytes
                    && mem.messages.len() > 1
                {
                    mem.messages.pop_first();
                }
            }

            if ack.is_none() {
                ack = Some(PublishAck {
                    stream: name.clone(),
                    sequence: seq,
                });
            }
        }

        ack.ok_or_else(|| SubstrateError::Publish {
            message: format!("no stream is bound to subject {subject}"),
        })
    }

    async fn read_by_range(
        &self,
        stream: &str,
        from_seq: u64,
        to_seq: u64,
    ) -> Result<Vec<StoredMessage>, SubstrateError> {
        let state = self.lock();
        let mem = state
            .streams
            .get(stream)
            .ok_or_else(|| SubstrateError::StreamNotFound {
                name: stream.to_string(),
            })?;
        Ok(mem
            .messages
            .range(from_seq..=to_seq)
            .map(|(seq, payload)| StoredMessage {
                sequence: *seq,
                payload: payload.clone(),
            })
            .collect())
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamStats, SubstrateError> {
        let state = self.lock();
        let mem = state
            .streams
            .get(stream)
            .ok_or_else(|| SubstrateError::StreamNotFound {
                name: stream.to_string(),
            })?;

        let stats = if mem.messages.is_empty() {
            if mem.next_seq == 1 {
                StreamStats::default()
            } else {
                StreamStats {
                    messages: 0,
                    bytes: 0,
                    first_sequence: mem.next_seq,
                    last_sequence: mem.next_seq - 1,
                }
            }
        } else {
            StreamStats {
                messages: mem.messages.len() as u64,
                bytes: mem.messages.values().map(|m| m.len() as u64).sum(),
                first_sequence: *mem.messages.keys().next().unwrap_or(&0),
                last_sequence: mem.next_seq - 1,
            }
        };
        Ok(stats)
    }

    async fn stream_names(&self) -> Result<Vec<String>, SubstrateError> {
        let state = self.lock();
        let mut names: Vec<String> = state.streams.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn delete_message(&self, stream: &str, sequence: u64) -> Result<(), SubstrateError> {
        let mut state = self.lock();
        let mem = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| SubstrateError::StreamNotFound {
                name: stream.to_string(),
            })?;
        mem.messages.remove(&sequence);
        Ok(())
    }

    async fn ensure_consumer(&self, spec: &ConsumerSpec) -> Result<(), SubstrateError> {
        let mut state = self.lock();
        let mem = state
            .streams
            .get_mut(&spec.stream)
            .ok_or_else(|| SubstrateError::StreamNotFound {
                name: spec.stream.clone(),
            })?;
        mem.consumers
            .entry(spec.name.clone())
            .or_insert_with(|| MemConsumer {
                ack_wait: spec.ack_wait,
                max_deliver: spec.max_deliver,
                delivered: HashMap::new(),
                inflight: HashMap::new(),
                acked: HashSet::new(),
                terminated: HashSet::new(),
            });
        Ok(())
    }

    async fn fetch(
        &self,
        stream: &str,
        consumer: &str,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<Self::Message>, SubstrateError> {
        let deadline = Instant::now() + timeout;
        loop {
            let batch = self.try_fetch(stream, consumer, max_messages)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(FETCH_POLL.min(deadline - now)).await;
        }
    }

    async fn subscribe(
        &self,
        subject: &str,
    ) -> Result<BoxStream<'static, Vec<u8>>, SubstrateError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push((subject.to_string(), tx));
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn ensure_bucket(
        &self,
        bucket: &str,
        _history: usize,
        _max_age: Option<Duration>,
    ) -> Result<(), SubstrateError> {
        self.lock().buckets.entry(bucket.to_string()).or_default();
        Ok(())
    }

    async fn kv_get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, SubstrateError> {
        let state = self.lock();
        let values = state
            .buckets
            .get(bucket)
            .ok_or_else(|| SubstrateError::BucketNotFound {
                name: bucket.to_string(),
            })?;
        Ok(values.get(key).cloned())
    }

    async fn kv_put(&self, bucket: &str, key: &str, value: Vec<u8>) -> Result<(), SubstrateError> {
        let mut state = self.lock();
        let values = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| SubstrateError::BucketNotFound {
                name: bucket.to_string(),
            })?;
        values.insert(key.to_string(), value.clone());

        let bucket = bucket.to_string();
        let key = key.to_string();
        state.kv_watchers.retain(|(b, prefix, sender)| {
            if *b == bucket && key.starts_with(prefix.as_str()) {
                sender
                    .send(KvWatchEvent {
                        key: key.clone(),
                        value: Some(value.clone()),
                    })
                    .is_ok()
            } else {
                !sender.is_closed()
            }
        });
        Ok(())
    }

    async fn kv_delete(&self, bucket: &str, key: &str) -> Result<(), SubstrateError> {
        let mut state = self.lock();
        let values = state
            .buckets
            .get_mut(bucket)
            .ok_or_else(|| SubstrateError::BucketNotFound {
                name: bucket.to_string(),
            })?;
        values.remove(key);

        let bucket = bucket.to_string();
        let key = key.to_string();
        state.kv_watchers.retain(|(b, prefix, sender)| {
            if *b == bucket && key.starts_with(prefix.as_str()) {
                sender
                    .send(KvWatchEvent {
                        key: key.clone(),
                        value: None,
                    })
                    .is_ok()
            } else {
                !sender.is_closed()
            }
        });
        Ok(())
    }

    async fn kv_keys(&self, bucket: &str) -> Result<Vec<String>, SubstrateError> {
        let state = self.lock();
        let values = state
            .buckets
            .get(bucket)
            .ok_or_else(|| SubstrateError::BucketNotFound {
                name: bucket.to_string(),
            })?;
        Ok(values.keys().cloned().collect())
    }

    async fn kv_watch(
        &self,
        bucket: &str,
        prefix: &str,
    ) -> Result<BoxStream<'static, KvWatchEvent>, SubstrateError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .kv_watchers
            .push((bucket.to_string(), prefix.to_string(), tx));
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

/// A message fetched from the in-process substrate, pending disposition
pub struct MemoryFetchedMessage {
    substrate: MemorySubstrate,
    stream: String,
    consumer: String,
    sequence: u64,
    payload: Vec<u8>,
    delivered: u64,
}

impl FetchedMessage for MemoryFetchedMessage {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn delivery_count(&self) -> u64 {
        self.delivered
    }

    async fn ack(&self) -> Result<(), SubstrateError> {
        self.substrate.dispose(self, Disposition::Ack);
        Ok(())
    }

    async fn nak(&self) -> Result<(), SubstrateError> {
        self.substrate.dispose(self, Disposition::Nak);
        Ok(())
    }

    async fn term(&self) -> Result<(), SubstrateError> {
        self.substrate.dispose(self, Disposition::Term);
        Ok(())
    }
}
