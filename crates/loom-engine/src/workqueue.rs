//! Capability-routed work queue
//!
//! One work-queue-discipline stream per capability, one shared durable
//! consumer (`workers`) per stream: claimants compete, first claim wins,
//! acknowledgement removes the item. The consumer's delivery budget is
//! one above the work-item budget so the final delivery is the engine's
//! chance to observe exhaustion and dead-letter the item instead of
//! handing it out again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use loom_domain::{
    capability_stream_name, capability_subject, validate, DlqItem, LoomError, WorkFilter,
    WorkItem, WorkOffer, WORKQUEUE_STREAM_PREFIX,
};
use loom_ports::{
    ConsumerSpec, FetchedMessage, StreamSpec, StreamStats, Substrate, SubstrateError,
};
use tracing::{debug, info, warn};

use crate::config::WorkQueueConfig;
use crate::dlq::DeadLetterQueue;
use crate::registry::Registry;

pub const WORK_CONSUMER: &str = "workers";

pub const LIST_LIMIT_MAX: usize = 100;
pub const LIST_LIMIT_DEFAULT: usize = 50;

/// Widest by-sequence window scanned per listing
const SCAN_WINDOW: u64 = 1000;

pub struct WorkQueue<S: Substrate> {
    substrate: Arc<S>,
    registry: Registry<S>,
    dlq: DeadLetterQueue<S>,
    config: WorkQueueConfig,
}

impl<S: Substrate> Clone for WorkQueue<S> {
    fn clone(&self) -> Self {
        WorkQueue {
            substrate: self.substrate.clone(),
            registry: self.registry.clone(),
            dlq: self.dlq.clone(),
            config: self.config.clone(),
        }
    }
}

/// Result of a claim attempt
#[derive(Debug, Clone)]
pub enum ClaimOutcome {
    Claimed(WorkItem),
    /// Timeout or empty queue; not an error.
    Empty,
}

/// Non-destructive queue listing
#[derive(Debug, Clone, Default)]
pub struct WorkListing {
    pub items: Vec<WorkItem>,
    /// Matching items within the scan window
    pub total: usize,
    pub truncated: bool,
}

/// Metrics for one capability stream
#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub stream: String,
    pub stats: StreamStats,
}

impl<S: Substrate> WorkQueue<S> {
    pub fn new(
        substrate: Arc<S>,
        registry: Registry<S>,
        dlq: DeadLetterQueue<S>,
        config: WorkQueueConfig,
    ) -> Self {
        WorkQueue {
            substrate,
            registry,
            dlq,
            config,
        }
    }

    async fn ensure_queue(&self, capability: &str) -> Result<String, LoomError> {
        let stream = capability_stream_name(capability);
        self.substrate
            .ensure_stream(&StreamSpec::work_queue(
                stream.clone(),
                capability_subject(capability),
                self.config.retention,
            ))
            .await?;
        self.substrate
            .ensure_consumer(&ConsumerSpec {
                stream: stream.clone(),
                name: WORK_CONSUMER.to_string(),
                ack_wait: self.config.ack_timeout,
                max_deliver: self.config.max_delivery_attempts as i64 + 1,
            })
            .await?;
        Ok(stream)
    }

    /// Offer work onto the capability queue. Requires a registered sender.
    pub async fn broadcast(
        &self,
        sender_guid: &str,
        offer: WorkOffer,
    ) -> Result<WorkItem, LoomError> {
        let sender = self.registry.require(sender_guid).await.map_err(|_| {
            LoomError::validation("sender is not registered; call registry_register first")
        })?;

        let item = WorkItem::from_offer(offer, &sender.guid)?;
        self.ensure_queue(&item.capability).await?;
        let ack = self
            .substrate
            .publish(
                &capability_subject(&item.capability),
                serde_json::to_vec(&item)?,
            )
            .await?;

        info!(
            task_id = %item.task_id,
            capability = %item.capability,
            priority = item.priority,
            stream = %ack.stream,
            sequence = ack.sequence,
            "Broadcast work offer"
        );
        Ok(item)
    }

    /// Destructively claim at most one item. First claim wins; on timeout
    /// or empty queue returns `Empty`.
    pub async fn claim(
        &self,
        claimer_guid: &str,
        capability: &str,
        timeout: Option<Duration>,
    ) -> Result<ClaimOutcome, LoomError> {
        let claimer = self.registry.require(claimer_guid).await.map_err(|_| {
            LoomError::validation("claimer is not registered; call registry_register first")
        })?;
        if !claimer.has_capability(capability) {
            return Err(LoomError::validation(format!(
                "you do not advertise capability {capability:?}; update your registration first"
            )));
        }

        let timeout = timeout
            .unwrap_or(self.config.claim_default_timeout)
            .min(self.config.claim_max_timeout);
        let stream = self.ensure_queue(capability).await?;
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ClaimOutcome::Empty);
            }

            let batch = self
                .substrate
                .fetch(&stream, WORK_CONSUMER, 1, remaining)
                .await?;
            let Some(message) = batch.into_iter().next() else {
                return Ok(ClaimOutcome::Empty);
            };

            let mut item = match WorkItem::from_slice(message.payload()) {
                Ok(item) => item,
                Err(e) => {
                    warn!(stream = %stream, error = %e, "Terminating unreadable work item");
                    message.term().await?;
                    continue;
                }
            };

            let delivered = message.delivery_count();
            if delivered > self.config.max_delivery_attempts as u64 {
                // Budget exhausted: this delivery is the dead-letter sweep.
                self.dead_letter(&message, item, "delivery budget exhausted", Vec::new())
                    .await?;
                continue;
            }

            item.attempts += delivered as u32;
            message.ack().await?;
            debug!(
                id = %item.id,
                capability = %capability,
                attempts = item.attempts,
                "Claimed work item"
            );
            return Ok(ClaimOutcome::Claimed(item));
        }
    }

    /// Explicitly fail an already-claimed item into the DLQ.
    pub async fn fail_claimed(
        &self,
        item: WorkItem,
        reason: &str,
        errors: Vec<String>,
    ) -> Result<DlqItem, LoomError> {
        let attempts = item.attempts;
        let record = DlqItem::from_work_item(item, reason, attempts, errors);
        self.dlq.publish(&record).await?;
        info!(id = %record.id, reason = %record.reason, "Dead-lettered claimed item");
        Ok(record)
    }

    async fn dead_letter(
        &self,
        message: &S::Message,
        item: WorkItem,
        reason: &str,
        errors: Vec<String>,
    ) -> Result<(), LoomError> {
        let attempts = item
            .attempts
            .saturating_add(self.config.max_delivery_attempts);
        let record = DlqItem::from_work_item(item, reason, attempts, errors);

        // Publish first; acknowledge (and thereby drop the original) only
        // once the record is durable. A failed publish leaves the item
        // pending for the next failure path.
        match self.dlq.publish(&record).await {
            Ok(()) => {
                message.ack().await?;
                info!(id = %record.id, reason = %record.reason, "Dead-lettered work item");
                Ok(())
            }
            Err(e) => {
                warn!(id = %record.id, error = %e, "Dead-letter publish failed; leaving item pending");
                message.nak().await?;
                Err(e)
            }
        }
    }

    /// Non-destructive by-sequence listing with range predicates.
    pub async fn list(
        &self,
        capability: &str,
        filter: &WorkFilter,
        limit: usize,
    ) -> Result<WorkListing, LoomError> {
        let limit = limit.clamp(1, LIST_LIMIT_MAX);
        let stream = capability_stream_name(capability);

        let stats = match self.substrate.stream_info(&stream).await {
            Ok(stats) => stats,
            Err(SubstrateError::StreamNotFound { .. }) => return Ok(WorkListing::default()),
            Err(e) => return Err(e.into()),
        };
        if stats.messages == 0 {
            return Ok(WorkListing::default());
        }

        let to = stats
            .last_sequence
            .min(stats.first_sequence.saturating_add(SCAN_WINDOW - 1));
        let window_truncated = to < stats.last_sequence;

        let stored = self
            .substrate
            .read_by_range(&stream, stats.first_sequence, to)
            .await?;

        let mut matches = Vec::new();
        for message in stored {
            match WorkItem::from_slice(&message.payload) {
                Ok(item) => {
                    if filter.matches(&item) {
                        matches.push(item);
                    }
                }
                Err(e) => {
                    warn!(stream = %stream, sequence = message.sequence, error = %e, "Skipping unreadable work item");
                }
            }
        }

        let total = matches.len();
        let items: Vec<WorkItem> = matches.into_iter().take(limit).collect();
        Ok(WorkListing {
            truncated: window_truncated || items.len() < total,
            items,
            total,
        })
    }

    /// Metrics for one queue, or for every non-empty queue sorted by
    /// backlog descending.
    pub async fn status(&self, capability: Option<&str>) -> Result<Vec<QueueStatus>, LoomError> {
        match capability {
            Some(capability) => {
                let stream = capability_stream_name(capability);
                let stats = self
                    .substrate
                    .stream_info(&stream)
                    .await
                    .map_err(|_| LoomError::not_found(format!("work queue for {capability:?}")))?;
                Ok(vec![QueueStatus { stream, stats }])
            }
            None => {
                let names = self.substrate.stream_names().await?;
                let mut out = Vec::new();
                for name in names {
                    if !name.starts_with(WORKQUEUE_STREAM_PREFIX) {
                        continue;
                    }
                    match self.substrate.stream_info(&name).await {
                        Ok(stats) if stats.messages > 0 => {
                            out.push(QueueStatus { stream: name, stats })
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(stream = %name, error = %e, "Skipping unreadable queue");
                        }
                    }
                }
                out.sort_by(|a, b| b.stats.messages.cmp(&a.stats.messages));
                Ok(out)
            }
        }
    }

    /// Republish a dead-lettered item onto its capability queue and remove
    /// it from the DLQ.
    pub async fn retry_dead_letter(
        &self,
        item_id: &str,
        reset_attempts: bool,
    ) -> Result<WorkItem, LoomError> {
        if !validate::is_uuid_v4(item_id) {
            return Err(LoomError::validation(format!(
                "itemId {item_id:?} is not a v4 UUID"
            )));
        }

        let (sequence, record) = self
            .dlq
            .find(item_id)
            .await?
            .ok_or_else(|| LoomError::not_found(format!("dead-letter item {item_id}")))?;

        let mut item = record.work_item;
        item.attempts = if reset_attempts { 0 } else { record.attempts };

        self.ensure_queue(&item.capability).await?;
        self.substrate
            .publish(
                &capability_subject(&item.capability),
                serde_json::to_vec(&item)?,
            )
            .await?;
        self.dlq.remove(sequence).await?;

        info!(id = %item.id, capability = %item.capability, reset_attempts, "Retried dead-letter item");
        Ok(item)
    }

    /// Permanently delete a dead-lettered item.
    pub async fn discard_dead_letter(&self, item_id: &str) -> Result<DlqItem, LoomError> {
        if !validate::is_uuid_v4(item_id) {
            return Err(LoomError::validation(format!(
                "itemId {item_id:?} is not a v4 UUID"
            )));
        }

        let (sequence, record) = self
            .dlq
            .find(item_id)
            .await?
            .ok_or_else(|| LoomError::not_found(format!("dead-letter item {item_id}")))?;
        self.dlq.remove(sequence).await?;

        info!(id = %record.id, "Discarded dead-letter item");
        Ok(record)
    }
}
