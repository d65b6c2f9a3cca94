//! Dead-letter queue
//!
//! One limits-retention stream holds every exhausted or explicitly failed
//! work item, bounded by the dead-letter TTL. Items are located by their
//! original work-item id; retry and discard remove the entry by sequence.

use std::sync::Arc;

use loom_domain::{normalize_capability, DlqItem, LoomError, RetentionSpec, DLQ_STREAM, DLQ_SUBJECT};
use loom_ports::{StreamSpec, Substrate, SubstrateError};
use tracing::warn;

use crate::config::WorkQueueConfig;

pub const DLQ_LIMIT_MAX: usize = 100;
pub const DLQ_LIMIT_DEFAULT: usize = 50;

/// Widest by-sequence window scanned per listing
const SCAN_WINDOW: u64 = 1000;

pub struct DeadLetterQueue<S: Substrate> {
    substrate: Arc<S>,
    config: WorkQueueConfig,
}

impl<S: Substrate> Clone for DeadLetterQueue<S> {
    fn clone(&self) -> Self {
        DeadLetterQueue {
            substrate: self.substrate.clone(),
            config: self.config.clone(),
        }
    }
}

/// One page of dead-letter items, oldest first
#[derive(Debug, Clone, Default)]
pub struct DlqListing {
    pub items: Vec<DlqItem>,
    /// Matching items within the scan window
    pub total: usize,
    pub truncated: bool,
}

impl<S: Substrate> DeadLetterQueue<S> {
    pub fn new(substrate: Arc<S>, config: WorkQueueConfig) -> Self {
        DeadLetterQueue { substrate, config }
    }

    pub async fn ensure(&self) -> Result<(), LoomError> {
        self.substrate
            .ensure_stream(&StreamSpec::limits(
                DLQ_STREAM,
                DLQ_SUBJECT,
                RetentionSpec {
                    max_messages: -1,
                    max_bytes: -1,
                    max_age: self.config.dead_letter_ttl,
                },
            ))
            .await?;
        Ok(())
    }

    /// Append a dead-letter record. Callers acknowledge the original work
    /// item only after this succeeds, so a failed append leaves the item
    /// pending.
    pub async fn publish(&self, item: &DlqItem) -> Result<(), LoomError> {
        self.ensure().await?;
        self.substrate
            .publish(DLQ_SUBJECT, serde_json::to_vec(item)?)
            .await?;
        Ok(())
    }

    /// Non-destructive listing, optionally restricted to one capability.
    pub async fn list(
        &self,
        capability: Option<&str>,
        offset: usize,
        limit: usize,
    ) -> Result<DlqListing, LoomError> {
        let limit = limit.clamp(1, DLQ_LIMIT_MAX);
        let capability = capability.map(normalize_capability);

        let mut matches = Vec::new();
        let mut truncated = false;
        self.scan(|_, item| {
            let keep = capability
                .as_deref()
                .map(|cap| normalize_capability(&item.work_item.capability) == cap)
                .unwrap_or(true);
            if keep {
                matches.push(item);
            }
            true
        }, &mut truncated)
        .await?;

        let total = matches.len();
        let items: Vec<DlqItem> = matches.into_iter().skip(offset).take(limit).collect();
        Ok(DlqListing {
            truncated: truncated || offset + items.len() < total,
            items,
            total,
        })
    }

    /// Locate a dead-letter record by its original work-item id.
    pub async fn find(&self, item_id: &str) -> Result<Option<(u64, DlqItem)>, LoomError> {
        let mut found = None;
        let mut truncated = false;
        self.scan(|sequence, item| {
            if item.id == item_id {
                found = Some((sequence, item));
                false
            } else {
                true
            }
        }, &mut truncated)
        .await?;
        Ok(found)
    }

    /// Remove a dead-letter record by stream sequence.
    pub async fn remove(&self, sequence: u64) -> Result<(), LoomError> {
        self.substrate.delete_message(DLQ_STREAM, sequence).await?;
        Ok(())
    }

    async fn scan<F>(&self, mut visit: F, truncated: &mut bool) -> Result<(), LoomError>
    where
        F: FnMut(u64, DlqItem) -> bool,
    {
        let stats = match self.substrate.stream_info(DLQ_STREAM).await {
            Ok(stats) => stats,
            Err(SubstrateError::StreamNotFound { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if stats.messages == 0 {
            return Ok(());
        }

        let to = stats
            .last_sequence
            .min(stats.first_sequence.saturating_add(SCAN_WINDOW - 1));
        *truncated = to < stats.last_sequence;

        let stored = self
            .substrate
            .read_by_range(DLQ_STREAM, stats.first_sequence, to)
            .await?;
        for message in stored {
            match DlqItem::from_slice(&message.payload) {
                Ok(item) => {
                    if !visit(message.sequence, item) {
                        return Ok(());
                    }
                }
                Err(e) => {
                    warn!(sequence = message.sequence, error = %e, "Skipping unreadable dead-letter record");
                }
            }
        }
        Ok(())
    }
}
