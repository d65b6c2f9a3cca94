//! Per-agent inbox
//!
//! Stream `INBOX_<id>` on subject `global.agent.<guid>`, limits retention
//! (1000 messages, 7 days), one durable owner consumer with explicit
//! acknowledgement. Reads are consume-once: everything fetched is
//! disposed of — matched messages are acknowledged and returned,
//! filtered-out and unparseable messages are acknowledged so they never
//! block the stream, and the single look-ahead overflow message is
//! negatively acknowledged so the next page sees it again.

use std::sync::Arc;

use futures::StreamExt;
use loom_domain::{
    inbox_stream_name, inbox_subject, validate, InboxMessage, LoomError, RetentionSpec,
};
use loom_ports::{ConsumerSpec, FetchedMessage, StreamSpec, Substrate, SubstrateError};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::InboxConfig;
use crate::registry::Registry;

pub const INBOX_CONSUMER: &str = "inbox-owner";

pub const READ_LIMIT_MAX: usize = 100;
pub const READ_LIMIT_DEFAULT: usize = 10;

pub struct Inbox<S: Substrate> {
    substrate: Arc<S>,
    registry: Registry<S>,
    config: InboxConfig,
}

impl<S: Substrate> Clone for Inbox<S> {
    fn clone(&self) -> Self {
        Inbox {
            substrate: self.substrate.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
        }
    }
}

/// What the sender learns from a durable send
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: String,
    /// Colours the acknowledgement only; delivery is durable regardless.
    pub recipient_status: loom_domain::AgentStatus,
}

/// Optional consume-time filters
#[derive(Debug, Clone, Default)]
pub struct ReadFilter {
    pub sender_guid: Option<String>,
    pub message_type: Option<String>,
}

impl ReadFilter {
    fn matches(&self, message: &InboxMessage) -> bool {
        if let Some(sender) = &self.sender_guid {
            if &message.sender_guid != sender {
                return false;
            }
        }
        if let Some(message_type) = &self.message_type {
            if &message.message_type != message_type {
                return false;
            }
        }
        true
    }
}

/// One consume-once batch, sorted by timestamp ascending
#[derive(Debug, Clone, Default)]
pub struct InboxPage {
    pub messages: Vec<InboxMessage>,
    pub has_more: bool,
}

impl<S: Substrate> Inbox<S> {
    pub fn new(substrate: Arc<S>, registry: Registry<S>, config: InboxConfig) -> Self {
        Inbox {
            substrate,
            registry,
            config,
        }
    }

    /// Create the inbox stream and owner consumer for `guid`. Idempotent.
    pub async fn ensure(&self, guid: &str) -> Result<(), LoomError> {
        let stream = inbox_stream_name(guid);
        self.substrate
            .ensure_stream(&StreamSpec::limits(
                stream.clone(),
                inbox_subject(guid),
                RetentionSpec {
                    max_messages: self.config.max_messages,
                    max_bytes: -1,
                    max_age: self.config.max_age,
                },
            ))
            .await?;
        self.substrate
            .ensure_consumer(&ConsumerSpec {
                stream,
                name: INBOX_CONSUMER.to_string(),
                ack_wait: self.config.ack_wait,
                max_deliver: self.config.max_deliver,
            })
            .await?;
        Ok(())
    }

    /// Publish a direct message into the recipient's inbox.
    pub async fn send_direct(
        &self,
        sender_guid: &str,
        recipient_guid: &str,
        message_type: &str,
        content: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<SendReceipt, LoomError> {
        let sender = self.registry.require(sender_guid).await.map_err(|_| {
            LoomError::validation("sender is not registered; call registry_register first")
        })?;

        if !validate::is_uuid_v4(recipient_guid) {
            return Err(LoomError::validation(format!(
                "recipientGuid {recipient_guid:?} is not a v4 UUID"
            )));
        }
        let recipient = self.registry.require(recipient_guid).await?;

        let message = InboxMessage::new(&sender, recipient_guid, message_type, content, metadata)?;
        self.ensure(recipient_guid).await?;
        self.substrate
            .publish(&inbox_subject(recipient_guid), serde_json::to_vec(&message)?)
            .await?;

        Ok(SendReceipt {
            message_id: message.id,
            recipient_status: recipient.status,
        })
    }

    /// Consume-once read of up to `limit` matching messages.
    ///
    /// Fetches one extra message to decide `has_more`. An empty inbox,
    /// a fetch timeout, and a missing stream all yield the canonical
    /// empty page.
    pub async fn read_direct(
        &self,
        owner_guid: &str,
        filter: &ReadFilter,
        limit: usize,
    ) -> Result<InboxPage, LoomError> {
        self.registry.require(owner_guid).await.map_err(|_| {
            LoomError::validation("you are not registered; call registry_register first")
        })?;
        if let Some(sender) = &filter.sender_guid {
            if !validate::is_uuid_v4(sender) {
                return Err(LoomError::validation(format!(
                    "senderGuid {sender:?} is not a v4 UUID"
                )));
            }
        }

        let limit = limit.clamp(1, READ_LIMIT_MAX);
        let stream = inbox_stream_name(owner_guid);

        let fetched = match self
            .substrate
            .fetch(&stream, INBOX_CONSUMER, limit + 1, self.config.fetch_timeout)
            .await
        {
            Ok(fetched) => fetched,
            Err(SubstrateError::StreamNotFound { .. })
            | Err(SubstrateError::ConsumerNotFound { .. }) => {
                // Nothing was ever sent here.
                return Ok(InboxPage::default());
            }
            Err(e) => return Err(e.into()),
        };

        let mut page = InboxPage::default();
        for message in fetched {
            let parsed = match InboxMessage::from_slice(message.payload()) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(stream = %stream, error = %e, "Discarding unreadable inbox message");
                    message.ack().await?;
                    continue;
                }
            };

            if !filter.matches(&parsed) {
                // Disposed of: filtered-out messages never come back.
                message.ack().await?;
                continue;
            }

            if page.messages.len() < limit {
                message.ack().await?;
                page.messages.push(parsed);
            } else {
                // The look-ahead overflow: leave it claimable for the
                // next page.
                page.has_more = true;
                message.nak().await?;
            }
        }

        page.messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(page)
    }

    /// Start the real-time notification subscription for `guid`.
    ///
    /// This is a core (non-durable) subscription on the inbox subject;
    /// it observes messages as they arrive without consuming from the
    /// durable owner consumer. At most one per session: the caller
    /// supersedes the previous subscription when starting a new one.
    pub async fn subscribe(
        &self,
        guid: &str,
        sink: mpsc::UnboundedSender<InboxMessage>,
    ) -> Result<InboxSubscription, LoomError> {
        let mut stream = self.substrate.subscribe(&inbox_subject(guid)).await?;
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let owner = guid.to_string();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    next = stream.next() => {
                        match next {
                            Some(bytes) => match InboxMessage::from_slice(&bytes) {
                                Ok(message) => {
                                    if sink.send(message).is_err() {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    warn!(guid = %owner, error = %e, "Dropping unreadable notification");
                                }
                            },
                            // End-of-stream: the connection drained.
                            None => break,
                        }
                    }
                }
            }
            debug!(guid = %owner, "Inbox subscription ended");
        });

        Ok(InboxSubscription { token, task })
    }
}

/// Running notification subscription; stop is idempotent.
pub struct InboxSubscription {
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl InboxSubscription {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }
}
