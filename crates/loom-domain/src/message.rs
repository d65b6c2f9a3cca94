//! Inbox and channel message payloads

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::LoomError;
use crate::registry::RegistryEntry;
use crate::validate;

/// Stream name prefix for per-agent inboxes
pub const INBOX_STREAM_PREFIX: &str = "INBOX_";
/// Subject prefix for per-agent inboxes
pub const INBOX_SUBJECT_PREFIX: &str = "global.agent.";

/// `INBOX_<guid with hyphens replaced by underscores>`
pub fn inbox_stream_name(guid: &str) -> String {
    format!("{INBOX_STREAM_PREFIX}{}", guid.replace('-', "_"))
}

/// `global.agent.<guid>`
pub fn inbox_subject(guid: &str) -> String {
    format!("{INBOX_SUBJECT_PREFIX}{guid}")
}

/// A direct message durably stored in the recipient's inbox stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxMessage {
    pub id: String,
    pub sender_guid: String,
    pub sender_handle: String,
    pub recipient_guid: String,
    /// Free-form routing tag, `"text"` by default
    pub message_type: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl InboxMessage {
    /// Build a fresh message from a registered sender. The id is generated
    /// here.
    pub fn new(
        sender: &RegistryEntry,
        recipient_guid: &str,
        message_type: &str,
        content: &str,
        metadata: Option<Map<String, Value>>,
    ) -> Result<Self, LoomError> {
        if !validate::is_uuid_v4(recipient_guid) {
            return Err(LoomError::validation(format!(
                "recipientGuid {recipient_guid:?} is not a v4 UUID"
            )));
        }
        if !validate::is_present(message_type) {
            return Err(LoomError::validation("messageType must not be empty"));
        }
        if !validate::is_present(content) {
            return Err(LoomError::validation("message must not be empty"));
        }
        Ok(InboxMessage {
            id: Uuid::new_v4().to_string(),
            sender_guid: sender.guid.clone(),
            sender_handle: sender.handle.clone(),
            recipient_guid: recipient_guid.to_string(),
            message_type: message_type.to_string(),
            content: content.to_string(),
            metadata,
            timestamp: Utc::now(),
            extra: Map::new(),
        })
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, LoomError> {
        serde_json::from_slice(bytes)
            .map_err(|e| LoomError::validation(format!("malformed inbox message: {e}")))
    }

    pub fn from_slice_strict(bytes: &[u8]) -> Result<Self, LoomError> {
        let msg = Self::from_slice(bytes)?;
        if !msg.extra.is_empty() {
            let keys: Vec<_> = msg.extra.keys().cloned().collect();
            return Err(LoomError::validation(format!(
                "unknown inbox message fields: {}",
                keys.join(", ")
            )));
        }
        Ok(msg)
    }
}

/// The wire payload stored in a channel stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    pub handle: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChannelMessage {
    pub fn new(handle: &str, message: &str) -> Self {
        ChannelMessage {
            handle: handle.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
            extra: Map::new(),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, LoomError> {
        serde_json::from_slice(bytes)
            .map_err(|e| LoomError::validation(format!("malformed channel message: {e}")))
    }
}
