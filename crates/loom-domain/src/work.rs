//! Work items and dead-letter items
//!
//! A work item is offered onto the capability queue `WORKQUEUE_<CAP>` and
//! has exactly one terminal state per incarnation: claimed-and-removed, or
//! moved to the dead-letter queue. `attempts` is advisory; it reflects the
//! delivery count observed at claim time, not a substrate-tracked counter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::LoomError;
use crate::registry::Scope;
use crate::validate;

/// Stream name prefix for capability queues
pub const WORKQUEUE_STREAM_PREFIX: &str = "WORKQUEUE_";
/// Subject prefix for capability queues
pub const WORKQUEUE_SUBJECT_PREFIX: &str = "global.work.";
/// The single dead-letter stream
pub const DLQ_STREAM: &str = "LOOM_DLQ";
/// Dead-letter subject
pub const DLQ_SUBJECT: &str = "global.dlq";

pub const PRIORITY_MIN: u8 = 1;
pub const PRIORITY_MAX: u8 = 10;
pub const PRIORITY_DEFAULT: u8 = 5;

/// Uppercase the capability and replace every non-alphanumeric with `_`.
pub fn normalize_capability(capability: &str) -> String {
    capability
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// `WORKQUEUE_<CAP_UPPER_SNAKE>`
pub fn capability_stream_name(capability: &str) -> String {
    format!("{WORKQUEUE_STREAM_PREFIX}{}", normalize_capability(capability))
}

/// Subject a capability queue listens on.
pub fn capability_subject(capability: &str) -> String {
    format!(
        "{WORKQUEUE_SUBJECT_PREFIX}{}",
        normalize_capability(capability).to_ascii_lowercase()
    )
}

/// One unit of capability-routed work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    pub task_id: String,
    pub capability: String,
    pub description: String,
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_data: Option<Value>,
    pub offered_by: String,
    pub offered_at: DateTime<Utc>,
    pub attempts: u32,
    pub scope: Scope,
    /// Fields this build does not know about survive a read-modify-write.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Caller-supplied parameters for offering work
#[derive(Debug, Clone)]
pub struct WorkOffer {
    pub task_id: String,
    pub description: String,
    pub capability: String,
    pub priority: u8,
    pub deadline: Option<DateTime<Utc>>,
    pub context_data: Option<Value>,
    pub scope: Scope,
}

impl WorkItem {
    /// Build a fresh item from an offer. The id is generated here; attempts
    /// start at zero.
    pub fn from_offer(offer: WorkOffer, offered_by: &str) -> Result<Self, LoomError> {
        let item = WorkItem {
            id: Uuid::new_v4().to_string(),
            task_id: offer.task_id,
            capability: offer.capability,
            description: offer.description,
            priority: offer.priority,
            deadline: offer.deadline,
            context_data: offer.context_data,
            offered_by: offered_by.to_string(),
            offered_at: Utc::now(),
            attempts: 0,
            scope: offer.scope,
            extra: Map::new(),
        };
        item.validate()?;
        Ok(item)
    }

    pub fn validate(&self) -> Result<(), LoomError> {
        if !validate::is_uuid_v4(&self.id) {
            return Err(LoomError::validation(format!(
                "work item id {:?} is not a v4 UUID",
                self.id
            )));
        }
        if !validate::is_present(&self.task_id) {
            return Err(LoomError::validation("taskId must not be empty"));
        }
        if !validate::is_present(&self.description) {
            return Err(LoomError::validation("description must not be empty"));
        }
        if !validate::is_present(&self.capability) {
            return Err(LoomError::validation(
                "requiredCapability must not be empty",
            ));
        }
        if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&self.priority) {
            return Err(LoomError::validation(format!(
                "priority {} must be between {PRIORITY_MIN} and {PRIORITY_MAX}",
                self.priority
            )));
        }
        Ok(())
    }

    /// Tolerant decode: unknown fields are preserved in `extra`.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, LoomError> {
        let item: WorkItem = serde_json::from_slice(bytes)
            .map_err(|e| LoomError::validation(format!("malformed work item: {e}")))?;
        Ok(item)
    }

    /// Strict decode: unknown fields are rejected.
    pub fn from_slice_strict(bytes: &[u8]) -> Result<Self, LoomError> {
        let item = Self::from_slice(bytes)?;
        if !item.extra.is_empty() {
            let keys: Vec<_> = item.extra.keys().cloned().collect();
            return Err(LoomError::validation(format!(
                "unknown work item fields: {}",
                keys.join(", ")
            )));
        }
        Ok(item)
    }
}

/// Range predicates for non-destructive queue listing
#[derive(Debug, Clone, Default)]
pub struct WorkFilter {
    pub min_priority: Option<u8>,
    pub max_priority: Option<u8>,
    pub deadline_before: Option<DateTime<Utc>>,
    pub deadline_after: Option<DateTime<Utc>>,
}

impl WorkFilter {
    pub fn matches(&self, item: &WorkItem) -> bool {
        if let Some(min) = self.min_priority {
            if item.priority < min {
                return false;
            }
        }
        if let Some(max) = self.max_priority {
            if item.priority > max {
                return false;
            }
        }
        // Deadline predicates only match items that carry a deadline.
        if let Some(before) = self.deadline_before {
            match item.deadline {
                Some(d) if d < before => {}
                _ => return false,
            }
        }
        if let Some(after) = self.deadline_after {
            match item.deadline {
                Some(d) if d > after => {}
                _ => return false,
            }
        }
        true
    }
}

/// A work item that exhausted its delivery budget or was failed explicitly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqItem {
    /// Equal to the original work item id
    pub id: String,
    pub work_item: WorkItem,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
    /// Per-attempt error strings, oldest first
    pub errors: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DlqItem {
    pub fn from_work_item(
        work_item: WorkItem,
        reason: impl Into<String>,
        attempts: u32,
        errors: Vec<String>,
    ) -> Self {
        DlqItem {
            id: work_item.id.clone(),
            work_item,
            reason: reason.into(),
            attempts,
            failed_at: Utc::now(),
            errors,
            extra: Map::new(),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, LoomError> {
        serde_json::from_slice(bytes)
            .map_err(|e| LoomError::validation(format!("malformed dead-letter item: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENDER: &str = "6c84fb90-12c4-4a1c-8e2b-2d0a3c7b9f10";

    fn offer() -> WorkOffer {
        WorkOffer {
            task_id: "t-1".to_string(),
            description: "port the parser".to_string(),
            capability: "typescript".to_string(),
            priority: PRIORITY_DEFAULT,
            deadline: None,
            context_data: None,
            scope: Scope::Team,
        }
    }

    #[test]
    fn test_capability_normalization() {
        assert_eq!(normalize_capability("typescript"), "TYPESCRIPT");
        assert_eq!(normalize_capability("code-review"), "CODE_REVIEW");
        assert_eq!(normalize_capability("gpu/cuda 12"), "GPU_CUDA_12");
        assert_eq!(capability_stream_name("typescript"), "WORKQUEUE_TYPESCRIPT");
        assert_eq!(capability_subject("code-review"), "global.work.code_review");
    }

    #[test]
    fn test_offer_produces_valid_item() {
        let item = WorkItem::from_offer(offer(), SENDER).expect("valid offer");
        assert!(item.validate().is_ok());
        assert_eq!(item.attempts, 0);
        assert_eq!(item.offered_by, SENDER);
        assert!(validate::is_uuid_v4(&item.id));
    }

    #[test]
    fn test_offer_rejects_priority_out_of_range() {
        let mut o = offer();
        o.priority = 0;
        assert!(WorkItem::from_offer(o, SENDER).is_err());
        let mut o = offer();
        o.priority = 11;
        assert!(WorkItem::from_offer(o, SENDER).is_err());
    }

    #[test]
    fn test_offer_rejects_blank_fields() {
        let mut o = offer();
        o.task_id = " ".to_string();
        assert!(WorkItem::from_offer(o, SENDER).is_err());
        let mut o = offer();
        o.description = String::new();
        assert!(WorkItem::from_offer(o, SENDER).is_err());
        let mut o = offer();
        o.capability = String::new();
        assert!(WorkItem::from_offer(o, SENDER).is_err());
    }

    #[test]
    fn test_round_trip_preserves_unknown_fields() {
        let item = WorkItem::from_offer(offer(), SENDER).expect("valid offer");
        let mut value = serde_json::to_value(&item).expect("to value");
        value["experimentalHint"] = Value::String("keep me".to_string());
        let bytes = serde_json::to_vec(&value).expect("to bytes");

        let parsed = WorkItem::from_slice(&bytes).expect("tolerant parse");
        assert_eq!(parsed.extra["experimentalHint"], "keep me");

        let reencoded = serde_json::to_value(&parsed).expect("reencode");
        assert_eq!(reencoded["experimentalHint"], "keep me");

        assert!(WorkItem::from_slice_strict(&bytes).is_err());
        let clean = serde_json::to_vec(&item).expect("clean bytes");
        assert!(WorkItem::from_slice_strict(&clean).is_ok());
    }

    #[test]
    fn test_filter_priority_bounds() {
        let mut item = WorkItem::from_offer(offer(), SENDER).expect("valid offer");
        item.priority = 7;
        let f = WorkFilter {
            min_priority: Some(5),
            max_priority: Some(8),
            ..Default::default()
        };
        assert!(f.matches(&item));
        item.priority = 4;
        assert!(!f.matches(&item));
        item.priority = 9;
        assert!(!f.matches(&item));
    }

    #[test]
    fn test_filter_deadline_predicates_require_deadline() {
        let mut item = WorkItem::from_offer(offer(), SENDER).expect("valid offer");
        let cutoff = Utc::now();
        let f = WorkFilter {
            deadline_before: Some(cutoff),
            ..Default::default()
        };
        assert!(!f.matches(&item), "no deadline never matches a bound");
        item.deadline = Some(cutoff - chrono::Duration::hours(1));
        assert!(f.matches(&item));
        item.deadline = Some(cutoff + chrono::Duration::hours(1));
        assert!(!f.matches(&item));
    }

    #[test]
    fn test_dlq_item_keeps_original_id() {
        let item = WorkItem::from_offer(offer(), SENDER).expect("valid offer");
        let id = item.id.clone();
        let dlq = DlqItem::from_work_item(item, "ack timeout", 3, vec!["boom".to_string()]);
        assert_eq!(dlq.id, id);
        assert_eq!(dlq.attempts, 3);

        let bytes = serde_json::to_vec(&dlq).expect("serialize");
        let back = DlqItem::from_slice(&bytes).expect("parse");
        assert_eq!(back, dlq);
    }
}
