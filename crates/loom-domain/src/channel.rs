//! Channel descriptors and naming
//!
//! A channel is a named, bounded, re-readable topic. Each channel maps to
//! one stream `<NAMESPACE>_<NAME_UPPER_SNAKE>` on subject
//! `<namespace>.<name>`, where the namespace is the 16-hex project tag.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration;
use crate::error::LoomError;
use crate::validate;

/// Largest accepted channel message, after trimming
pub const MAX_CHANNEL_MESSAGE_BYTES: usize = 1024 * 1024;

pub const DEFAULT_CHANNEL_MAX_MESSAGES: i64 = 10_000;
pub const DEFAULT_CHANNEL_MAX_BYTES: i64 = 10 * 1024 * 1024;
pub const DEFAULT_CHANNEL_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Bounded retention for a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionSpec {
    /// -1 means unlimited
    pub max_messages: i64,
    /// -1 means unlimited
    pub max_bytes: i64,
    #[serde(with = "duration::serde_millis")]
    pub max_age: Duration,
}

impl Default for RetentionSpec {
    fn default() -> Self {
        RetentionSpec {
            max_messages: DEFAULT_CHANNEL_MAX_MESSAGES,
            max_bytes: DEFAULT_CHANNEL_MAX_BYTES,
            max_age: DEFAULT_CHANNEL_MAX_AGE,
        }
    }
}

/// Configuration record for one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDescriptor {
    /// `^[a-z0-9-]+$`
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub retention: RetentionSpec,
}

impl ChannelDescriptor {
    pub fn new(name: &str, description: &str) -> Self {
        ChannelDescriptor {
            name: name.to_string(),
            description: description.to_string(),
            retention: RetentionSpec::default(),
        }
    }

    pub fn validate(&self) -> Result<(), LoomError> {
        if !validate::is_handle(&self.name) {
            return Err(LoomError::validation(format!(
                "channel name {:?} must match ^[a-z0-9-]+$",
                self.name
            )));
        }
        Ok(())
    }

    /// `<NAMESPACE>_<NAME_UPPER_SNAKE>`
    pub fn stream_name(&self, namespace: &str) -> String {
        format!(
            "{}_{}",
            namespace.to_ascii_uppercase(),
            upper_snake(&self.name)
        )
    }

    /// `<namespace>.<name>`
    pub fn subject(&self, namespace: &str) -> String {
        format!("{namespace}.{}", self.name)
    }
}

fn upper_snake(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// Validate outbound channel content: non-empty after trim, bounded size.
pub fn validate_channel_content(message: &str) -> Result<(), LoomError> {
    if !validate::is_present(message) {
        return Err(LoomError::validation("message must not be empty"));
    }
    if message.len() > MAX_CHANNEL_MESSAGE_BYTES {
        return Err(LoomError::validation(format!(
            "message is {} bytes; the limit is {MAX_CHANNEL_MESSAGE_BYTES}",
            message.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_and_subject_names() {
        let c = ChannelDescriptor::new("code-review", "review queue");
        assert_eq!(c.stream_name("0123456789abcdef"), "0123456789ABCDEF_CODE_REVIEW");
        assert_eq!(c.subject("0123456789abcdef"), "0123456789abcdef.code-review");
    }

    #[test]
    fn test_name_validation() {
        assert!(ChannelDescriptor::new("general", "").validate().is_ok());
        assert!(ChannelDescriptor::new("General", "").validate().is_err());
        assert!(ChannelDescriptor::new("", "").validate().is_err());
        assert!(ChannelDescriptor::new("a.b", "").validate().is_err());
    }

    #[test]
    fn test_retention_defaults() {
        let r = RetentionSpec::default();
        assert_eq!(r.max_messages, 10_000);
        assert_eq!(r.max_bytes, 10 * 1024 * 1024);
        assert_eq!(r.max_age, Duration::from_secs(86_400));
    }

    #[test]
    fn test_retention_accepts_duration_strings() {
        let r: RetentionSpec =
            serde_json::from_str(r#"{"maxMessages":5,"maxBytes":1024,"maxAge":"12h"}"#)
                .expect("parse");
        assert_eq!(r.max_age, Duration::from_secs(12 * 3600));

        let r: RetentionSpec =
            serde_json::from_str(r#"{"maxMessages":5,"maxBytes":1024,"maxAge":60000}"#)
                .expect("parse");
        assert_eq!(r.max_age, Duration::from_secs(60));
    }

    #[test]
    fn test_content_limits() {
        assert!(validate_channel_content("hello").is_ok());
        assert!(validate_channel_content("   ").is_err());
        let big = "x".repeat(MAX_CHANNEL_MESSAGE_BYTES + 1);
        assert!(validate_channel_content(&big).is_err());
    }
}
