//! Engine tuning knobs
//!
//! Defaults follow the service contract: 60 s heartbeats, staleness at
//! three missed beats, 24 h entry TTL, 5 min work acknowledgement
//! timeout, three delivery attempts, 7 day dead-letter retention.

use std::time::Duration;

use loom_domain::{ChannelDescriptor, RetentionSpec};

/// Heartbeat and garbage-collection timing
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub heartbeat_interval: Duration,
    /// Strictly-greater-than comparison against the last heartbeat
    pub stale_threshold: Duration,
    pub gc_interval: Duration,
    /// Entries older than this are deleted outright
    pub ttl: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        LifecycleConfig {
            heartbeat_interval: Duration::from_secs(60),
            stale_threshold: Duration::from_secs(180),
            gc_interval: Duration::from_secs(5 * 60),
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Work queue and dead-letter tuning
#[derive(Debug, Clone)]
pub struct WorkQueueConfig {
    /// How long a claimed-but-unacknowledged item stays invisible
    pub ack_timeout: Duration,
    /// Delivery budget per item before it is dead-lettered
    pub max_delivery_attempts: u32,
    pub dead_letter_ttl: Duration,
    /// Retention for every capability stream
    pub retention: RetentionSpec,
    pub claim_default_timeout: Duration,
    pub claim_max_timeout: Duration,
}

impl Default for WorkQueueConfig {
    fn default() -> Self {
        WorkQueueConfig {
            ack_timeout: Duration::from_secs(300),
            max_delivery_attempts: 3,
            dead_letter_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            retention: RetentionSpec {
                max_messages: 10_000,
                max_bytes: 100 * 1024 * 1024,
                max_age: Duration::from_secs(7 * 24 * 60 * 60),
            },
            claim_default_timeout: Duration::from_secs(5),
            claim_max_timeout: Duration::from_secs(30),
        }
    }
}

/// Inbox stream and consumer tuning
#[derive(Debug, Clone)]
pub struct InboxConfig {
    pub max_messages: i64,
    pub max_age: Duration,
    /// Matches the work-queue acknowledgement timeout
    pub ack_wait: Duration,
    /// Redelivery bound for the owner consumer. Kept well above the work
    /// queue budget: overflow messages are negatively acknowledged on
    /// every paged read and each of those counts as a delivery.
    pub max_deliver: i64,
    /// How long a read waits for the bounded batch
    pub fetch_timeout: Duration,
}

impl InboxConfig {
    pub fn from_work_queue(work_queue: &WorkQueueConfig) -> Self {
        InboxConfig {
            max_messages: 1000,
            max_age: Duration::from_secs(7 * 24 * 60 * 60),
            ack_wait: work_queue.ack_timeout,
            max_deliver: 30,
            fetch_timeout: Duration::from_secs(2),
        }
    }
}

/// Everything the engine needs to know about its session and project
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// 16 lowercase hex project tag
    pub project_id: String,
    pub project_path: String,
    /// Channel namespace; defaults to the project id
    pub namespace: String,
    /// Recorded in registry entries so peers can reach this substrate
    pub nats_url: String,
    pub username: Option<String>,
    pub channels: Vec<ChannelDescriptor>,
    pub lifecycle: LifecycleConfig,
    pub work_queue: WorkQueueConfig,
    /// How long an inbox read waits for its bounded batch
    pub inbox_fetch_timeout: Duration,
}

impl EngineConfig {
    /// A minimal config for tests and local development.
    pub fn for_project(project_id: &str, project_path: &str) -> Self {
        EngineConfig {
            project_id: project_id.to_string(),
            project_path: project_path.to_string(),
            namespace: project_id.to_string(),
            nats_url: "nats://localhost:4222".to_string(),
            username: None,
            channels: Vec::new(),
            lifecycle: LifecycleConfig::default(),
            work_queue: WorkQueueConfig::default(),
            inbox_fetch_timeout: Duration::from_secs(2),
        }
    }
}
