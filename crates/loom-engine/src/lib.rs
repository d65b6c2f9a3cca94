//! Loom Coordination Engine
//!
//! The engine turns tool calls into operations against the messaging
//! substrate. Six cooperating components, leaves first:
//! - substrate adapter (behind the `loom-ports` trait)
//! - identity service: stable agent ids across restarts
//! - registry: KV-backed agent directory with scope-aware redaction
//! - lifecycle: per-agent heartbeat loop and registry-wide GC
//! - inbox: per-agent durable stream with consume-once reads
//! - work queue + DLQ: capability-routed competing consumers
//!
//! Channels (bounded, re-readable topics) reuse the substrate with a
//! different retention discipline.
//!
//! The engine is safe to call from multiple tasks concurrently; the
//! long-running loops (heartbeat, GC, inbox subscription) are explicit
//! objects with start/stop and supersession semantics. No lock is held
//! across a substrate request.

pub mod channels;
pub mod config;
pub mod dlq;
pub mod identity;
pub mod inbox;
pub mod lifecycle;
pub mod registry;
pub mod session;
pub mod workqueue;

use std::sync::Arc;

use loom_domain::LoomError;
use loom_ports::Substrate;

pub use channels::{ChannelStatus, Channels};
pub use config::{EngineConfig, InboxConfig, LifecycleConfig, WorkQueueConfig};
pub use dlq::{DeadLetterQueue, DlqListing};
pub use identity::{IdentityOverrides, IdentityService};
pub use inbox::{Inbox, InboxPage, InboxSubscription, ReadFilter, SendReceipt};
pub use lifecycle::{GarbageCollector, GcHandle, GcReport, Heartbeat, HeartbeatHandle};
pub use registry::{DiscoverPage, DiscoverQuery, RegisterParams, Registry};
pub use session::{AgentSession, RegisterRequest};
pub use workqueue::{ClaimOutcome, QueueStatus, WorkListing, WorkQueue};

/// All engine components wired onto one substrate.
pub struct CoordinationEngine<S: Substrate> {
    pub config: EngineConfig,
    pub registry: Registry<S>,
    pub identity: IdentityService<S>,
    pub inbox: Inbox<S>,
    pub work_queue: WorkQueue<S>,
    pub dlq: DeadLetterQueue<S>,
    pub channels: Channels<S>,
}

impl<S: Substrate> CoordinationEngine<S> {
    pub fn new(substrate: Arc<S>, config: EngineConfig) -> Self {
        let registry = Registry::new(substrate.clone());
        let identity = IdentityService::new(substrate.clone());
        let mut inbox_config = InboxConfig::from_work_queue(&config.work_queue);
        inbox_config.fetch_timeout = config.inbox_fetch_timeout;
        let inbox = Inbox::new(substrate.clone(), registry.clone(), inbox_config);
        let dlq = DeadLetterQueue::new(substrate.clone(), config.work_queue.clone());
        let work_queue = WorkQueue::new(
            substrate.clone(),
            registry.clone(),
            dlq.clone(),
            config.work_queue.clone(),
        );
        let channels = Channels::new(
            substrate,
            config.namespace.clone(),
            config.channels.clone(),
        );

        CoordinationEngine {
            config,
            registry,
            identity,
            inbox,
            work_queue,
            dlq,
            channels,
        }
    }

    /// Create the buckets and streams every session relies on. Idempotent.
    pub async fn init(&self) -> Result<(), LoomError> {
        self.registry.init().await?;
        self.dlq.ensure().await?;
        self.channels.init().await?;
        Ok(())
    }

    /// A per-session state holder over this engine's registry and inbox.
    pub fn session(&self, stable_agent_id: Option<String>) -> AgentSession<S> {
        AgentSession::new(
            self.registry.clone(),
            self.inbox.clone(),
            self.config.clone(),
            stable_agent_id,
        )
    }
}
