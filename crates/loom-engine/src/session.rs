//! Per-session agent state
//!
//! Owns the session's registration guid and its two singleton loops: the
//! heartbeat and the inbox notification subscription. Starting either one
//! supersedes (stops) the previous instance; stop is idempotent and safe
//! from any exit path.

use loom_domain::{AgentStatus, InboxMessage, LoomError, RegistryEntry, Scope};
use loom_ports::Substrate;
use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::config::EngineConfig;
use crate::identity::current_hostname;
use crate::inbox::{Inbox, InboxSubscription};
use crate::lifecycle::{Heartbeat, HeartbeatHandle};
use crate::registry::{RegisterParams, Registry};

/// Arguments accepted from the registration tool
#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub agent_type: String,
    pub handle: String,
    pub capabilities: Vec<String>,
    pub scope: Scope,
}

pub struct AgentSession<S: Substrate> {
    registry: Registry<S>,
    inbox: Inbox<S>,
    config: EngineConfig,
    /// Stable 32-hex agent id from the identity service, when available
    stable_agent_id: Option<String>,
    state: Mutex<SessionState>,
}

#[derive(Default)]
struct SessionState {
    guid: Option<String>,
    heartbeat: Option<HeartbeatHandle>,
    subscription: Option<InboxSubscription>,
}

impl<S: Substrate> AgentSession<S> {
    pub fn new(
        registry: Registry<S>,
        inbox: Inbox<S>,
        config: EngineConfig,
        stable_agent_id: Option<String>,
    ) -> Self {
        AgentSession {
            registry,
            inbox,
            config,
            stable_agent_id,
            state: Mutex::new(SessionState::default()),
        }
    }

    pub async fn guid(&self) -> Option<String> {
        self.state.lock().await.guid.clone()
    }

    pub async fn require_guid(&self) -> Result<String, LoomError> {
        self.guid().await.ok_or_else(|| {
            LoomError::validation("you are not registered; call registry_register first")
        })
    }

    /// Register (or re-register) this session: write the directory entry,
    /// create the inbox, and start the heartbeat. A previous heartbeat is
    /// superseded.
    pub async fn register(&self, request: RegisterRequest) -> Result<RegistryEntry, LoomError> {
        let params = RegisterParams {
            agent_type: request.agent_type,
            handle: request.handle,
            hostname: current_hostname(),
            project_id: self.config.project_id.clone(),
            nats_url: self.config.nats_url.clone(),
            username: self.config.username.clone(),
            capabilities: request.capabilities,
            scope: request.scope,
            stable_agent_id: self.stable_agent_id.clone(),
        };

        let entry = self.registry.register(params).await?;
        self.inbox.ensure(&entry.guid).await?;

        let mut state = self.state.lock().await;
        if let Some(previous) = state.heartbeat.take() {
            previous.stop();
        }
        state.heartbeat = Some(Heartbeat::start(
            self.registry.clone(),
            entry.guid.clone(),
            &self.config.lifecycle,
            None,
        ));
        state.guid = Some(entry.guid.clone());

        info!(guid = %entry.guid, handle = %entry.handle, "Registered agent");
        Ok(entry)
    }

    /// Mutate this session's own entry. Going offline stops the heartbeat.
    pub async fn update_presence(
        &self,
        status: Option<AgentStatus>,
        current_task_count: Option<u32>,
        capabilities: Option<Vec<String>>,
    ) -> Result<RegistryEntry, LoomError> {
        if status.is_none() && current_task_count.is_none() && capabilities.is_none() {
            return Err(LoomError::validation(
                "provide at least one of status, currentTaskCount, capabilities",
            ));
        }

        let guid = self.require_guid().await?;
        let mut entry = self.registry.require(&guid).await?;

        if let Some(status) = status {
            entry.status = status;
        }
        if let Some(count) = current_task_count {
            entry.current_task_count = count;
        }
        if let Some(capabilities) = capabilities {
            entry.capabilities = capabilities;
        }
        self.registry.put(&entry).await?;

        if status == Some(AgentStatus::Offline) {
            let mut state = self.state.lock().await;
            if let Some(heartbeat) = state.heartbeat.take() {
                heartbeat.stop();
            }
        }
        Ok(entry)
    }

    /// Start (or restart) the inbox notification subscription and hand
    /// back its receiving end.
    pub async fn subscribe_inbox(
        &self,
    ) -> Result<mpsc::UnboundedReceiver<InboxMessage>, LoomError> {
        let guid = self.require_guid().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.inbox.subscribe(&guid, tx).await?;

        let mut state = self.state.lock().await;
        if let Some(previous) = state.subscription.take() {
            previous.stop();
        }
        state.subscription = Some(subscription);
        Ok(rx)
    }

    /// Stop both loops and mark the entry offline. Idempotent: an
    /// unregistered session deregisters to a no-op.
    pub async fn deregister(&self) -> Result<(), LoomError> {
        let (guid, heartbeat, subscription) = {
            let mut state = self.state.lock().await;
            (
                state.guid.take(),
                state.heartbeat.take(),
                state.subscription.take(),
            )
        };

        if let Some(heartbeat) = heartbeat {
            heartbeat.stop();
        }
        if let Some(subscription) = subscription {
            subscription.stop();
        }

        let Some(guid) = guid else {
            return Ok(());
        };
        if let Some(mut entry) = self.registry.get(&guid).await? {
            entry.status = AgentStatus::Offline;
            self.registry.put(&entry).await?;
        }

        info!(guid = %guid, "Deregistered agent");
        Ok(())
    }
}
