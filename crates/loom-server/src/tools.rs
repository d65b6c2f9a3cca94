//! Tool surface
//!
//! Maps named tool invocations onto engine calls. Argument names, ranges,
//! and defaults are stable; results are text payloads (sentences for
//! acknowledgements, JSON for listings). Failures render as
//! `Error: <message>`, with remediation folded into the message.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use loom_domain::{
    validate, AgentStatus, Cursor, InboxMessage, LoomError, Scope, WorkFilter, WorkOffer,
};
use loom_engine::{
    AgentSession, ClaimOutcome, CoordinationEngine, DiscoverQuery, ReadFilter, RegisterRequest,
};
use loom_ports::Substrate;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

/// The continuation token handed out by paged inbox reads
const CONTINUE_TOKEN: &str = "continue";

pub struct ToolRouter<S: Substrate> {
    engine: Arc<CoordinationEngine<S>>,
    session: AgentSession<S>,
    handle: Mutex<Option<String>>,
    /// Logs real-time inbox notifications while registered
    notifier: Mutex<Option<JoinHandle<()>>>,
}

impl<S: Substrate> ToolRouter<S> {
    pub fn new(engine: Arc<CoordinationEngine<S>>, stable_agent_id: Option<String>) -> Self {
        let session = engine.session(stable_agent_id);
        ToolRouter {
            engine,
            session,
            handle: Mutex::new(None),
            notifier: Mutex::new(None),
        }
    }

    /// Dispatch one tool call; never fails, errors become text.
    pub async fn dispatch(&self, tool: &str, args: &Value) -> String {
        match self.call(tool, args).await {
            Ok(text) => text,
            Err(e) => render_error(&e),
        }
    }

    /// Stop session loops on the way out.
    pub async fn shutdown(&self) {
        if let Err(e) = self.session.deregister().await {
            tracing::warn!(error = %e, "Deregistration during shutdown failed");
        }
        if let Some(notifier) = self.notifier.lock().await.take() {
            notifier.abort();
        }
    }

    async fn call(&self, tool: &str, args: &Value) -> Result<String, LoomError> {
        match tool {
            "handle_set" => self.handle_set(args).await,
            "handle_get" => self.handle_get().await,
            "channels_list" => self.channels_list(),
            "channels_send" => self.channels_send(args).await,
            "channels_read" => self.channels_read(args).await,
            "channels_status" => self.channels_status(args).await,
            "registry_register" => self.registry_register(args).await,
            "registry_get_info" => self.registry_get_info(args).await,
            "registry_discover" => self.registry_discover(args).await,
            "registry_update_presence" => self.registry_update_presence(args).await,
            "registry_deregister" => self.registry_deregister().await,
            "messages_send_direct" => self.messages_send_direct(args).await,
            "messages_read_direct" => self.messages_read_direct(args).await,
            "work_broadcast" => self.work_broadcast(args).await,
            "work_claim" => self.work_claim(args).await,
            "work_list" => self.work_list(args).await,
            "work_queue_status" => self.work_queue_status(args).await,
            "dlq_list" => self.dlq_list(args).await,
            "dlq_retry" => self.dlq_retry(args).await,
            "dlq_discard" => self.dlq_discard(args).await,
            other => Err(LoomError::validation(format!(
                "unknown tool {other:?}"
            ))),
        }
    }

    // -- handle ------------------------------------------------------------

    async fn handle_set(&self, args: &Value) -> Result<String, LoomError> {
        let handle = required_str(args, "handle")?;
        if !validate::is_handle(&handle) {
            return Err(LoomError::validation(format!(
                "handle {handle:?} must match ^[a-z0-9-]+$"
            )));
        }
        *self.handle.lock().await = Some(handle.clone());
        Ok(format!("Handle set to \"{handle}\"."))
    }

    async fn handle_get(&self) -> Result<String, LoomError> {
        Ok(match self.handle.lock().await.as_deref() {
            Some(handle) => format!("Your handle is \"{handle}\"."),
            None => "No handle set. Use handle_set to choose one.".to_string(),
        })
    }

    // -- channels ----------------------------------------------------------

    fn channels_list(&self) -> Result<String, LoomError> {
        let channels: Vec<Value> = self
            .engine
            .channels
            .list()
            .iter()
            .map(|c| {
                json!({
                    "name": c.name,
                    "description": c.description,
                    "retention": c.retention,
                })
            })
            .collect();
        pretty(&json!({ "channels": channels }))
    }

    async fn channels_send(&self, args: &Value) -> Result<String, LoomError> {
        let channel = required_str(args, "channel")?;
        let message = required_str(args, "message")?;
        if let Some(scope) = optional_str(args, "scope")? {
            // Channels are readable by anyone; the scope tag is advisory.
            Scope::parse(&scope)?;
        }
        let handle = self
            .handle
            .lock()
            .await
            .clone()
            .ok_or_else(|| LoomError::validation("no handle set; call handle_set first"))?;

        let sequence = self.engine.channels.send(&channel, &handle, &message).await?;
        Ok(format!("Sent to #{channel} (sequence {sequence})."))
    }

    async fn channels_read(&self, args: &Value) -> Result<String, LoomError> {
        let channel = required_str(args, "channel")?;
        let limit = optional_u64(args, "limit")?.unwrap_or(50).clamp(1, 1000) as usize;
        let offset = optional_u64(args, "offset")?.unwrap_or(0);

        let messages = self.engine.channels.read(&channel, limit, offset).await?;
        pretty(&json!({ "channel": channel, "messages": messages }))
    }

    async fn channels_status(&self, args: &Value) -> Result<String, LoomError> {
        let channel = optional_str(args, "channel")?;
        let statuses = self.engine.channels.status(channel.as_deref()).await?;
        let rows: Vec<Value> = statuses
            .iter()
            .map(|s| {
                json!({
                    "channel": s.name,
                    "messages": s.stats.messages,
                    "bytes": s.stats.bytes,
                    "firstSeq": s.stats.first_sequence,
                    "lastSeq": s.stats.last_sequence,
                })
            })
            .collect();
        pretty(&json!({ "channels": rows }))
    }

    // -- registry ----------------------------------------------------------

    async fn registry_register(&self, args: &Value) -> Result<String, LoomError> {
        let agent_type = required_str(args, "agentType")?;
        let capabilities = optional_str_vec(args, "capabilities")?.unwrap_or_default();
        let scope = match optional_str(args, "scope")? {
            Some(scope) => Scope::parse(&scope)?,
            None => Scope::default(),
        };

        let handle = match self.handle.lock().await.clone() {
            Some(handle) => handle,
            None => synthesize_handle(&agent_type),
        };

        let entry = self
            .session
            .register(RegisterRequest {
                agent_type,
                handle: handle.clone(),
                capabilities,
                scope,
            })
            .await?;
        self.handle.lock().await.get_or_insert(handle);
        self.start_notifier().await?;

        pretty(&json!({
            "registered": true,
            "agent": entry,
        }))
    }

    async fn start_notifier(&self) -> Result<(), LoomError> {
        let mut receiver = self.session.subscribe_inbox().await?;
        let task = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                log_notification(&message);
            }
        });
        if let Some(previous) = self.notifier.lock().await.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn requester(&self) -> Result<loom_domain::RegistryEntry, LoomError> {
        let guid = self.session.require_guid().await?;
        self.engine.registry.require(&guid).await
    }

    async fn registry_get_info(&self, args: &Value) -> Result<String, LoomError> {
        let guid = required_str(args, "guid")?;
        if !validate::is_uuid_v4(&guid) {
            return Err(LoomError::validation(format!(
                "guid {guid:?} is not a v4 UUID"
            )));
        }
        let requester = self.requester().await?;
        let Some(entry) = self.engine.registry.get(&guid).await? else {
            return Err(LoomError::not_found(format!("agent {guid}")));
        };
        // Invisible entries read as an empty record.
        match entry.redact_for(&requester) {
            Some(redacted) => pretty(&json!({ "agent": redacted })),
            None => pretty(&json!({ "agent": {} })),
        }
    }

    async fn registry_discover(&self, args: &Value) -> Result<String, LoomError> {
        let requester = self.requester().await?;
        let query = DiscoverQuery {
            agent_type: optional_str(args, "agentType")?,
            capability: optional_str(args, "capability")?,
            hostname: optional_str(args, "hostname")?,
            project_id: optional_str(args, "projectId")?,
            status: optional_str(args, "status")?
                .map(|s| AgentStatus::parse(&s))
                .transpose()?,
            scope: optional_str(args, "scope")?
                .map(|s| Scope::parse(&s))
                .transpose()?,
            include_offline: optional_bool(args, "includeOffline")?.unwrap_or(false),
            limit: optional_u64(args, "limit")?.map(|l| l.clamp(1, 100) as usize),
            cursor: optional_str(args, "cursor")?,
        };

        let page = self.engine.registry.discover(&requester, &query).await?;
        pretty(&json!({
            "agents": page.entries,
            "total": page.total,
            "cursor": page.next_cursor,
        }))
    }

    async fn registry_update_presence(&self, args: &Value) -> Result<String, LoomError> {
        let status = optional_str(args, "status")?
            .map(|s| AgentStatus::parse(&s))
            .transpose()?;
        let current_task_count =
            optional_u64(args, "currentTaskCount")?.map(|c| c.min(u32::MAX as u64) as u32);
        let capabilities = optional_str_vec(args, "capabilities")?;

        let entry = self
            .session
            .update_presence(status, current_task_count, capabilities)
            .await?;
        pretty(&json!({ "agent": entry }))
    }

    async fn registry_deregister(&self) -> Result<String, LoomError> {
        self.session.deregister().await?;
        if let Some(notifier) = self.notifier.lock().await.take() {
            notifier.abort();
        }
        Ok("Deregistered; status is offline and the heartbeat is stopped.".to_string())
    }

    // -- direct messages ---------------------------------------------------

    async fn messages_send_direct(&self, args: &Value) -> Result<String, LoomError> {
        let recipient_guid = required_str(args, "recipientGuid")?;
        let message = required_str(args, "message")?;
        let message_type =
            optional_str(args, "messageType")?.unwrap_or_else(|| "text".to_string());
        let metadata = optional_map(args, "metadata")?;

        let sender_guid = self.session.require_guid().await?;
        let receipt = self
            .engine
            .inbox
            .send_direct(&sender_guid, &recipient_guid, &message_type, &message, metadata)
            .await?;

        Ok(format!(
            "Message {} delivered to inbox; recipient is {}.",
            receipt.message_id,
            receipt.recipient_status.as_str()
        ))
    }

    async fn messages_read_direct(&self, args: &Value) -> Result<String, LoomError> {
        let limit = optional_u64(args, "limit")?.unwrap_or(10).clamp(1, 100) as usize;
        // The continuation token carries no position; reads are
        // consume-once and always resume at the front.
        let _ = optional_str(args, "cursor")?;
        let filter = ReadFilter {
            sender_guid: optional_str(args, "senderGuid")?,
            message_type: optional_str(args, "messageType")?,
        };

        let guid = self.session.require_guid().await?;
        let page = self.engine.inbox.read_direct(&guid, &filter, limit).await?;
        pretty(&json!({
            "messages": page.messages,
            "cursor": page.has_more.then_some(CONTINUE_TOKEN),
        }))
    }

    // -- work queue --------------------------------------------------------

    async fn work_broadcast(&self, args: &Value) -> Result<String, LoomError> {
        let offer = WorkOffer {
            task_id: required_str(args, "taskId")?,
            description: required_str(args, "description")?,
            capability: required_str(args, "requiredCapability")?,
            priority: match optional_u64(args, "priority")? {
                Some(p) if (1..=10).contains(&p) => p as u8,
                Some(p) => {
                    return Err(LoomError::validation(format!(
                        "priority {p} must be between 1 and 10"
                    )))
                }
                None => loom_domain::PRIORITY_DEFAULT,
            },
            deadline: optional_timestamp(args, "deadline")?,
            context_data: args.get("contextData").filter(|v| !v.is_null()).cloned(),
            scope: match optional_str(args, "scope")? {
                Some(scope) => Scope::parse(&scope)?,
                None => Scope::default(),
            },
        };

        let sender_guid = self.session.require_guid().await?;
        let item = self.engine.work_queue.broadcast(&sender_guid, offer).await?;
        pretty(&json!({ "offered": item }))
    }

    async fn work_claim(&self, args: &Value) -> Result<String, LoomError> {
        let capability = required_str(args, "capability")?;
        let timeout = optional_u64(args, "timeout")?
            .map(|ms| std::time::Duration::from_millis(ms.clamp(100, 30_000)));

        let guid = self.session.require_guid().await?;
        match self.engine.work_queue.claim(&guid, &capability, timeout).await? {
            ClaimOutcome::Claimed(item) => pretty(&json!({ "claimed": item })),
            ClaimOutcome::Empty => Ok(format!(
                "No work available for capability \"{capability}\"."
            )),
        }
    }

    async fn work_list(&self, args: &Value) -> Result<String, LoomError> {
        let capability = required_str(args, "capability")?;
        let limit = optional_u64(args, "limit")?.unwrap_or(50).clamp(1, 100) as usize;
        let filter = WorkFilter {
            min_priority: optional_priority(args, "minPriority")?,
            max_priority: optional_priority(args, "maxPriority")?,
            deadline_before: optional_timestamp(args, "deadlineBefore")?,
            deadline_after: optional_timestamp(args, "deadlineAfter")?,
        };

        let listing = self.engine.work_queue.list(&capability, &filter, limit).await?;
        pretty(&json!({
            "items": listing.items,
            "total": listing.total,
            "truncated": listing.truncated,
        }))
    }

    async fn work_queue_status(&self, args: &Value) -> Result<String, LoomError> {
        let capability = optional_str(args, "capability")?;
        let statuses = self.engine.work_queue.status(capability.as_deref()).await?;
        let rows: Vec<Value> = statuses
            .iter()
            .map(|s| {
                json!({
                    "stream": s.stream,
                    "messages": s.stats.messages,
                    "bytes": s.stats.bytes,
                    "firstSeq": s.stats.first_sequence,
                    "lastSeq": s.stats.last_sequence,
                })
            })
            .collect();
        pretty(&json!({ "queues": rows }))
    }

    // -- dead letters ------------------------------------------------------

    async fn dlq_list(&self, args: &Value) -> Result<String, LoomError> {
        let capability = optional_str(args, "capability")?;
        let fingerprint =
            loom_domain::filter_fingerprint(&[("capability", capability.as_deref())]);
        let (offset, limit) = match optional_str(args, "cursor")? {
            Some(token) => {
                let cursor = Cursor::decode_for(&token, &fingerprint)?;
                (cursor.offset, cursor.limit.clamp(1, 100))
            }
            None => (
                0,
                optional_u64(args, "limit")?.unwrap_or(50).clamp(1, 100) as usize,
            ),
        };

        let listing = self.engine.dlq.list(capability.as_deref(), offset, limit).await?;
        let next_offset = offset + listing.items.len();
        let cursor = (next_offset < listing.total)
            .then(|| Cursor::new(next_offset, limit, fingerprint).encode());

        pretty(&json!({
            "items": listing.items,
            "total": listing.total,
            "truncated": listing.truncated,
            "cursor": cursor,
        }))
    }

    async fn dlq_retry(&self, args: &Value) -> Result<String, LoomError> {
        let item_id = required_str(args, "itemId")?;
        let reset_attempts = optional_bool(args, "resetAttempts")?.unwrap_or(false);
        let item = self
            .engine
            .work_queue
            .retry_dead_letter(&item_id, reset_attempts)
            .await?;
        pretty(&json!({ "requeued": item }))
    }

    async fn dlq_discard(&self, args: &Value) -> Result<String, LoomError> {
        let item_id = required_str(args, "itemId")?;
        let record = self.engine.work_queue.discard_dead_letter(&item_id).await?;
        Ok(format!("Discarded dead-letter item {}.", record.id))
    }
}

fn log_notification(message: &InboxMessage) {
    info!(
        from = %message.sender_handle,
        message_type = %message.message_type,
        id = %message.id,
        "Inbox message received"
    );
}

fn render_error(e: &LoomError) -> String {
    match e {
        LoomError::Connection { .. } => format!(
            "Error: {e}. The substrate connection is retried automatically; try again shortly."
        ),
        LoomError::Internal { .. } => format!("Error: {e}. This is a bug worth reporting."),
        _ => format!("Error: {e}"),
    }
}

fn pretty(value: &Value) -> Result<String, LoomError> {
    serde_json::to_string_pretty(value).map_err(Into::into)
}

fn synthesize_handle(agent_type: &str) -> String {
    let mut base: String = agent_type
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    if base.is_empty() {
        base = "agent".to_string();
    }
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{base}-{}", &suffix[..4])
}

// -- argument extraction ----------------------------------------------------

fn required_str(args: &Value, name: &str) -> Result<String, LoomError> {
    optional_str(args, name)?.ok_or_else(|| {
        LoomError::validation(format!("missing required argument \"{name}\""))
    })
}

fn optional_str(args: &Value, name: &str) -> Result<Option<String>, LoomError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(LoomError::validation(format!(
            "argument \"{name}\" must be a string, got {other}"
        ))),
    }
}

fn optional_u64(args: &Value, name: &str) -> Result<Option<u64>, LoomError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
            LoomError::validation(format!(
                "argument \"{name}\" must be a non-negative integer"
            ))
        }),
        Some(other) => Err(LoomError::validation(format!(
            "argument \"{name}\" must be an integer, got {other}"
        ))),
    }
}

fn optional_bool(args: &Value, name: &str) -> Result<Option<bool>, LoomError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(other) => Err(LoomError::validation(format!(
            "argument \"{name}\" must be a boolean, got {other}"
        ))),
    }
}

fn optional_str_vec(args: &Value, name: &str) -> Result<Option<Vec<String>>, LoomError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(LoomError::validation(format!(
                    "argument \"{name}\" must be an array of strings, got {other}"
                ))),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some),
        Some(other) => Err(LoomError::validation(format!(
            "argument \"{name}\" must be an array, got {other}"
        ))),
    }
}

fn optional_map(args: &Value, name: &str) -> Result<Option<Map<String, Value>>, LoomError> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map.clone())),
        Some(other) => Err(LoomError::validation(format!(
            "argument \"{name}\" must be an object, got {other}"
        ))),
    }
}

fn optional_timestamp(args: &Value, name: &str) -> Result<Option<DateTime<Utc>>, LoomError> {
    match optional_str(args, name)? {
        None => Ok(None),
        Some(text) => DateTime::parse_from_rfc3339(&text)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|_| {
                LoomError::validation(format!(
                    "argument \"{name}\" must be an ISO-8601 timestamp, got {text:?}"
                ))
            }),
    }
}

fn optional_priority(args: &Value, name: &str) -> Result<Option<u8>, LoomError> {
    match optional_u64(args, name)? {
        None => Ok(None),
        Some(p) if (1..=10).contains(&p) => Ok(Some(p as u8)),
        Some(p) => Err(LoomError::validation(format!(
            "argument \"{name}\" is {p}; priorities run 1 to 10"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_adapters::MemorySubstrate;
    use loom_domain::ChannelDescriptor;
    use loom_engine::EngineConfig;

    async fn router() -> ToolRouter<MemorySubstrate> {
        let substrate = Arc::new(MemorySubstrate::new());
        let mut config = EngineConfig::for_project("0123456789abcdef", "/proj");
        config.channels = vec![ChannelDescriptor::new("general", "team chat")];
        config.inbox_fetch_timeout = std::time::Duration::from_millis(100);
        let engine = Arc::new(CoordinationEngine::new(substrate, config));
        engine.init().await.expect("init");
        ToolRouter::new(engine, None)
    }

    #[tokio::test]
    async fn test_handle_round_trip() {
        let router = router().await;
        assert!(router
            .dispatch("handle_get", &json!({}))
            .await
            .contains("No handle set"));

        let out = router
            .dispatch("handle_set", &json!({"handle": "builder-7"}))
            .await;
        assert_eq!(out, "Handle set to \"builder-7\".");
        assert!(router
            .dispatch("handle_get", &json!({}))
            .await
            .contains("builder-7"));

        let out = router
            .dispatch("handle_set", &json!({"handle": "Bad Handle"}))
            .await;
        assert!(out.starts_with("Error: "));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_an_error_payload() {
        let router = router().await;
        let out = router.dispatch("definitely_not_a_tool", &json!({})).await;
        assert!(out.starts_with("Error: "));
        assert!(out.contains("unknown tool"));
    }

    #[tokio::test]
    async fn test_register_then_discover() {
        let router = router().await;
        let out = router
            .dispatch(
                "registry_register",
                &json!({"agentType": "builder", "capabilities": ["rust"], "scope": "team"}),
            )
            .await;
        assert!(out.contains("\"registered\": true"), "got: {out}");

        let out = router
            .dispatch("registry_discover", &json!({"capability": "rust"}))
            .await;
        assert!(out.contains("\"total\": 1"), "got: {out}");
    }

    #[tokio::test]
    async fn test_channel_send_requires_handle() {
        let router = router().await;
        let out = router
            .dispatch(
                "channels_send",
                &json!({"channel": "general", "message": "hello"}),
            )
            .await;
        assert!(out.contains("handle_set"), "got: {out}");

        router
            .dispatch("handle_set", &json!({"handle": "builder-7"}))
            .await;
        let out = router
            .dispatch(
                "channels_send",
                &json!({"channel": "general", "message": "hello"}),
            )
            .await;
        assert!(out.starts_with("Sent to #general"), "got: {out}");

        let out = router
            .dispatch("channels_read", &json!({"channel": "general"}))
            .await;
        assert!(out.contains("hello"), "got: {out}");
        let out = router.dispatch("channels_status", &json!({})).await;
        assert!(out.contains("\"messages\": 1"), "got: {out}");
    }

    #[tokio::test]
    async fn test_messaging_flow_over_tools() {
        let sender = router().await;
        sender
            .dispatch("registry_register", &json!({"agentType": "sender"}))
            .await;

        // A second session against the same engine plays the recipient.
        let engine = sender.engine.clone();
        let recipient = ToolRouter::new(engine, None);
        let out = recipient
            .dispatch("registry_register", &json!({"agentType": "receiver"}))
            .await;
        let parsed: Value = serde_json::from_str(&out).expect("register payload");
        let guid = parsed["agent"]["guid"].as_str().expect("guid").to_string();

        let out = sender
            .dispatch(
                "messages_send_direct",
                &json!({"recipientGuid": guid, "message": "hi there"}),
            )
            .await;
        assert!(out.contains("delivered to inbox"), "got: {out}");

        let out = recipient.dispatch("messages_read_direct", &json!({})).await;
        assert!(out.contains("hi there"), "got: {out}");

        // Consume-once: the next read is empty.
        let out = recipient.dispatch("messages_read_direct", &json!({})).await;
        let parsed: Value = serde_json::from_str(&out).expect("read payload");
        assert_eq!(parsed["messages"].as_array().expect("array").len(), 0);
    }

    #[tokio::test]
    async fn test_work_flow_over_tools() {
        let router = router().await;
        router
            .dispatch(
                "registry_register",
                &json!({"agentType": "builder", "capabilities": ["typescript"]}),
            )
            .await;

        let out = router
            .dispatch(
                "work_broadcast",
                &json!({"taskId": "t", "description": "port it", "requiredCapability": "typescript", "priority": 8}),
            )
            .await;
        assert!(out.contains("\"offered\""), "got: {out}");

        let out = router
            .dispatch("work_list", &json!({"capability": "typescript"}))
            .await;
        assert!(out.contains("\"total\": 1"), "got: {out}");

        let out = router
            .dispatch(
                "work_claim",
                &json!({"capability": "typescript", "timeout": 500}),
            )
            .await;
        assert!(out.contains("\"claimed\""), "got: {out}");

        let out = router
            .dispatch(
                "work_claim",
                &json!({"capability": "typescript", "timeout": 150}),
            )
            .await;
        assert!(out.contains("No work available"), "got: {out}");
    }

    #[tokio::test]
    async fn test_work_broadcast_validates_priority() {
        let router = router().await;
        router
            .dispatch("registry_register", &json!({"agentType": "builder"}))
            .await;
        let out = router
            .dispatch(
                "work_broadcast",
                &json!({"taskId": "t", "description": "d", "requiredCapability": "rust", "priority": 11}),
            )
            .await;
        assert!(out.starts_with("Error: "), "got: {out}");
        assert!(out.contains("between 1 and 10"), "got: {out}");
    }

    #[tokio::test]
    async fn test_dlq_tools_validate_ids() {
        let router = router().await;
        let out = router
            .dispatch("dlq_retry", &json!({"itemId": "nope"}))
            .await;
        assert!(out.starts_with("Error: "), "got: {out}");

        let out = router.dispatch("dlq_list", &json!({})).await;
        assert!(out.contains("\"total\": 0"), "got: {out}");
    }

    #[tokio::test]
    async fn test_tools_require_registration() {
        let router = router().await;
        for (tool, args) in [
            ("messages_read_direct", json!({})),
            ("registry_discover", json!({})),
            (
                "work_claim",
                json!({"capability": "rust", "timeout": 200}),
            ),
        ] {
            let out = router.dispatch(tool, &args).await;
            assert!(
                out.contains("registry_register"),
                "{tool} should demand registration, got: {out}"
            );
        }
    }
}
