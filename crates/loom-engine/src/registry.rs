//! KV-backed agent directory
//!
//! One global bucket, key = guid, value = the JSON registry entry. The
//! registry is the single writer for entries; the heartbeat loop for an
//! agent is the only writer of that entry's `lastHeartbeat` (GC may write
//! `status = offline`). The registry holds no per-connection state.

use std::sync::Arc;

use chrono::Utc;
use loom_domain::{
    filter_fingerprint, guid_from_agent_id, AgentStatus, Cursor, LoomError, RedactedEntry,
    RegistryEntry, Scope,
};
use loom_ports::Substrate;
use tracing::{debug, warn};
use uuid::Uuid;

pub const REGISTRY_BUCKET: &str = "loom-registry";

pub const DISCOVER_LIMIT_MAX: usize = 100;
pub const DISCOVER_LIMIT_DEFAULT: usize = 50;

pub struct Registry<S: Substrate> {
    substrate: Arc<S>,
}

impl<S: Substrate> Clone for Registry<S> {
    fn clone(&self) -> Self {
        Registry {
            substrate: self.substrate.clone(),
        }
    }
}

/// Parameters for creating (or refreshing) a registration
#[derive(Debug, Clone)]
pub struct RegisterParams {
    pub agent_type: String,
    pub handle: String,
    pub hostname: String,
    pub project_id: String,
    pub nats_url: String,
    pub username: Option<String>,
    pub capabilities: Vec<String>,
    pub scope: Scope,
    /// Stable 32-hex agent id from the identity service, when available
    pub stable_agent_id: Option<String>,
}

/// Equality filters for discovery
#[derive(Debug, Clone, Default)]
pub struct DiscoverQuery {
    pub agent_type: Option<String>,
    pub capability: Option<String>,
    pub hostname: Option<String>,
    pub project_id: Option<String>,
    pub status: Option<AgentStatus>,
    pub scope: Option<Scope>,
    pub include_offline: bool,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}

impl DiscoverQuery {
    fn fingerprint(&self) -> String {
        filter_fingerprint(&[
            ("agentType", self.agent_type.as_deref()),
            ("capability", self.capability.as_deref()),
            ("hostname", self.hostname.as_deref()),
            ("projectId", self.project_id.as_deref()),
            ("status", self.status.map(|s| s.as_str())),
            ("scope", self.scope.map(|s| s.as_str())),
            (
                "includeOffline",
                Some(if self.include_offline { "true" } else { "false" }),
            ),
        ])
    }

    fn matches(&self, entry: &RegistryEntry) -> bool {
        if let Some(agent_type) = &self.agent_type {
            if &entry.agent_type != agent_type {
                return false;
            }
        }
        if let Some(capability) = &self.capability {
            if !entry.has_capability(capability) {
                return false;
            }
        }
        if let Some(hostname) = &self.hostname {
            if &entry.hostname != hostname {
                return false;
            }
        }
        if let Some(project_id) = &self.project_id {
            if &entry.project_id != project_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if entry.status != status {
                return false;
            }
        }
        if let Some(scope) = self.scope {
            if entry.scope != scope {
                return false;
            }
        }
        true
    }
}

/// One page of discovery results
#[derive(Debug, Clone)]
pub struct DiscoverPage {
    pub entries: Vec<RedactedEntry>,
    /// Matching entries across all pages
    pub total: usize,
    pub next_cursor: Option<String>,
}

impl<S: Substrate> Registry<S> {
    pub fn new(substrate: Arc<S>) -> Self {
        Registry { substrate }
    }

    pub async fn init(&self) -> Result<(), LoomError> {
        self.substrate.ensure_bucket(REGISTRY_BUCKET, 1, None).await?;
        Ok(())
    }

    /// Create a registration. Prefers the identity-derived guid; without
    /// one, reuses an existing offline entry on the same host, project,
    /// and agent type before minting a fresh guid.
    pub async fn register(&self, params: RegisterParams) -> Result<RegistryEntry, LoomError> {
        let guid = match &params.stable_agent_id {
            Some(agent_id) => guid_from_agent_id(agent_id)?,
            None => match self.find_reusable(&params).await? {
                Some(guid) => guid,
                None => Uuid::new_v4().to_string(),
            },
        };

        let now = Utc::now();
        let entry = RegistryEntry {
            guid,
            agent_type: params.agent_type,
            handle: params.handle,
            hostname: params.hostname,
            project_id: params.project_id,
            nats_url: params.nats_url,
            username: params.username,
            capabilities: params.capabilities,
            scope: params.scope,
            status: AgentStatus::Online,
            current_task_count: 0,
            registered_at: now,
            last_heartbeat: now,
        };
        self.put(&entry).await?;
        Ok(entry)
    }

    async fn find_reusable(&self, params: &RegisterParams) -> Result<Option<String>, LoomError> {
        let entries = self.list().await?;
        Ok(entries
            .into_iter()
            .find(|e| {
                e.status == AgentStatus::Offline
                    && e.hostname == params.hostname
                    && e.project_id == params.project_id
                    && e.agent_type == params.agent_type
            })
            .map(|e| {
                debug!(guid = %e.guid, "Reusing offline registration");
                e.guid
            }))
    }

    pub async fn put(&self, entry: &RegistryEntry) -> Result<(), LoomError> {
        entry.validate()?;
        let bytes = serde_json::to_vec(entry)?;
        self.substrate
            .kv_put(REGISTRY_BUCKET, &entry.guid, bytes)
            .await?;
        Ok(())
    }

    pub async fn get(&self, guid: &str) -> Result<Option<RegistryEntry>, LoomError> {
        let Some(bytes) = self.substrate.kv_get(REGISTRY_BUCKET, guid).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(guid, error = %e, "Unreadable registry entry");
                Ok(None)
            }
        }
    }

    /// Like `get`, but an absent entry is an error the caller can surface.
    pub async fn require(&self, guid: &str) -> Result<RegistryEntry, LoomError> {
        self.get(guid)
            .await?
            .ok_or_else(|| LoomError::not_found(format!("agent {guid}")))
    }

    pub async fn list(&self) -> Result<Vec<RegistryEntry>, LoomError> {
        let keys = self.substrate.kv_keys(REGISTRY_BUCKET).await?;
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.get(&key).await? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub async fn delete(&self, guid: &str) -> Result<(), LoomError> {
        self.substrate.kv_delete(REGISTRY_BUCKET, guid).await?;
        Ok(())
    }

    /// Scope-aware, paginated discovery sorted by freshest heartbeat.
    pub async fn discover(
        &self,
        requester: &RegistryEntry,
        query: &DiscoverQuery,
    ) -> Result<DiscoverPage, LoomError> {
        let fingerprint = query.fingerprint();
        let (offset, limit) = match &query.cursor {
            Some(token) => {
                let cursor = Cursor::decode_for(token, &fingerprint)?;
                (cursor.offset, cursor.limit.clamp(1, DISCOVER_LIMIT_MAX))
            }
            None => (
                0,
                query
                    .limit
                    .unwrap_or(DISCOVER_LIMIT_DEFAULT)
                    .clamp(1, DISCOVER_LIMIT_MAX),
            ),
        };

        let show_offline = query.include_offline || query.status == Some(AgentStatus::Offline);

        let mut matches: Vec<RegistryEntry> = self
            .list()
            .await?
            .into_iter()
            .filter(|e| e.is_visible_to(requester))
            .filter(|e| show_offline || e.status != AgentStatus::Offline)
            .filter(|e| query.matches(e))
            .collect();
        matches.sort_by(|a, b| b.last_heartbeat.cmp(&a.last_heartbeat));

        let total = matches.len();
        let page: Vec<RedactedEntry> = matches
            .into_iter()
            .skip(offset)
            .take(limit)
            .filter_map(|e| e.redact_for(requester))
            .collect();

        let next_offset = offset + limit;
        let next_cursor = (next_offset < total)
            .then(|| Cursor::new(next_offset, limit, fingerprint).encode());

        Ok(DiscoverPage {
            entries: page,
            total,
            next_cursor,
        })
    }
}
