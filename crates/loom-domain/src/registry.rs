//! Agent registry entries
//!
//! A `RegistryEntry` is the directory record for one registered agent.
//! Scope governs who can discover the entry and which fields they see:
//! - `private`: visible only to the agent itself
//! - `personal`: visible to entries sharing a non-empty username
//! - `team`: visible to entries in the same project
//! - `public`: visible to everyone
//!
//! Redaction is derived from visibility; a requester that cannot see an
//! entry gets nothing at all, never a partial record.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LoomError;
use crate::validate;

/// Visibility domain for a registry entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Private,
    Personal,
    Team,
    Public,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Private => "private",
            Scope::Personal => "personal",
            Scope::Team => "team",
            Scope::Public => "public",
        }
    }

    pub fn parse(s: &str) -> Result<Self, LoomError> {
        match s {
            "private" => Ok(Scope::Private),
            "personal" => Ok(Scope::Personal),
            "team" => Ok(Scope::Team),
            "public" => Ok(Scope::Public),
            other => Err(LoomError::validation(format!(
                "invalid scope {other:?}: expected private, personal, team, or public"
            ))),
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::Team
    }
}

/// Presence state of a registered agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Busy,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Busy => "busy",
            AgentStatus::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Result<Self, LoomError> {
        match s {
            "online" => Ok(AgentStatus::Online),
            "busy" => Ok(AgentStatus::Busy),
            "offline" => Ok(AgentStatus::Offline),
            other => Err(LoomError::validation(format!(
                "invalid status {other:?}: expected online, busy, or offline"
            ))),
        }
    }
}

/// Directory record for one registered agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    /// v4 UUID identifying this registration
    pub guid: String,
    /// Free-form agent kind, e.g. "backend", "reviewer"
    pub agent_type: String,
    /// Human-facing name, `^[a-z0-9-]+$`
    pub handle: String,
    pub hostname: String,
    /// 16 lowercase hex characters scoping team visibility
    pub project_id: String,
    pub nats_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Advertised capability tags; duplicates are tolerated, membership is
    /// what matters
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub scope: Scope,
    pub status: AgentStatus,
    pub current_task_count: u32,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl RegistryEntry {
    /// Check every field invariant. Entries created by the engine always
    /// pass; entries decoded from storage are re-checked before use.
    pub fn validate(&self) -> Result<(), LoomError> {
        if !validate::is_uuid_v4(&self.guid) {
            return Err(LoomError::validation(format!(
                "guid {:?} is not a v4 UUID",
                self.guid
            )));
        }
        if !validate::is_present(&self.agent_type) {
            return Err(LoomError::validation("agentType must not be empty"));
        }
        if !validate::is_present(&self.handle) {
            return Err(LoomError::validation("handle must not be empty"));
        }
        if !validate::is_handle(&self.handle) {
            return Err(LoomError::validation(format!(
                "handle {:?} must match ^[a-z0-9-]+$",
                self.handle
            )));
        }
        if !validate::is_present(&self.hostname) {
            return Err(LoomError::validation("hostname must not be empty"));
        }
        if !validate::is_project_id(&self.project_id) {
            return Err(LoomError::validation(format!(
                "projectId {:?} must be 16 lowercase hex characters",
                self.project_id
            )));
        }
        if !self.nats_url.starts_with("nats://") {
            return Err(LoomError::validation(format!(
                "natsUrl {:?} must begin with nats://",
                self.nats_url
            )));
        }
        if self.capabilities.iter().any(|c| !validate::is_present(c)) {
            return Err(LoomError::validation(
                "capabilities must be non-empty strings",
            ));
        }
        Ok(())
    }

    /// Set-membership check over the advertised capability tags.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    /// Strictly older than `threshold`; a heartbeat exactly `threshold` old
    /// is not stale.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now - self.last_heartbeat > threshold
    }

    /// Whether `requester` may discover this entry at all.
    pub fn is_visible_to(&self, requester: &RegistryEntry) -> bool {
        match self.scope {
            Scope::Private => self.guid == requester.guid,
            Scope::Personal => match (&self.username, &requester.username) {
                (Some(a), Some(b)) => !a.is_empty() && a == b,
                _ => false,
            },
            Scope::Team => self.project_id == requester.project_id,
            Scope::Public => true,
        }
    }

    /// Project the entry down to what `requester` is allowed to see.
    ///
    /// `None` when the entry is not visible at all. The owner sees the whole
    /// record; everyone else gets the public core plus location fields
    /// gated on project membership. `registeredAt` never leaves the owner.
    pub fn redact_for(&self, requester: &RegistryEntry) -> Option<RedactedEntry> {
        if !self.is_visible_to(requester) {
            return None;
        }
        if self.guid == requester.guid {
            return Some(RedactedEntry {
                guid: self.guid.clone(),
                agent_type: self.agent_type.clone(),
                handle: self.handle.clone(),
                capabilities: self.capabilities.clone(),
                scope: self.scope,
                status: self.status,
                current_task_count: self.current_task_count,
                last_heartbeat: self.last_heartbeat,
                project_id: Some(self.project_id.clone()),
                nats_url: Some(self.nats_url.clone()),
                hostname: Some(self.hostname.clone()),
                username: self.username.clone(),
                registered_at: Some(self.registered_at),
            });
        }

        let same_project = self.project_id == requester.project_id;
        let usernames_match = matches!(
            (&self.username, &requester.username),
            (Some(a), Some(b)) if !a.is_empty() && a == b
        );

        Some(RedactedEntry {
            guid: self.guid.clone(),
            agent_type: self.agent_type.clone(),
            handle: self.handle.clone(),
            capabilities: self.capabilities.clone(),
            scope: self.scope,
            status: self.status,
            current_task_count: self.current_task_count,
            last_heartbeat: self.last_heartbeat,
            project_id: same_project.then(|| self.project_id.clone()),
            nats_url: same_project.then(|| self.nats_url.clone()),
            hostname: (same_project || self.scope == Scope::Public)
                .then(|| self.hostname.clone()),
            username: (self.scope == Scope::Personal && usernames_match)
                .then(|| self.username.clone())
                .flatten(),
            registered_at: None,
        })
    }
}

/// A registry entry as seen by somebody other than (or including) its owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedactedEntry {
    pub guid: String,
    pub agent_type: String,
    pub handle: String,
    pub capabilities: Vec<String>,
    pub scope: Scope,
    pub status: AgentStatus,
    pub current_task_count: u32,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nats_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(guid: &str, project: &str, scope: Scope) -> RegistryEntry {
        RegistryEntry {
            guid: guid.to_string(),
            agent_type: "worker".to_string(),
            handle: "worker-1".to_string(),
            hostname: "host-a".to_string(),
            project_id: project.to_string(),
            nats_url: "nats://localhost:4222".to_string(),
            username: None,
            capabilities: vec!["rust".to_string()],
            scope,
            status: AgentStatus::Online,
            current_task_count: 0,
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
        }
    }

    const GUID_A: &str = "6c84fb90-12c4-4a1c-8e2b-2d0a3c7b9f10";
    const GUID_B: &str = "2f1e4d3c-5b6a-4798-8c9d-0e1f2a3b4c5d";
    const PROJECT: &str = "0123456789abcdef";
    const OTHER_PROJECT: &str = "fedcba9876543210";

    #[test]
    fn test_valid_entry_passes() {
        assert!(entry(GUID_A, PROJECT, Scope::Team).validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_fields() {
        let mut e = entry(GUID_A, PROJECT, Scope::Team);
        e.guid = "nope".to_string();
        assert!(e.validate().is_err());

        let mut e = entry(GUID_A, PROJECT, Scope::Team);
        e.handle = "Worker_1".to_string();
        assert!(e.validate().is_err());

        let mut e = entry(GUID_A, PROJECT, Scope::Team);
        e.project_id = "ABCDEF0123456789".to_string();
        assert!(e.validate().is_err());

        let mut e = entry(GUID_A, PROJECT, Scope::Team);
        e.nats_url = "tcp://localhost:4222".to_string();
        assert!(e.validate().is_err());

        let mut e = entry(GUID_A, PROJECT, Scope::Team);
        e.capabilities = vec!["rust".to_string(), "  ".to_string()];
        assert!(e.validate().is_err());

        let mut e = entry(GUID_A, PROJECT, Scope::Team);
        e.agent_type = "  ".to_string();
        assert!(e.validate().is_err());
    }

    #[test]
    fn test_private_visible_only_to_self() {
        let e = entry(GUID_A, PROJECT, Scope::Private);
        let me = entry(GUID_A, PROJECT, Scope::Team);
        let peer = entry(GUID_B, PROJECT, Scope::Team);
        assert!(e.is_visible_to(&me));
        assert!(!e.is_visible_to(&peer));
    }

    #[test]
    fn test_team_visible_iff_same_project() {
        let e = entry(GUID_A, PROJECT, Scope::Team);
        let teammate = entry(GUID_B, PROJECT, Scope::Team);
        let outsider = entry(GUID_B, OTHER_PROJECT, Scope::Team);
        assert!(e.is_visible_to(&teammate));
        assert!(!e.is_visible_to(&outsider));
    }

    #[test]
    fn test_personal_requires_matching_usernames() {
        let mut e = entry(GUID_A, PROJECT, Scope::Personal);
        let mut peer = entry(GUID_B, OTHER_PROJECT, Scope::Team);
        assert!(!e.is_visible_to(&peer));

        e.username = Some("ada".to_string());
        assert!(!e.is_visible_to(&peer));

        peer.username = Some("ada".to_string());
        assert!(e.is_visible_to(&peer));

        peer.username = Some("grace".to_string());
        assert!(!e.is_visible_to(&peer));
    }

    #[test]
    fn test_public_visible_to_all() {
        let e = entry(GUID_A, PROJECT, Scope::Public);
        let outsider = entry(GUID_B, OTHER_PROJECT, Scope::Team);
        assert!(e.is_visible_to(&outsider));
    }

    #[test]
    fn test_visibility_iff_redaction_nonempty() {
        let scopes = [Scope::Private, Scope::Personal, Scope::Team, Scope::Public];
        for scope in scopes {
            let e = entry(GUID_A, PROJECT, scope);
            for requester in [
                entry(GUID_A, PROJECT, Scope::Team),
                entry(GUID_B, PROJECT, Scope::Team),
                entry(GUID_B, OTHER_PROJECT, Scope::Team),
            ] {
                assert_eq!(
                    e.is_visible_to(&requester),
                    e.redact_for(&requester).is_some(),
                    "scope {scope:?} requester {}",
                    requester.guid
                );
            }
        }
    }

    #[test]
    fn test_owner_sees_whole_entry() {
        let e = entry(GUID_A, PROJECT, Scope::Private);
        let me = entry(GUID_A, PROJECT, Scope::Team);
        let r = e.redact_for(&me).expect("visible to self");
        assert!(r.registered_at.is_some());
        assert_eq!(r.nats_url.as_deref(), Some("nats://localhost:4222"));
        assert_eq!(r.hostname.as_deref(), Some("host-a"));
    }

    #[test]
    fn test_same_project_peer_sees_location_but_not_registered_at() {
        let e = entry(GUID_A, PROJECT, Scope::Team);
        let peer = entry(GUID_B, PROJECT, Scope::Team);
        let r = e.redact_for(&peer).expect("teammate visible");
        assert_eq!(r.project_id.as_deref(), Some(PROJECT));
        assert!(r.nats_url.is_some());
        assert!(r.hostname.is_some());
        assert!(r.registered_at.is_none());
        assert!(r.username.is_none());
    }

    #[test]
    fn test_public_cross_project_exposes_hostname_only() {
        let e = entry(GUID_A, PROJECT, Scope::Public);
        let outsider = entry(GUID_B, OTHER_PROJECT, Scope::Team);
        let r = e.redact_for(&outsider).expect("public visible");
        assert!(r.hostname.is_some());
        assert!(r.project_id.is_none());
        assert!(r.nats_url.is_none());
        assert!(r.registered_at.is_none());
    }

    #[test]
    fn test_staleness_is_strict() {
        let mut e = entry(GUID_A, PROJECT, Scope::Team);
        let now = Utc::now();
        let threshold = Duration::milliseconds(180_000);

        e.last_heartbeat = now - threshold;
        assert!(!e.is_stale(now, threshold));

        e.last_heartbeat = now - threshold - Duration::milliseconds(1);
        assert!(e.is_stale(now, threshold));
    }

    #[test]
    fn test_capability_membership_tolerates_duplicates() {
        let mut e = entry(GUID_A, PROJECT, Scope::Team);
        e.capabilities = vec!["rust".to_string(), "rust".to_string()];
        assert!(e.has_capability("rust"));
        assert!(!e.has_capability("go"));
    }

    #[test]
    fn test_entry_round_trips_through_json() {
        let e = entry(GUID_A, PROJECT, Scope::Team);
        let json = serde_json::to_string(&e).expect("serialize");
        assert!(json.contains("\"agentType\""));
        assert!(json.contains("\"lastHeartbeat\""));
        let back: RegistryEntry = serde_json::from_str(&json).expect("parse");
        assert_eq!(back, e);
        assert!(back.validate().is_ok());
    }
}
