//! Agent identities
//!
//! A root identity is pinned to (hostname, project path); a subagent
//! identity is pinned to (parent id, subagent type). Both derive a stable
//! 32-hex agent id from SHA-256 over their inputs, so the same process on
//! the same host and project rehydrates the same id across restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Builder;

use crate::error::LoomError;

/// Persisted identity record, keyed `root` or `subagent/<type>` in the
/// per-project identity bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Identity {
    #[serde(rename = "root", rename_all = "camelCase")]
    Root {
        agent_id: String,
        hostname: String,
        project_path: String,
        created_at: DateTime<Utc>,
    },
    #[serde(rename = "subagent", rename_all = "camelCase")]
    Subagent {
        agent_id: String,
        parent_id: String,
        subagent_type: String,
        created_at: DateTime<Utc>,
    },
}

impl Identity {
    pub fn root(agent_id: String, hostname: String, project_path: String) -> Self {
        Identity::Root {
            agent_id,
            hostname,
            project_path,
            created_at: Utc::now(),
        }
    }

    pub fn subagent(agent_id: String, parent_id: String, subagent_type: String) -> Self {
        Identity::Subagent {
            agent_id,
            parent_id,
            subagent_type,
            created_at: Utc::now(),
        }
    }

    pub fn agent_id(&self) -> &str {
        match self {
            Identity::Root { agent_id, .. } => agent_id,
            Identity::Subagent { agent_id, .. } => agent_id,
        }
    }

    pub fn hostname(&self) -> Option<&str> {
        match self {
            Identity::Root { hostname, .. } => Some(hostname),
            Identity::Subagent { .. } => None,
        }
    }
}

fn truncated_sha256(input: &[u8], hex_len: usize) -> String {
    let digest = Sha256::digest(input);
    let mut out = hex::encode(digest);
    out.truncate(hex_len);
    out
}

/// First 32 hex of SHA-256(hostname || projectPath).
pub fn derive_root_id(hostname: &str, project_path: &str) -> String {
    truncated_sha256(format!("{hostname}{project_path}").as_bytes(), 32)
}

/// First 32 hex of SHA-256(parentId || subagentType).
pub fn derive_subagent_id(parent_id: &str, subagent_type: &str) -> String {
    truncated_sha256(format!("{parent_id}{subagent_type}").as_bytes(), 32)
}

/// First 16 hex of SHA-256(projectPath). Used for both the project id and
/// the default channel namespace.
pub fn derive_project_id(project_path: &str) -> String {
    truncated_sha256(project_path.as_bytes(), 16)
}

/// Re-express a 32-hex agent id as a v4 UUID.
///
/// The 16 id bytes are loaded into a UUID with the version and variant
/// bits forced, so the result is deterministic for a given agent id while
/// still passing strict v4 validation.
pub fn guid_from_agent_id(agent_id: &str) -> Result<String, LoomError> {
    let bytes = hex::decode(agent_id).map_err(|_| {
        LoomError::validation(format!("agent id {agent_id:?} is not 32 hex characters"))
    })?;
    let arr: [u8; 16] = bytes.as_slice().try_into().map_err(|_| {
        LoomError::validation(format!("agent id {agent_id:?} is not 32 hex characters"))
    })?;
    Ok(Builder::from_random_bytes(arr).into_uuid().to_string())
}
