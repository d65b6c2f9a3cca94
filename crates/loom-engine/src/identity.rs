//! Identity service
//!
//! Persists identities in the per-project bucket `loom-identity-<projectId>`
//! (history 1, no TTL) under the keys `root` and `subagent/<type>`, so the
//! same process on the same host and project rehydrates the same agent id
//! across restarts.

use std::sync::Arc;

use loom_domain::{
    derive_root_id, derive_subagent_id, Identity, LoomError,
};
use loom_ports::Substrate;
use tracing::{debug, info};

/// Environment-driven overrides, injected as a value so tests never touch
/// process environment
#[derive(Debug, Clone, Default)]
pub struct IdentityOverrides {
    /// Forces the root agent id verbatim
    pub explicit_agent_id: Option<String>,
    /// Marks this process as a subagent of the stored root identity
    pub subagent_type: Option<String>,
}

impl IdentityOverrides {
    pub fn from_env() -> Self {
        IdentityOverrides {
            explicit_agent_id: std::env::var("LOOM_AGENT_ID").ok().filter(|s| !s.is_empty()),
            subagent_type: std::env::var("LOOM_SUBAGENT_TYPE")
                .ok()
                .filter(|s| !s.is_empty()),
        }
    }
}

pub fn identity_bucket(project_id: &str) -> String {
    format!("loom-identity-{project_id}")
}

fn subagent_key(subagent_type: &str) -> String {
    format!("subagent/{subagent_type}")
}

pub struct IdentityService<S: Substrate> {
    substrate: Arc<S>,
}

impl<S: Substrate> IdentityService<S> {
    pub fn new(substrate: Arc<S>) -> Self {
        IdentityService { substrate }
    }

    /// Resolve this process's identity.
    ///
    /// Order: explicit id override; then subagent derivation (which
    /// requires a stored root identity); then a stored root identity with
    /// a matching hostname; then a freshly derived root identity.
    pub async fn initialize(
        &self,
        project_id: &str,
        project_path: &str,
        overrides: &IdentityOverrides,
    ) -> Result<Identity, LoomError> {
        let bucket = identity_bucket(project_id);
        self.substrate.ensure_bucket(&bucket, 1, None).await?;
        let host = current_hostname();

        if let Some(explicit) = &overrides.explicit_agent_id {
            let identity =
                Identity::root(explicit.clone(), host.clone(), project_path.to_string());
            self.store(&bucket, "root", &identity).await?;
            info!(agent_id = %explicit, "Using explicit agent id");
            return Ok(identity);
        }

        if let Some(subagent_type) = &overrides.subagent_type {
            let root = self
                .load(&bucket, "root")
                .await?
                .ok_or_else(|| LoomError::not_found("root identity for subagent derivation"))?;
            let agent_id = derive_subagent_id(root.agent_id(), subagent_type);
            let identity = Identity::subagent(
                agent_id,
                root.agent_id().to_string(),
                subagent_type.clone(),
            );
            self.store(&bucket, &subagent_key(subagent_type), &identity)
                .await?;
            info!(subagent_type = %subagent_type, agent_id = %identity.agent_id(), "Derived subagent identity");
            return Ok(identity);
        }

        if let Some(existing) = self.load(&bucket, "root").await? {
            if existing.hostname() == Some(host.as_str()) {
                debug!(agent_id = %existing.agent_id(), "Rehydrated root identity");
                return Ok(existing);
            }
            debug!(
                stored = ?existing.hostname(),
                current = %host,
                "Stored identity belongs to a different host; deriving fresh"
            );
        }

        let agent_id = derive_root_id(&host, project_path);
        let identity = Identity::root(agent_id, host, project_path.to_string());
        self.store(&bucket, "root", &identity).await?;
        info!(agent_id = %identity.agent_id(), "Derived root identity");
        Ok(identity)
    }

    async fn load(&self, bucket: &str, key: &str) -> Result<Option<Identity>, LoomError> {
        let Some(bytes) = self.substrate.kv_get(bucket, key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(identity) => Ok(Some(identity)),
            Err(e) => Err(LoomError::internal(format!(
                "stored identity {bucket}/{key} is unreadable: {e}"
            ))),
        }
    }

    async fn store(&self, bucket: &str, key: &str, identity: &Identity) -> Result<(), LoomError> {
        let bytes = serde_json::to_vec(identity)?;
        self.substrate.kv_put(bucket, key, bytes).await?;
        Ok(())
    }
}

pub fn current_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string())
}
