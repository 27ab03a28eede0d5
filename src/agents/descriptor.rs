//! `AgentDescriptor` — identity and capabilities of a running agent.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::capabilities::{AgentKind, Capabilities};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub agent_id: String,
    pub agent_kind: AgentKind,
    pub capabilities: Capabilities,
    /// Opaque address consumed only by the proxy layer.
    pub endpoint: String,
    pub load: u32,
    pub last_heartbeat: DateTime<Utc>,
}

impl AgentDescriptor {
    pub fn is_stale(&self, ttl: chrono::Duration, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_heartbeat) > ttl
    }
}
