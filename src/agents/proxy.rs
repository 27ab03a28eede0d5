//! `AgentProxy` — the uniform contract the core speaks to every concrete
//! agent implementation through.
//!
//! Concrete adapters (the input parser, world builder, narrative generator,
//! safety classifier) live outside this crate; this module only defines the
//! seam and an in-memory test double used by the integration tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::capabilities::{AgentKind, Capabilities};
use crate::types::{AgentRequest, AgentResponse};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProxyError {
    #[error("call timed out")]
    Timeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("upstream returned an error response")]
    UpstreamError,
    #[error("upstream is rate-limiting calls")]
    RateLimited,
    /// Intentional rejection (4xx-equivalent) — does not trip the breaker.
    #[error("request rejected: {0}")]
    Rejected(String),
}

impl ProxyError {
    /// Whether this failure counts toward the circuit breaker's failure
    /// count.
    pub fn trips_breaker(&self) -> bool {
        !matches!(self, ProxyError::Rejected(_))
    }
}

/// Three operations every agent adapter satisfies.
#[async_trait]
pub trait AgentProxy: Send + Sync {
    fn agent_id(&self) -> &str;

    /// Capability tags used for registration.
    fn describe(&self) -> (AgentKind, Capabilities);

    async fn invoke(&self, request: &AgentRequest, deadline: DateTime<Utc>) -> Result<AgentResponse, ProxyError>;

    /// Cheap liveness probe used by the circuit breaker's half-open probe.
    async fn health(&self) -> Result<(), ProxyError>;
}
