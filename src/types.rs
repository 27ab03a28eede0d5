//! Shared wire/data types referenced across components.
//!
//! Kept in one module because `AgentRequest`/`AgentResponse`/`SafetyReport`
//! cross the router/safety/orchestrator boundary as plain data — none of
//! those components own these types exclusively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SafetyMode {
    Normal,
    Strict,
    CrisisBypass,
}

/// A single routed call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRequest {
    /// Idempotency key.
    pub request_id: String,
    pub conversation_id: String,
    pub agent_kind: crate::agents::AgentKind,
    pub payload: Value,
    pub deadline: DateTime<Utc>,
    pub safety_mode: SafetyMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Ok,
    Rejected,
    Transformed,
    Failed,
}

/// Outcome of a routed call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub request_id: String,
    pub status: ResponseStatus,
    pub payload: Value,
    pub safety_report: Option<SafetyReport>,
    pub elapsed: std::time::Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Pass,
    Warn,
    Block,
    Crisis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// A single rule match within a `SafetyReport`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub rule_id: String,
    pub severity: Severity,
    /// Byte range within the payload the rule matched, or the whole payload.
    pub span: Span,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Span {
    Whole,
    Range { start: usize, end: usize },
}

/// Validation outcome for one payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyReport {
    pub verdict: Verdict,
    pub findings: Vec<Finding>,
    /// Present only when `verdict == Warn` and a rewrite was applied.
    pub transformed_payload: Option<Value>,
}

impl SafetyReport {
    pub fn pass() -> Self {
        Self {
            verdict: Verdict::Pass,
            findings: Vec::new(),
            transformed_payload: None,
        }
    }
}

/// An immutable record broadcast to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub topic: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    pub owner_id: String,
}

/// A connected client's interest filter.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub connection_id: String,
    pub owner_id: String,
    pub topics: Vec<String>,
    pub since: Option<u64>,
}
