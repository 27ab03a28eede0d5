//! Client↔server WebSocket frame types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::SafetyMode;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Hello { owner_id: String, token: String },
    Subscribe { topics: Vec<String>, since: Option<u64> },
    Unsubscribe { topics: Vec<String> },
    Request {
        conversation_id: String,
        request_id: String,
        payload: Value,
        safety_mode: SafetyMode,
        deadline_ms: i64,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome { instance_id: String, server_time: i64 },
    Subscribed { topics: Vec<String> },
    Event { topic: String, sequence: u64, timestamp: i64, payload: Value },
    Gap { topic: String, from: u64, to: u64 },
    Error { code: ErrorCode, message: String, #[serde(skip_serializing_if = "Option::is_none")] request_id: Option<String> },
    Bye { reason: ByeReason },
    Pong { server_time: i64 },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    Unauthenticated,
    Forbidden,
    Overloaded,
    DeadlineExceeded,
    CircuitOpen,
    NoTarget,
    InvalidRequest,
    BlockedContent,
    Internal,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ByeReason {
    SlowConsumer,
    AuthExpired,
    ServerShutdown,
}

impl ServerFrame {
    pub fn error(code: ErrorCode, message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerFrame::Error { code, message: message.into(), request_id }
    }
}
