//! `Conversation` — ordered interaction context owned by the orchestrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Active,
    Paused,
    Closed,
    Crisis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub state: ConversationState,
    /// Next message in this conversation must have sequence = last + 1.
    pub ordering_sequence: u64,
    /// True while a request for this conversation is in flight. Not
    /// serialized — reconstructed at instance startup as `false`.
    #[serde(skip)]
    pub in_flight: bool,
    /// Count of recent `warn` verdicts, used to decide whether strict mode
    /// should be forced for the next message.
    #[serde(skip)]
    pub recent_warn_count: u32,
}

impl Conversation {
    pub fn new(conversation_id: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            owner_id: owner_id.into(),
            created_at: Utc::now(),
            state: ConversationState::Active,
            ordering_sequence: 0,
            in_flight: false,
            recent_warn_count: 0,
        }
    }

    /// Strict mode is forced when paused or when recent history contains
    /// warnings.
    pub fn requires_strict_mode(&self) -> bool {
        self.state == ConversationState::Paused || self.recent_warn_count > 0
    }

    pub fn next_sequence(&mut self) -> u64 {
        let seq = self.ordering_sequence;
        self.ordering_sequence += 1;
        seq
    }
}
