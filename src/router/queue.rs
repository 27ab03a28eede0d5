//! Bounded FIFO queue with deadline-aware eviction.
//!
//! The router has no notion of request priority, only arrival order and a
//! deadline past which a queued request is worthless to serve.

use std::collections::VecDeque;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::router::RouterError;
use crate::types::{AgentRequest, AgentResponse};

pub struct QueuedRequest {
    pub request: AgentRequest,
    pub queued_at: Instant,
    pub deadline: Instant,
    pub responder: oneshot::Sender<Result<AgentResponse, RouterError>>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is at capacity")]
    Overloaded,
}

/// Bounded FIFO. A single drain task owns popping from the front; callers
/// only ever push to the back, so there is no contention over which entry
/// is "next".
pub struct RequestQueue {
    items: VecDeque<QueuedRequest>,
    capacity: usize,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, item: QueuedRequest) -> Result<(), QueueError> {
        if self.items.len() >= self.capacity {
            return Err(QueueError::Overloaded);
        }
        self.items.push_back(item);
        Ok(())
    }

    pub fn front(&self) -> Option<&QueuedRequest> {
        self.items.front()
    }

    pub fn pop_front(&mut self) -> Option<QueuedRequest> {
        self.items.pop_front()
    }
}
