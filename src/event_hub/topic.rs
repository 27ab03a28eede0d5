//! Topic pattern matching and the bounded per-topic replay buffer.

use std::collections::VecDeque;

use crate::types::Event;

/// `pattern` is either an exact topic or ends in a trailing `*` meaning "one
/// or more further dot-separated segments".
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.len() > prefix.len() && topic.starts_with(prefix),
        None => pattern == topic,
    }
}

pub fn is_public_topic(topic: &str, public_prefix: &str) -> bool {
    topic.starts_with(public_prefix)
}

/// Bounded ring buffer for one topic's event history (default capacity
/// 1024).
pub struct TopicBuffer {
    events: VecDeque<Event>,
    capacity: usize,
}

/// Outcome of a replay request.
pub struct Replay {
    pub events: Vec<Event>,
    /// Set when `since` was older than the oldest buffered sequence — the
    /// hub must emit a `gap` frame before resuming.
    pub gap: Option<(u64, u64)>,
}

impl TopicBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { events: VecDeque::with_capacity(capacity.min(4096)), capacity }
    }

    pub fn push(&mut self, event: Event) {
        if self.events.len() >= self.capacity {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn oldest_sequence(&self) -> Option<u64> {
        self.events.front().map(|e| e.sequence)
    }

    pub fn latest_sequence(&self) -> Option<u64> {
        self.events.back().map(|e| e.sequence)
    }

    /// Replays events from `max(since, oldest_buffered)` up to current.
    pub fn replay_since(&self, since: u64) -> Replay {
        let oldest = self.oldest_sequence();
        let gap = match oldest {
            Some(oldest) if since < oldest.saturating_sub(1) => Some((since, oldest)),
            _ => None,
        };
        let events: Vec<Event> = self.events.iter().filter(|e| e.sequence > since).cloned().collect();
        Replay { events, gap }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(seq: u64) -> Event {
        Event { event_id: seq.to_string(), topic: "t".to_string(), sequence: seq, timestamp: Utc::now(), payload: json!(null), owner_id: "o1".to_string() }
    }

    #[test]
    fn exact_match() {
        assert!(topic_matches("conversation.c1", "conversation.c1"));
        assert!(!topic_matches("conversation.c1", "conversation.c2"));
    }

    #[test]
    fn wildcard_matches_one_or_more_segments() {
        assert!(topic_matches("agent.*", "agent.narrative.status"));
        assert!(topic_matches("agent.*", "agent.x"));
        assert!(!topic_matches("agent.*", "agent"));
    }

    #[test]
    fn public_prefix_detection() {
        assert!(is_public_topic("public.announcements", "public."));
        assert!(!is_public_topic("conversation.c1", "public."));
    }

    #[test]
    fn buffer_evicts_oldest_at_capacity() {
        let mut buf = TopicBuffer::new(2);
        buf.push(event(1));
        buf.push(event(2));
        buf.push(event(3));
        assert_eq!(buf.oldest_sequence(), Some(2));
    }

    #[test]
    fn replay_reports_gap_when_since_older_than_buffer() {
        let mut buf = TopicBuffer::new(2);
        buf.push(event(5));
        buf.push(event(6));
        let replay = buf.replay_since(1);
        assert!(replay.gap.is_some());
        assert_eq!(replay.events.len(), 2);
    }

    #[test]
    fn replay_without_gap_returns_events_after_since() {
        let mut buf = TopicBuffer::new(4);
        buf.push(event(1));
        buf.push(event(2));
        buf.push(event(3));
        let replay = buf.replay_since(1);
        assert!(replay.gap.is_none());
        assert_eq!(replay.events.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![2, 3]);
    }
}
