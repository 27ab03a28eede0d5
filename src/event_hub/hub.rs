//! `EventHub` — per-connection WebSocket fan-out with Redis-backed
//! cross-instance pub/sub.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::protocol::{ByeReason, ServerFrame};
use super::topic::{is_public_topic, topic_matches, TopicBuffer};
use crate::recorder::Recorder;
use crate::types::Event;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("connection not found")]
    UnknownConnection,
}

pub struct EventHubConfig {
    pub redis_url: String,
    pub channel_prefix: String,
    pub public_topic_prefix: String,
    pub topic_buffer_capacity: usize,
    pub slow_consumer_watermark: usize,
}

struct ConnectionState {
    owner_id: String,
    topics: Vec<String>,
    sender: mpsc::Sender<ServerFrame>,
}

pub struct EventHub {
    config: EventHubConfig,
    instance_id: String,
    topics: Mutex<HashMap<String, TopicBuffer>>,
    sequence_counters: Mutex<HashMap<String, u64>>,
    connections: Mutex<HashMap<String, ConnectionState>>,
    redis: Mutex<Option<ConnectionManager>>,
    recorder: Arc<dyn Recorder>,
}

impl EventHub {
    pub async fn new(config: EventHubConfig, recorder: Arc<dyn Recorder>) -> Self {
        let redis = redis::Client::open(config.redis_url.as_str())
            .ok()
            .map(|client| async move { ConnectionManager::new(client).await.ok() });
        let redis = match redis {
            Some(fut) => fut.await,
            None => None,
        };
        if redis.is_none() {
            warn!("event hub starting without a live redis connection — local-only fan-out");
        }
        Self {
            config,
            instance_id: Uuid::new_v4().to_string(),
            topics: Mutex::new(HashMap::new()),
            sequence_counters: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            redis: Mutex::new(redis),
            recorder,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Registers a new connection and returns the receiving half of its
    /// outbound frame queue, bounded at the slow-consumer watermark.
    pub async fn connect(&self, connection_id: &str, owner_id: &str) -> mpsc::Receiver<ServerFrame> {
        let (tx, rx) = mpsc::channel(self.config.slow_consumer_watermark);
        self.connections.lock().await.insert(
            connection_id.to_string(),
            ConnectionState { owner_id: owner_id.to_string(), topics: Vec::new(), sender: tx },
        );
        rx
    }

    pub async fn disconnect(&self, connection_id: &str, reason: ByeReason) {
        let removed = {
            let mut conns = self.connections.lock().await;
            conns.remove(connection_id)
        };
        if let Some(conn) = removed {
            let _ = conn.sender.try_send(ServerFrame::Bye { reason });
        }
    }

    /// Subscribe/resume on `topics`, replaying buffered events from
    /// `max(since, oldest_buffered)`.
    pub async fn subscribe(
        &self,
        connection_id: &str,
        topics: Vec<String>,
        since: Option<u64>,
    ) -> Result<(), HubError> {
        {
            let mut conns = self.connections.lock().await;
            let conn = conns.get_mut(connection_id).ok_or(HubError::UnknownConnection)?;
            for t in &topics {
                if !conn.topics.contains(t) {
                    conn.topics.push(t.clone());
                }
            }
        }
        for topic in &topics {
            self.replay_matching(connection_id, topic, since.unwrap_or(0)).await;
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, connection_id: &str, topics: Vec<String>) -> Result<(), HubError> {
        let mut conns = self.connections.lock().await;
        let conn = conns.get_mut(connection_id).ok_or(HubError::UnknownConnection)?;
        conn.topics.retain(|t| !topics.contains(t));
        Ok(())
    }

    async fn replay_matching(&self, connection_id: &str, pattern: &str, since: u64) {
        let topics = self.topics.lock().await;
        let conns = self.connections.lock().await;
        let Some(conn) = conns.get(connection_id) else { return };
        for (topic_name, buffer) in topics.iter() {
            if !topic_matches(pattern, topic_name) {
                continue;
            }
            let replay = buffer.replay_since(since);
            if let Some((from, to)) = replay.gap {
                let _ = conn.sender.try_send(ServerFrame::Gap { topic: topic_name.clone(), from, to });
            }
            for event in replay.events {
                if event.owner_id != conn.owner_id && !is_public_topic(topic_name, &self.config.public_topic_prefix) {
                    continue;
                }
                let _ = conn.sender.try_send(event_to_frame(&event));
            }
        }
    }

    /// Publish an event on `topic`, fanning out to local subscribers and
    /// the cross-instance Redis channel.
    pub async fn publish(&self, topic: &str, owner_id: &str, payload: Value) -> Event {
        let sequence = self.next_sequence(topic).await;
        let event = Event {
            event_id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            sequence,
            timestamp: Utc::now(),
            payload,
            owner_id: owner_id.to_string(),
        };
        {
            let mut topics = self.topics.lock().await;
            topics
                .entry(topic.to_string())
                .or_insert_with(|| TopicBuffer::new(self.config.topic_buffer_capacity))
                .push(event.clone());
        }
        self.deliver_local(&event).await;
        self.publish_cross_instance(&event).await;
        event
    }

    async fn next_sequence(&self, topic: &str) -> u64 {
        if let Some(conn) = self.redis.lock().await.as_mut() {
            let key = format!("{}seq:{topic}", self.config.channel_prefix);
            if let Ok(seq) = conn.incr::<_, _, u64>(&key, 1).await {
                return seq;
            }
        }
        let mut counters = self.sequence_counters.lock().await;
        let counter = counters.entry(topic.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    async fn deliver_local(&self, event: &Event) {
        let owner_matches_or_public = |conn: &ConnectionState, topic: &str| {
            conn.owner_id == event.owner_id || is_public_topic(topic, &self.config.public_topic_prefix)
        };
        let mut to_disconnect = Vec::new();
        {
            let conns = self.connections.lock().await;
            for (connection_id, conn) in conns.iter() {
                let subscribed = conn.topics.iter().any(|p| topic_matches(p, &event.topic));
                if !subscribed || !owner_matches_or_public(conn, &event.topic) {
                    continue;
                }
                if conn.sender.try_send(event_to_frame(event)).is_err() {
                    to_disconnect.push(connection_id.clone());
                }
            }
        }
        for connection_id in to_disconnect {
            warn!(connection_id, topic = %event.topic, "slow consumer disconnected");
            self.recorder.record_counter("weave_hub_slow_consumer_disconnects_total", 1, &[]);
            self.disconnect(&connection_id, ByeReason::SlowConsumer).await;
        }
    }

    async fn publish_cross_instance(&self, event: &Event) {
        let Some(mut conn) = self.redis.lock().await.as_ref().cloned() else { return };
        let channel = format!("{}{}", self.config.channel_prefix, event.topic);
        let envelope = serde_json::json!({ "instance_id": self.instance_id, "event": event });
        let payload = envelope.to_string();
        if let Err(e) = conn.publish::<_, _, ()>(channel, payload).await {
            error!(err = %e, "event hub redis publish failed");
        }
    }

    /// Background task: listens on the Redis channel for `topic_pattern`
    /// and delivers remote-published events to local subscribers only
    /// (never republishes, to avoid an infinite fan-out loop).
    pub async fn run_remote_listener(self: Arc<Self>, topic_pattern: String) {
        let Ok(client) = redis::Client::open(self.config.redis_url.as_str()) else { return };
        loop {
            match client.get_async_pubsub().await {
                Ok(mut pubsub) => {
                    let channel = format!("{}{}", self.config.channel_prefix, topic_pattern);
                    if pubsub.psubscribe(&channel).await.is_err() {
                        warn!(channel, "event hub failed to subscribe to redis channel");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                    info!(channel, "event hub subscribed to redis channel");
                    let mut stream = pubsub.on_message();
                    while let Some(msg) = stream.next().await {
                        let Ok(raw): Result<String, _> = msg.get_payload() else { continue };
                        let Ok(envelope): Result<Value, _> = serde_json::from_str(&raw) else { continue };
                        let Some(remote_instance) = envelope.get("instance_id").and_then(|v| v.as_str()) else { continue };
                        if remote_instance == self.instance_id {
                            continue;
                        }
                        let Some(event_value) = envelope.get("event") else { continue };
                        let Ok(event): Result<Event, _> = serde_json::from_value(event_value.clone()) else { continue };
                        debug!(topic = %event.topic, sequence = event.sequence, "event hub delivering remote event");
                        self.deliver_local(&event).await;
                    }
                }
                Err(e) => {
                    error!(err = %e, "event hub redis pubsub connection failed — retrying");
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                }
            }
        }
    }

}

fn event_to_frame(event: &Event) -> ServerFrame {
    ServerFrame::Event {
        topic: event.topic.clone(),
        sequence: event.sequence,
        timestamp: event.timestamp.timestamp_millis(),
        payload: event.payload.clone(),
    }
}
