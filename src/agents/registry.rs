//! Redis-backed `AgentRegistry`.
//!
//! The authoritative fleet membership lives in Redis so multiple
//! orchestrator instances see the same view. The hot path (`lookup`) never
//! touches the network: it reads a local `ArcSwap` snapshot kept current by
//! a Redis pub/sub listener (near-real-time) plus a forced resync every
//! 30 s (the backstop for whatever the listener missed).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::capabilities::{satisfies, AgentKind, Capabilities};
use super::descriptor::AgentDescriptor;
use crate::recorder::Recorder;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("agent_id already registered")]
    AlreadyRegistered,
    #[error("registry store unreachable")]
    Unavailable,
}

/// Result of a `heartbeat` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Ok,
    /// The entry was already purged; the agent must re-register.
    Unknown,
}

/// Change notification delivered by [`AgentRegistry::watch`].
#[derive(Debug, Clone)]
pub enum RegistryChange {
    Added(AgentDescriptor),
    Removed { agent_id: String },
}

struct TokenRecord {
    agent_kind: AgentKind,
    agent_id: String,
}

type Cache = HashMap<AgentKind, Vec<AgentDescriptor>>;

pub struct AgentRegistryConfig {
    pub redis_url: String,
    pub heartbeat_interval: Duration,
    pub ttl: Duration,
}

pub struct AgentRegistry {
    conn: tokio::sync::Mutex<Option<ConnectionManager>>,
    redis_url: String,
    ttl: Duration,
    cache: Arc<ArcSwap<Cache>>,
    tokens: tokio::sync::Mutex<HashMap<String, TokenRecord>>,
    recorder: Arc<dyn Recorder>,
    change_tx: broadcast::Sender<RegistryChange>,
    outage_logged: std::sync::atomic::AtomicBool,
}

impl AgentRegistry {
    pub async fn new(config: AgentRegistryConfig, recorder: Arc<dyn Recorder>) -> Self {
        let (change_tx, _) = broadcast::channel(256);
        let conn = ConnectionManager::new(
            redis::Client::open(config.redis_url.as_str()).expect("invalid redis url"),
        )
        .await
        .ok();
        if conn.is_none() {
            warn!(url = %config.redis_url, "registry starting without a live redis connection");
        }
        Self {
            conn: tokio::sync::Mutex::new(conn),
            redis_url: config.redis_url,
            ttl: config.ttl,
            cache: Arc::new(ArcSwap::from_pointee(Cache::new())),
            tokens: tokio::sync::Mutex::new(HashMap::new()),
            recorder,
            change_tx,
            outage_logged: std::sync::atomic::AtomicBool::new(false),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager, RegistryError> {
        let mut guard = self.conn.lock().await;
        if let Some(c) = guard.as_ref() {
            return Ok(c.clone());
        }
        match redis::Client::open(self.redis_url.as_str()) {
            Ok(client) => match ConnectionManager::new(client).await {
                Ok(c) => {
                    if self.outage_logged.swap(false, std::sync::atomic::Ordering::SeqCst) {
                        info!("registry redis connection restored");
                    }
                    *guard = Some(c.clone());
                    Ok(c)
                }
                Err(e) => {
                    self.log_outage_once(&e);
                    Err(RegistryError::Unavailable)
                }
            },
            Err(e) => {
                self.log_outage_once(&e);
                Err(RegistryError::Unavailable)
            }
        }
    }

    fn log_outage_once(&self, err: &redis::RedisError) {
        if !self.outage_logged.swap(true, std::sync::atomic::Ordering::SeqCst) {
            error!(err = %err, "registry redis connection unavailable");
        }
    }

    fn descriptor_key(kind: &AgentKind, agent_id: &str) -> String {
        format!("weave:agent:{}:{agent_id}", kind.registry_key())
    }

    fn channel(kind: &AgentKind) -> String {
        format!("weave:agents:{}", kind.registry_key())
    }

    /// Register a new agent. Fails with `AlreadyRegistered` if `agent_id` is
    /// currently live for that kind.
    pub async fn register(&self, descriptor: AgentDescriptor) -> Result<String, RegistryError> {
        let mut conn = self.connection().await?;
        let key = Self::descriptor_key(&descriptor.agent_kind, &descriptor.agent_id);

        let exists: bool = conn.exists(&key).await.map_err(|_| RegistryError::Unavailable)?;
        if exists {
            return Err(RegistryError::AlreadyRegistered);
        }

        let token = Uuid::new_v4().to_string();
        let json = serde_json::to_string(&descriptor).expect("AgentDescriptor is always serializable");
        let ttl_ms = (self.ttl.as_millis() as u64) * 3;

        let _: () = conn
            .set_ex(&key, &json, ttl_ms / 1000)
            .await
            .map_err(|_| RegistryError::Unavailable)?;

        self.tokens.lock().await.insert(
            token.clone(),
            TokenRecord {
                agent_kind: descriptor.agent_kind.clone(),
                agent_id: descriptor.agent_id.clone(),
            },
        );

        let _: Result<(), _> = conn.publish(Self::channel(&descriptor.agent_kind), format!("added:{}", descriptor.agent_id)).await;
        self.apply_change(RegistryChange::Added(descriptor.clone()));
        info!(agent_id = %descriptor.agent_id, kind = %descriptor.agent_kind, "agent registered");
        self.recorder.record_counter("weave_registry_registrations_total", 1, &[("kind", &descriptor.agent_kind.to_string())]);
        Ok(token)
    }

    /// Refresh TTL and update load. O(1); must never block on the hot path
    /// of the caller's request handling.
    pub async fn heartbeat(&self, token: &str, load: u32) -> Result<HeartbeatOutcome, RegistryError> {
        let record = {
            let tokens = self.tokens.lock().await;
            match tokens.get(token) {
                Some(r) => (r.agent_kind.clone(), r.agent_id.clone()),
                None => return Ok(HeartbeatOutcome::Unknown),
            }
        };
        let (kind, agent_id) = record;
        let key = Self::descriptor_key(&kind, &agent_id);
        let mut conn = self.connection().await?;

        let raw: Option<String> = conn.get(&key).await.map_err(|_| RegistryError::Unavailable)?;
        let Some(raw) = raw else {
            self.tokens.lock().await.remove(token);
            return Ok(HeartbeatOutcome::Unknown);
        };

        let mut descriptor: AgentDescriptor = serde_json::from_str(&raw).map_err(|_| RegistryError::Unavailable)?;
        descriptor.load = load;
        descriptor.last_heartbeat = chrono::Utc::now();

        let ttl_ms = (self.ttl.as_millis() as u64) * 3;
        let json = serde_json::to_string(&descriptor).expect("AgentDescriptor is always serializable");
        let _: () = conn
            .set_ex(&key, &json, ttl_ms / 1000)
            .await
            .map_err(|_| RegistryError::Unavailable)?;

        self.apply_change(RegistryChange::Added(descriptor));
        Ok(HeartbeatOutcome::Ok)
    }

    /// Idempotent: removing an already-absent token is a no-op.
    pub async fn deregister(&self, token: &str) -> Result<(), RegistryError> {
        let record = self.tokens.lock().await.remove(token);
        let Some(record) = record else {
            return Ok(());
        };
        if let Ok(mut conn) = self.connection().await {
            let key = Self::descriptor_key(&record.agent_kind, &record.agent_id);
            let _: Result<(), _> = conn.del(&key).await;
            let _: Result<(), _> = conn.publish(Self::channel(&record.agent_kind), format!("removed:{}", record.agent_id)).await;
        }
        self.apply_change(RegistryChange::Removed { agent_id: record.agent_id.clone() });
        info!(agent_id = %record.agent_id, kind = %record.agent_kind, "agent deregistered");
        Ok(())
    }

    /// Read-only, served entirely from the local cache.
    pub fn lookup(&self, kind: &AgentKind, capabilities: &Capabilities) -> Vec<AgentDescriptor> {
        let snapshot = self.cache.load();
        let mut matches: Vec<AgentDescriptor> = snapshot
            .get(kind)
            .map(|v| v.iter().filter(|d| satisfies(&d.capabilities, capabilities)).cloned().collect())
            .unwrap_or_default();
        matches.sort_by(|a, b| a.load.cmp(&b.load).then_with(|| a.agent_id.cmp(&b.agent_id)));
        matches
    }

    fn apply_change(&self, change: RegistryChange) {
        let current = self.cache.load_full();
        let mut next: Cache = (*current).clone();
        match &change {
            RegistryChange::Added(descriptor) => {
                let list = next.entry(descriptor.agent_kind.clone()).or_default();
                list.retain(|d| d.agent_id != descriptor.agent_id);
                list.push(descriptor.clone());
            }
            RegistryChange::Removed { agent_id } => {
                for list in next.values_mut() {
                    list.retain(|d| &d.agent_id != agent_id);
                }
            }
        }
        self.cache.store(Arc::new(next));
        let _ = self.change_tx.send(change);
    }

    /// Subscribe to change notifications for `kind`.
    pub fn watch(&self, kind: AgentKind) -> impl futures_util::Stream<Item = RegistryChange> {
        let mut rx = self.change_tx.subscribe();
        async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(change) => {
                        let matches = match &change {
                            RegistryChange::Added(d) => d.agent_kind == kind,
                            RegistryChange::Removed { .. } => true,
                        };
                        if matches {
                            yield change;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "registry watch stream lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    /// Background task: forces a full resync of every kind every 30 s, as a
    /// backstop for whatever `run_remote_listener` missed (a dropped pubsub
    /// connection, a message published before this instance subscribed).
    pub async fn run_resync_loop(self: Arc<Self>, kinds: Vec<AgentKind>) {
        let mut interval = tokio::time::interval(Duration::from_secs(30));
        loop {
            interval.tick().await;
            for kind in &kinds {
                if let Err(e) = self.resync_kind(kind).await {
                    warn!(kind = %kind, err = %e, "registry forced resync failed");
                }
            }
        }
    }

    /// Background task: subscribes to the Redis channels `register` and
    /// `deregister` publish on, feeding `watch()` subscribers as soon as a
    /// remote instance's change lands rather than waiting for the next
    /// forced resync.
    pub async fn run_remote_listener(self: Arc<Self>, kinds: Vec<AgentKind>) {
        let Ok(client) = redis::Client::open(self.redis_url.as_str()) else { return };
        loop {
            match client.get_async_pubsub().await {
                Ok(mut pubsub) => {
                    let mut subscribed = false;
                    for kind in &kinds {
                        if pubsub.subscribe(Self::channel(kind)).await.is_ok() {
                            subscribed = true;
                        }
                    }
                    if !subscribed {
                        warn!("registry failed to subscribe to any redis change channel");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                        continue;
                    }
                    info!("registry subscribed to redis change channels");
                    let mut stream = pubsub.on_message();
                    while let Some(msg) = stream.next().await {
                        let channel = msg.get_channel_name().to_string();
                        let Ok(payload): Result<String, _> = msg.get_payload() else { continue };
                        let Some(kind) = kinds.iter().find(|k| Self::channel(k) == channel) else { continue };
                        self.handle_remote_change(kind, &payload).await;
                    }
                }
                Err(e) => {
                    error!(err = %e, "registry redis pubsub connection failed — retrying");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn handle_remote_change(&self, kind: &AgentKind, payload: &str) {
        if let Some(agent_id) = payload.strip_prefix("removed:") {
            self.apply_change(RegistryChange::Removed { agent_id: agent_id.to_string() });
            return;
        }
        let Some(agent_id) = payload.strip_prefix("added:") else { return };
        let Ok(mut conn) = self.connection().await else { return };
        let key = Self::descriptor_key(kind, agent_id);
        if let Ok(Some(raw)) = conn.get::<_, Option<String>>(&key).await {
            if let Ok(descriptor) = serde_json::from_str::<AgentDescriptor>(&raw) {
                self.apply_change(RegistryChange::Added(descriptor));
            }
        }
    }

    /// Seeds the local cache directly, bypassing Redis — for tests that
    /// exercise routing/lookup without a live registry backend.
    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, descriptor: AgentDescriptor) {
        self.apply_change(RegistryChange::Added(descriptor));
    }

    async fn resync_kind(&self, kind: &AgentKind) -> Result<(), RegistryError> {
        let mut conn = self.connection().await?;
        let pattern = format!("weave:agent:{}:*", kind.registry_key());
        let keys: Vec<String> = conn.keys(&pattern).await.map_err(|_| RegistryError::Unavailable)?;
        let mut descriptors = Vec::with_capacity(keys.len());
        for key in keys {
            if let Ok(Some(raw)) = conn.get::<_, Option<String>>(&key).await {
                if let Ok(d) = serde_json::from_str::<AgentDescriptor>(&raw) {
                    descriptors.push(d);
                }
            }
        }
        let current = self.cache.load_full();
        let mut next: Cache = (*current).clone();
        next.insert(kind.clone(), descriptors);
        self.cache.store(Arc::new(next));
        Ok(())
    }
}
