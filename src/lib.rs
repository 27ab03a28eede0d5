// SPDX-License-Identifier: MIT
//! weave — the orchestration core tying agent discovery, routing, content
//! safety, and client-facing event delivery into one pipeline.
//!
//! This crate owns no concrete agent implementation, storage backend, or
//! metrics exporter. Everything a deployment must supply is expressed as a
//! trait seam (`AgentProxy`, `EventSink`, `ConversationStore`, `Recorder`)
//! and wired together here in [`AppContext`].

pub mod agents;
pub mod circuit_breaker;
pub mod config;
pub mod conversation;
pub mod event_hub;
pub mod orchestrator;
pub mod recorder;
pub mod retry;
pub mod router;
pub mod safety;
pub mod storage;
pub mod types;
pub mod ws_server;

use std::sync::Arc;
use std::time::Instant;

use tracing::info;

use agents::{AgentRegistry, AgentRegistryConfig};
use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use config::WeaveConfig;
use event_hub::{EventHub, EventHubConfig};
use orchestrator::{Orchestrator, OrchestratorConfig};
use recorder::{Recorder, TracingRecorder};
use router::{AgentRouter, RouterConfig};
use safety::{SafetyValidator, SafetyValidatorConfig};
use storage::{ConversationStore, EventSink, FileEventSink, InMemoryConversationStore};

/// Everything a running instance needs, built once at startup and shared
/// behind `Arc` by every connection task.
pub struct AppContext {
    pub config: Arc<WeaveConfig>,
    pub registry: Arc<AgentRegistry>,
    pub router: Arc<AgentRouter>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub safety: Arc<SafetyValidator>,
    pub hub: Arc<EventHub>,
    pub orchestrator: Arc<Orchestrator>,
    pub recorder: Arc<dyn Recorder>,
    pub started_at: Instant,
}

impl AppContext {
    /// Construct every component from a resolved [`WeaveConfig`]. The
    /// conversation store is process-local — a real deployment backs it
    /// with its own durable store — while the event sink is a durable
    /// append-only file under `data_dir`.
    pub async fn bootstrap(config: WeaveConfig) -> anyhow::Result<Arc<Self>> {
        let config = Arc::new(config);
        let recorder: Arc<dyn Recorder> = Arc::new(TracingRecorder::new());

        let registry = Arc::new(
            AgentRegistry::new(
                AgentRegistryConfig {
                    redis_url: config.registry_redis_url.clone(),
                    heartbeat_interval: config.registry_heartbeat_interval,
                    ttl: config.registry_ttl,
                },
                recorder.clone(),
            )
            .await,
        );

        let failure_window = config.registry_heartbeat_interval.max(std::time::Duration::from_secs(1));
        let breakers = Arc::new(CircuitBreakerRegistry::with_profiles(
            CircuitBreakerConfig {
                failure_threshold: config.breaker_failure_threshold_default,
                failure_window,
                cooldown: config.breaker_cooldown_default,
                half_open_probes: config.breaker_half_open_probes,
            },
            CircuitBreakerConfig {
                failure_threshold: config.breaker_failure_threshold_safety,
                failure_window,
                cooldown: config.breaker_cooldown_safety,
                half_open_probes: config.breaker_half_open_probes,
            },
        ));

        let router = Arc::new(AgentRouter::new(
            registry.clone(),
            breakers.clone(),
            recorder.clone(),
            RouterConfig {
                concurrency_cap_per_agent: config.router_concurrency_cap_per_agent,
                queue_depth: config.router_queue_depth,
            },
        ));

        let safety = Arc::new(SafetyValidator::new(
            SafetyValidatorConfig {
                rewrite_cap_per_payload: config.safety_rewrite_cap_per_payload,
                score_threshold_warn: config.safety_score_threshold_warn,
            },
            recorder.clone(),
        ));

        let hub = Arc::new(
            EventHub::new(
                EventHubConfig {
                    redis_url: config.registry_redis_url.clone(),
                    channel_prefix: config.hub_redis_channel_prefix.clone(),
                    public_topic_prefix: config.hub_public_topic_prefix.clone(),
                    topic_buffer_capacity: config.hub_topic_buffer,
                    slow_consumer_watermark: config.hub_slow_consumer_watermark,
                },
                recorder.clone(),
            )
            .await,
        );

        let sink: Arc<dyn EventSink> = Arc::new(FileEventSink::open(config.data_dir.join("events.jsonl")).await?);
        let conversations: Arc<dyn ConversationStore> = Arc::new(InMemoryConversationStore::new());

        let orchestrator = Arc::new(Orchestrator::new(
            router.clone(),
            safety.clone(),
            hub.clone(),
            sink,
            conversations,
            recorder.clone(),
            OrchestratorConfig {
                retry_max: config.orchestrator_retry_max,
                retry_base: config.orchestrator_retry_base,
                retry_cap: config.orchestrator_retry_cap,
                dedup_ttl: config.orchestrator_dedup_ttl,
            },
        ));

        info!(data_dir = %config.data_dir.display(), ws_port = config.ws_port, "weave context bootstrapped");

        Ok(Arc::new(Self {
            config,
            registry,
            router,
            breakers,
            safety,
            hub,
            orchestrator,
            recorder,
            started_at: Instant::now(),
        }))
    }

    /// Spawns the registry's background resync loop and remote-change
    /// listener, the hub's cross-instance Redis listener, and the router's
    /// queue-drain loop. All degrade gracefully without a live Redis
    /// connection.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let watched_kinds = vec![
            agents::AgentKind::Input,
            agents::AgentKind::World,
            agents::AgentKind::Narrative,
            agents::AgentKind::Safety,
        ];

        let registry = self.registry.clone();
        tokio::spawn(registry.clone().run_resync_loop(watched_kinds.clone()));
        tokio::spawn(registry.run_remote_listener(watched_kinds));

        let hub = self.hub.clone();
        tokio::spawn(hub.run_remote_listener("*".to_string()));

        let router = self.router.clone();
        tokio::spawn(router.run_queue_drain_loop());
    }
}
