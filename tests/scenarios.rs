//! End-to-end scenario tests wiring the real registry, router, circuit
//! breaker, safety validator, event hub, and orchestrator together —
//! no crate-internal test doubles, only the public API.
//!
//! Requires a Redis instance reachable at `redis://127.0.0.1:6379` (the
//! crate's own default). The registry and hub both degrade to local-only
//! behavior without one, but `AgentRegistry::register` needs a live store
//! to admit a candidate into the router's lookup in the first place.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;

use weave::agents::{AgentDescriptor, AgentKind, AgentProxy, AgentRegistry, AgentRegistryConfig, Capabilities, ProxyError};
use weave::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use weave::event_hub::{EventHub, EventHubConfig, ServerFrame};
use weave::orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorError};
use weave::recorder::{Recorder, TracingRecorder};
use weave::router::{AgentRouter, RouterConfig};
use weave::safety::{SafetyValidator, SafetyValidatorConfig};
use weave::storage::{InMemoryConversationStore, MemoryEventSink};
use weave::types::{AgentRequest, ResponseStatus, SafetyMode};

const REDIS_URL: &str = "redis://127.0.0.1:6379";

/// An `AgentProxy` that echoes its input, optionally timing out a fixed
/// number of times first.
struct ScenarioProxy {
    agent_id: String,
    kind: AgentKind,
    timeouts_remaining: AtomicU32,
    invocations: AtomicU32,
}

impl ScenarioProxy {
    fn echo(agent_id: &str, kind: AgentKind) -> Self {
        Self { agent_id: agent_id.to_string(), kind, timeouts_remaining: AtomicU32::new(0), invocations: AtomicU32::new(0) }
    }

    fn always_times_out(agent_id: &str, kind: AgentKind) -> Self {
        Self { agent_id: agent_id.to_string(), kind, timeouts_remaining: AtomicU32::new(u32::MAX), invocations: AtomicU32::new(0) }
    }
}

#[async_trait]
impl AgentProxy for ScenarioProxy {
    fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn describe(&self) -> (AgentKind, Capabilities) {
        (self.kind.clone(), Capabilities::new())
    }

    async fn invoke(&self, request: &AgentRequest, _deadline: DateTime<Utc>) -> Result<weave::types::AgentResponse, ProxyError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        let remaining = self.timeouts_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            if remaining != u32::MAX {
                self.timeouts_remaining.fetch_sub(1, Ordering::SeqCst);
            }
            return Err(ProxyError::Timeout);
        }
        Ok(weave::types::AgentResponse {
            request_id: request.request_id.clone(),
            status: ResponseStatus::Ok,
            payload: json!({ "echo": request.payload }),
            safety_report: None,
            elapsed: Duration::from_millis(1),
        })
    }

    async fn health(&self) -> Result<(), ProxyError> {
        Ok(())
    }
}

struct Harness {
    orchestrator: Orchestrator,
    registry: Arc<AgentRegistry>,
    router: Arc<AgentRouter>,
    hub: Arc<EventHub>,
    sink: Arc<MemoryEventSink>,
}

async fn build_harness(breakers: CircuitBreakerRegistry) -> Harness {
    let recorder: Arc<dyn Recorder> = Arc::new(TracingRecorder::new());
    let registry = Arc::new(
        AgentRegistry::new(
            AgentRegistryConfig {
                redis_url: REDIS_URL.to_string(),
                heartbeat_interval: Duration::from_secs(5),
                ttl: Duration::from_secs(15),
            },
            recorder.clone(),
        )
        .await,
    );
    let breakers = Arc::new(breakers);
    let router = Arc::new(AgentRouter::new(
        registry.clone(),
        breakers,
        recorder.clone(),
        RouterConfig { concurrency_cap_per_agent: 4, queue_depth: 8 },
    ));
    let safety = Arc::new(SafetyValidator::new(
        SafetyValidatorConfig { rewrite_cap_per_payload: 1, score_threshold_warn: 0.4 },
        recorder.clone(),
    ));
    let hub = Arc::new(
        EventHub::new(
            EventHubConfig {
                redis_url: REDIS_URL.to_string(),
                channel_prefix: "weave:scenario-test:".to_string(),
                public_topic_prefix: "public.".to_string(),
                topic_buffer_capacity: 1024,
                slow_consumer_watermark: 256,
            },
            recorder.clone(),
        )
        .await,
    );
    let sink = Arc::new(MemoryEventSink::new());
    let conversations = Arc::new(InMemoryConversationStore::new());

    let orchestrator = Orchestrator::new(
        router.clone(),
        safety,
        hub.clone(),
        sink.clone(),
        conversations,
        recorder,
        OrchestratorConfig {
            retry_max: 0,
            retry_base: Duration::from_millis(1),
            retry_cap: Duration::from_millis(5),
            dedup_ttl: Duration::from_secs(300),
        },
    );

    Harness { orchestrator, registry, router, hub, sink }
}

fn request(conversation_id: &str, request_id: &str, payload: serde_json::Value) -> AgentRequest {
    AgentRequest {
        request_id: request_id.to_string(),
        conversation_id: conversation_id.to_string(),
        agent_kind: AgentKind::Narrative,
        payload,
        deadline: Utc::now() + chrono::Duration::seconds(5),
        safety_mode: SafetyMode::Normal,
    }
}

async fn register_echo_agent(harness: &Harness, agent_id: &str) {
    let descriptor = AgentDescriptor {
        agent_id: agent_id.to_string(),
        agent_kind: AgentKind::Narrative,
        capabilities: Capabilities::new(),
        endpoint: format!("inproc://{agent_id}"),
        load: 0,
        last_heartbeat: Utc::now(),
    };
    harness.registry.register(descriptor).await.expect("registry must be reachable for scenario tests");
    harness.router.register_proxy(agent_id, Arc::new(ScenarioProxy::echo(agent_id, AgentKind::Narrative))).await;
}

/// S1 — happy path: one response event at sequence 1, preceded by the
/// inbound append at sequence 0.
#[tokio::test]
async fn s1_happy_path_delivers_one_response_event_in_order() {
    let harness = build_harness(CircuitBreakerRegistry::new()).await;
    register_echo_agent(&harness, "s1-agent").await;

    let mut rx = harness.hub.connect("conn-s1", "owner-s1").await;
    harness.hub.subscribe("conn-s1", vec!["conversation.s1".to_string()], None).await.unwrap();

    let response = harness.orchestrator.handle(request("s1", "r1", json!("hello")), "owner-s1").await.unwrap();
    assert_eq!(response.status, ResponseStatus::Ok);

    let frame = rx.recv().await.unwrap();
    match frame {
        ServerFrame::Event { sequence, topic, .. } => {
            assert_eq!(sequence, 1);
            assert_eq!(topic, "conversation.s1");
        }
        other => panic!("expected an event frame, got {other:?}"),
    }

    let entries = harness.sink.entries().await;
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].2, 0);
    assert_eq!(entries[1].2, 1);
}

/// S2 — resending an identical request_id within the dedup TTL replays the
/// cached response instead of calling the agent or the sink again.
#[tokio::test]
async fn s2_duplicate_request_id_does_not_re_append() {
    let harness = build_harness(CircuitBreakerRegistry::new()).await;
    register_echo_agent(&harness, "s2-agent").await;

    let first = harness.orchestrator.handle(request("s2", "r1", json!("hi")), "owner-s2").await.unwrap();
    let second = harness.orchestrator.handle(request("s2", "r1", json!("hi")), "owner-s2").await.unwrap();

    assert_eq!(first.payload, second.payload);
    assert_eq!(harness.sink.entries().await.len(), 2); // inbound + outbound, once only
}

/// S3 — repeated timeouts trip the circuit; once open, further calls fail
/// fast as `circuit-open` without reaching the proxy. Uses a scaled-down
/// cooldown/threshold so the test doesn't have to wait 60 real seconds.
#[tokio::test]
async fn s3_repeated_timeouts_trip_the_circuit_then_fail_fast() {
    let breakers = CircuitBreakerRegistry::with_profiles(
        CircuitBreakerConfig { failure_threshold: 3, failure_window: Duration::from_secs(30), cooldown: Duration::from_millis(200), half_open_probes: 1 },
        CircuitBreakerConfig::safety_profile(),
    );
    let harness = build_harness(breakers).await;

    let descriptor = AgentDescriptor {
        agent_id: "s3-agent".to_string(),
        agent_kind: AgentKind::Narrative,
        capabilities: Capabilities::new(),
        endpoint: "inproc://s3-agent".to_string(),
        load: 0,
        last_heartbeat: Utc::now(),
    };
    harness.registry.register(descriptor).await.expect("registry must be reachable for scenario tests");
    let proxy = Arc::new(ScenarioProxy::always_times_out("s3-agent", AgentKind::Narrative));
    harness.router.register_proxy("s3-agent", proxy.clone()).await;

    for i in 0..3 {
        let err = harness
            .orchestrator
            .handle(request(&format!("s3-{i}"), &format!("r{i}"), json!("hi")), "owner-s3")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DeadlineExceeded));
    }

    let err = harness.orchestrator.handle(request("s3-trip", "r-trip", json!("hi")), "owner-s3").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::CircuitOpen));
    let invocations_before = proxy.invocations.load(Ordering::SeqCst);

    // Circuit-open calls never reach the proxy.
    let err = harness.orchestrator.handle(request("s3-trip2", "r-trip2", json!("hi")), "owner-s3").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::CircuitOpen));
    assert_eq!(proxy.invocations.load(Ordering::SeqCst), invocations_before);

    tokio::time::sleep(Duration::from_millis(250)).await;
    // After cooldown, one probe is allowed through (still times out here,
    // but it must have reached the proxy rather than failing fast).
    let _ = harness.orchestrator.handle(request("s3-probe", "r-probe", json!("hi")), "owner-s3").await;
    assert!(proxy.invocations.load(Ordering::SeqCst) > invocations_before);
}

/// S4 — a crisis phrase publishes the pre-approved response on the
/// conversation topic and a copy on `crisis.<owner_id>`, then leaves the
/// conversation in a state where a follow-up normal request is blocked.
#[tokio::test]
async fn s4_crisis_phrase_publishes_twice_and_latches_conversation() {
    let harness = build_harness(CircuitBreakerRegistry::new()).await;
    register_echo_agent(&harness, "s4-agent").await;

    let mut conv_rx = harness.hub.connect("conn-s4-conv", "owner-s4").await;
    harness.hub.subscribe("conn-s4-conv", vec!["conversation.s4".to_string()], None).await.unwrap();
    let mut crisis_rx = harness.hub.connect("conn-s4-crisis", "owner-s4").await;
    harness.hub.subscribe("conn-s4-crisis", vec!["crisis.owner-s4".to_string()], None).await.unwrap();

    let err = harness.orchestrator.handle(request("s4", "r1", json!("I want to end my life")), "owner-s4").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::CrisisDetected { .. }));
    assert!(matches!(conv_rx.recv().await.unwrap(), ServerFrame::Event { .. }));
    assert!(matches!(crisis_rx.recv().await.unwrap(), ServerFrame::Event { .. }));

    let follow_up = harness.orchestrator.handle(request("s4", "r2", json!("let's keep talking")), "owner-s4").await.unwrap_err();
    assert!(matches!(follow_up, OrchestratorError::BlockedContent));
}

/// S5 — a subscriber that never drains its queue gets disconnected once
/// the hub's slow-consumer watermark is exceeded; other subscribers on the
/// same topic are unaffected.
#[tokio::test]
async fn s5_slow_consumer_disconnects_without_affecting_others() {
    let harness = build_harness(CircuitBreakerRegistry::new()).await;

    let _slow_rx = harness.hub.connect("conn-slow", "owner-s5").await;
    harness.hub.subscribe("conn-slow", vec!["conversation.s5".to_string()], None).await.unwrap();

    let mut healthy_rx = harness.hub.connect("conn-healthy", "owner-s5").await;
    harness.hub.subscribe("conn-healthy", vec!["conversation.s5".to_string()], None).await.unwrap();

    for i in 0..300u32 {
        harness.hub.publish("conversation.s5", "owner-s5", json!({ "n": i })).await;
        // Keep the healthy subscriber drained so it never backs up.
        let _ = healthy_rx.try_recv();
    }

    // Once evicted, `conn-slow` is no longer a known connection — attempting
    // to unsubscribe it now surfaces `UnknownConnection` rather than `Ok`.
    let unsubscribe_result = harness.hub.unsubscribe("conn-slow", vec!["conversation.s5".to_string()]).await;
    assert!(unsubscribe_result.is_err(), "slow consumer should already be disconnected");

    // A fresh subscriber on the same topic still receives new events.
    let mut rx = harness.hub.connect("probe", "owner-s5").await;
    harness.hub.subscribe("probe", vec!["conversation.s5".to_string()], None).await.unwrap();
    harness.hub.publish("conversation.s5", "owner-s5", json!("probe-event")).await;
    assert!(rx.recv().await.is_some(), "a fresh subscriber must still receive new events");
}
