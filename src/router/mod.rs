//! `AgentRouter` — capability-matched dispatch through the circuit breaker.

pub mod queue;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{oneshot, Mutex, Notify, RwLock, Semaphore};
use tracing::{debug, warn};

use crate::agents::{AgentKind, AgentProxy, AgentRegistry, Capabilities, ProxyError};
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::recorder::Recorder;
use crate::types::{AgentRequest, AgentResponse, SafetyMode};
use queue::{QueueError, QueuedRequest, RequestQueue};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no live agent matches the requested kind/capabilities")]
    NoTargetAvailable,
    #[error("queue is full or all agents saturated")]
    Overloaded,
    #[error("deadline exceeded before an agent slot became available")]
    DeadlineExceeded,
    #[error("all matching targets have an open circuit")]
    CircuitOpen,
    #[error("upstream proxy error: {0}")]
    Proxy(#[from] ProxyError),
}

pub struct RouterConfig {
    pub concurrency_cap_per_agent: usize,
    pub queue_depth: usize,
}

struct AgentSlot {
    proxy: Arc<dyn AgentProxy>,
    semaphore: Arc<Semaphore>,
    in_flight: std::sync::atomic::AtomicU32,
}

pub struct AgentRouter {
    registry: Arc<AgentRegistry>,
    breakers: Arc<CircuitBreakerRegistry>,
    recorder: Arc<dyn Recorder>,
    config: RouterConfig,
    slots: RwLock<HashMap<String, Arc<AgentSlot>>>,
    queue: Mutex<RequestQueue>,
    /// Woken whenever a slot or breaker probe permit is released, so the
    /// queue drain loop doesn't have to poll on a tight interval.
    notify: Notify,
}

impl AgentRouter {
    pub fn new(
        registry: Arc<AgentRegistry>,
        breakers: Arc<CircuitBreakerRegistry>,
        recorder: Arc<dyn Recorder>,
        config: RouterConfig,
    ) -> Self {
        let queue_depth = config.queue_depth;
        Self {
            registry,
            breakers,
            recorder,
            config,
            slots: RwLock::new(HashMap::new()),
            queue: Mutex::new(RequestQueue::new(queue_depth)),
            notify: Notify::new(),
        }
    }

    /// Registers a concrete agent proxy so the router can invoke it. Called
    /// once the agent is live in the [`AgentRegistry`].
    pub async fn register_proxy(&self, agent_id: &str, proxy: Arc<dyn AgentProxy>) {
        let slot = Arc::new(AgentSlot {
            proxy,
            semaphore: Arc::new(Semaphore::new(self.config.concurrency_cap_per_agent)),
            in_flight: std::sync::atomic::AtomicU32::new(0),
        });
        self.slots.write().await.insert(agent_id.to_string(), slot);
        self.notify.notify_waiters();
    }

    pub async fn unregister_proxy(&self, agent_id: &str) {
        self.slots.write().await.remove(agent_id);
    }

    /// Picks the lowest-load matching descriptor, invokes it through the
    /// circuit breaker. Attempts exactly one agent — no in-process retry
    /// across candidates beyond trying the next candidate when the current
    /// one is saturated or breaker-open. If every candidate is saturated
    /// (but none open), the request is queued until a slot frees up or its
    /// deadline passes.
    pub async fn route(&self, request: &AgentRequest) -> Result<AgentResponse, RouterError> {
        match self.try_dispatch(request).await {
            Some(result) => result,
            None => self.enqueue(request).await,
        }
    }

    /// Attempts to serve `request` against the candidates registered right
    /// now, without queueing. `None` means every candidate exists but is
    /// at its concurrency cap — the caller should wait for a slot.
    async fn try_dispatch(&self, request: &AgentRequest) -> Option<Result<AgentResponse, RouterError>> {
        let required: Capabilities = Capabilities::new();
        let candidates = self.registry.lookup(&request.agent_kind, &required);
        if candidates.is_empty() {
            return Some(Err(RouterError::NoTargetAvailable));
        }

        let slots = self.slots.read().await;
        let mut any_open = false;

        for candidate in &candidates {
            let Some(slot) = slots.get(&candidate.agent_id) else {
                continue;
            };
            let breaker = self.breakers.get(request.agent_kind.clone(), &candidate.agent_id).await;
            let Some(half_open_permit) = breaker.admit().await else {
                any_open = true;
                if request.safety_mode == SafetyMode::CrisisBypass {
                    if let Some(permit) = breaker.try_bypass_probe() {
                        debug!(agent_id = %candidate.agent_id, "crisis-bypass probing open circuit");
                        let result = self.invoke_slot(slot, request, &breaker).await;
                        drop(permit);
                        return Some(result);
                    }
                }
                continue;
            };

            let Ok(permit) = slot.semaphore.clone().try_acquire_owned() else {
                continue;
            };
            slot.in_flight.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            debug!(agent_id = %candidate.agent_id, "router selected candidate");
            let result = self.invoke_slot(slot, request, &breaker).await;
            slot.in_flight.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            drop(permit);
            drop(half_open_permit);
            self.notify.notify_waiters();
            return Some(result);
        }
        drop(slots);

        if any_open {
            warn!(kind = %request.agent_kind, "all matching candidates have an open circuit");
            return Some(Err(RouterError::CircuitOpen));
        }
        None
    }

    async fn invoke_slot(
        &self,
        slot: &AgentSlot,
        request: &AgentRequest,
        breaker: &crate::circuit_breaker::CircuitBreaker,
    ) -> Result<AgentResponse, RouterError> {
        let result = slot.proxy.invoke(request, request.deadline).await;
        match &result {
            Ok(_) => breaker.record_success(self.recorder.as_ref()).await,
            Err(e) if e.trips_breaker() => breaker.record_failure(self.recorder.as_ref()).await,
            Err(_) => {}
        }
        result.map_err(RouterError::from)
    }

    /// Pushes the request onto the bounded queue and waits for the drain
    /// loop to either serve it or give up at its deadline. Only a full
    /// queue fails fast with `Overloaded` — a successful enqueue awaits
    /// service.
    async fn enqueue(&self, request: &AgentRequest) -> Result<AgentResponse, RouterError> {
        let now = Instant::now();
        let deadline_in = (request.deadline - chrono::Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let (responder, rx) = oneshot::channel();
        {
            let mut queue = self.queue.lock().await;
            queue
                .push(QueuedRequest {
                    request: request.clone(),
                    queued_at: now,
                    deadline: now + deadline_in,
                    responder,
                })
                .map_err(|QueueError::Overloaded| RouterError::Overloaded)?;
        }
        warn!(conversation_id = %request.conversation_id, "request queued — all agents saturated");
        self.notify.notify_waiters();

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(RouterError::DeadlineExceeded),
        }
    }

    /// Background task: wakes whenever a slot frees up (or periodically, as
    /// a backstop) and serves the queue's head while it can, in arrival
    /// order. An expired head is resolved with `DeadlineExceeded` rather
    /// than left to block everything behind it.
    pub async fn run_queue_drain_loop(self: Arc<Self>) {
        let mut backstop = tokio::time::interval(Duration::from_millis(50));
        loop {
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = backstop.tick() => {}
            }
            while self.drain_front_once().await {}
        }
    }

    /// Resolves the queue's front entry if possible. Returns `true` when an
    /// entry was resolved (served or expired), so the caller should
    /// immediately try the new front too.
    async fn drain_front_once(&self) -> bool {
        let pending_request = {
            let queue = self.queue.lock().await;
            queue.front().map(|item| (item.request.clone(), item.deadline))
        };
        let Some((request, deadline)) = pending_request else {
            return false;
        };

        if deadline <= Instant::now() {
            let mut queue = self.queue.lock().await;
            if let Some(item) = queue.pop_front() {
                let _ = item.responder.send(Err(RouterError::DeadlineExceeded));
            }
            return true;
        }

        match self.try_dispatch(&request).await {
            Some(result) => {
                let mut queue = self.queue.lock().await;
                if let Some(item) = queue.pop_front() {
                    let _ = item.responder.send(result);
                }
                true
            }
            None => false,
        }
    }

    pub fn queue_len_blocking(&self) -> usize {
        self.queue.blocking_lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::proxy::fake::FakeProxy;
    use crate::agents::{AgentDescriptor, AgentRegistryConfig};
    use crate::recorder::TracingRecorder;
    use serde_json::json;

    async fn setup() -> (Arc<AgentRegistry>, Arc<CircuitBreakerRegistry>, Arc<dyn Recorder>) {
        let recorder: Arc<dyn Recorder> = Arc::new(TracingRecorder::new());
        let registry = Arc::new(
            AgentRegistry::new(
                AgentRegistryConfig {
                    redis_url: "redis://127.0.0.1:1".to_string(),
                    heartbeat_interval: Duration::from_secs(5),
                    ttl: Duration::from_secs(15),
                },
                recorder.clone(),
            )
            .await,
        );
        (registry, Arc::new(CircuitBreakerRegistry::new()), recorder)
    }

    fn request() -> AgentRequest {
        AgentRequest {
            request_id: "r1".to_string(),
            conversation_id: "c1".to_string(),
            agent_kind: AgentKind::Narrative,
            payload: json!("hello"),
            deadline: chrono::Utc::now() + chrono::Duration::seconds(5),
            safety_mode: SafetyMode::Normal,
        }
    }

    #[tokio::test]
    async fn no_candidates_returns_no_target() {
        let (registry, breakers, recorder) = setup().await;
        let router = AgentRouter::new(registry, breakers, recorder, RouterConfig { concurrency_cap_per_agent: 4, queue_depth: 8 });
        let err = router.route(&request()).await.unwrap_err();
        assert!(matches!(err, RouterError::NoTargetAvailable));
    }

    #[tokio::test]
    async fn queued_request_is_served_once_a_slot_frees_up() {
        let (registry, breakers, recorder) = setup().await;
        let router = Arc::new(AgentRouter::new(
            registry.clone(),
            breakers,
            recorder,
            RouterConfig { concurrency_cap_per_agent: 1, queue_depth: 4 },
        ));
        registry.insert_for_test(AgentDescriptor {
            agent_id: "a1".to_string(),
            agent_kind: AgentKind::Narrative,
            capabilities: Capabilities::new(),
            endpoint: "inproc://a1".to_string(),
            load: 0,
            last_heartbeat: chrono::Utc::now(),
        });
        let proxy = Arc::new(FakeProxy::echo("a1", AgentKind::Narrative));
        router.register_proxy("a1", proxy.clone()).await;

        let drain_handle = tokio::spawn(router.clone().run_queue_drain_loop());

        // Occupy the only slot with a request that blocks until released.
        proxy.hold_next_call();
        let held_router = router.clone();
        let holder = tokio::spawn(async move { held_router.route(&request()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut queued_request = request();
        queued_request.request_id = "r2".to_string();
        let queued_router = router.clone();
        let queued = tokio::spawn(async move { queued_router.route(&queued_request).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(router.queue_len_blocking(), 1);

        proxy.release_held_call();
        holder.await.unwrap().unwrap();
        let queued_result = queued.await.unwrap();
        assert!(queued_result.is_ok(), "queued request should be served once the slot frees up");
        drain_handle.abort();
    }

    #[tokio::test]
    async fn queue_overflow_fails_fast_with_overloaded() {
        let (registry, breakers, recorder) = setup().await;
        let router = Arc::new(AgentRouter::new(
            registry.clone(),
            breakers,
            recorder,
            RouterConfig { concurrency_cap_per_agent: 1, queue_depth: 1 },
        ));
        registry.insert_for_test(AgentDescriptor {
            agent_id: "a1".to_string(),
            agent_kind: AgentKind::Narrative,
            capabilities: Capabilities::new(),
            endpoint: "inproc://a1".to_string(),
            load: 0,
            last_heartbeat: chrono::Utc::now(),
        });
        let proxy = Arc::new(FakeProxy::echo("a1", AgentKind::Narrative));
        proxy.hold_next_call();
        router.register_proxy("a1", proxy.clone()).await;

        let held_router = router.clone();
        let holder = tokio::spawn(async move { held_router.route(&request()).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut first_queued = request();
        first_queued.request_id = "r2".to_string();
        let first_router = router.clone();
        let first = tokio::spawn(async move { first_router.route(&first_queued).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut second_queued = request();
        second_queued.request_id = "r3".to_string();
        let err = router.route(&second_queued).await.unwrap_err();
        assert!(matches!(err, RouterError::Overloaded));

        proxy.release_held_call();
        holder.await.unwrap().unwrap();
        let _ = first.await.unwrap();
    }
}
