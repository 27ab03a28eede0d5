// SPDX-License-Identifier: MIT
//! Per-destination circuit breaker protecting outbound agent calls from
//! cascading failures.
//!
//! # State machine
//!
//! ```text
//! Closed ──(N consecutive failures within window W)──► Open
//!   ▲                                                     │
//!   └──(M consecutive probe successes)──── HalfOpen ◄─(cooldown elapsed)──┘
//! ```
//!
//! - **Closed**: requests pass through; consecutive failures are counted.
//! - **Open**: requests fail fast with [`CircuitOpen`](BreakerError::CircuitOpen).
//!   After the cooldown elapses, one caller is allowed to probe and the
//!   breaker moves to `HalfOpen`. A `crisis-bypass` request may additionally
//!   probe through an open breaker ahead of cooldown, but only one such
//!   bypass probe may be in flight at a time.
//! - **HalfOpen**: up to `half_open_probes` calls are admitted concurrently.
//!   Any failure reopens the circuit; `half_open_probes` consecutive
//!   successes close it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{info, warn};

use crate::agents::AgentKind;
use crate::recorder::Recorder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// A caller that observed `CircuitOpen` must not attempt the call.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BreakerError {
    #[error("circuit open for target")]
    CircuitOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
    pub half_open_probes: u32,
}

impl CircuitBreakerConfig {
    pub fn default_profile() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(30),
            cooldown: Duration::from_secs(60),
            half_open_probes: 3,
        }
    }

    /// Tighter thresholds for safety-critical targets.
    pub fn safety_profile() -> Self {
        Self {
            failure_threshold: 3,
            failure_window: Duration::from_secs(30),
            cooldown: Duration::from_secs(30),
            half_open_probes: 3,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    /// Caps concurrent probes while `HalfOpen`. Recreated fresh each time the
    /// circuit enters `HalfOpen`; `None` in every other state.
    half_open_permits: Option<Arc<Semaphore>>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure: None,
            opened_at: None,
            half_open_permits: None,
        }
    }
}

/// A single target's breaker. Cheaply cloneable; clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<RwLock<BreakerInner>>,
    config: Arc<CircuitBreakerConfig>,
    bypass_permit: Arc<Semaphore>,
    name: Arc<str>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(BreakerInner::new())),
            config: Arc::new(config),
            bypass_permit: Arc::new(Semaphore::new(1)),
            name: Arc::from(name.into().as_str()),
        }
    }

    /// Decides whether a normal call may proceed, transitioning Open →
    /// HalfOpen once the cooldown has elapsed. `Closed` admits freely
    /// (`Some(None)`); `HalfOpen` admits only while a probe permit is free
    /// and the caller must hold the returned permit for the call's duration;
    /// `None` means the circuit is open and the call must not be attempted.
    pub async fn admit(&self) -> Option<Option<tokio::sync::OwnedSemaphorePermit>> {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::Closed => Some(None),
            CircuitState::HalfOpen => {
                let permits = inner.half_open_permits.clone()?;
                permits.try_acquire_owned().ok().map(Some)
            }
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed < self.config.cooldown {
                    return None;
                }
                info!(breaker = %self.name, "circuit -> half_open (cooldown elapsed)");
                let permits = Arc::new(Semaphore::new(self.config.half_open_probes.max(1) as usize));
                let permit = permits.clone().try_acquire_owned().ok();
                inner.state = CircuitState::HalfOpen;
                inner.consecutive_successes = 0;
                inner.half_open_permits = Some(permits);
                permit.map(Some)
            }
        }
    }

    /// Whether a call would currently be admitted, without consuming a
    /// half-open probe slot. Diagnostic use only — callers that actually
    /// invoke an agent must go through [`Self::admit`].
    pub async fn is_allowed(&self) -> bool {
        let inner = self.inner.read().await;
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => inner.half_open_permits.as_ref().is_some_and(|p| p.available_permits() > 0),
            CircuitState::Open => inner.opened_at.map(|t| t.elapsed()).unwrap_or_default() >= self.config.cooldown,
        }
    }

    /// Attempt a `crisis-bypass` probe through an otherwise-open circuit.
    /// Returns `None` if a bypass probe is already in flight.
    pub fn try_bypass_probe(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        self.bypass_permit.clone().try_acquire_owned().ok()
    }

    pub async fn record_success(&self, recorder: &dyn Recorder) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.half_open_probes {
                    self.transition(&mut inner, CircuitState::Closed, recorder);
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.opened_at = None;
                    inner.half_open_permits = None;
                }
            }
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub async fn record_failure(&self, recorder: &dyn Recorder) {
        let mut inner = self.inner.write().await;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.opened_at = Some(Instant::now());
                    self.transition(&mut inner, CircuitState::Open, recorder);
                }
            }
            CircuitState::HalfOpen => {
                inner.opened_at = Some(Instant::now());
                inner.consecutive_successes = 0;
                inner.half_open_permits = None;
                self.transition(&mut inner, CircuitState::Open, recorder);
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, recorder: &dyn Recorder) {
        if inner.state == to {
            return;
        }
        warn!(breaker = %self.name, from = %inner.state, to = %to, "circuit breaker state transition");
        recorder.record_counter(
            "weave_circuit_transitions_total",
            1,
            &[("target", &self.name), ("to", &to.to_string())],
        );
        recorder.record_gauge(
            "weave_circuit_state",
            state_gauge_value(to),
            &[("target", &self.name)],
        );
        inner.state = to;
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn state_gauge_value(state: CircuitState) -> f64 {
    match state {
        CircuitState::Closed => 0.0,
        CircuitState::HalfOpen => 1.0,
        CircuitState::Open => 2.0,
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker").field("name", &self.name).finish()
    }
}

/// Which profile a breaker target uses. The safety classifier is the only
/// built-in safety-critical kind; everything else uses the default profile.
fn profile_for(kind: AgentKind, default_profile: &CircuitBreakerConfig, safety_profile: &CircuitBreakerConfig) -> CircuitBreakerConfig {
    match kind {
        AgentKind::Safety => safety_profile.clone(),
        _ => default_profile.clone(),
    }
}

/// Lazily creates and retains one breaker per `(agent_kind, target_id)` pair.
/// Process-local by design — each orchestrator instance gauges its own view
/// of target health.
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<(AgentKind, String), CircuitBreaker>>,
    default_profile: CircuitBreakerConfig,
    safety_profile: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::with_profiles(CircuitBreakerConfig::default_profile(), CircuitBreakerConfig::safety_profile())
    }

    /// Build a registry whose default/safety profiles come from resolved
    /// configuration rather than the hardcoded defaults.
    pub fn with_profiles(default_profile: CircuitBreakerConfig, safety_profile: CircuitBreakerConfig) -> Self {
        Self { breakers: Mutex::new(HashMap::new()), default_profile, safety_profile }
    }

    pub async fn get(&self, kind: AgentKind, target_id: &str) -> CircuitBreaker {
        let key = (kind.clone(), target_id.to_string());
        let mut breakers = self.breakers.lock().await;
        breakers
            .entry(key)
            .or_insert_with(|| {
                let profile = profile_for(kind, &self.default_profile, &self.safety_profile);
                CircuitBreaker::new(format!("{kind}:{target_id}"), profile)
            })
            .clone()
    }

    pub async fn snapshot(&self) -> Vec<((AgentKind, String), CircuitState)> {
        let breakers = self.breakers.lock().await;
        let mut out = Vec::with_capacity(breakers.len());
        for (key, b) in breakers.iter() {
            out.push((key.clone(), b.state().await));
        }
        out
    }
}
