// SPDX-License-Identifier: MIT
//! Opaque metrics/trace sink consumed by every component.
//!
//! The core never talks to a concrete metrics backend — it depends only on
//! this trait seam, the way the rest of the system depends on `EventSink`
//! and `ConversationStore`. The default implementation emits `tracing`
//! events on a dedicated target, matching the daemon's own
//! `observability` conventions: counters and gauges as structured `info!`
//! events, latency as a dedicated tracker that logs slow operations.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tracing::{debug, info};

/// Metrics/trace sink. Counters and gauges are `(name, value, labels)`
/// triples; labels are rendered as `key=value` pairs in the emitted event.
pub trait Recorder: Send + Sync {
    fn record_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]);
    fn record_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);
    fn record_histogram(&self, name: &str, value_ms: f64, labels: &[(&str, &str)]);
}

/// Emits every recorded metric as a structured `tracing` event on the
/// `weave::metrics` target. Cheap, dependency-free, and sufficient for the
/// core's own needs — a real backend (Prometheus, OTLP, ...) is an adapter
/// implementing the same trait, out of scope for this crate.
#[derive(Debug, Default)]
pub struct TracingRecorder {
    events_emitted: AtomicU64,
}

impl TracingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of metric events emitted since construction (diagnostic only).
    pub fn emitted_count(&self) -> u64 {
        self.events_emitted.load(Ordering::Relaxed)
    }
}

impl Recorder for TracingRecorder {
    fn record_counter(&self, name: &str, value: u64, labels: &[(&str, &str)]) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
        info!(target: "weave::metrics", metric = name, kind = "counter", value, ?labels);
    }

    fn record_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
        info!(target: "weave::metrics", metric = name, kind = "gauge", value, ?labels);
    }

    fn record_histogram(&self, name: &str, value_ms: f64, labels: &[(&str, &str)]) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);
        info!(target: "weave::metrics", metric = name, kind = "histogram", value_ms, ?labels);
    }
}

/// Tracks latency of an async operation and emits a structured log event,
/// escalating to `info!` when the operation is unexpectedly slow.
pub struct LatencyTracker {
    operation: String,
    start: Instant,
}

impl LatencyTracker {
    pub fn start(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            start: Instant::now(),
        }
    }

    /// Finish tracking, optionally recording the elapsed time into a [`Recorder`].
    pub fn finish(self, recorder: &dyn Recorder) {
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        recorder.record_histogram(
            "weave_stage_latency_ms",
            elapsed_ms,
            &[("operation", &self.operation)],
        );
        if elapsed_ms > 1000.0 {
            info!(operation = %self.operation, elapsed_ms, "slow operation");
        } else {
            debug!(operation = %self.operation, elapsed_ms, "operation complete");
        }
    }
}
