//! Criterion benchmarks for hot paths in the orchestration core.
//!
//! Run with:
//!   cargo bench
//!
//! Covers:
//!   - SafetyValidator::validate (regex rule pipeline, runs on every message)
//!   - Topic wildcard matching and ring-buffer replay (event hub fan-out)
//!   - WebSocket frame (de)serialization

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use std::sync::Arc;
use weave::event_hub::topic::{topic_matches, TopicBuffer};
use weave::event_hub::{ClientFrame, ServerFrame};
use weave::recorder::TracingRecorder;
use weave::safety::{SafetyValidator, SafetyValidatorConfig};
use weave::types::{Event, SafetyMode};

fn validator() -> SafetyValidator {
    SafetyValidator::new(
        SafetyValidatorConfig { rewrite_cap_per_payload: 1, score_threshold_warn: 0.4 },
        Arc::new(TracingRecorder::new()),
    )
}

fn bench_safety_validate(c: &mut Criterion) {
    let v = validator();
    let clean = json!("Let's continue exploring the cave system to the north.");
    let flagged = json!("Please contact me at someone@example.com about this.");

    c.bench_function("safety_validate_clean_normal", |b| {
        b.iter(|| {
            let report = v.validate(black_box(&clean), SafetyMode::Normal, "c1");
            black_box(report);
        });
    });

    c.bench_function("safety_validate_flagged_strict", |b| {
        b.iter(|| {
            let report = v.validate(black_box(&flagged), SafetyMode::Strict, "c1");
            black_box(report);
        });
    });
}

fn bench_topic_matching(c: &mut Criterion) {
    c.bench_function("topic_matches_wildcard", |b| {
        b.iter(|| {
            black_box(topic_matches(black_box("agent.*"), black_box("agent.narrative.status")));
        });
    });

    c.bench_function("topic_buffer_replay_1k", |b| {
        b.iter_with_setup(
            || {
                let mut buf = TopicBuffer::new(1024);
                for seq in 1..=1024u64 {
                    buf.push(Event {
                        event_id: seq.to_string(),
                        topic: "conversation.c1".to_string(),
                        sequence: seq,
                        timestamp: chrono::Utc::now(),
                        payload: json!({"n": seq}),
                        owner_id: "owner-1".to_string(),
                    });
                }
                buf
            },
            |buf| {
                let replay = buf.replay_since(black_box(500));
                black_box(replay.events.len());
            },
        );
    });
}

fn bench_frame_codec(c: &mut Criterion) {
    let request_raw = r#"{"type":"request","conversation_id":"c1","request_id":"r1","payload":{"text":"hello there"},"safety_mode":"normal","deadline_ms":2000}"#;

    c.bench_function("client_frame_parse_request", |b| {
        b.iter(|| {
            let frame: ClientFrame = serde_json::from_str(black_box(request_raw)).unwrap();
            black_box(frame);
        });
    });

    c.bench_function("server_frame_serialize_event", |b| {
        let frame = ServerFrame::Event {
            topic: "conversation.c1".to_string(),
            sequence: 42,
            timestamp: 0,
            payload: json!({"text": "hello there"}),
        };
        b.iter(|| {
            let s = serde_json::to_string(black_box(&frame)).unwrap();
            black_box(s);
        });
    });
}

criterion_group!(benches, bench_safety_validate, bench_topic_matching, bench_frame_codec);
criterion_main!(benches);
