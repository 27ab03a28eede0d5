//! `SafetyValidator` — the content-safety gate every outbound (and, in
//! strict mode, inbound) payload passes through.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use super::rules::{rules_for_stage, Stage, DEFAULT_RULES};
use crate::recorder::Recorder;
use crate::types::{Finding, SafetyMode, SafetyReport, Severity, Span, Verdict};

pub struct SafetyValidatorConfig {
    pub rewrite_cap_per_payload: u32,
    pub score_threshold_warn: f64,
}

pub struct SafetyValidator {
    config: SafetyValidatorConfig,
    recorder: Arc<dyn Recorder>,
}

/// Extracts the text a rule matches against. Non-string payloads (structured
/// JSON) are matched against their serialized form — conservative, since a
/// rule false-negative is worse than a false positive here.
fn payload_text(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl SafetyValidator {
    pub fn new(config: SafetyValidatorConfig, recorder: Arc<dyn Recorder>) -> Self {
        Self { config, recorder }
    }

    /// Run the full pipeline against `payload` under `mode`.
    /// Deterministic: same payload + mode always yields a byte-identical
    /// report.
    pub fn validate(&self, payload: &Value, mode: SafetyMode, conversation_id: &str) -> SafetyReport {
        let text = payload_text(payload);
        let lower = text.to_lowercase();

        // Stage 1 — crisis detection always runs, even under crisis-bypass.
        if let Some(findings) = self.run_stage(Stage::Crisis, &lower) {
            warn!(conversation_id, verdict = "crisis", "safety pipeline: crisis detected");
            self.recorder.record_counter("weave_safety_verdicts_total", 1, &[("verdict", "crisis")]);
            return SafetyReport::crisis(findings);
        }

        if mode == SafetyMode::CrisisBypass {
            return SafetyReport::pass();
        }

        let strict = mode == SafetyMode::Strict;

        // Stage 2 — hard block. Strict mode lowers the bar: a scoring-stage
        // match at Medium severity or above also hard-blocks on its own,
        // not just an explicit hard-block rule.
        let hard_block_findings = self.run_stage(Stage::HardBlock, &lower);
        let scoring_escalation = strict
            .then(|| self.run_stage(Stage::Scoring, &lower))
            .flatten()
            .map(|findings| findings.into_iter().filter(|f| f.severity >= Severity::Medium).collect::<Vec<_>>())
            .filter(|findings| !findings.is_empty());

        if hard_block_findings.is_some() || scoring_escalation.is_some() {
            let mut findings = hard_block_findings.unwrap_or_default();
            if let Some(extra) = scoring_escalation {
                findings.extend(extra);
            }
            warn!(conversation_id, verdict = "block", "safety pipeline: hard block");
            self.recorder.record_counter("weave_safety_verdicts_total", 1, &[("verdict", "block")]);
            return SafetyReport::block(findings);
        }

        // Stage 3 — soft rewrite: first match in declared order wins the
        // rewrite; later matches become findings. Strict mode lowers the
        // bar by chaining every matching rewrite instead of stopping at the
        // first, so e.g. PII redaction and tone softening both land on the
        // same payload.
        let mut findings: Vec<Finding> = Vec::new();
        let mut transformed: Option<Value> = None;

        if self.config.rewrite_cap_per_payload > 0 {
            let mut rewrite_applied = false;
            let mut current_text = text.clone();
            for rule in rules_for_stage(Stage::SoftRewrite) {
                let current_lower = current_text.to_lowercase();
                if !Self::safe_matches(rule, &current_lower) {
                    continue;
                }
                findings.push(Finding { rule_id: rule.id.to_string(), severity: rule.severity, span: Span::Whole });
                if rewrite_applied && !strict {
                    continue;
                }
                if let Some(transform) = rule.rewrite {
                    let new_text = transform(&current_text);
                    let new_lower = new_text.to_lowercase();
                    // The transformed payload must itself clear stage 1
                    // before release.
                    if let Some(crisis_findings) = self.run_stage(Stage::Crisis, &new_lower) {
                        warn!(conversation_id, "rewrite introduced crisis content — blocking original");
                        self.recorder.record_counter("weave_safety_verdicts_total", 1, &[("verdict", "block")]);
                        return SafetyReport::block(crisis_findings);
                    }
                    current_text = new_text;
                    rewrite_applied = true;
                }
            }
            if rewrite_applied {
                transformed = Some(Value::String(current_text));
            }
        }

        // Stage 4 — scoring: annotate, and elevate to warn if the aggregate
        // appropriateness score falls below threshold.
        let threshold = if strict { self.config.score_threshold_warn + 0.2 } else { self.config.score_threshold_warn };
        let mut score = 1.0_f64;
        for rule in rules_for_stage(Stage::Scoring) {
            if Self::safe_matches(rule, &lower) {
                findings.push(Finding { rule_id: rule.id.to_string(), severity: rule.severity, span: Span::Whole });
                score -= rule.weight;
            }
        }

        let verdict = if transformed.is_some() {
            Verdict::Warn
        } else if score < threshold {
            Verdict::Warn
        } else {
            Verdict::Pass
        };

        if verdict != Verdict::Pass {
            warn!(conversation_id, verdict = "warn", score, "safety pipeline: warn");
        }
        self.recorder.record_counter(
            "weave_safety_verdicts_total",
            1,
            &[("verdict", match verdict {
                Verdict::Pass => "pass",
                Verdict::Warn => "warn",
                Verdict::Block => "block",
                Verdict::Crisis => "crisis",
            })],
        );

        SafetyReport { verdict, findings, transformed_payload: transformed }
    }

    /// Evaluates every rule in `stage`; a panicking rule is caught and
    /// converted to a fail-safe high-severity finding rather than crashing
    /// the pipeline.
    fn run_stage(&self, stage: Stage, payload_lower: &str) -> Option<Vec<Finding>> {
        let mut findings = Vec::new();
        for rule in rules_for_stage(stage) {
            if Self::safe_matches(rule, payload_lower) {
                findings.push(Finding { rule_id: rule.id.to_string(), severity: rule.severity, span: Span::Whole });
            }
        }
        if findings.is_empty() {
            None
        } else {
            Some(findings)
        }
    }

    fn safe_matches(rule: &super::rules::RuleSpec, payload_lower: &str) -> bool {
        match std::panic::catch_unwind(AssertUnwindSafe(|| rule.matches(payload_lower))) {
            Ok(result) => result,
            Err(_) => {
                warn!(rule_id = rule.id, "safety rule panicked — treating as fail-safe match");
                true
            }
        }
    }

    /// Exposed for diagnostics/config-show; not part of the hot path.
    pub fn rule_count(&self) -> usize {
        DEFAULT_RULES.len()
    }
}
