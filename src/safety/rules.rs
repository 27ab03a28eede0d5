//! Declarative rule table for the [`crate::safety::validator::SafetyValidator`]
//! pipeline.
//!
//! Pattern lists are deliberately small and illustrative; the rule set is
//! meant to be treated as configuration, not code. A production deployment
//! supplies its own table — this one is the built-in default.

use once_cell::sync::Lazy;

use crate::types::Severity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Crisis,
    HardBlock,
    SoftRewrite,
    Scoring,
}

/// One pattern-driven rule. Ordered evaluation within a stage is significant.
pub struct RuleSpec {
    pub id: &'static str,
    pub stage: Stage,
    pub severity: Severity,
    pub patterns: &'static [&'static str],
    /// Present only on `SoftRewrite` rules.
    pub rewrite: Option<fn(&str) -> String>,
    /// Present only on `Scoring` rules — subtracted from the running score
    /// for each match.
    pub weight: f64,
}

fn contains_any(haystack_lower: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| haystack_lower.contains(p))
}

impl RuleSpec {
    pub fn matches(&self, payload_lower: &str) -> bool {
        contains_any(payload_lower, self.patterns)
    }
}

fn redact_pii(text: &str) -> String {
    static EMAIL: Lazy<regex::Regex> = Lazy::new(|| regex::Regex::new(r"[\w.+-]+@[\w-]+\.[\w.-]+").unwrap());
    static PHONE: Lazy<regex::Regex> = Lazy::new(|| regex::Regex::new(r"\b\d{3}[-.\s]?\d{3}[-.\s]?\d{4}\b").unwrap());
    let redacted = EMAIL.replace_all(text, "[redacted-email]");
    PHONE.replace_all(&redacted, "[redacted-phone]").into_owned()
}

fn soften_tone(text: &str) -> String {
    text.replace("you must", "you might consider").replace("you have to", "it may help to")
}

/// Built-in default rule table, in declared evaluation order.
pub static DEFAULT_RULES: Lazy<Vec<RuleSpec>> = Lazy::new(|| {
    vec![
        // --- Stage 1: crisis detection — always runs, never disabled ---
        RuleSpec {
            id: "crisis.self-harm",
            stage: Stage::Crisis,
            severity: Severity::High,
            patterns: &[
                "kill myself",
                "end my life",
                "suicide",
                "want to die",
                "hurt myself",
                "self-harm",
            ],
            rewrite: None,
            weight: 0.0,
        },
        RuleSpec {
            id: "crisis.endangerment",
            stage: Stage::Crisis,
            severity: Severity::High,
            patterns: &["going to hurt", "going to kill", "planning to attack"],
            rewrite: None,
            weight: 0.0,
        },
        // --- Stage 2: hard-block ---
        RuleSpec {
            id: "block.dangerous-instructions",
            stage: Stage::HardBlock,
            severity: Severity::High,
            patterns: &["how to make a bomb", "synthesize nerve agent", "build an untraceable weapon"],
            rewrite: None,
            weight: 0.0,
        },
        RuleSpec {
            id: "block.prompt-injection",
            stage: Stage::HardBlock,
            severity: Severity::Medium,
            patterns: &["ignore previous instructions", "ignore all previous", "disregard your instructions"],
            rewrite: None,
            weight: 0.0,
        },
        // --- Stage 3: soft-rewrite (first match in order wins the rewrite) ---
        RuleSpec {
            id: "rewrite.pii",
            stage: Stage::SoftRewrite,
            severity: Severity::Medium,
            patterns: &["@"],
            rewrite: Some(redact_pii),
            weight: 0.0,
        },
        RuleSpec {
            id: "rewrite.directive-tone",
            stage: Stage::SoftRewrite,
            severity: Severity::Low,
            patterns: &["you must", "you have to"],
            rewrite: Some(soften_tone),
            weight: 0.0,
        },
        // --- Stage 4: scoring — annotate only, unless aggregate falls below threshold ---
        RuleSpec {
            id: "score.dismissive-language",
            stage: Stage::Scoring,
            severity: Severity::Low,
            patterns: &["that's not a big deal", "just get over it", "stop overreacting"],
            rewrite: None,
            weight: 0.3,
        },
        RuleSpec {
            id: "score.clinical-overreach",
            stage: Stage::Scoring,
            severity: Severity::Medium,
            patterns: &["you definitely have", "i diagnose you with"],
            rewrite: None,
            weight: 0.5,
        },
    ]
});

pub fn rules_for_stage(stage: Stage) -> impl Iterator<Item = &'static RuleSpec> {
    DEFAULT_RULES.iter().filter(move |r| r.stage == stage)
}
