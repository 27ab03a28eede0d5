//! Re-exports the shared `SafetyReport`/`Verdict`/`Finding` types and adds
//! the helpers the validator pipeline needs to build them up incrementally.

pub use crate::types::{Finding, Severity, Span, SafetyReport, Verdict};

impl SafetyReport {
    pub fn crisis(findings: Vec<Finding>) -> Self {
        Self {
            verdict: Verdict::Crisis,
            findings,
            transformed_payload: None,
        }
    }

    pub fn block(findings: Vec<Finding>) -> Self {
        Self {
            verdict: Verdict::Block,
            findings,
            transformed_payload: None,
        }
    }

    pub fn warn(findings: Vec<Finding>, transformed_payload: Option<serde_json::Value>) -> Self {
        Self {
            verdict: Verdict::Warn,
            findings,
            transformed_payload,
        }
    }

    pub fn is_terminal_block(&self) -> bool {
        matches!(self.verdict, Verdict::Block | Verdict::Crisis)
    }
}
