//! Content-safety gate: ordered rule stages producing a `SafetyReport` for
//! every payload that would otherwise reach a client.

pub mod report;
pub mod rules;
pub mod validator;

pub use validator::{SafetyValidator, SafetyValidatorConfig};
