//! `Orchestrator` — the per-request pipeline that ties the registry, router,
//! circuit breakers, safety validator, and event hub together.

pub mod pipeline;

pub use pipeline::{Orchestrator, OrchestratorConfig, OrchestratorError};
