//! Agent identity, capability matching, the proxy seam, and the Redis-backed
//! registry.

pub mod capabilities;
pub mod descriptor;
pub mod proxy;
pub mod registry;

pub use capabilities::{satisfies, AgentKind, Capabilities};
pub use descriptor::AgentDescriptor;
pub use proxy::{AgentProxy, ProxyError};
pub use registry::{AgentRegistry, AgentRegistryConfig, HeartbeatOutcome, RegistryChange, RegistryError};
