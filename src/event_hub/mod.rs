//! Client-facing WebSocket event hub: subscriptions, replay, and
//! cross-instance fan-out.

pub mod hub;
pub mod protocol;
pub mod topic;

pub use hub::{EventHub, EventHubConfig, HubError};
pub use protocol::{ByeReason, ClientFrame, ErrorCode, ServerFrame};
