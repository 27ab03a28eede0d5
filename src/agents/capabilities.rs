//! Agent kind and capability tags.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The broad category of an agent. `Custom` carries a free-form label for
/// agent families the core has no dedicated kind for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Input,
    World,
    Narrative,
    Safety,
    Custom(String),
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentKind::Input => write!(f, "input"),
            AgentKind::World => write!(f, "world"),
            AgentKind::Narrative => write!(f, "narrative"),
            AgentKind::Safety => write!(f, "safety"),
            AgentKind::Custom(label) => write!(f, "custom:{label}"),
        }
    }
}

impl AgentKind {
    /// Registry key fragment — stable across process restarts, unlike
    /// `Display`'s `custom:` prefix which is for logs only.
    pub fn registry_key(&self) -> String {
        match self {
            AgentKind::Input => "input".to_string(),
            AgentKind::World => "world".to_string(),
            AgentKind::Narrative => "narrative".to_string(),
            AgentKind::Safety => "safety".to_string(),
            AgentKind::Custom(label) => format!("custom.{label}"),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "input" => AgentKind::Input,
            "world" => AgentKind::World,
            "narrative" => AgentKind::Narrative,
            "safety" => AgentKind::Safety,
            other => match other.strip_prefix("custom.") {
                Some(label) => AgentKind::Custom(label.to_string()),
                None => AgentKind::Custom(other.to_string()),
            },
        }
    }
}

/// Free-form capability tag set, e.g. `{"therapeutic", "long-context"}`.
pub type Capabilities = BTreeSet<String>;

/// `required` is satisfied by `have` iff `have` is a superset of `required`.
pub fn satisfies(have: &Capabilities, required: &Capabilities) -> bool {
    required.is_subset(have)
}
