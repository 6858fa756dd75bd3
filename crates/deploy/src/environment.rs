//! The environment a plan is deployed to.

use serde::{Deserialize, Serialize};

/// Immutable description of the target environment.
///
/// Passed explicitly through every context so several environments can be
/// orchestrated from one process without sharing state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Environment {
    /// Environment name, also the store partition key (e.g. `localhost`).
    pub name: String,
    /// Chain ID of the target network.
    pub chain_id: u64,
    /// Whether the environment is a live network (as opposed to a dev chain).
    #[serde(default)]
    pub live: bool,
    /// Free-form environment tags (e.g. `local`).
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Environment {
    pub fn new(name: impl Into<String>, chain_id: u64) -> Self {
        Self {
            name: name.into(),
            chain_id,
            live: false,
            tags: Vec::new(),
        }
    }

    pub fn live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}
