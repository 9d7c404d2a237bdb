// Simulator configuration

use crate::escape::EscapeMode;
use crate::interpreter::constants::{DEFAULT_ENTRY, DEFAULT_TRACE_LIMIT};
use crate::memory::Placement;
use crate::SimError;
use serde::{Deserialize, Serialize};

/// How allocation sites are placed at run time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementPolicy {
    /// Follow the escape classifier
    #[default]
    Classified,
    /// Every site on the stack; escaping addresses dangle
    ForceStack,
    /// Every site in the heap
    ForceHeap,
}

impl PlacementPolicy {
    /// Placement forced by this policy, if any
    pub fn forced(self) -> Option<Placement> {
        match self {
            PlacementPolicy::Classified => None,
            PlacementPolicy::ForceStack => Some(Placement::Stack),
            PlacementPolicy::ForceHeap => Some(Placement::Heap),
        }
    }
}

/// Options for one simulation; every field has a default
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub entry: String,
    pub escape_mode: EscapeMode,
    pub placement_policy: PlacementPolicy,
    pub trace_limit: usize, // Events past this are dropped
}

impl SimConfig {
    pub fn from_json(json: &str) -> Result<Self, SimError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = entry.into();
        self
    }

    pub fn with_escape_mode(mut self, escape_mode: EscapeMode) -> Self {
        self.escape_mode = escape_mode;
        self
    }

    pub fn with_placement_policy(mut self, placement_policy: PlacementPolicy) -> Self {
        self.placement_policy = placement_policy;
        self
    }

    pub fn with_trace_limit(mut self, trace_limit: usize) -> Self {
        self.trace_limit = trace_limit;
        self
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            entry: DEFAULT_ENTRY.to_string(),
            escape_mode: EscapeMode::Conservative,
            placement_policy: PlacementPolicy::Classified,
            trace_limit: DEFAULT_TRACE_LIMIT,
        }
    }
}
