//! Verdicts and execution traces
//!
//! - [`Verdict`]: the immutable result of one trace (final values, panics,
//!   placements), serialized with camelCase keys
//! - [`Trace`]: bounded log of statements, call transitions, allocations and
//!   faults recorded while the engine runs
//! - [`HeapReport`]: live and unreachable heap objects at the end of a trace

use crate::interpreter::errors::FaultKind;
use crate::memory::heap::{HeapObject, HeapState};
use crate::memory::value::{Address, Value};
use crate::memory::{Placement, Storage};
use crate::program::ast::{Location, SiteId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A panic raised during a trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanicRecord {
    pub kind: FaultKind,
    pub location: Location,
}

/// Observable result of one trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub final_values: BTreeMap<String, Value>,
    pub panics: Vec<PanicRecord>,
    pub placements: BTreeMap<SiteId, Placement>,
}

impl Verdict {
    pub fn value(&self, name: &str) -> Option<&Value> {
        self.final_values.get(name)
    }

    pub fn placement(&self, site: &str) -> Option<Placement> {
        self.placements.get(site).copied()
    }

    pub fn panicked(&self) -> bool {
        !self.panics.is_empty()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Lifecycle of one call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Entered,
    Executing,
    Returning,
    Exited,
}

/// One recorded step of execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    Statement {
        location: Location,
    },
    Call {
        function: String,
        state: CallState,
        depth: usize,
    },
    Alloc {
        site: Option<SiteId>,
        address: Address,
        placement: Placement,
    },
    Fault {
        kind: FaultKind,
        location: Location,
    },
    Sweep {
        unreachable: usize,
    },
}

/// Execution trace with a cap on recorded events
#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    events: Vec<TraceEvent>,
    limit: usize,
    truncated: bool, // Set once an event was dropped
}

impl Trace {
    pub fn new(limit: usize) -> Self {
        Trace {
            events: Vec::new(),
            limit,
            truncated: false,
        }
    }

    pub fn record(&mut self, event: TraceEvent) {
        if self.events.len() >= self.limit {
            self.truncated = true;
            return;
        }
        self.events.push(event);
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Call transitions of `function`, in order
    pub fn call_states(&self, function: &str) -> Vec<CallState> {
        self.events
            .iter()
            .filter_map(|event| match event {
                TraceEvent::Call {
                    function: f, state, ..
                } if f == function => Some(*state),
                _ => None,
            })
            .collect()
    }
}

/// One heap object in a [`HeapReport`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeapObjectReport {
    pub address: Address,
    pub object: &'static str,
    pub name: Option<String>, // Slot name; None for blocks and tables
    pub state: HeapState,
}

/// Live vs. unreachable heap objects
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct HeapReport {
    pub live: usize,
    pub unreachable: usize,
    pub objects: Vec<HeapObjectReport>, // Sorted by address
}

impl HeapReport {
    pub fn from_storage(storage: &Storage) -> Self {
        let (live, unreachable) = storage.heap_counts();
        let mut objects: Vec<HeapObjectReport> = storage
            .heap()
            .entries()
            .iter()
            .map(|(address, entry)| {
                let (object, name) = match &entry.object {
                    HeapObject::Slot(slot) => ("slot", Some(slot.name.clone())),
                    HeapObject::Block(_) => ("block", None),
                    HeapObject::Table(_) => ("table", None),
                };
                HeapObjectReport {
                    address: *address,
                    object,
                    name,
                    state: entry.state,
                }
            })
            .collect();
        objects.sort_by_key(|o| o.address);
        HeapReport {
            live,
            unreachable,
            objects,
        }
    }
}
