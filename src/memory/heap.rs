//! Heap implementation for the simulator
//!
//! This module provides the heap region:
//! - Heap-bound slots (declarations promoted by the escape classifier)
//! - Blocks backing reference headers
//! - Tables backing key-value headers
//! - Reachability-based lifetime tracking with tombstones
//!
//! Nothing is ever freed. Objects no live binding can reach are marked
//! [`HeapState::Unreachable`], which is what a collector would reclaim.

use super::stack::Slot;
use super::value::{Address, Value};
use crate::interpreter::constants::{HEAP_ADDRESS_START, SLOT_SIZE};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::BTreeSet;

/// Lifetime state of a heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HeapState {
    Live,
    Unreachable, // No path from any live binding; kept for reporting
}

/// Sequence storage shared by every reference header that designates it
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub cells: Vec<Value>, // Length is the block's capacity
    pub zero: Value,       // Fill value for spare capacity
}

/// Associative storage shared by every key-value header that designates it
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    pub entries: Vec<(Value, Value)>, // Insertion order
}

impl Table {
    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }
}

/// Object stored in the heap
#[derive(Debug, Clone, PartialEq)]
pub enum HeapObject {
    Slot(Slot),
    Block(Block),
    Table(Table),
}

impl HeapObject {
    /// Values held directly by this object
    pub fn values(&self) -> Box<dyn Iterator<Item = &Value> + '_> {
        match self {
            HeapObject::Slot(slot) => Box::new(std::iter::once(&slot.value)),
            HeapObject::Block(block) => Box::new(block.cells.iter()),
            HeapObject::Table(table) => {
                Box::new(table.entries.iter().flat_map(|(k, v)| [k, v]))
            }
        }
    }
}

/// A heap object with its lifetime state
#[derive(Debug, Clone)]
pub struct HeapEntry {
    pub object: HeapObject,
    pub state: HeapState,
}

/// The heap
#[derive(Debug, Clone)]
pub struct Heap {
    entries: FxHashMap<Address, HeapEntry>,
    next_address: Address,
}

impl Heap {
    pub fn new() -> Self {
        Heap {
            entries: FxHashMap::default(),
            next_address: HEAP_ADDRESS_START, // Start heap at high address
        }
    }

    /// Address the next allocation will receive
    pub fn next_address(&self) -> Address {
        self.next_address
    }

    /// Store an object and return its address
    pub fn allocate(&mut self, object: HeapObject) -> Address {
        let addr = self.next_address;
        self.next_address += SLOT_SIZE;
        self.entries.insert(
            addr,
            HeapEntry {
                object,
                state: HeapState::Live,
            },
        );
        addr
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.entries.contains_key(&addr)
    }

    pub fn get(&self, addr: Address) -> Option<&HeapObject> {
        self.entries.get(&addr).map(|e| &e.object)
    }

    pub fn get_mut(&mut self, addr: Address) -> Option<&mut HeapObject> {
        self.entries.get_mut(&addr).map(|e| &mut e.object)
    }

    pub fn state(&self, addr: Address) -> Option<HeapState> {
        self.entries.get(&addr).map(|e| e.state)
    }

    /// Get all entries (includes unreachable ones)
    pub fn entries(&self) -> &FxHashMap<Address, HeapEntry> {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Heap addresses reachable from `roots`; addresses outside the heap are skipped
    pub fn reachable_from(&self, roots: impl IntoIterator<Item = Address>) -> BTreeSet<Address> {
        let mut seen = BTreeSet::new();
        let mut pending: Vec<Address> = roots.into_iter().collect();
        let mut refs = Vec::new();

        while let Some(addr) = pending.pop() {
            let Some(entry) = self.entries.get(&addr) else {
                continue;
            };
            if !seen.insert(addr) {
                continue;
            }
            refs.clear();
            for value in entry.object.values() {
                value.referenced_addresses(&mut refs);
            }
            pending.extend(refs.iter().copied());
        }
        seen
    }

    /// Tombstone every live object outside `live`; returns how many changed state
    pub fn mark_unreachable(&mut self, live: &BTreeSet<Address>) -> usize {
        let mut marked = 0;
        for (addr, entry) in self.entries.iter_mut() {
            if entry.state == HeapState::Live && !live.contains(addr) {
                entry.state = HeapState::Unreachable;
                marked += 1;
            }
        }
        marked
    }

    pub fn count(&self, state: HeapState) -> usize {
        self.entries.values().filter(|e| e.state == state).count()
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
