//! Call stack implementation
//!
//! This module provides the call stack for function execution:
//! - [`Stack`]: The call stack containing frames, rooted at the globals frame
//! - [`StackFrame`]: A single function's activation record
//! - [`Slot`]: A named storage location holding exactly one value
//!
//! # Bindings vs. owned slots
//!
//! A frame binds names to addresses. Stack-resident slots are owned by the
//! frame and die with it; a heap-bound declaration is still *bound* in the
//! frame, but its slot lives in the heap and survives the pop.

use super::value::{Address, Value};
use crate::program::ast::{Location, SiteId, VarKind};
use rustc_hash::FxHashMap;

/// A single storage location
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub name: String,
    pub kind: VarKind,
    pub value: Value,
    pub site: Option<SiteId>, // None for globals
    pub address: Address,
}

impl Slot {
    pub fn new(
        name: impl Into<String>,
        kind: VarKind,
        value: Value,
        site: Option<SiteId>,
        address: Address,
    ) -> Self {
        Slot {
            name: name.into(),
            kind,
            value,
            site,
            address,
        }
    }
}

/// Stack frame for a function call
#[derive(Debug, Clone)]
pub struct StackFrame {
    pub function_name: String,
    pub call_site: Option<Location>, // Where to return to
    slots: Vec<Slot>,                // Stack-resident slots owned by this frame
    bindings: FxHashMap<String, Address>,
    insertion_order: Vec<String>, // Track order of variable declarations
}

impl StackFrame {
    pub fn new(function_name: String, call_site: Option<Location>) -> Self {
        StackFrame {
            function_name,
            call_site,
            slots: Vec::new(),
            bindings: FxHashMap::default(),
            insertion_order: Vec::new(),
        }
    }

    /// Take ownership of a stack-resident slot, returning its index in the frame
    pub fn push_slot(&mut self, slot: Slot) -> usize {
        self.slots.push(slot);
        self.slots.len() - 1
    }

    /// Bind a name to a slot address (stack or heap)
    pub fn bind(&mut self, name: &str, address: Address) {
        if self.bindings.insert(name.to_string(), address).is_none() {
            self.insertion_order.push(name.to_string());
        }
    }

    /// Address bound to a name in this frame
    pub fn lookup(&self, name: &str) -> Option<Address> {
        self.bindings.get(name).copied()
    }

    pub fn slot(&self, index: usize) -> Option<&Slot> {
        self.slots.get(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut Slot> {
        self.slots.get_mut(index)
    }

    /// Slots owned by this frame
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// Bindings in declaration order
    pub fn bindings(&self) -> impl Iterator<Item = (&str, Address)> + '_ {
        self.insertion_order
            .iter()
            .filter_map(|name| self.bindings.get(name).map(|addr| (name.as_str(), *addr)))
    }
}

/// The call stack
#[derive(Debug, Clone)]
pub struct Stack {
    frames: Vec<StackFrame>,
}

impl Stack {
    pub fn new() -> Self {
        Stack { frames: Vec::new() }
    }

    /// Push a new stack frame
    pub fn push_frame(&mut self, function_name: String, call_site: Option<Location>) {
        self.frames.push(StackFrame::new(function_name, call_site));
    }

    /// Pop the top stack frame
    pub fn pop_frame(&mut self) -> Option<StackFrame> {
        self.frames.pop()
    }

    /// Get the current (top) frame
    pub fn current_frame(&self) -> Option<&StackFrame> {
        self.frames.last()
    }

    /// Get a mutable reference to the current frame
    pub fn current_frame_mut(&mut self) -> Option<&mut StackFrame> {
        self.frames.last_mut()
    }

    /// Get all frames, bottom first
    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    /// Get the depth of the call stack
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Check if stack is empty
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, index: usize) -> Option<&StackFrame> {
        self.frames.get(index)
    }

    /// Get a mutable reference to a specific frame by index
    pub fn frame_mut(&mut self, index: usize) -> Option<&mut StackFrame> {
        self.frames.get_mut(index)
    }
}

impl Default for Stack {
    fn default() -> Self {
        Self::new()
    }
}
