//! Storage engine for the simulator
//!
//! This module provides the core memory abstractions:
//! - [`value`]: Runtime value representation and the copy rule
//! - [`stack`]: Call stack with frames and named slots
//! - [`heap`]: Heap objects (slots, blocks, tables) with reachability tracking
//!
//! [`Storage`] ties them together behind the operations the interpreter uses:
//! `allocate`, `copy_value`, `dereference`, `take_address`, plus the block and
//! table operations backing reference and key-value headers.
//!
//! # Address space
//!
//! Stack slots get addresses from [`STACK_ADDRESS_START`] upward; heap objects
//! from [`HEAP_ADDRESS_START`]. A stack address that no longer resolves
//! belonged to a popped frame and reading it is a dangling access.
//!
//! # Growth
//!
//! Appending past capacity allocates a new block of `max(2 * cap, needed)`
//! cells and rebinds only the header being appended to; every other header
//! keeps the old block.

pub mod heap;
pub mod stack;
pub mod value;

use crate::interpreter::constants::{HEAP_ADDRESS_START, SLOT_SIZE, STACK_ADDRESS_START};
use crate::program::ast::{Location, Primitive, SiteId, VarKind, GLOBALS_FRAME};
use heap::{Block, Heap, HeapObject, HeapState, Table};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use stack::{Slot, Stack, StackFrame};
use std::collections::BTreeSet;
use thiserror::Error;
use value::{Address, SlotRef, Value};

/// Where an allocation site's slots live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Placement {
    Stack,
    Heap,
}

/// Failures of individual storage operations
///
/// The interpreter attaches a location and decides which of these are
/// panic-class faults.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("dereference of an empty pointer")]
    NilDereference,

    #[error("slot at 0x{0:x} belongs to a frame that has been destroyed")]
    Dangling(Address),

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("assignment to entry in nil key-value header")]
    NilMapWrite,

    #[error("expected {expected}, got {got}")]
    KindMismatch { expected: &'static str, got: &'static str },

    #[error("no field `{0}`")]
    MissingField(String),

    #[error("address 0x{0:x} does not designate a {1}")]
    InvalidAddress(Address, &'static str),

    #[error("no active frame")]
    NoFrame,
}

/// Stack, heap and the index from stack addresses to owning frames
#[derive(Debug, Clone)]
pub struct Storage {
    stack: Stack,
    heap: Heap,
    /// Mapping from live stack addresses to (frame depth, slot index)
    stack_index: FxHashMap<Address, (usize, usize)>,
    next_stack_address: Address,
}

impl Storage {
    /// Fresh storage holding only the (empty) root frame
    pub fn new() -> Self {
        let mut stack = Stack::new();
        stack.push_frame(GLOBALS_FRAME.to_string(), None);
        Storage {
            stack,
            heap: Heap::new(),
            stack_index: FxHashMap::default(),
            next_stack_address: STACK_ADDRESS_START,
        }
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Number of frames including the root frame
    pub fn depth(&self) -> usize {
        self.stack.depth()
    }

    pub fn push_frame(&mut self, function_name: &str, call_site: Option<Location>) {
        self.stack.push_frame(function_name.to_string(), call_site);
    }

    /// Pop the top frame and forget its stack slots; the root frame is never popped
    pub fn pop_frame(&mut self) -> Option<StackFrame> {
        if self.stack.depth() <= 1 {
            return None;
        }
        let frame = self.stack.pop_frame()?;
        for slot in frame.slots() {
            self.stack_index.remove(&slot.address);
        }
        Some(frame)
    }

    /// Create a slot per `placement` and return a reference to it
    ///
    /// Stack slots are owned by the current frame; heap slots by the heap.
    /// The slot is not bound to a name, see [`Storage::declare`].
    pub fn allocate(
        &mut self,
        name: &str,
        kind: VarKind,
        site: Option<SiteId>,
        placement: Placement,
        value: Value,
    ) -> Result<SlotRef, StorageError> {
        let address = match placement {
            Placement::Stack => {
                let address = self.next_stack_address;
                let depth = self
                    .stack
                    .depth()
                    .checked_sub(1)
                    .ok_or(StorageError::NoFrame)?;
                let frame = self
                    .stack
                    .current_frame_mut()
                    .ok_or(StorageError::NoFrame)?;
                let index = frame.push_slot(Slot::new(name, kind, value, site, address));
                self.stack_index.insert(address, (depth, index));
                self.next_stack_address += SLOT_SIZE;
                address
            }
            Placement::Heap => {
                let address = self.heap.next_address();
                self.heap
                    .allocate(HeapObject::Slot(Slot::new(name, kind, value, site, address)))
            }
        };
        Ok(SlotRef::new(address))
    }

    /// Allocate a slot and bind `name` to it in the current frame
    pub fn declare(
        &mut self,
        name: &str,
        kind: VarKind,
        site: Option<SiteId>,
        placement: Placement,
        value: Value,
    ) -> Result<SlotRef, StorageError> {
        let slot_ref = self.allocate(name, kind, site, placement, value)?;
        self.stack
            .current_frame_mut()
            .ok_or(StorageError::NoFrame)?
            .bind(name, slot_ref.address);
        Ok(slot_ref)
    }

    /// Resolve a name in the current frame, then in the root frame
    pub fn lookup(&self, name: &str) -> Option<SlotRef> {
        let current = self.stack.current_frame()?;
        current
            .lookup(name)
            .or_else(|| self.stack.frame(0).and_then(|root| root.lookup(name)))
            .map(SlotRef::new)
    }

    /// Slot living at `address`, on the stack or in the heap
    pub fn slot(&self, address: Address) -> Result<&Slot, StorageError> {
        if let Some(&(depth, index)) = self.stack_index.get(&address) {
            return self
                .stack
                .frame(depth)
                .and_then(|frame| frame.slot(index))
                .ok_or(StorageError::Dangling(address));
        }
        match self.heap.get(address) {
            Some(HeapObject::Slot(slot)) => Ok(slot),
            Some(_) => Err(StorageError::InvalidAddress(address, "slot")),
            None if address < HEAP_ADDRESS_START => Err(StorageError::Dangling(address)),
            None => Err(StorageError::InvalidAddress(address, "slot")),
        }
    }

    pub fn slot_mut(&mut self, address: Address) -> Result<&mut Slot, StorageError> {
        if let Some(&(depth, index)) = self.stack_index.get(&address) {
            return self
                .stack
                .frame_mut(depth)
                .and_then(|frame| frame.slot_mut(index))
                .ok_or(StorageError::Dangling(address));
        }
        match self.heap.get_mut(address) {
            Some(HeapObject::Slot(slot)) => Ok(slot),
            Some(_) => Err(StorageError::InvalidAddress(address, "slot")),
            None if address < HEAP_ADDRESS_START => Err(StorageError::Dangling(address)),
            None => Err(StorageError::InvalidAddress(address, "slot")),
        }
    }

    /// Where the slot at `address` lives
    pub fn placement_of(&self, address: Address) -> Placement {
        if self.heap.contains(address) {
            Placement::Heap
        } else {
            Placement::Stack
        }
    }

    /// Borrow the value a reference designates
    pub fn load(&self, slot_ref: &SlotRef) -> Result<&Value, StorageError> {
        let slot = self.slot(slot_ref.address)?;
        slot.value
            .at_path(&slot_ref.path)
            .ok_or_else(|| StorageError::MissingField(slot_ref.path.join(".")))
    }

    /// Overwrite the value a reference designates, in place
    pub fn store(&mut self, slot_ref: &SlotRef, value: Value) -> Result<(), StorageError> {
        let slot = self.slot_mut(slot_ref.address)?;
        let target = slot
            .value
            .at_path_mut(&slot_ref.path)
            .ok_or_else(|| StorageError::MissingField(slot_ref.path.join(".")))?;
        *target = value;
        Ok(())
    }

    /// Independent copy of the value a reference designates
    pub fn copy_value(&self, slot_ref: &SlotRef) -> Result<Value, StorageError> {
        self.load(slot_ref).cloned()
    }

    /// Reference designated by a pointer value
    pub fn dereference(&self, pointer: &Value) -> Result<SlotRef, StorageError> {
        match pointer {
            Value::Pointer { target: Some(target) } => {
                self.slot(target.address)?;
                Ok(target.clone())
            }
            Value::Pointer { target: None } => Err(StorageError::NilDereference),
            other => Err(StorageError::KindMismatch {
                expected: "pointer",
                got: other.kind_name(),
            }),
        }
    }

    /// Pointer value designating `slot_ref`
    pub fn take_address(&self, slot_ref: &SlotRef) -> Value {
        Value::pointer(slot_ref.clone())
    }

    /// New block holding `cells` (capacity = cells.len()), viewed by a header of length `len`
    pub fn alloc_block(&mut self, cells: Vec<Value>, len: usize, zero: Value) -> Value {
        let cap = cells.len();
        let block = self.heap.allocate(HeapObject::Block(Block { cells, zero }));
        Value::ReferenceHeader {
            len: len.min(cap),
            cap,
            offset: 0,
            block: Some(block),
        }
    }

    fn block(&self, address: Address) -> Result<&Block, StorageError> {
        match self.heap.get(address) {
            Some(HeapObject::Block(block)) => Ok(block),
            _ => Err(StorageError::InvalidAddress(address, "block")),
        }
    }

    fn block_mut(&mut self, address: Address) -> Result<&mut Block, StorageError> {
        match self.heap.get_mut(address) {
            Some(HeapObject::Block(block)) => Ok(block),
            _ => Err(StorageError::InvalidAddress(address, "block")),
        }
    }

    /// Block cell behind element `index` of a reference header
    fn cell_index(header: &Value, index: i64) -> Result<(Address, usize), StorageError> {
        let Value::ReferenceHeader {
            len, offset, block, ..
        } = header
        else {
            return Err(StorageError::KindMismatch {
                expected: "reference_header",
                got: header.kind_name(),
            });
        };
        let out_of_range = StorageError::IndexOutOfRange { index, len: *len };
        let i = usize::try_from(index).map_err(|_| out_of_range.clone())?;
        match block {
            Some(block) if i < *len => Ok((*block, offset + i)),
            _ => Err(out_of_range),
        }
    }

    /// Copy of element `index` seen through `header`
    pub fn element(&self, header: &Value, index: i64) -> Result<Value, StorageError> {
        let (block, cell) = Self::cell_index(header, index)?;
        self.block(block)?
            .cells
            .get(cell)
            .cloned()
            .ok_or(StorageError::InvalidAddress(block, "block cell"))
    }

    /// Overwrite element `index`; visible through every header sharing the block
    pub fn set_element(
        &mut self,
        header: &Value,
        index: i64,
        value: Value,
    ) -> Result<(), StorageError> {
        let (block, cell) = Self::cell_index(header, index)?;
        let slot = self
            .block_mut(block)?
            .cells
            .get_mut(cell)
            .ok_or(StorageError::InvalidAddress(block, "block cell"))?;
        *slot = value;
        Ok(())
    }

    /// Kind of the values stored in the block behind `header`
    pub fn element_kind(&self, header: &Value) -> Result<Option<VarKind>, StorageError> {
        match header {
            Value::ReferenceHeader { block: None, .. } => Ok(None),
            Value::ReferenceHeader {
                block: Some(block), ..
            } => Ok(Some(self.block(*block)?.zero.kind())),
            other => Err(StorageError::KindMismatch {
                expected: "reference_header",
                got: other.kind_name(),
            }),
        }
    }

    /// Append `values` to `header`, returning the updated header
    ///
    /// Within capacity the shared block is written in place. Past capacity a
    /// new block is allocated and only the returned header designates it.
    pub fn append(&mut self, header: &Value, values: Vec<Value>) -> Result<Value, StorageError> {
        let Value::ReferenceHeader {
            len,
            cap,
            offset,
            block,
        } = header
        else {
            return Err(StorageError::KindMismatch {
                expected: "reference_header",
                got: header.kind_name(),
            });
        };
        let (len, cap, offset, block) = (*len, *cap, *offset, *block);
        if values.is_empty() {
            return Ok(header.clone());
        }
        let needed = len + values.len();

        if let Some(address) = block.filter(|_| needed <= cap) {
            let cells = &mut self.block_mut(address)?.cells;
            for (i, value) in values.into_iter().enumerate() {
                if let Some(cell) = cells.get_mut(offset + len + i) {
                    *cell = value;
                }
            }
            return Ok(Value::ReferenceHeader {
                len: needed,
                cap,
                offset,
                block: Some(address),
            });
        }

        let (mut cells, zero) = match block {
            Some(address) => {
                let old = self.block(address)?;
                let visible = old.cells.iter().skip(offset).take(len).cloned().collect();
                (visible, old.zero.clone())
            }
            None => (Vec::new(), values[0].zero_like()),
        };
        let new_cap = needed.max(cap * 2);
        cells.extend(values);
        cells.resize(new_cap, zero.clone());
        tracing::debug!(old_cap = cap, new_cap, "append reallocated block");
        Ok(self.alloc_block(cells, needed, zero))
    }

    /// Header viewing cells `[low, high)` of the block behind `header`
    pub fn reslice(&self, header: &Value, low: usize, high: usize) -> Result<Value, StorageError> {
        let Value::ReferenceHeader {
            cap, offset, block, ..
        } = header
        else {
            return Err(StorageError::KindMismatch {
                expected: "reference_header",
                got: header.kind_name(),
            });
        };
        if low > high || high > *cap {
            return Err(StorageError::IndexOutOfRange {
                index: i64::try_from(high).unwrap_or(i64::MAX),
                len: *cap,
            });
        }
        Ok(Value::ReferenceHeader {
            len: high - low,
            cap: cap - low,
            offset: offset + low,
            block: *block,
        })
    }

    /// New table holding `entries`
    pub fn alloc_table(&mut self, entries: Vec<(Value, Value)>) -> Value {
        let mut table = Table::default();
        for (key, value) in entries {
            table.insert(key, value);
        }
        let block = self.heap.allocate(HeapObject::Table(table));
        Value::KeyValueHeader { block: Some(block) }
    }

    fn table_address(header: &Value) -> Result<Option<Address>, StorageError> {
        match header {
            Value::KeyValueHeader { block } => Ok(*block),
            other => Err(StorageError::KindMismatch {
                expected: "key_value_header",
                got: other.kind_name(),
            }),
        }
    }

    /// Copy of the entry under `key`; a nil header reads as empty
    pub fn table_get(&self, header: &Value, key: &Value) -> Result<Option<Value>, StorageError> {
        let Some(address) = Self::table_address(header)? else {
            return Ok(None);
        };
        match self.heap.get(address) {
            Some(HeapObject::Table(table)) => Ok(table.get(key).cloned()),
            _ => Err(StorageError::InvalidAddress(address, "table")),
        }
    }

    /// Kind of the entry under `key`, or of any entry when `key` is absent
    pub fn table_value_kind(
        &self,
        header: &Value,
        key: &Value,
    ) -> Result<Option<VarKind>, StorageError> {
        let Some(address) = Self::table_address(header)? else {
            return Ok(None);
        };
        match self.heap.get(address) {
            Some(HeapObject::Table(table)) => Ok(table
                .get(key)
                .or_else(|| table.entries.first().map(|(_, v)| v))
                .map(Value::kind)),
            _ => Err(StorageError::InvalidAddress(address, "table")),
        }
    }

    /// Insert through a key-value header; visible through every copy of it
    pub fn table_insert(
        &mut self,
        header: &Value,
        key: Value,
        value: Value,
    ) -> Result<(), StorageError> {
        let address = Self::table_address(header)?.ok_or(StorageError::NilMapWrite)?;
        match self.heap.get_mut(address) {
            Some(HeapObject::Table(table)) => {
                table.insert(key, value);
                Ok(())
            }
            _ => Err(StorageError::InvalidAddress(address, "table")),
        }
    }

    /// Length of a header (entry count for key-value headers)
    pub fn header_len(&self, value: &Value) -> Result<usize, StorageError> {
        match value {
            Value::ReferenceHeader { len, .. } => Ok(*len),
            Value::KeyValueHeader { block: None } => Ok(0),
            Value::KeyValueHeader { block: Some(address) } => match self.heap.get(*address) {
                Some(HeapObject::Table(table)) => Ok(table.entries.len()),
                _ => Err(StorageError::InvalidAddress(*address, "table")),
            },
            Value::Primitive(Primitive::String(s)) => Ok(s.len()),
            other => Err(StorageError::KindMismatch {
                expected: "reference_header",
                got: other.kind_name(),
            }),
        }
    }

    /// Capacity of a reference header
    pub fn header_cap(&self, value: &Value) -> Result<usize, StorageError> {
        match value {
            Value::ReferenceHeader { cap, .. } => Ok(*cap),
            other => Err(StorageError::KindMismatch {
                expected: "reference_header",
                got: other.kind_name(),
            }),
        }
    }

    /// Heap objects reachable from any binding or stack slot of a live frame
    pub fn reachable_heap(&self) -> BTreeSet<Address> {
        let mut roots = Vec::new();
        for frame in self.stack.frames() {
            for (_, address) in frame.bindings() {
                roots.push(address);
            }
            for slot in frame.slots() {
                slot.value.referenced_addresses(&mut roots);
            }
        }
        self.heap.reachable_from(roots)
    }

    /// Tombstone unreachable heap objects, returning how many were newly marked
    pub fn sweep(&mut self) -> usize {
        let live = self.reachable_heap();
        self.heap.mark_unreachable(&live)
    }

    /// Live and unreachable heap object counts
    pub fn heap_counts(&self) -> (usize, usize) {
        (
            self.heap.count(HeapState::Live),
            self.heap.count(HeapState::Unreachable),
        )
    }

    /// Copies of the values bound in frame `depth`, in declaration order
    pub fn frame_values(&self, depth: usize) -> Vec<(String, Value)> {
        let Some(frame) = self.stack.frame(depth) else {
            return Vec::new();
        };
        frame
            .bindings()
            .filter_map(|(name, address)| {
                self.copy_value(&SlotRef::new(address))
                    .ok()
                    .map(|value| (name.to_string(), value))
            })
            .collect()
    }

    /// Drop every frame and heap object, leaving a fresh root frame
    pub fn discard(&mut self) {
        *self = Storage::new();
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new()
    }
}
