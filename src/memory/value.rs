//! Runtime value representation
//!
//! This module defines the [`Value`] enum, the tagged union every slot holds.
//! Rust's `Clone` on [`Value`] is exactly the copy rule of the simulated
//! language:
//!
//! - [`Value::Primitive`] and [`Value::Composite`]: deep copy, nothing shared
//! - [`Value::Pointer`]: the address is copied, the target is aliased
//! - [`Value::ReferenceHeader`] / [`Value::KeyValueHeader`]: the header is
//!   copied, the underlying block is shared
//! - [`Value::InterfaceBox`]: the pair is copied with the rule of its content
//!
//! # Emptiness
//!
//! An interface box is empty only when both its type tag and its value are
//! empty. A box carrying a type tag around an empty pointer is *not* empty.

use crate::program::ast::{Primitive, VarKind};
use serde::{Deserialize, Serialize};

/// Memory address type (64-bit)
pub type Address = u64;

/// Reference to a slot, or to a field nested inside a composite slot
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotRef {
    pub address: Address,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>, // Field names from the slot's value down to the target
}

impl SlotRef {
    pub fn new(address: Address) -> Self {
        SlotRef {
            address,
            path: Vec::new(),
        }
    }

    /// Reference to field `name` of the composite this reference designates
    pub fn field(&self, name: &str) -> Self {
        let mut path = self.path.clone();
        path.push(name.to_string());
        SlotRef {
            address: self.address,
            path,
        }
    }
}

/// One field of a composite value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub name: String,
    pub value: Value,
}

/// Runtime values in the simulator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Value {
    Primitive(Primitive),
    Composite {
        type_name: String,
        fields: Vec<FieldValue>, // Declaration order
    },
    ReferenceHeader {
        len: usize,
        cap: usize,
        #[serde(default)]
        offset: usize, // First block cell visible through this header
        block: Option<Address>,
    },
    KeyValueHeader {
        block: Option<Address>,
    },
    Pointer {
        target: Option<SlotRef>,
    },
    InterfaceBox {
        type_tag: Option<String>,
        value: Box<Value>,
    },
}

impl Value {
    pub fn int(n: i64) -> Self {
        Value::Primitive(Primitive::Int(n))
    }

    pub fn boolean(b: bool) -> Self {
        Value::Primitive(Primitive::Bool(b))
    }

    pub fn string(s: impl Into<String>) -> Self {
        Value::Primitive(Primitive::String(s.into()))
    }

    pub fn pointer(target: SlotRef) -> Self {
        Value::Pointer {
            target: Some(target),
        }
    }

    pub fn nil_pointer() -> Self {
        Value::Pointer { target: None }
    }

    /// Zero value of a declared kind
    pub fn zero(kind: VarKind) -> Self {
        match kind {
            VarKind::Value => Value::int(0),
            VarKind::Pointer => Value::nil_pointer(),
            VarKind::ReferenceHeader => Value::ReferenceHeader {
                len: 0,
                cap: 0,
                offset: 0,
                block: None,
            },
            VarKind::KeyValueHeader => Value::KeyValueHeader { block: None },
            VarKind::InterfaceBox => Value::InterfaceBox {
                type_tag: None,
                value: Box::new(Value::nil_pointer()),
            },
        }
    }

    /// Zero value shaped like this one (fields of composites are zeroed recursively)
    pub fn zero_like(&self) -> Self {
        match self {
            Value::Primitive(p) => Value::Primitive(match p {
                Primitive::Bool(_) => Primitive::Bool(false),
                Primitive::Int(_) => Primitive::Int(0),
                Primitive::Float(_) => Primitive::Float(0.0),
                Primitive::String(_) => Primitive::String(String::new()),
            }),
            Value::Composite { type_name, fields } => Value::Composite {
                type_name: type_name.clone(),
                fields: fields
                    .iter()
                    .map(|f| FieldValue {
                        name: f.name.clone(),
                        value: f.value.zero_like(),
                    })
                    .collect(),
            },
            other => Value::zero(other.kind()),
        }
    }

    /// Declared kind this value belongs to
    pub fn kind(&self) -> VarKind {
        match self {
            Value::Primitive(_) | Value::Composite { .. } => VarKind::Value,
            Value::ReferenceHeader { .. } => VarKind::ReferenceHeader,
            Value::KeyValueHeader { .. } => VarKind::KeyValueHeader,
            Value::Pointer { .. } => VarKind::Pointer,
            Value::InterfaceBox { .. } => VarKind::InterfaceBox,
        }
    }

    /// Short name for diagnostics
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Primitive(_) => "primitive",
            Value::Composite { .. } => "composite",
            Value::ReferenceHeader { .. } => "reference_header",
            Value::KeyValueHeader { .. } => "key_value_header",
            Value::Pointer { .. } => "pointer",
            Value::InterfaceBox { .. } => "interface_box",
        }
    }

    /// Check if this value is the empty value of its kind
    ///
    /// Primitives and composites are never empty.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Primitive(_) | Value::Composite { .. } => false,
            Value::ReferenceHeader { block, .. } | Value::KeyValueHeader { block } => {
                block.is_none()
            }
            Value::Pointer { target } => target.is_none(),
            Value::InterfaceBox { type_tag, value } => type_tag.is_none() && value.is_empty(),
        }
    }

    /// Get the integer value, returns None if not an int
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Primitive(Primitive::Int(n)) => Some(*n),
            _ => None,
        }
    }

    /// Check if this value is a pointer (including the empty pointer)
    pub fn is_pointer(&self) -> bool {
        matches!(self, Value::Pointer { .. })
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Composite { fields, .. } => {
                fields.iter().find(|f| f.name == name).map(|f| &f.value)
            }
            _ => None,
        }
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Value> {
        match self {
            Value::Composite { fields, .. } => fields
                .iter_mut()
                .find(|f| f.name == name)
                .map(|f| &mut f.value),
            _ => None,
        }
    }

    /// Follow a field path down from this value
    pub fn at_path(&self, path: &[String]) -> Option<&Value> {
        path.iter().try_fold(self, |value, name| value.field(name))
    }

    pub fn at_path_mut(&mut self, path: &[String]) -> Option<&mut Value> {
        let mut value = self;
        for name in path {
            value = value.field_mut(name)?;
        }
        Some(value)
    }

    /// Push every address this value designates (pointers and header blocks)
    pub fn referenced_addresses(&self, out: &mut Vec<Address>) {
        match self {
            Value::Primitive(_) => {}
            Value::Composite { fields, .. } => {
                for f in fields {
                    f.value.referenced_addresses(out);
                }
            }
            Value::ReferenceHeader { block, .. } | Value::KeyValueHeader { block } => {
                out.extend(block.iter().copied());
            }
            Value::Pointer { target } => out.extend(target.iter().map(|t| t.address)),
            Value::InterfaceBox { value, .. } => value.referenced_addresses(out),
        }
    }
}
