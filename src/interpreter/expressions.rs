//! Expression evaluation
//!
//! Every expression evaluates to an owned [`Value`]: reading a variable is a
//! `copy_value` of its slot, so the copy rule of [`Value`] applies to every
//! use. Places resolve to a [`SlotRef`] instead, which is how `&x`, `&s.f`
//! and assignments reach storage.
//!
//! An untyped `nil` takes the zero value of the kind it flows into, and a
//! concrete value flowing into an interface-box slot is boxed with its
//! dynamic type; see [`Simulator::evaluate_for`].

use crate::interpreter::engine::Simulator;
use crate::interpreter::errors::{AtLocation, FaultKind, RuntimeError};
use crate::memory::value::{FieldValue, SlotRef, Value};
use crate::memory::Placement;
use crate::program::ast::*;

impl Simulator {
    /// Evaluate `expr` where a value of `kind` is expected
    pub(crate) fn evaluate_for(
        &mut self,
        expr: &Expr,
        kind: VarKind,
        location: &Location,
    ) -> Result<Value, RuntimeError> {
        match expr {
            Expr::Nil if kind == VarKind::Value => {
                Err(RuntimeError::kind_mismatch("value", "nil", location))
            }
            Expr::Nil => Ok(Value::zero(kind)),
            _ => {
                let value = self.evaluate(expr, location)?;
                // A concrete value flowing into an interface is boxed with its dynamic type
                if kind == VarKind::InterfaceBox && !matches!(value, Value::InterfaceBox { .. }) {
                    let type_tag = match &value {
                        Value::Composite { type_name, .. } => type_name.clone(),
                        other => other.kind_name().to_string(),
                    };
                    return Ok(Value::InterfaceBox {
                        type_tag: Some(type_tag),
                        value: Box::new(value),
                    });
                }
                Ok(value)
            }
        }
    }

    pub(crate) fn evaluate(&mut self, expr: &Expr, location: &Location) -> Result<Value, RuntimeError> {
        match expr {
            Expr::Lit { value } => Ok(Value::Primitive(value.clone())),

            // Untyped nil with no context is the empty pointer
            Expr::Nil => Ok(Value::nil_pointer()),

            Expr::Var { name } => {
                let slot = self.lookup(name, location)?;
                self.storage.copy_value(&slot).at(location)
            }

            Expr::Field { base, field } => {
                let value = self.evaluate(base, location)?;
                let composite = if value.is_pointer() {
                    let target = self.storage.dereference(&value).at(location)?;
                    self.storage.copy_value(&target).at(location)?
                } else {
                    value
                };
                select_field(composite, field, location)
            }

            Expr::Deref { pointer } => {
                let pointer = self.evaluate(pointer, location)?;
                let target = self.storage.dereference(&pointer).at(location)?;
                self.storage.copy_value(&target).at(location)
            }

            Expr::AddrOf { place } => {
                let slot = self.place_ref(place, location)?;
                Ok(self.storage.take_address(&slot))
            }

            Expr::New { init, site } => {
                let value = self.evaluate(init, location)?;
                let placement = self.placement_for(site);
                let slot = self
                    .storage
                    .allocate(site, value.kind(), Some(site.clone()), placement, value)
                    .at(location)?;
                self.record_alloc(Some(site.clone()), slot.address, placement);
                Ok(self.storage.take_address(&slot))
            }

            Expr::Composite { type_name, fields } => {
                let mut values = Vec::with_capacity(fields.len());
                for field in fields {
                    values.push(FieldValue {
                        name: field.name.clone(),
                        value: self.evaluate(&field.value, location)?,
                    });
                }
                Ok(Value::Composite {
                    type_name: type_name.clone(),
                    fields: values,
                })
            }

            Expr::SliceLit { elems, capacity } => {
                let mut cells = Vec::with_capacity(elems.len());
                for elem in elems {
                    cells.push(self.evaluate(elem, location)?);
                }
                let len = cells.len();
                let zero = cells
                    .first()
                    .map(Value::zero_like)
                    .unwrap_or_else(|| Value::int(0));
                cells.resize(capacity.unwrap_or(len).max(len), zero.clone());
                let header = self.storage.alloc_block(cells, len, zero);
                self.record_header_alloc(&header);
                Ok(header)
            }

            Expr::MakeSlice { len, cap, zero } => {
                if len > cap {
                    return Err(RuntimeError::Fault {
                        kind: FaultKind::IndexOutOfRange,
                        detail: format!("make: length {} exceeds capacity {}", len, cap),
                        location: location.clone(),
                    });
                }
                let zero = self.evaluate(zero, location)?;
                let header = self.storage.alloc_block(vec![zero.clone(); *cap], *len, zero);
                self.record_header_alloc(&header);
                Ok(header)
            }

            Expr::MapLit { entries } => {
                let mut pairs = Vec::with_capacity(entries.len());
                for entry in entries {
                    let key = self.evaluate(&entry.key, location)?;
                    let value = self.evaluate(&entry.value, location)?;
                    pairs.push((key, value));
                }
                let header = self.storage.alloc_table(pairs);
                self.record_header_alloc(&header);
                Ok(header)
            }

            Expr::Index { base, index } => {
                let header = self.evaluate(base, location)?;
                let index = self.evaluate_int(index, location)?;
                self.storage.element(&header, index).at(location)
            }

            Expr::Lookup { base, key, default } => {
                let header = self.evaluate(base, location)?;
                let key = self.evaluate(key, location)?;
                match self.storage.table_get(&header, &key).at(location)? {
                    Some(value) => Ok(value),
                    None => self.evaluate(default, location),
                }
            }

            Expr::Len { base } => {
                let value = self.evaluate(base, location)?;
                let len = self.storage.header_len(&value).at(location)?;
                Ok(Value::int(len as i64))
            }

            Expr::Cap { base } => {
                let value = self.evaluate(base, location)?;
                let cap = self.storage.header_cap(&value).at(location)?;
                Ok(Value::int(cap as i64))
            }

            Expr::Reslice { base, low, high } => {
                let header = self.evaluate(base, location)?;
                self.storage.reslice(&header, *low, *high).at(location)
            }

            Expr::Boxed { type_tag, value } => {
                let value = self.evaluate(value, location)?;
                // Boxing a box keeps its dynamic type
                if matches!(value, Value::InterfaceBox { .. }) {
                    return Ok(value);
                }
                Ok(Value::InterfaceBox {
                    type_tag: type_tag.clone(),
                    value: Box::new(value),
                })
            }

            Expr::IsNil { value } => {
                let value = self.evaluate(value, location)?;
                Ok(Value::boolean(value.is_empty()))
            }

            Expr::Call(call) => self.call_function(call, location)?.ok_or_else(|| {
                RuntimeError::kind_mismatch(
                    "a result",
                    format!("no result from '{}'", call.callee),
                    location,
                )
            }),
        }
    }

    pub(crate) fn evaluate_int(&mut self, expr: &Expr, location: &Location) -> Result<i64, RuntimeError> {
        let value = self.evaluate(expr, location)?;
        value
            .as_int()
            .ok_or_else(|| RuntimeError::kind_mismatch("int", value.kind_name(), location))
    }

    /// Resolve a place to the slot (or field of a slot) it designates
    pub(crate) fn place_ref(&mut self, place: &Place, location: &Location) -> Result<SlotRef, RuntimeError> {
        match place {
            Place::Var { name } => self.lookup(name, location),
            Place::Field { base, field } => {
                let base = self.place_ref(base, location)?;
                self.field_ref(base, field, location)
            }
            Place::Deref { pointer } => {
                let pointer = self.evaluate(pointer, location)?;
                self.storage.dereference(&pointer).at(location)
            }
        }
    }

    /// Field `field` of the composite at `base`, following one pointer if `base` holds one
    pub(crate) fn field_ref(
        &self,
        base: SlotRef,
        field: &str,
        location: &Location,
    ) -> Result<SlotRef, RuntimeError> {
        let holder = match self.storage.load(&base).at(location)? {
            pointer @ Value::Pointer { .. } => self.storage.dereference(pointer).at(location)?,
            Value::Composite { .. } => base,
            other => {
                return Err(RuntimeError::kind_mismatch(
                    "composite",
                    other.kind_name(),
                    location,
                ))
            }
        };
        let target = holder.field(field);
        match self.storage.load(&holder).at(location)? {
            Value::Composite { .. } => {
                self.storage.load(&target).at(location)?;
                Ok(target)
            }
            other => Err(RuntimeError::kind_mismatch(
                "composite",
                other.kind_name(),
                location,
            )),
        }
    }

    /// Copy of the value a place designates
    pub(crate) fn place_value(&mut self, place: &Place, location: &Location) -> Result<Value, RuntimeError> {
        let slot = self.place_ref(place, location)?;
        self.storage.copy_value(&slot).at(location)
    }

    /// Blocks and tables are always heap objects
    pub(crate) fn record_header_alloc(&mut self, header: &Value) {
        if let Value::ReferenceHeader {
            block: Some(address),
            ..
        }
        | Value::KeyValueHeader {
            block: Some(address),
        } = header
        {
            self.record_alloc(None, *address, Placement::Heap);
        }
    }
}

fn select_field(value: Value, field: &str, location: &Location) -> Result<Value, RuntimeError> {
    match value {
        Value::Composite { fields, .. } => fields
            .into_iter()
            .find(|f| f.name == field)
            .map(|f| f.value)
            .ok_or_else(|| RuntimeError::MissingField {
                field: field.to_string(),
                location: location.clone(),
            }),
        other => Err(RuntimeError::kind_mismatch(
            "composite",
            other.kind_name(),
            location,
        )),
    }
}

#[cfg(test)]
mod tests {
    use crate::config::SimConfig;
    use crate::interpreter::engine::Simulator;
    use crate::memory::value::Value;
    use crate::program::ast::*;

    fn main_only(body: Vec<Stmt>) -> Simulator {
        let program = Program::new().with_function(FunctionDef::new("main", vec![], body));
        Simulator::new(program, SimConfig::default())
    }

    #[test]
    fn test_field_read_through_pointer() {
        let mut sim = main_only(vec![
            Stmt::declare(
                "pt",
                VarKind::Value,
                Expr::composite("Point", vec![("x", Expr::int(3)), ("y", Expr::int(4))]),
            ),
            Stmt::declare("p", VarKind::Pointer, Expr::addr_of("pt")),
            Stmt::declare("y", VarKind::Value, Expr::field(Expr::var("p"), "y")),
        ]);
        let verdict = sim.run().unwrap();
        assert_eq!(verdict.value("y"), Some(&Value::int(4)));
    }

    #[test]
    fn test_address_of_field_aliases_the_composite() {
        let mut sim = main_only(vec![
            Stmt::declare(
                "pt",
                VarKind::Value,
                Expr::composite("Point", vec![("x", Expr::int(3))]),
            ),
            Stmt::declare(
                "px",
                VarKind::Pointer,
                Expr::AddrOf {
                    place: Place::field(Place::var("pt"), "x"),
                },
            ),
            Stmt::store(Expr::var("px"), Expr::int(9)),
            Stmt::declare("x", VarKind::Value, Expr::field(Expr::var("pt"), "x")),
        ]);
        let verdict = sim.run().unwrap();
        assert_eq!(verdict.value("x"), Some(&Value::int(9)));
    }

    #[test]
    fn test_lookup_falls_back_to_default() {
        let mut sim = main_only(vec![
            Stmt::declare(
                "m",
                VarKind::KeyValueHeader,
                Expr::MapLit {
                    entries: vec![MapEntry {
                        key: Expr::string("a"),
                        value: Expr::int(1),
                    }],
                },
            ),
            Stmt::declare(
                "hit",
                VarKind::Value,
                Expr::Lookup {
                    base: Box::new(Expr::var("m")),
                    key: Box::new(Expr::string("a")),
                    default: Box::new(Expr::int(0)),
                },
            ),
            Stmt::declare(
                "miss",
                VarKind::Value,
                Expr::Lookup {
                    base: Box::new(Expr::var("m")),
                    key: Box::new(Expr::string("b")),
                    default: Box::new(Expr::int(-1)),
                },
            ),
        ]);
        let verdict = sim.run().unwrap();
        assert_eq!(verdict.value("hit"), Some(&Value::int(1)));
        assert_eq!(verdict.value("miss"), Some(&Value::int(-1)));
    }

    #[test]
    fn test_typed_nil_box_is_not_nil() {
        let mut sim = main_only(vec![
            Stmt::Declare(VarDecl::new("p", VarKind::Pointer, None)),
            Stmt::declare(
                "e",
                VarKind::InterfaceBox,
                Expr::boxed(Some("*MyErr"), Expr::var("p")),
            ),
            Stmt::declare("e_nil", VarKind::Value, Expr::is_nil(Expr::var("e"))),
            Stmt::declare("p_nil", VarKind::Value, Expr::is_nil(Expr::var("p"))),
            Stmt::declare("empty", VarKind::InterfaceBox, Expr::Nil),
            Stmt::declare("empty_nil", VarKind::Value, Expr::is_nil(Expr::var("empty"))),
        ]);
        let verdict = sim.run().unwrap();
        assert_eq!(verdict.value("e_nil"), Some(&Value::boolean(false)));
        assert_eq!(verdict.value("p_nil"), Some(&Value::boolean(true)));
        assert_eq!(verdict.value("empty_nil"), Some(&Value::boolean(true)));
    }
}
