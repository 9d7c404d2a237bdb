//! Statement execution implementation
//!
//! Every statement mutates storage in place:
//!
//! - `declare` allocates a slot at its site's placement and binds the name
//! - `assign` overwrites the named slot; for a pointer parameter this changes
//!   the parameter, never the caller's pointee
//! - `set_field`, `store`, `set_index` and `set_key` route through the
//!   designated slot, block or table, so the mutation is visible through
//!   every alias
//! - `append` writes the grown header back to its place; past capacity that
//!   header silently moves to a new block
//!
//! All statement execution methods are `pub(crate)` methods on
//! [`Simulator`].

use crate::interpreter::engine::{Flow, Simulator};
use crate::interpreter::errors::{AtLocation, RuntimeError};
use crate::memory::value::Value;
use crate::program::ast::*;

impl Simulator {
    pub(crate) fn execute_statement(
        &mut self,
        function: &FunctionDef,
        stmt: &Stmt,
        location: &Location,
    ) -> Result<Flow, RuntimeError> {
        match stmt {
            Stmt::Declare(decl) => {
                let value = match &decl.init {
                    Some(init) => self.evaluate_for(init, decl.kind, location)?,
                    None => Value::zero(decl.kind),
                };
                self.expect_kind(&value, decl.kind, location)?;
                self.bind(
                    &decl.name,
                    decl.kind,
                    decl.site_id(&function.name),
                    value,
                    location,
                )?;
            }

            Stmt::Assign { target, value } => {
                let slot = self.lookup(target, location)?;
                let kind = self.storage.slot(slot.address).at(location)?.kind;
                let value = self.evaluate_for(value, kind, location)?;
                self.expect_kind(&value, kind, location)?;
                self.storage.store(&slot, value).at(location)?;
            }

            Stmt::SetField {
                target,
                field,
                value,
            } => {
                let base = self.place_ref(target, location)?;
                let slot = self.field_ref(base, field, location)?;
                let kind = self.storage.load(&slot).at(location)?.kind();
                let value = self.evaluate_for(value, kind, location)?;
                self.expect_kind(&value, kind, location)?;
                self.storage.store(&slot, value).at(location)?;
            }

            Stmt::Store { pointer, value } => {
                let pointer = self.evaluate(pointer, location)?;
                let slot = self.storage.dereference(&pointer).at(location)?;
                let kind = self.storage.load(&slot).at(location)?.kind();
                let value = self.evaluate_for(value, kind, location)?;
                self.expect_kind(&value, kind, location)?;
                self.storage.store(&slot, value).at(location)?;
            }

            Stmt::SetIndex {
                target,
                index,
                value,
            } => {
                let header = self.place_value(target, location)?;
                let index = self.evaluate_int(index, location)?;
                // Bounds are checked before the value is evaluated
                let kind = self.storage.element(&header, index).at(location)?.kind();
                let value = self.evaluate_for(value, kind, location)?;
                self.storage
                    .set_element(&header, index, value)
                    .at(location)?;
            }

            Stmt::SetKey { target, key, value } => {
                let header = self.place_value(target, location)?;
                let key = self.evaluate(key, location)?;
                let value = match self.storage.table_value_kind(&header, &key).at(location)? {
                    Some(kind) => self.evaluate_for(value, kind, location)?,
                    None => self.evaluate(value, location)?,
                };
                self.storage.table_insert(&header, key, value).at(location)?;
            }

            Stmt::Append { target, values } => {
                let slot = self.place_ref(target, location)?;
                let header = self.storage.copy_value(&slot).at(location)?;
                let kind = self.storage.element_kind(&header).at(location)?;
                let mut appended = Vec::with_capacity(values.len());
                for value in values {
                    appended.push(match kind {
                        Some(kind) => self.evaluate_for(value, kind, location)?,
                        None => self.evaluate(value, location)?,
                    });
                }
                let grown = self.storage.append(&header, appended).at(location)?;
                if block_of(&grown) != block_of(&header) {
                    tracing::debug!(%location, "append moved header to a new block");
                    self.record_header_alloc(&grown);
                }
                self.storage.store(&slot, grown).at(location)?;
            }

            Stmt::Call(call) => {
                self.call_function(call, location)?;
            }

            Stmt::Return { value } => {
                let Some(value) = value else {
                    return Ok(Flow::Return(None));
                };
                let kind = function.result.as_ref().map(|r| r.kind).unwrap_or_default();
                let value = self.evaluate_for(value, kind, location)?;
                self.expect_kind(&value, kind, location)?;
                // A named result takes the value; the caller copies it out
                if let Some(name) = function.named_result() {
                    let slot = self.lookup(name, location)?;
                    self.storage.store(&slot, value).at(location)?;
                    return Ok(Flow::Return(None));
                }
                return Ok(Flow::Return(Some(value)));
            }
        }
        Ok(Flow::Next)
    }
}

fn block_of(header: &Value) -> Option<u64> {
    match header {
        Value::ReferenceHeader { block, .. } => *block,
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use crate::config::SimConfig;
    use crate::interpreter::engine::Simulator;
    use crate::interpreter::errors::FaultKind;
    use crate::memory::value::Value;
    use crate::program::ast::*;

    fn run_main(body: Vec<Stmt>) -> crate::snapshot::Verdict {
        let program = Program::new().with_function(FunctionDef::new("main", vec![], body));
        Simulator::new(program, SimConfig::default()).run().unwrap()
    }

    #[test]
    fn test_composite_assignment_copies() {
        let verdict = run_main(vec![
            Stmt::declare(
                "a",
                VarKind::Value,
                Expr::composite("Point", vec![("x", Expr::int(1))]),
            ),
            Stmt::declare("b", VarKind::Value, Expr::var("a")),
            Stmt::set_field(Place::var("b"), "x", Expr::int(2)),
            Stmt::declare("ax", VarKind::Value, Expr::field(Expr::var("a"), "x")),
            Stmt::declare("bx", VarKind::Value, Expr::field(Expr::var("b"), "x")),
        ]);
        assert_eq!(verdict.value("ax"), Some(&Value::int(1)));
        assert_eq!(verdict.value("bx"), Some(&Value::int(2)));
    }

    #[test]
    fn test_set_index_is_shared_between_header_copies() {
        let verdict = run_main(vec![
            Stmt::declare(
                "s",
                VarKind::ReferenceHeader,
                Expr::slice(vec![Expr::int(1), Expr::int(2)], None),
            ),
            Stmt::declare("t", VarKind::ReferenceHeader, Expr::var("s")),
            Stmt::SetIndex {
                target: Place::var("t"),
                index: Expr::int(0),
                value: Expr::int(100),
            },
            Stmt::declare("s0", VarKind::Value, Expr::index(Expr::var("s"), Expr::int(0))),
        ]);
        assert_eq!(verdict.value("s0"), Some(&Value::int(100)));
    }

    #[test]
    fn test_set_index_out_of_range_panics() {
        let verdict = run_main(vec![
            Stmt::declare(
                "s",
                VarKind::ReferenceHeader,
                Expr::slice(vec![Expr::int(1)], Some(4)),
            ),
            Stmt::SetIndex {
                target: Place::var("s"),
                index: Expr::int(1),
                value: Expr::int(5),
            },
        ]);
        assert_eq!(verdict.panics[0].kind, FaultKind::IndexOutOfRange);
    }

    #[test]
    fn test_nil_map_write_panics() {
        let verdict = run_main(vec![
            Stmt::Declare(VarDecl::new("m", VarKind::KeyValueHeader, None)),
            Stmt::SetKey {
                target: Place::var("m"),
                key: Expr::string("k"),
                value: Expr::int(1),
            },
        ]);
        assert_eq!(verdict.panics[0].kind, FaultKind::NilMapWrite);
        assert_eq!(verdict.panics[0].location, Location::new("main", 1));
    }

    #[test]
    fn test_append_and_set_key_box_into_interface_elements() {
        let verdict = run_main(vec![
            Stmt::declare(
                "errs",
                VarKind::ReferenceHeader,
                Expr::MakeSlice {
                    len: 1,
                    cap: 4,
                    zero: Box::new(Expr::boxed(None, Expr::Nil)),
                },
            ),
            Stmt::Declare(VarDecl::new("p", VarKind::Pointer, None)),
            Stmt::SetIndex {
                target: Place::var("errs"),
                index: Expr::int(0),
                value: Expr::var("p"),
            },
            Stmt::Append {
                target: Place::var("errs"),
                values: vec![Expr::var("p")],
            },
            Stmt::declare(
                "by_index_nil",
                VarKind::Value,
                Expr::is_nil(Expr::index(Expr::var("errs"), Expr::int(0))),
            ),
            Stmt::declare(
                "by_append_nil",
                VarKind::Value,
                Expr::is_nil(Expr::index(Expr::var("errs"), Expr::int(1))),
            ),
            Stmt::declare(
                "m",
                VarKind::KeyValueHeader,
                Expr::MapLit {
                    entries: vec![MapEntry {
                        key: Expr::string("first"),
                        value: Expr::boxed(None, Expr::Nil),
                    }],
                },
            ),
            Stmt::SetKey {
                target: Place::var("m"),
                key: Expr::string("second"),
                value: Expr::var("p"),
            },
            Stmt::declare(
                "by_key_nil",
                VarKind::Value,
                Expr::is_nil(Expr::Lookup {
                    base: Box::new(Expr::var("m")),
                    key: Box::new(Expr::string("second")),
                    default: Box::new(Expr::Nil),
                }),
            ),
        ]);
        assert!(verdict.panics.is_empty());
        assert_eq!(verdict.value("by_index_nil"), Some(&Value::boolean(false)));
        assert_eq!(verdict.value("by_append_nil"), Some(&Value::boolean(false)));
        assert_eq!(verdict.value("by_key_nil"), Some(&Value::boolean(false)));
    }

    #[test]
    fn test_named_result_is_copied_out() {
        let program = Program::new()
            .with_function(FunctionDef::new(
                "main",
                vec![],
                vec![Stmt::declare("r", VarKind::Value, Expr::call("seven", vec![]))],
            ))
            .with_function(
                FunctionDef::new(
                    "seven",
                    vec![],
                    vec![Stmt::assign("out", Expr::int(7)), Stmt::ret(None)],
                )
                .with_result(Some("out"), VarKind::Value),
            );
        let verdict = Simulator::new(program, SimConfig::default()).run().unwrap();
        assert_eq!(verdict.value("r"), Some(&Value::int(7)));
        assert!(verdict.placements.contains_key("seven.out"));
    }
}
