//! Well-formedness check for program models
//!
//! Runs once before execution; anything rejected here never reaches the
//! interpreter. The check is structural: it resolves names, arities and site
//! ids, and rejects recursive call graphs (the model has no control flow, so a
//! recursive call could never terminate). Kind errors that need type inference
//! are left to the interpreter's `KindMismatch`.

use super::ast::*;
use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::BTreeSet;
use thiserror::Error;

/// Reasons a program model is rejected before execution
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WellFormednessError {
    #[error("function `{name}` is defined more than once")]
    DuplicateFunction { name: String },

    #[error("entry function `{name}` is not defined")]
    MissingEntry { name: String },

    #[error("entry function `{name}` must not take parameters")]
    EntryTakesParameters { name: String },

    #[error("call to undefined function `{name}` in {location}")]
    UnknownFunction { name: String, location: Location },

    #[error("function `{function}` expects {expected} argument(s), got {got} in {location}")]
    ArityMismatch {
        function: String,
        expected: usize,
        got: usize,
        location: Location,
    },

    #[error("variable `{name}` is used before declaration in {location}")]
    UnknownVariable { name: String, location: Location },

    #[error("variable `{name}` is declared twice in `{function}`")]
    DuplicateVariable { name: String, function: String },

    #[error("allocation site `{site}` is declared more than once")]
    DuplicateSite { site: SiteId },

    #[error("function `{function}` calls itself through `{via}`")]
    RecursiveCall { function: String, via: String },

    #[error("interface box without a type tag must hold nil in {location}")]
    UntypedBox { location: Location },

    #[error("return value does not match the result of `{function}` in {location}")]
    ResultMismatch { function: String, location: Location },

    #[error("function `{function}` can fall off its end without returning a value")]
    MissingReturn { function: String },

    #[error("invalid slice literal in {location}: {message}")]
    InvalidSlice { message: String, location: Location },
}

/// Check a program against the structural rules, with `entry` as the entry point
pub fn check_program(program: &Program, entry: &str) -> Result<(), WellFormednessError> {
    let mut functions: FxHashMap<&str, &FunctionDef> = FxHashMap::default();
    for function in &program.functions {
        if functions.insert(&function.name, function).is_some() {
            return Err(WellFormednessError::DuplicateFunction {
                name: function.name.clone(),
            });
        }
    }

    let main = functions
        .get(entry)
        .ok_or_else(|| WellFormednessError::MissingEntry {
            name: entry.to_string(),
        })?;
    if !main.params.is_empty() {
        return Err(WellFormednessError::EntryTakesParameters {
            name: entry.to_string(),
        });
    }

    let mut checker = Checker {
        functions: &functions,
        sites: FxHashSet::default(),
        globals: FxHashSet::default(),
    };

    // Globals see the globals declared before them
    let mut scope = Scope::default();
    for (i, decl) in program.globals.iter().enumerate() {
        let location = Location::new(GLOBALS_FRAME, i);
        if let Some(init) = &decl.init {
            checker.check_expr(init, &scope, &location)?;
        }
        scope.declare(&decl.name, GLOBALS_FRAME)?;
    }
    checker.globals = scope.names;

    for function in &program.functions {
        checker.check_function(function)?;
    }

    check_call_graph(program)
}

#[derive(Default)]
struct Scope {
    names: FxHashSet<String>,
}

impl Scope {
    fn declare(&mut self, name: &str, function: &str) -> Result<(), WellFormednessError> {
        if !self.names.insert(name.to_string()) {
            return Err(WellFormednessError::DuplicateVariable {
                name: name.to_string(),
                function: function.to_string(),
            });
        }
        Ok(())
    }
}

struct Checker<'a> {
    functions: &'a FxHashMap<&'a str, &'a FunctionDef>,
    sites: FxHashSet<SiteId>,
    globals: FxHashSet<String>,
}

impl Checker<'_> {
    fn claim_site(&mut self, site: SiteId) -> Result<(), WellFormednessError> {
        if self.sites.insert(site.clone()) {
            Ok(())
        } else {
            Err(WellFormednessError::DuplicateSite { site })
        }
    }

    fn check_function(&mut self, function: &FunctionDef) -> Result<(), WellFormednessError> {
        let name = function.name.as_str();
        let mut scope = Scope::default();

        for param in &function.params {
            scope.declare(&param.name, name)?;
            self.claim_site(default_site(name, &param.name))?;
        }
        if let Some(result) = function.named_result() {
            scope.declare(result, name)?;
            self.claim_site(default_site(name, result))?;
        }

        for (i, stmt) in function.body.iter().enumerate() {
            let location = Location::new(name, i);
            self.check_stmt(function, stmt, &mut scope, &location)?;
        }

        // Unnamed results need an explicit final return
        if let Some(result) = &function.result {
            let ends_with_value = matches!(
                function.body.last(),
                Some(Stmt::Return { value: Some(_) })
            );
            if result.name.is_none() && !ends_with_value {
                return Err(WellFormednessError::MissingReturn {
                    function: name.to_string(),
                });
            }
        }
        Ok(())
    }

    fn check_stmt(
        &mut self,
        function: &FunctionDef,
        stmt: &Stmt,
        scope: &mut Scope,
        location: &Location,
    ) -> Result<(), WellFormednessError> {
        match stmt {
            Stmt::Declare(decl) => {
                if let Some(init) = &decl.init {
                    self.check_expr(init, scope, location)?;
                }
                scope.declare(&decl.name, &function.name)?;
                self.claim_site(decl.site_id(&function.name))
            }
            Stmt::Assign { target, value } => {
                self.check_name(target, scope, location)?;
                self.check_expr(value, scope, location)
            }
            Stmt::SetField { target, value, .. } => {
                self.check_place(target, scope, location)?;
                self.check_expr(value, scope, location)
            }
            Stmt::Store { pointer, value } => {
                self.check_expr(pointer, scope, location)?;
                self.check_expr(value, scope, location)
            }
            Stmt::SetIndex {
                target,
                index,
                value,
            } => {
                self.check_place(target, scope, location)?;
                self.check_expr(index, scope, location)?;
                self.check_expr(value, scope, location)
            }
            Stmt::SetKey { target, key, value } => {
                self.check_place(target, scope, location)?;
                self.check_expr(key, scope, location)?;
                self.check_expr(value, scope, location)
            }
            Stmt::Append { target, values } => {
                self.check_place(target, scope, location)?;
                values
                    .iter()
                    .try_for_each(|v| self.check_expr(v, scope, location))
            }
            Stmt::Call(call) => self.check_call(call, scope, location),
            Stmt::Return { value } => {
                match (&function.result, value) {
                    (None, Some(_)) => {
                        return Err(WellFormednessError::ResultMismatch {
                            function: function.name.clone(),
                            location: location.clone(),
                        });
                    }
                    (Some(result), None) if result.name.is_none() => {
                        return Err(WellFormednessError::ResultMismatch {
                            function: function.name.clone(),
                            location: location.clone(),
                        });
                    }
                    _ => {}
                }
                match value {
                    Some(value) => self.check_expr(value, scope, location),
                    None => Ok(()),
                }
            }
        }
    }

    fn check_name(
        &self,
        name: &str,
        scope: &Scope,
        location: &Location,
    ) -> Result<(), WellFormednessError> {
        if scope.names.contains(name) || self.globals.contains(name) {
            Ok(())
        } else {
            Err(WellFormednessError::UnknownVariable {
                name: name.to_string(),
                location: location.clone(),
            })
        }
    }

    fn check_place(
        &mut self,
        place: &Place,
        scope: &Scope,
        location: &Location,
    ) -> Result<(), WellFormednessError> {
        match place {
            Place::Var { name } => self.check_name(name, scope, location),
            Place::Field { base, .. } => self.check_place(base, scope, location),
            Place::Deref { pointer } => self.check_expr(pointer, scope, location),
        }
    }

    fn check_call(
        &mut self,
        call: &Call,
        scope: &Scope,
        location: &Location,
    ) -> Result<(), WellFormednessError> {
        let callee = self
            .functions
            .get(call.callee.as_str())
            .ok_or_else(|| WellFormednessError::UnknownFunction {
                name: call.callee.clone(),
                location: location.clone(),
            })?;
        if callee.params.len() != call.args.len() {
            return Err(WellFormednessError::ArityMismatch {
                function: call.callee.clone(),
                expected: callee.params.len(),
                got: call.args.len(),
                location: location.clone(),
            });
        }
        call.args
            .iter()
            .try_for_each(|arg| self.check_expr(arg, scope, location))
    }

    fn check_expr(
        &mut self,
        expr: &Expr,
        scope: &Scope,
        location: &Location,
    ) -> Result<(), WellFormednessError> {
        match expr {
            Expr::Lit { .. } | Expr::Nil => Ok(()),
            Expr::Var { name } => self.check_name(name, scope, location),
            Expr::Field { base, .. }
            | Expr::Len { base }
            | Expr::Cap { base }
            | Expr::Reslice { base, .. } => self.check_expr(base, scope, location),
            Expr::Deref { pointer } => self.check_expr(pointer, scope, location),
            Expr::AddrOf { place } => self.check_place(place, scope, location),
            Expr::New { init, site } => {
                self.claim_site(site.clone())?;
                self.check_expr(init, scope, location)
            }
            Expr::Composite { fields, .. } => fields
                .iter()
                .try_for_each(|f| self.check_expr(&f.value, scope, location)),
            Expr::SliceLit { elems, capacity } => {
                let cap = capacity.unwrap_or(elems.len());
                if cap < elems.len() {
                    return Err(WellFormednessError::InvalidSlice {
                        message: format!("capacity {} is below length {}", cap, elems.len()),
                        location: location.clone(),
                    });
                }
                if cap > elems.len() && elems.is_empty() {
                    return Err(WellFormednessError::InvalidSlice {
                        message: "spare capacity needs at least one element".to_string(),
                        location: location.clone(),
                    });
                }
                elems
                    .iter()
                    .try_for_each(|e| self.check_expr(e, scope, location))
            }
            Expr::MakeSlice { len, cap, zero } => {
                if len > cap {
                    return Err(WellFormednessError::InvalidSlice {
                        message: format!("length {} exceeds capacity {}", len, cap),
                        location: location.clone(),
                    });
                }
                self.check_expr(zero, scope, location)
            }
            Expr::MapLit { entries } => entries.iter().try_for_each(|e| {
                self.check_expr(&e.key, scope, location)?;
                self.check_expr(&e.value, scope, location)
            }),
            Expr::Index { base, index } => {
                self.check_expr(base, scope, location)?;
                self.check_expr(index, scope, location)
            }
            Expr::Lookup { base, key, default } => {
                self.check_expr(base, scope, location)?;
                self.check_expr(key, scope, location)?;
                self.check_expr(default, scope, location)
            }
            Expr::Boxed { type_tag, value } => {
                if type_tag.is_none() && **value != Expr::Nil {
                    return Err(WellFormednessError::UntypedBox {
                        location: location.clone(),
                    });
                }
                self.check_expr(value, scope, location)
            }
            Expr::IsNil { value } => self.check_expr(value, scope, location),
            Expr::Call(call) => self.check_call(call, scope, location),
        }
    }
}

/// Collect the callees named anywhere inside a statement list
pub(crate) fn callees(body: &[Stmt]) -> BTreeSet<String> {
    fn from_place(place: &Place, out: &mut BTreeSet<String>) {
        match place {
            Place::Var { .. } => {}
            Place::Field { base, .. } => from_place(base, out),
            Place::Deref { pointer } => from_expr(pointer, out),
        }
    }

    fn from_expr(expr: &Expr, out: &mut BTreeSet<String>) {
        match expr {
            Expr::Lit { .. } | Expr::Nil | Expr::Var { .. } => {}
            Expr::Field { base, .. }
            | Expr::Len { base }
            | Expr::Cap { base }
            | Expr::Reslice { base, .. } => from_expr(base, out),
            Expr::Deref { pointer } => from_expr(pointer, out),
            Expr::AddrOf { place } => from_place(place, out),
            Expr::New { init, .. } => from_expr(init, out),
            Expr::Composite { fields, .. } => {
                fields.iter().for_each(|f| from_expr(&f.value, out));
            }
            Expr::SliceLit { elems, .. } => elems.iter().for_each(|e| from_expr(e, out)),
            Expr::MakeSlice { zero, .. } => from_expr(zero, out),
            Expr::MapLit { entries } => entries.iter().for_each(|e| {
                from_expr(&e.key, out);
                from_expr(&e.value, out);
            }),
            Expr::Index { base, index } => {
                from_expr(base, out);
                from_expr(index, out);
            }
            Expr::Lookup { base, key, default } => {
                from_expr(base, out);
                from_expr(key, out);
                from_expr(default, out);
            }
            Expr::Boxed { value, .. } | Expr::IsNil { value } => from_expr(value, out),
            Expr::Call(call) => {
                out.insert(call.callee.clone());
                call.args.iter().for_each(|a| from_expr(a, out));
            }
        }
    }

    let mut out = BTreeSet::new();
    for stmt in body {
        match stmt {
            Stmt::Declare(decl) => {
                if let Some(init) = &decl.init {
                    from_expr(init, &mut out);
                }
            }
            Stmt::Assign { value, .. } => from_expr(value, &mut out),
            Stmt::SetField { target, value, .. } => {
                from_place(target, &mut out);
                from_expr(value, &mut out);
            }
            Stmt::Store { pointer, value } => {
                from_expr(pointer, &mut out);
                from_expr(value, &mut out);
            }
            Stmt::SetIndex {
                target,
                index,
                value,
            } => {
                from_place(target, &mut out);
                from_expr(index, &mut out);
                from_expr(value, &mut out);
            }
            Stmt::SetKey { target, key, value } => {
                from_place(target, &mut out);
                from_expr(key, &mut out);
                from_expr(value, &mut out);
            }
            Stmt::Append { target, values } => {
                from_place(target, &mut out);
                values.iter().for_each(|v| from_expr(v, &mut out));
            }
            Stmt::Call(call) => {
                out.insert(call.callee.clone());
                call.args.iter().for_each(|a| from_expr(a, &mut out));
            }
            Stmt::Return { value } => {
                if let Some(value) = value {
                    from_expr(value, &mut out);
                }
            }
        }
    }
    out
}

/// Reject any cycle in the call graph (depth-first, three-colour marking)
fn check_call_graph(program: &Program) -> Result<(), WellFormednessError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        name: &str,
        graph: &FxHashMap<&str, BTreeSet<String>>,
        marks: &mut FxHashMap<String, Mark>,
    ) -> Result<(), WellFormednessError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(WellFormednessError::RecursiveCall {
                    function: name.to_string(),
                    via: name.to_string(),
                });
            }
            None => {}
        }
        marks.insert(name.to_string(), Mark::Visiting);
        if let Some(targets) = graph.get(name) {
            for target in targets {
                if marks.get(target.as_str()) == Some(&Mark::Visiting) {
                    return Err(WellFormednessError::RecursiveCall {
                        function: target.clone(),
                        via: name.to_string(),
                    });
                }
                visit(target, graph, marks)?;
            }
        }
        marks.insert(name.to_string(), Mark::Done);
        Ok(())
    }

    let graph: FxHashMap<&str, BTreeSet<String>> = program
        .functions
        .iter()
        .map(|f| (f.name.as_str(), callees(&f.body)))
        .collect();

    let mut marks = FxHashMap::default();
    for function in &program.functions {
        visit(&function.name, &graph, &mut marks)?;
    }
    Ok(())
}
