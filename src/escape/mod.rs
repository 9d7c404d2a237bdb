//! # Escape classification
//!
//! Decides, before execution, which allocation sites must be heap-resident
//! because a reference to them could outlive the frame that declares them.
//!
//! ## Abstract locations
//!
//! Every allocation site (declaration, parameter, named result, `new`) is an
//! abstract location. Each parameter additionally gets a *content* token
//! standing for "whatever the caller passed in"; the token holds itself, so
//! content reached through any number of dereferences is still the caller's.
//!
//! ## Rules
//!
//! The analysis is flow-insensitive over locations, but names are resolved
//! in statement order: until a local is declared its name designates the
//! global of the same name. `holds[l]` over-approximates the sites whose
//! address may be stored inside `l`. A location escapes when its
//! address may be
//!
//! | Sink | Reason |
//! |------|--------|
//! | returned (or left in a named result) | `Returned` |
//! | stored in a global, through a pointer, or into a block/table | `StoredOutside` |
//! | passed to a call that may retain it | `PassedToCall` |
//! | held by a location that escapes | `HeldByEscaping` |
//!
//! In [`EscapeMode::Conservative`] every argument is assumed retained. In
//! [`EscapeMode::Interprocedural`] only arguments bound to *leaking*
//! parameters escape; a parameter leaks once its content token escapes in the
//! callee. Both modes iterate to a fixed point and may over-classify a site
//! as heap-bound, never the reverse.

use crate::memory::Placement;
use crate::program::ast::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// How call arguments are treated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscapeMode {
    /// Assume every argument may be retained by the callee
    #[default]
    Conservative,
    /// Compute per-parameter leak summaries across the call graph
    Interprocedural,
}

/// Why a site was classified heap-bound (the first reason found)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscapeReason {
    Returned,
    StoredOutside,
    PassedToCall,
    HeldByEscaping,
}

/// Placement decision for every allocation site of a program
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placements {
    sites: BTreeMap<SiteId, Placement>,
    reasons: BTreeMap<SiteId, EscapeReason>,
}

impl Placements {
    pub fn get(&self, site: &str) -> Option<Placement> {
        self.sites.get(site).copied()
    }

    pub fn reason(&self, site: &str) -> Option<EscapeReason> {
        self.reasons.get(site).copied()
    }

    /// Every site with its placement, ordered by site id
    pub fn iter(&self) -> impl Iterator<Item = (&SiteId, Placement)> + '_ {
        self.sites.iter().map(|(site, placement)| (site, *placement))
    }

    pub fn heap_sites(&self) -> impl Iterator<Item = &SiteId> + '_ {
        self.sites
            .iter()
            .filter(|(_, p)| **p == Placement::Heap)
            .map(|(site, _)| site)
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Same sites with every placement replaced by `placement`
    pub fn forced(&self, placement: Placement) -> Placements {
        Placements {
            sites: self.sites.keys().map(|s| (s.clone(), placement)).collect(),
            reasons: BTreeMap::new(),
        }
    }
}

/// Classify every allocation site of `program`
pub fn classify(program: &Program, mode: EscapeMode) -> Placements {
    let mut classifier = Classifier {
        program,
        mode,
        holds: BTreeMap::new(),
        escaped: BTreeMap::new(),
        leaking: BTreeSet::new(),
        sites: BTreeSet::new(),
        changed: false,
    };
    let rounds = classifier.run();

    let mut placements = Placements::default();
    for site in &classifier.sites {
        let loc = Loc::Site(site.clone());
        let placement = match classifier.escaped.get(&loc) {
            Some(reason) => {
                placements.reasons.insert(site.clone(), *reason);
                tracing::debug!(site = %site, reason = ?reason, "site is heap-bound");
                Placement::Heap
            }
            None => Placement::Stack,
        };
        placements.sites.insert(site.clone(), placement);
    }
    tracing::debug!(
        sites = placements.len(),
        heap = placements.heap_sites().count(),
        rounds,
        ?mode,
        "escape classification finished"
    );
    placements
}

/// Abstract location
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Loc {
    Site(SiteId),
    ParamContent { function: String, index: usize },
}

type LocSet = BTreeSet<Loc>;

/// Names visible in one function, mapped to their site and declared kind
struct FnCtx<'p> {
    name: &'p str,
    locals: FxHashMap<&'p str, (SiteId, VarKind)>,
}

impl<'p> FnCtx<'p> {
    fn for_function(function: &'p FunctionDef) -> Self {
        let name = function.name.as_str();
        let mut locals = FxHashMap::default();
        for param in &function.params {
            locals.insert(
                param.name.as_str(),
                (default_site(name, &param.name), param.kind),
            );
        }
        if let Some(result) = &function.result {
            if let Some(result_name) = &result.name {
                locals.insert(
                    result_name.as_str(),
                    (default_site(name, result_name), result.kind),
                );
            }
        }
        FnCtx { name, locals }
    }

    /// Bind a local from its declaration on; earlier uses of the name see a global
    fn declare(&mut self, decl: &'p VarDecl) {
        self.locals
            .insert(decl.name.as_str(), (decl.site_id(self.name), decl.kind));
    }

    fn globals() -> Self {
        FnCtx {
            name: GLOBALS_FRAME,
            locals: FxHashMap::default(),
        }
    }

    fn site(&self, name: &str) -> Option<Loc> {
        self.locals.get(name).map(|(site, _)| Loc::Site(site.clone()))
    }

    fn kind(&self, name: &str) -> Option<VarKind> {
        self.locals.get(name).map(|(_, kind)| *kind)
    }
}

struct Classifier<'p> {
    program: &'p Program,
    mode: EscapeMode,
    holds: BTreeMap<Loc, LocSet>,
    escaped: BTreeMap<Loc, EscapeReason>,
    leaking: BTreeSet<(String, usize)>, // (function, parameter index)
    sites: BTreeSet<SiteId>,
    changed: bool,
}

impl<'p> Classifier<'p> {
    /// Iterate every rule until nothing changes; returns the number of rounds
    fn run(&mut self) -> usize {
        let mut rounds = 0;
        loop {
            rounds += 1;
            self.changed = false;

            let program = self.program;
            let globals = FnCtx::globals();
            for decl in &program.globals {
                if let Some(init) = &decl.init {
                    let addrs = self.addrs(&globals, init);
                    self.escape_all(addrs, EscapeReason::StoredOutside);
                }
            }
            for function in &program.functions {
                self.analyze_function(function);
            }

            self.close_over_escaped();
            self.update_leaks();

            if !self.changed {
                return rounds;
            }
        }
    }

    fn analyze_function(&mut self, function: &'p FunctionDef) {
        let mut ctx = FnCtx::for_function(function);

        for (index, param) in function.params.iter().enumerate() {
            let site = default_site(ctx.name, &param.name);
            self.sites.insert(site.clone());
            let content = Loc::ParamContent {
                function: ctx.name.to_string(),
                index,
            };
            self.add_holds(Loc::Site(site), [content.clone()].into());
            self.add_holds(content.clone(), [content].into());
        }

        if let Some(result) = function.named_result() {
            let site = default_site(ctx.name, result);
            self.sites.insert(site.clone());
            // The named result is copied out to the caller
            let held = self.contents(&[Loc::Site(site)].into());
            self.escape_all(held, EscapeReason::Returned);
        }

        for stmt in &function.body {
            self.analyze_stmt(&ctx, stmt);
            if let Stmt::Declare(decl) = stmt {
                ctx.declare(decl);
            }
        }
    }

    fn analyze_stmt(&mut self, ctx: &FnCtx<'_>, stmt: &Stmt) {
        match stmt {
            Stmt::Declare(decl) => {
                let site = decl.site_id(ctx.name);
                self.sites.insert(site.clone());
                if let Some(init) = &decl.init {
                    let addrs = self.addrs(ctx, init);
                    self.add_holds(Loc::Site(site), addrs);
                }
            }
            Stmt::Assign { target, value } => {
                let addrs = self.addrs(ctx, value);
                match ctx.site(target) {
                    Some(site) => self.add_holds(site, addrs),
                    None => self.escape_all(addrs, EscapeReason::StoredOutside),
                }
            }
            Stmt::SetField { target, value, .. } => {
                let addrs = self.addrs(ctx, value);
                let inline_local = match target {
                    Place::Var { name } if ctx.kind(name) == Some(VarKind::Value) => {
                        ctx.site(name)
                    }
                    _ => None,
                };
                match inline_local {
                    Some(site) => self.add_holds(site, addrs),
                    None => {
                        // Written through a pointer or nested path: target unknown
                        self.place_addrs(ctx, target);
                        self.escape_all(addrs, EscapeReason::StoredOutside);
                    }
                }
            }
            Stmt::Store { pointer, value } => {
                self.addrs(ctx, pointer);
                let addrs = self.addrs(ctx, value);
                self.escape_all(addrs, EscapeReason::StoredOutside);
            }
            Stmt::SetIndex {
                target,
                index,
                value,
            } => {
                self.place_addrs(ctx, target);
                self.addrs(ctx, index);
                let addrs = self.addrs(ctx, value);
                self.escape_all(addrs, EscapeReason::StoredOutside);
            }
            Stmt::SetKey { target, key, value } => {
                self.place_addrs(ctx, target);
                let mut addrs = self.addrs(ctx, key);
                addrs.extend(self.addrs(ctx, value));
                self.escape_all(addrs, EscapeReason::StoredOutside);
            }
            Stmt::Append { target, values } => {
                self.place_addrs(ctx, target);
                for value in values {
                    let addrs = self.addrs(ctx, value);
                    self.escape_all(addrs, EscapeReason::StoredOutside);
                }
            }
            Stmt::Call(call) => {
                self.call_addrs(ctx, call);
            }
            Stmt::Return { value } => {
                if let Some(value) = value {
                    let addrs = self.addrs(ctx, value);
                    self.escape_all(addrs, EscapeReason::Returned);
                }
            }
        }
    }

    /// Locations whose address the value of `expr` may carry
    fn addrs(&mut self, ctx: &FnCtx<'_>, expr: &Expr) -> LocSet {
        match expr {
            Expr::Lit { .. } | Expr::Nil => LocSet::new(),
            // Globals only ever hold escaped addresses
            Expr::Var { name } => match ctx.site(name) {
                Some(site) => self.holds.get(&site).cloned().unwrap_or_default(),
                None => LocSet::new(),
            },
            Expr::Field { base, .. } => {
                let mut addrs = self.addrs(ctx, base);
                let pointees = self.contents(&addrs);
                addrs.extend(pointees);
                addrs
            }
            Expr::Deref { pointer } => {
                let addrs = self.addrs(ctx, pointer);
                self.contents(&addrs)
            }
            Expr::AddrOf { place } => self.place_addrs(ctx, place),
            Expr::New { init, site } => {
                self.sites.insert(site.clone());
                let addrs = self.addrs(ctx, init);
                let loc = Loc::Site(site.clone());
                self.add_holds(loc.clone(), addrs);
                [loc].into()
            }
            Expr::Composite { fields, .. } => {
                let mut addrs = LocSet::new();
                for field in fields {
                    addrs.extend(self.addrs(ctx, &field.value));
                }
                addrs
            }
            // Blocks and tables always live in the heap
            Expr::SliceLit { elems, .. } => {
                for elem in elems {
                    let addrs = self.addrs(ctx, elem);
                    self.escape_all(addrs, EscapeReason::StoredOutside);
                }
                LocSet::new()
            }
            Expr::MakeSlice { zero, .. } => {
                let addrs = self.addrs(ctx, zero);
                self.escape_all(addrs, EscapeReason::StoredOutside);
                LocSet::new()
            }
            Expr::MapLit { entries } => {
                for entry in entries {
                    let mut addrs = self.addrs(ctx, &entry.key);
                    addrs.extend(self.addrs(ctx, &entry.value));
                    self.escape_all(addrs, EscapeReason::StoredOutside);
                }
                LocSet::new()
            }
            Expr::Index { base, index } => {
                self.addrs(ctx, base);
                self.addrs(ctx, index);
                LocSet::new()
            }
            Expr::Lookup { base, key, default } => {
                self.addrs(ctx, base);
                self.addrs(ctx, key);
                self.addrs(ctx, default)
            }
            Expr::Len { base } | Expr::Cap { base } | Expr::Reslice { base, .. } => {
                self.addrs(ctx, base);
                LocSet::new()
            }
            Expr::IsNil { value } => {
                self.addrs(ctx, value);
                LocSet::new()
            }
            Expr::Boxed { value, .. } => self.addrs(ctx, value),
            Expr::Call(call) => self.call_addrs(ctx, call),
        }
    }

    /// Locations a place may designate
    fn place_addrs(&mut self, ctx: &FnCtx<'_>, place: &Place) -> LocSet {
        match place {
            Place::Var { name } => ctx.site(name).into_iter().collect(),
            Place::Field { base, .. } => {
                let mut addrs = self.place_addrs(ctx, base);
                let pointees = self.contents(&addrs);
                addrs.extend(pointees);
                addrs
            }
            Place::Deref { pointer } => self.addrs(ctx, pointer),
        }
    }

    /// Escape retained arguments; the result may carry anything reachable from them
    fn call_addrs(&mut self, ctx: &FnCtx<'_>, call: &Call) -> LocSet {
        let mut passed = LocSet::new();
        for (index, arg) in call.args.iter().enumerate() {
            let addrs = self.addrs(ctx, arg);
            let retained = match self.mode {
                EscapeMode::Conservative => true,
                EscapeMode::Interprocedural => {
                    self.leaking.contains(&(call.callee.clone(), index))
                }
            };
            if retained {
                self.escape_all(addrs.clone(), EscapeReason::PassedToCall);
            }
            passed.extend(addrs);
        }
        self.reach(passed)
    }

    /// Union of what each location holds
    fn contents(&self, locs: &LocSet) -> LocSet {
        locs.iter()
            .filter_map(|loc| self.holds.get(loc))
            .flatten()
            .cloned()
            .collect()
    }

    /// Closure of `locs` under `holds`
    fn reach(&self, locs: LocSet) -> LocSet {
        let mut seen = LocSet::new();
        let mut pending: Vec<Loc> = locs.into_iter().collect();
        while let Some(loc) = pending.pop() {
            if !seen.insert(loc.clone()) {
                continue;
            }
            if let Some(held) = self.holds.get(&loc) {
                pending.extend(held.iter().filter(|l| !seen.contains(*l)).cloned());
            }
        }
        seen
    }

    fn add_holds(&mut self, loc: Loc, addrs: LocSet) {
        if addrs.is_empty() {
            return;
        }
        let held = self.holds.entry(loc).or_default();
        let before = held.len();
        held.extend(addrs);
        if held.len() != before {
            self.changed = true;
        }
    }

    fn escape_all(&mut self, locs: LocSet, reason: EscapeReason) {
        for loc in locs {
            if !self.escaped.contains_key(&loc) {
                self.escaped.insert(loc, reason);
                self.changed = true;
            }
        }
    }

    /// Anything held by an escaping location escapes too
    fn close_over_escaped(&mut self) {
        let escaped: Vec<Loc> = self.escaped.keys().cloned().collect();
        let held = self.reach(escaped.into_iter().collect());
        self.escape_all(held, EscapeReason::HeldByEscaping);
    }

    fn update_leaks(&mut self) {
        let leaked: Vec<(String, usize)> = self
            .escaped
            .keys()
            .filter_map(|loc| match loc {
                Loc::ParamContent { function, index } => Some((function.clone(), *index)),
                Loc::Site(_) => None,
            })
            .collect();
        for leak in leaked {
            if self.leaking.insert(leak) {
                self.changed = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn program(functions: Vec<FunctionDef>) -> Program {
        functions
            .into_iter()
            .fold(Program::new(), |p, f| p.with_function(f))
    }

    fn main_fn(body: Vec<Stmt>) -> FunctionDef {
        FunctionDef::new("main", vec![], body)
    }

    fn inc_fn() -> FunctionDef {
        FunctionDef::new(
            "inc",
            vec![Param::new("p", VarKind::Pointer)],
            vec![Stmt::store(Expr::var("p"), Expr::int(20))],
        )
    }

    #[test]
    fn test_returned_address_is_heap_bound() {
        let p = program(vec![
            main_fn(vec![Stmt::declare("q", VarKind::Pointer, Expr::call("newPoint", vec![]))]),
            FunctionDef::new(
                "newPoint",
                vec![],
                vec![
                    Stmt::declare("pt", VarKind::Value, Expr::composite("Point", vec![("x", Expr::int(1))])),
                    Stmt::ret(Some(Expr::addr_of("pt"))),
                ],
            )
            .with_result(None, VarKind::Pointer),
        ]);
        let placements = classify(&p, EscapeMode::Conservative);
        assert_eq!(placements.get("newPoint.pt"), Some(Placement::Heap));
        assert_eq!(placements.reason("newPoint.pt"), Some(EscapeReason::Returned));
        assert_eq!(placements.get("main.q"), Some(Placement::Stack));
    }

    #[test]
    fn test_local_address_kept_local_stays_on_stack() {
        let p = program(vec![main_fn(vec![
            Stmt::declare("x", VarKind::Value, Expr::int(1)),
            Stmt::declare("p", VarKind::Pointer, Expr::addr_of("x")),
            Stmt::store(Expr::var("p"), Expr::int(2)),
        ])]);
        let placements = classify(&p, EscapeMode::Conservative);
        assert_eq!(placements.get("main.x"), Some(Placement::Stack));
        assert_eq!(placements.get("main.p"), Some(Placement::Stack));
    }

    #[test]
    fn test_pointer_argument_modes() {
        let p = program(vec![
            main_fn(vec![
                Stmt::declare("x", VarKind::Value, Expr::int(10)),
                Stmt::call("inc", vec![Expr::addr_of("x")]),
            ]),
            inc_fn(),
        ]);

        let conservative = classify(&p, EscapeMode::Conservative);
        assert_eq!(conservative.get("main.x"), Some(Placement::Heap));
        assert_eq!(conservative.reason("main.x"), Some(EscapeReason::PassedToCall));

        let precise = classify(&p, EscapeMode::Interprocedural);
        assert_eq!(precise.get("main.x"), Some(Placement::Stack));
    }

    #[test]
    fn test_leaking_parameter_through_global() {
        let p = program(vec![
            main_fn(vec![
                Stmt::declare("x", VarKind::Value, Expr::int(10)),
                Stmt::call("keep", vec![Expr::addr_of("x")]),
            ]),
            FunctionDef::new(
                "keep",
                vec![Param::new("p", VarKind::Pointer)],
                vec![Stmt::assign("saved", Expr::var("p"))],
            ),
        ])
        .with_global(VarDecl::new("saved", VarKind::Pointer, None));

        let placements = classify(&p, EscapeMode::Interprocedural);
        assert_eq!(placements.get("main.x"), Some(Placement::Heap));
    }

    #[test]
    fn test_global_assigned_before_local_shadow_escapes() {
        // g names the global until the local g is declared
        let p = program(vec![
            main_fn(vec![Stmt::call("f", vec![])]),
            FunctionDef::new(
                "f",
                vec![],
                vec![
                    Stmt::declare("x", VarKind::Value, Expr::int(1)),
                    Stmt::assign("g", Expr::addr_of("x")),
                    Stmt::Declare(VarDecl::new("g", VarKind::Pointer, None)),
                ],
            ),
        ])
        .with_global(VarDecl::new("g", VarKind::Pointer, None));

        for mode in [EscapeMode::Conservative, EscapeMode::Interprocedural] {
            let placements = classify(&p, mode);
            assert_eq!(placements.get("f.x"), Some(Placement::Heap));
            assert_eq!(placements.reason("f.x"), Some(EscapeReason::StoredOutside));
            assert_eq!(placements.get("f.g"), Some(Placement::Stack));
        }
    }

    #[test]
    fn test_local_declared_after_global_use_holds_locally() {
        let p = program(vec![main_fn(vec![
            Stmt::declare("x", VarKind::Value, Expr::int(1)),
            Stmt::Declare(VarDecl::new("g", VarKind::Pointer, None)),
            Stmt::assign("g", Expr::addr_of("x")),
        ])])
        .with_global(VarDecl::new("g", VarKind::Pointer, None));

        let placements = classify(&p, EscapeMode::Conservative);
        assert_eq!(placements.get("main.x"), Some(Placement::Stack));
    }

    #[test]
    fn test_identity_function_result_is_tracked() {
        // main returns whatever id hands back, which is &x
        let p = program(vec![
            main_fn(vec![
                Stmt::declare("x", VarKind::Value, Expr::int(1)),
                Stmt::declare("q", VarKind::Pointer, Expr::call("id", vec![Expr::addr_of("x")])),
                Stmt::assign("g", Expr::var("q")),
            ]),
            FunctionDef::new(
                "id",
                vec![Param::new("p", VarKind::Pointer)],
                vec![Stmt::ret(Some(Expr::var("p")))],
            )
            .with_result(None, VarKind::Pointer),
        ])
        .with_global(VarDecl::new("g", VarKind::Pointer, None));

        let placements = classify(&p, EscapeMode::Interprocedural);
        assert_eq!(placements.get("main.x"), Some(Placement::Heap));
    }

    #[test]
    fn test_held_by_escaping_composite() {
        let p = program(vec![
            main_fn(vec![Stmt::declare("r", VarKind::Pointer, Expr::call("make", vec![]))]),
            FunctionDef::new(
                "make",
                vec![],
                vec![
                    Stmt::declare("v", VarKind::Value, Expr::int(3)),
                    Stmt::declare(
                        "holder",
                        VarKind::Value,
                        Expr::composite("Holder", vec![("ptr", Expr::addr_of("v"))]),
                    ),
                    Stmt::ret(Some(Expr::addr_of("holder"))),
                ],
            )
            .with_result(None, VarKind::Pointer),
        ]);
        let placements = classify(&p, EscapeMode::Interprocedural);
        assert_eq!(placements.get("make.holder"), Some(Placement::Heap));
        assert_eq!(placements.get("make.v"), Some(Placement::Heap));
        assert_eq!(placements.reason("make.v"), Some(EscapeReason::HeldByEscaping));
    }

    #[test]
    fn test_address_stored_in_slice_escapes() {
        let p = program(vec![main_fn(vec![
            Stmt::declare("x", VarKind::Value, Expr::int(1)),
            Stmt::declare(
                "s",
                VarKind::ReferenceHeader,
                Expr::slice(vec![Expr::addr_of("x")], None),
            ),
        ])]);
        let placements = classify(&p, EscapeMode::Interprocedural);
        assert_eq!(placements.get("main.x"), Some(Placement::Heap));
        assert_eq!(placements.get("main.s"), Some(Placement::Stack));
    }

    #[test]
    fn test_classification_is_idempotent() {
        let p = program(vec![
            main_fn(vec![
                Stmt::declare("x", VarKind::Value, Expr::int(10)),
                Stmt::call("inc", vec![Expr::addr_of("x")]),
            ]),
            inc_fn(),
        ]);
        for mode in [EscapeMode::Conservative, EscapeMode::Interprocedural] {
            assert_eq!(classify(&p, mode), classify(&p, mode));
        }
    }
}
