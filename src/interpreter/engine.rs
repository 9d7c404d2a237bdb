// Execution engine for the simulator

use crate::config::SimConfig;
use crate::escape::{classify, Placements};
use crate::interpreter::errors::{AtLocation, RuntimeError};
use crate::memory::value::{Address, SlotRef, Value};
use crate::memory::{Placement, Storage};
use crate::program::ast::*;
use crate::program::load_program;
use crate::snapshot::{CallState, HeapReport, PanicRecord, Trace, TraceEvent, Verdict};
use crate::SimError;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Host-side handle that stops a trace at a statement boundary
#[derive(Debug, Clone)]
pub struct AbortHandle {
    flag: Arc<AtomicBool>,
    budget: Arc<AtomicUsize>, // Statement boundaries left; usize::MAX is unlimited
}

impl Default for AbortHandle {
    fn default() -> Self {
        AbortHandle {
            flag: Arc::new(AtomicBool::new(false)),
            budget: Arc::new(AtomicUsize::new(usize::MAX)),
        }
    }
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Let `statements` more statement boundaries pass, then abort
    pub fn abort_after(&self, statements: usize) {
        self.budget.store(statements, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Consume one statement boundary; true once the trace must stop
    fn tick(&self) -> bool {
        let exhausted = self
            .budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                0 | usize::MAX => None,
                left => Some(left - 1),
            })
            == Err(0);
        if exhausted {
            self.abort();
        }
        self.is_aborted()
    }
}

/// What the caller of `execute_statement` does next
pub(crate) enum Flow {
    Next,
    Return(Option<Value>),
}

/// Runs one program model against its own storage
pub struct Simulator {
    config: SimConfig,

    /// Root frame declarations, initialized once before the entry runs
    globals: Arc<[VarDecl]>,

    /// Function definitions (name -> FunctionDef)
    functions: FxHashMap<String, Arc<FunctionDef>>,

    /// Effective placement of every allocation site (policy applied)
    placements: Placements,

    pub(crate) storage: Storage,
    pub(crate) trace: Trace,
    panics: Vec<PanicRecord>,
    final_values: BTreeMap<String, Value>,
    abort: AbortHandle,

    /// Whether the trace has run to completion or panicked
    finished: bool,
}

impl Simulator {
    /// Classify the program and prepare a fresh storage
    ///
    /// The program is assumed to have passed the well-formedness check; see
    /// [`Simulator::from_json`] for the checked path.
    pub fn new(program: Program, config: SimConfig) -> Self {
        let classified = classify(&program, config.escape_mode);
        let placements = match config.placement_policy.forced() {
            Some(placement) => classified.forced(placement),
            None => classified,
        };

        let functions = program
            .functions
            .into_iter()
            .map(|f| (f.name.clone(), Arc::new(f)))
            .collect();

        Simulator {
            trace: Trace::new(config.trace_limit),
            config,
            globals: program.globals.into(),
            functions,
            placements,
            storage: Storage::new(),
            panics: Vec::new(),
            final_values: BTreeMap::new(),
            abort: AbortHandle::new(),
            finished: false,
        }
    }

    /// Load, check and prepare a program from its JSON model
    pub fn from_json(json: &str, config: SimConfig) -> Result<Self, SimError> {
        let program = load_program(json, &config.entry)?;
        Ok(Simulator::new(program, config))
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    pub fn placements(&self) -> &Placements {
        &self.placements
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn heap_report(&self) -> HeapReport {
        HeapReport::from_storage(&self.storage)
    }

    /// Run the trace to completion (or to its first panic) and report
    ///
    /// Panic-class faults end the trace and are recorded in the verdict.
    /// Other runtime errors and aborts are returned as `Err`; an aborted
    /// trace discards its storage.
    pub fn run(&mut self) -> Result<Verdict, SimError> {
        if self.finished {
            return Ok(self.verdict());
        }

        match self.execute() {
            Ok(()) => {}
            Err(RuntimeError::Fault {
                kind,
                detail,
                location,
            }) => {
                tracing::warn!(%location, %kind, %detail, "trace ended by panic");
                self.trace.record(TraceEvent::Fault {
                    kind,
                    location: location.clone(),
                });
                self.panics.push(PanicRecord { kind, location });
                self.capture_final_values();
                self.sweep();
            }
            Err(RuntimeError::Aborted { location }) => {
                tracing::warn!(%location, "trace aborted, discarding storage");
                self.storage.discard();
                self.final_values.clear();
                return Err(SimError::Aborted);
            }
            Err(err) => return Err(err.into()),
        }

        self.finished = true;
        Ok(self.verdict())
    }

    pub fn verdict(&self) -> Verdict {
        Verdict {
            final_values: self.final_values.clone(),
            panics: self.panics.clone(),
            placements: self
                .placements
                .iter()
                .map(|(site, placement)| (site.clone(), placement))
                .collect(),
        }
    }

    fn execute(&mut self) -> Result<(), RuntimeError> {
        tracing::debug!(
            entry = %self.config.entry,
            sites = self.placements.len(),
            "starting trace"
        );

        let globals = Arc::clone(&self.globals);
        for (i, decl) in globals.iter().enumerate() {
            let location = Location::new(GLOBALS_FRAME, i);
            self.checkpoint(&location)?;
            let value = match &decl.init {
                Some(init) => self.evaluate_for(init, decl.kind, &location)?,
                None => Value::zero(decl.kind),
            };
            self.expect_kind(&value, decl.kind, &location)?;
            // Globals live in the root frame, which is never popped
            let slot = self
                .storage
                .declare(&decl.name, decl.kind, None, Placement::Stack, value)
                .at(&location)?;
            self.record_alloc(None, slot.address, Placement::Stack);
        }

        let entry_name = self.config.entry.clone();
        let entry = self.function(&entry_name, &Location::new(entry_name.as_str(), 0))?;
        self.enter(&entry, Vec::new(), None)?;
        let returned = self.execute_body(&entry)?;
        // Entry bindings are observed before its frame goes away
        self.capture_final_values();
        self.sweep();
        self.leave(&entry, returned)?;
        Ok(())
    }

    /// Statement boundary: honour aborts and record the step
    fn checkpoint(&mut self, location: &Location) -> Result<(), RuntimeError> {
        if self.abort.tick() {
            return Err(RuntimeError::Aborted {
                location: location.clone(),
            });
        }
        tracing::trace!(%location, "statement");
        self.trace.record(TraceEvent::Statement {
            location: location.clone(),
        });
        Ok(())
    }

    pub(crate) fn function(
        &self,
        name: &str,
        location: &Location,
    ) -> Result<Arc<FunctionDef>, RuntimeError> {
        self.functions
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::UndefinedFunction {
                name: name.to_string(),
                location: location.clone(),
            })
    }

    /// Evaluate arguments, run the callee and hand back its result
    pub(crate) fn call_function(
        &mut self,
        call: &Call,
        location: &Location,
    ) -> Result<Option<Value>, RuntimeError> {
        let function = self.function(&call.callee, location)?;
        if function.params.len() != call.args.len() {
            return Err(RuntimeError::kind_mismatch(
                format!("{} argument(s)", function.params.len()),
                format!("{}", call.args.len()),
                location,
            ));
        }

        // Arguments are fresh copies; binding them is call-by-value
        let mut args = Vec::with_capacity(call.args.len());
        for (param, arg) in function.params.iter().zip(&call.args) {
            args.push(self.evaluate_for(arg, param.kind, location)?);
        }

        self.enter(&function, args, Some(location.clone()))?;
        let returned = self.execute_body(&function)?;
        self.leave(&function, returned)
    }

    /// Push the frame and bind parameters and the named result
    fn enter(
        &mut self,
        function: &FunctionDef,
        args: Vec<Value>,
        call_site: Option<Location>,
    ) -> Result<(), RuntimeError> {
        let location = call_site
            .clone()
            .unwrap_or_else(|| Location::new(function.name.as_str(), 0));
        self.storage.push_frame(&function.name, call_site);
        self.transition(&function.name, CallState::Entered);

        for (param, arg) in function.params.iter().zip(args) {
            self.expect_kind(&arg, param.kind, &location)?;
            let site = default_site(&function.name, &param.name);
            self.bind(&param.name, param.kind, site, arg, &location)?;
        }
        if let Some(result) = &function.result {
            if let Some(name) = &result.name {
                let site = default_site(&function.name, name);
                self.bind(name, result.kind, site, Value::zero(result.kind), &location)?;
            }
        }

        self.transition(&function.name, CallState::Executing);
        Ok(())
    }

    fn execute_body(&mut self, function: &FunctionDef) -> Result<Option<Value>, RuntimeError> {
        for (i, stmt) in function.body.iter().enumerate() {
            let location = Location::new(function.name.as_str(), i);
            self.checkpoint(&location)?;
            if let Flow::Return(value) = self.execute_statement(function, stmt, &location)? {
                return Ok(value);
            }
        }
        Ok(None)
    }

    /// Copy the result out, then pop the frame
    fn leave(
        &mut self,
        function: &FunctionDef,
        returned: Option<Value>,
    ) -> Result<Option<Value>, RuntimeError> {
        self.transition(&function.name, CallState::Returning);
        let result = match function.named_result() {
            Some(name) => {
                let location = Location::new(function.name.as_str(), function.body.len());
                let slot = self.lookup(name, &location)?;
                Some(self.storage.copy_value(&slot).at(&location)?)
            }
            None => returned,
        };
        self.storage.pop_frame();
        self.transition(&function.name, CallState::Exited);
        Ok(result)
    }

    fn transition(&mut self, function: &str, state: CallState) {
        let depth = self.storage.depth().saturating_sub(1);
        tracing::debug!(function, ?state, depth, "call transition");
        self.trace.record(TraceEvent::Call {
            function: function.to_string(),
            state,
            depth,
        });
    }

    /// Allocate and bind a named slot for `site` in the current frame
    pub(crate) fn bind(
        &mut self,
        name: &str,
        kind: VarKind,
        site: SiteId,
        value: Value,
        location: &Location,
    ) -> Result<SlotRef, RuntimeError> {
        let placement = self.placement_for(&site);
        let slot = self
            .storage
            .declare(name, kind, Some(site.clone()), placement, value)
            .at(location)?;
        self.record_alloc(Some(site), slot.address, placement);
        Ok(slot)
    }

    pub(crate) fn placement_for(&self, site: &str) -> Placement {
        self.config
            .placement_policy
            .forced()
            .or_else(|| self.placements.get(site))
            .unwrap_or(Placement::Stack)
    }

    pub(crate) fn record_alloc(
        &mut self,
        site: Option<SiteId>,
        address: Address,
        placement: Placement,
    ) {
        tracing::debug!(site = ?site, address, ?placement, "allocated");
        self.trace.record(TraceEvent::Alloc {
            site,
            address,
            placement,
        });
    }

    pub(crate) fn lookup(&self, name: &str, location: &Location) -> Result<SlotRef, RuntimeError> {
        self.storage
            .lookup(name)
            .ok_or_else(|| RuntimeError::UndefinedVariable {
                name: name.to_string(),
                location: location.clone(),
            })
    }

    pub(crate) fn expect_kind(
        &self,
        value: &Value,
        kind: VarKind,
        location: &Location,
    ) -> Result<(), RuntimeError> {
        if value.kind() == kind {
            Ok(())
        } else {
            Err(RuntimeError::kind_mismatch(
                kind.name(),
                value.kind_name(),
                location,
            ))
        }
    }

    fn sweep(&mut self) {
        let unreachable = self.storage.sweep();
        if unreachable > 0 {
            tracing::debug!(unreachable, "heap objects no longer reachable");
            self.trace.record(TraceEvent::Sweep { unreachable });
        }
    }

    /// Globals plus the entry frame's bindings; an entry local shadows a global
    fn capture_final_values(&mut self) {
        let mut values: BTreeMap<String, Value> =
            self.storage.frame_values(0).into_iter().collect();
        let entry_live = self
            .storage
            .stack()
            .frame(1)
            .is_some_and(|frame| frame.call_site.is_none());
        if entry_live {
            values.extend(self.storage.frame_values(1));
        }
        self.final_values = values;
    }
}
