//! # Introduction
//!
//! refsim models a program's variables, calls and allocations under an
//! explicit value/reference memory model, and answers for each trace where
//! every value lives (stack frame or heap), whether a mutation inside a callee
//! is visible to its caller, and which operations panic.
//!
//! ## Execution pipeline
//!
//! ```text
//! JSON → Program Model → Escape Classifier → Simulator (+ Storage) → Verdict
//! ```
//!
//! 1. [`program`]: the program model, its JSON loader and the
//!    well-formedness check.
//! 2. [`escape`]: static classification of every allocation site as
//!    stack- or heap-bound.
//! 3. [`interpreter`]: walks the model statement by statement and drives
//!    storage; panic-class faults end the trace.
//! 4. [`memory`]: tagged [`memory::value::Value`]s in a
//!    [`memory::stack::Stack`] of frames and a [`memory::heap::Heap`] of
//!    slots, blocks and tables.
//! 5. [`snapshot`]: the [`snapshot::Verdict`], the execution
//!    [`snapshot::Trace`] and the [`snapshot::HeapReport`].
//!
//! ## Copy rule
//!
//! Primitives and composites copy deeply. Pointers copy the address.
//! Reference and key-value headers copy the header and share the block
//! behind it; appending past capacity rebinds only the header appended to.
//!
//! ## Example
//!
//! ```
//! use refsim::config::SimConfig;
//! use refsim::memory::value::Value;
//! use refsim::program::ast::*;
//!
//! let program = Program::new()
//!     .with_function(FunctionDef::new(
//!         "main",
//!         vec![],
//!         vec![
//!             Stmt::declare("x", VarKind::Value, Expr::int(10)),
//!             Stmt::call("set", vec![Expr::addr_of("x")]),
//!         ],
//!     ))
//!     .with_function(FunctionDef::new(
//!         "set",
//!         vec![Param::new("p", VarKind::Pointer)],
//!         vec![Stmt::store(Expr::var("p"), Expr::int(20))],
//!     ));
//!
//! let verdict = refsim::run_program(program, SimConfig::default()).unwrap();
//! assert_eq!(verdict.value("x"), Some(&Value::int(20)));
//! ```

pub mod config;
pub mod escape;
pub mod interpreter;
pub mod memory;
pub mod program;
pub mod snapshot;

use config::SimConfig;
use interpreter::engine::Simulator;
use interpreter::errors::RuntimeError;
use program::ast::Program;
use program::check::WellFormednessError;
use snapshot::Verdict;
use thiserror::Error;

/// Top-level errors of a simulation
#[derive(Debug, Error)]
pub enum SimError {
    #[error("malformed program model: {0}")]
    WellFormedness(#[from] WellFormednessError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("trace aborted by host")]
    Aborted,

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Load a JSON program model and run it to a verdict
pub fn simulate(json: &str, config: SimConfig) -> Result<Verdict, SimError> {
    Simulator::from_json(json, config)?.run()
}

/// Check and run an already-built program model
pub fn run_program(program: Program, config: SimConfig) -> Result<Verdict, SimError> {
    program::check::check_program(&program, &config.entry)?;
    Simulator::new(program, config).run()
}
