//! Program model and loader
//!
//! - [`ast`]: the read-only program tree (declarations, statements, calls)
//! - [`check`]: structural well-formedness check run before execution
//!
//! Programs arrive as JSON documents. Every enum is internally tagged
//! (`"stmt"`, `"expr"`, `"place"`) and declared kinds use the
//! `value` / `pointer` / `reference_header` / `key_value_header` /
//! `interface_box` vocabulary.

pub mod ast;
pub mod check;

use crate::SimError;
use ast::Program;

/// Parse a program model from JSON and check it against `entry`
pub fn load_program(json: &str, entry: &str) -> Result<Program, SimError> {
    let program: Program = serde_json::from_str(json)?;
    check::check_program(&program, entry)?;
    tracing::debug!(
        functions = program.functions.len(),
        globals = program.globals.len(),
        "loaded program model"
    );
    Ok(program)
}
