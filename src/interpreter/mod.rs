//! Simulator execution engine
//!
//! This module provides the core execution logic:
//! - [`engine`]: the [`engine::Simulator`], call state machine and abort handle
//! - [`errors`]: Runtime error types and panic-class fault kinds
//! - [`constants`]: Address-space layout and defaults
//!
//! # Execution Model
//!
//! The simulator walks the program model one statement at a time, driving
//! [`crate::memory::Storage`] with the placements decided by
//! [`crate::escape::classify`]. Each call moves through
//! `Entered → Executing → Returning → Exited`; each step is recorded in the
//! [`crate::snapshot::Trace`].
//!
//! Execution is single-threaded and synchronous. The only cross-thread
//! surface is [`engine::AbortHandle`], polled at statement boundaries.

pub mod constants;
pub mod engine;
pub mod errors;
mod expressions;
mod statements;
