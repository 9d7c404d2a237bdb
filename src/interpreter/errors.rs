//! Runtime error types for the simulator
//!
//! This module defines [`RuntimeError`], which represents all errors that can
//! occur during execution (as opposed to well-formedness errors raised by the
//! loader).
//!
//! [`RuntimeError::Fault`] is the panic class: the engine ends the trace and
//! records it in the verdict. Every other variant means the model is ill-typed
//! in a way the structural check cannot see, and is returned to the host.

use crate::memory::StorageError;
use crate::program::ast::Location;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Panic-class fault kinds reported in the verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    NilDereference,
    DanglingPointer,
    IndexOutOfRange,
    NilMapWrite,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FaultKind::NilDereference => "nil dereference",
            FaultKind::DanglingPointer => "dangling pointer",
            FaultKind::IndexOutOfRange => "index out of range",
            FaultKind::NilMapWrite => "nil map write",
        };
        f.write_str(name)
    }
}

/// Runtime errors that can occur during execution
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    /// Panic-class fault; ends the trace
    #[error("{kind} at {location}: {detail}")]
    Fault {
        kind: FaultKind,
        detail: String,
        location: Location,
    },

    #[error("kind mismatch at {location}: expected {expected}, got {got}")]
    KindMismatch {
        expected: String,
        got: String,
        location: Location,
    },

    #[error("undefined variable '{name}' at {location}")]
    UndefinedVariable { name: String, location: Location },

    #[error("undefined function '{name}' at {location}")]
    UndefinedFunction { name: String, location: Location },

    #[error("no field '{field}' at {location}")]
    MissingField { field: String, location: Location },

    /// Storage is inconsistent with the program (bad address, missing frame)
    #[error("invalid storage state at {location}: {message}")]
    InvalidState { message: String, location: Location },

    /// The host aborted the trace
    #[error("aborted at {location}")]
    Aborted { location: Location },
}

impl RuntimeError {
    pub fn location(&self) -> &Location {
        match self {
            RuntimeError::Fault { location, .. }
            | RuntimeError::KindMismatch { location, .. }
            | RuntimeError::UndefinedVariable { location, .. }
            | RuntimeError::UndefinedFunction { location, .. }
            | RuntimeError::MissingField { location, .. }
            | RuntimeError::InvalidState { location, .. }
            | RuntimeError::Aborted { location } => location,
        }
    }

    /// Fault kind, if this is a panic-class error
    pub fn fault_kind(&self) -> Option<FaultKind> {
        match self {
            RuntimeError::Fault { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn kind_mismatch(
        expected: impl Into<String>,
        got: impl Into<String>,
        location: &Location,
    ) -> Self {
        RuntimeError::KindMismatch {
            expected: expected.into(),
            got: got.into(),
            location: location.clone(),
        }
    }

    /// Attach a location to a storage failure and classify it
    pub fn from_storage(err: StorageError, location: Location) -> Self {
        let detail = err.to_string();
        let kind = match err {
            StorageError::NilDereference => FaultKind::NilDereference,
            StorageError::Dangling(_) => FaultKind::DanglingPointer,
            StorageError::IndexOutOfRange { .. } => FaultKind::IndexOutOfRange,
            StorageError::NilMapWrite => FaultKind::NilMapWrite,
            StorageError::KindMismatch { expected, got } => {
                return RuntimeError::KindMismatch {
                    expected: expected.to_string(),
                    got: got.to_string(),
                    location,
                };
            }
            StorageError::MissingField(field) => {
                return RuntimeError::MissingField { field, location };
            }
            StorageError::InvalidAddress(..) | StorageError::NoFrame => {
                return RuntimeError::InvalidState {
                    message: detail,
                    location,
                };
            }
        };
        RuntimeError::Fault {
            kind,
            detail,
            location,
        }
    }
}

/// Attach a statement location to storage results
pub(crate) trait AtLocation<T> {
    fn at(self, location: &Location) -> Result<T, RuntimeError>;
}

impl<T> AtLocation<T> for Result<T, StorageError> {
    fn at(self, location: &Location) -> Result<T, RuntimeError> {
        self.map_err(|err| RuntimeError::from_storage(err, location.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_faults_are_panic_class() {
        let location = Location::new("main", 3);
        let err = RuntimeError::from_storage(StorageError::NilDereference, location.clone());
        assert_eq!(err.fault_kind(), Some(FaultKind::NilDereference));
        assert_eq!(err.location(), &location);

        let err = RuntimeError::from_storage(StorageError::Dangling(0x8), location.clone());
        assert_eq!(err.fault_kind(), Some(FaultKind::DanglingPointer));
    }

    #[test]
    fn test_kind_mismatch_is_not_a_fault() {
        let err = RuntimeError::from_storage(
            StorageError::KindMismatch {
                expected: "pointer",
                got: "primitive",
            },
            Location::new("f", 0),
        );
        assert_eq!(err.fault_kind(), None);
        assert_eq!(
            err.to_string(),
            "kind mismatch at f#0: expected pointer, got primitive"
        );
    }
}
