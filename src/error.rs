//! Error taxonomy for the analysis core
//!
//! Analyses distinguish three failure classes:
//!
//! - [`WeftError::InvariantViolation`]: an internal consistency check failed
//!   (edge between unknown endpoints, condensation produced a cycle, a
//!   dataflow pass ran past its iteration ceiling). Fatal; never swallowed.
//! - [`WeftError::Unsupported`]: an oracle or input produced a value outside
//!   its documented contract. Fatal.
//! - [`WeftError::Resource`]: an optional artifact (DOT file) could not be
//!   written. Callers recover locally, emit a diagnostic, and continue.
//!
//! Refinements that cannot conclude are *not* errors: the edge keeps its
//! pessimistic classification and the event is only logged.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, WeftError>;

/// Fatal and locally-recoverable failures of the analysis core.
#[derive(Debug, Error)]
pub enum WeftError {
    /// An internal consistency check failed. The message names the
    /// operation and the offending entity.
    #[error("invariant violation in {operation}: {message}")]
    InvariantViolation {
        /// The operation that detected the violation, e.g. `DepGraph::add_edge`.
        operation: &'static str,
        /// Human-readable description of what went wrong.
        message: String,
    },

    /// An oracle returned a value outside its documented enum, or an input
    /// used a construct the core does not model.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A best-effort artifact could not be produced.
    #[error("resource error: {0}")]
    Resource(#[from] std::io::Error),
}

impl WeftError {
    /// Shorthand for an [`WeftError::InvariantViolation`].
    pub fn invariant(operation: &'static str, message: impl Into<String>) -> Self {
        Self::InvariantViolation {
            operation,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invariant_message_names_operation() {
        let err = WeftError::invariant("DepGraph::add_edge", "unknown endpoint v7");
        let msg = err.to_string();
        assert!(msg.contains("DepGraph::add_edge"));
        assert!(msg.contains("unknown endpoint v7"));
    }

    #[test]
    fn test_io_error_converts_to_resource() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: WeftError = io.into();
        assert!(matches!(err, WeftError::Resource(_)));
    }
}
