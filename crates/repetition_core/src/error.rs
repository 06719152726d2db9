//! crates/repetition_core/src/error.rs
//!
//! The error raised when processing a single rule fails.

use crate::domain::RuleError;
use crate::ports::PortError;

/// A per-rule failure. It aborts the rule's unit of work, never the tick.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    /// Represents an error that propagated up from one of the core service ports.
    #[error("Service Port Error: {0}")]
    Port(#[from] PortError),

    /// The rule breaks its own contract (e.g. a restrictive book domain with no books).
    #[error("Invalid repetition rule: {0}")]
    InvalidRule(#[from] RuleError),
}
