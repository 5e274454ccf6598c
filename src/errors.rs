//! Error handling for the cooperative scheduler.
//!
//! Only configuration-time failures are reported as values: registering more
//! identities than the registry can hold, or the stack-switch backend failing
//! to produce a context. Everything else this crate checks is an invariant
//! shared with the virtual machine's control flow, and a violated invariant
//! means the two sides have diverged; those paths log and panic instead of
//! returning, because the host cannot safely continue.

use core::fmt;

/// Errors that can occur while registering thread identities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// The registry already holds the maximum number of identities
    CapacityExhausted {
        /// Configured identity limit
        limit: usize,
        /// Number of identities the failed registration asked for
        requested: usize,
    },
    /// The virtual machine could not allocate a trap range
    TrapAllocation,
}

/// Errors reported by the stack-switch primitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    /// The backend could not allocate a stack of the requested size
    StackAllocation(usize),
    /// The backend could not create the execution context
    CreateFailed,
}

impl fmt::Display for RegisterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterError::CapacityExhausted { limit, requested } => {
                write!(f, "too many threads: {} requested, limit {}", requested, limit)
            }
            RegisterError::TrapAllocation => write!(f, "trap range allocation failed"),
        }
    }
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextError::StackAllocation(size) => {
                write!(f, "failed to allocate {} byte context stack", size)
            }
            ContextError::CreateFailed => write!(f, "context creation failed"),
        }
    }
}
