//! Error types and error handling for graph operations
//!
//! All errors implement `std::error::Error` via the `thiserror` crate.
//!
//! # Error taxonomy
//!
//! ```text
//! GraphError
//! ├── Validation         - graph structure errors, compile time only
//! ├── NodeExecution      - a node body failed
//! ├── Execution          - general execution errors
//! ├── Interrupt          - control-flow signal, not a failure
//! ├── Checkpoint         - persistence errors
//! ├── Serialization      - JSON errors
//! ├── Io                 - I/O errors
//! ├── Timeout            - superstep exceeded its allotted time
//! └── Custom             - application-defined errors
//! ```
//!
//! Two conditions deserve special handling and never surface to callers as
//! plain failures: the `EmptyChannel` read (the scheduler treats it as
//! "not yet ready") and [`GraphError::Interrupt`] (recorded as checkpoint
//! state and reported as an interrupt event). Everything else is fatal to
//! the run and propagates after in-flight tasks are settled and partial
//! progress is persisted.

use crate::interrupt::Interrupt;
use stepgraph_checkpoint::CheckpointError;
use thiserror::Error;

/// Convenience result type using [`GraphError`]
pub type Result<T> = std::result::Result<T, GraphError>;

/// Comprehensive error type for all graph operations
#[derive(Error, Debug)]
pub enum GraphError {
    /// Graph structure validation failed
    ///
    /// Raised only at compile time: unreachable node, dangling edge,
    /// reserved-name collision. The run never starts.
    #[error("graph validation failed: {0}")]
    Validation(String),

    /// Node execution failed with context
    #[error("node '{node}' execution failed: {error}")]
    NodeExecution {
        /// Name of the node that failed
        node: String,
        /// Error message from node execution
        error: String,
    },

    /// Generic execution error without specific node context
    #[error("execution failed: {0}")]
    Execution(String),

    /// Execution suspended waiting for external input
    ///
    /// This is **not a failure** but a control-flow signal. The runner
    /// special-cases it: never retried, never recorded as an error, and
    /// the superstep still commits so a later invocation can resume.
    #[error("execution interrupted in node '{}'", .0.node)]
    Interrupt(Interrupt),

    /// Checkpoint persistence error
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation exceeded its time limit
    ///
    /// Fatal to the run; writes already committed by finished tasks are
    /// preserved.
    #[error("operation timed out after {duration_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out
        operation: String,
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Custom application-defined error
    #[error("{0}")]
    Custom(String),
}

impl GraphError {
    /// Create a node execution error with context
    pub fn node_execution(node: impl Into<String>, error: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            error: error.into(),
        }
    }

    /// Whether this is the interrupt control-flow signal
    pub fn is_interrupt(&self) -> bool {
        matches!(self, GraphError::Interrupt(_))
    }

    /// Whether this error looks like a transient failure worth retrying.
    ///
    /// This is the default retry predicate: I/O and storage failures are
    /// retried, as are execution errors whose message points at a
    /// connection-style problem. Validation, serialization and channel
    /// contract errors are programming errors and never retried;
    /// interrupts are control flow and never reach retry at all.
    pub fn is_transient(&self) -> bool {
        fn transient_message(msg: &str) -> bool {
            let msg = msg.to_ascii_lowercase();
            ["timeout", "timed out", "connection", "unavailable", "rate limit", "503", "504"]
                .iter()
                .any(|needle| msg.contains(needle))
        }

        match self {
            GraphError::Io(_) => true,
            GraphError::Checkpoint(CheckpointError::Storage(_))
            | GraphError::Checkpoint(CheckpointError::Io(_)) => true,
            GraphError::NodeExecution { error, .. } => transient_message(error),
            GraphError::Execution(msg) | GraphError::Custom(msg) => transient_message(msg),
            _ => false,
        }
    }
}
