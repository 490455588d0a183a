//! Errors reported by the recoverable parts of the runtime
//!
//! Kernel execution itself has no error channel: allocation failure aborts
//! and malformed kernels are a precondition violation. These variants cover
//! program construction, configuration and the worker pool.

/// Errors that can occur outside of kernel execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// Program metadata is unusable (zero-sized workgroup, overflow)
    InvalidProgram(String),

    /// Configuration value could not be parsed
    Config(String),

    /// A worker or coordinator thread could not be spawned
    Spawn(String),

    /// Kernels panicked on this many work items since the last sync
    WorkerPanicked(usize),

    /// The pool has shut down and no longer accepts work
    PoolStopped,
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeError::InvalidProgram(e) => write!(f, "invalid program: {}", e),
            RuntimeError::Config(e) => write!(f, "configuration error: {}", e),
            RuntimeError::Spawn(e) => write!(f, "failed to spawn thread: {}", e),
            RuntimeError::WorkerPanicked(n) => write!(f, "{} work item(s) panicked", n),
            RuntimeError::PoolStopped => write!(f, "worker pool has stopped"),
        }
    }
}

impl std::error::Error for RuntimeError {}
