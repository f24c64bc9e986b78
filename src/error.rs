//! Typed error surface for the engine.
//!
//! Every fallible API boundary returns [`Result<T, EngineError>`]. Internal invariants
//! (e.g. the bidirectional edge invariant of the IR) are additionally enforced with
//! `debug_assert!` at the call site so release builds do not pay for the redundant check;
//! `EngineError::Invariant` exists for invariant failures that must be reported rather
//! than panicked on (assembled across thread boundaries, for instance).

use thiserror::Error;

use crate::ir::NodeId;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

/// The terminal error surface of the engine.
///
/// Workers never locally recover from a failure: whichever kind is raised, the caller sees
/// exactly one of these variants with enough context to report a human-readable message.
/// There are no retries.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid device name or an internally inconsistent [`crate::config::Config`].
    /// Raised at `setup_devices` / `Config::validate`.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Kernel build failure. Raised at `Program::compile`.
    #[error("compilation error in task {task} version {detail:?}: {message}")]
    Compilation {
        /// The task whose version failed to compile.
        task: usize,
        /// The specialization detail string of the failing version.
        detail: String,
        /// Collaborator-supplied diagnostic text.
        message: String,
    },

    /// Kernel dispatch or buffer transfer failed. Raised at worker scope; aborts the
    /// evaluation.
    #[error("device error on job {node:?}@{coord:?}: {message}")]
    Device {
        /// The node whose compute step failed.
        node: NodeId,
        /// The block coordinate being computed.
        coord: String,
        /// Collaborator-supplied diagnostic text.
        message: String,
    },

    /// No evictable entry exists (every pooled entry is `used`). Indicates bad sizing of
    /// `Config::cache_entry_count` relative to the workload's live-set.
    #[error("cache capacity exhausted: all {entries} entries are in use")]
    CacheCapacity {
        /// Size of the entry pool at the time of failure.
        entries: usize,
    },

    /// File spill failure.
    #[error("I/O error: {0}")]
    Io(String),

    /// An internal invariant was violated (bidirectional edge mismatch, illegal pattern
    /// fusion, double allocation of a block, etc). These are bugs in the engine, not in
    /// user input.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl EngineError {
    /// Short machine-readable kind tag naming this error's category.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Configuration(_) => "ConfigurationError",
            EngineError::Compilation { .. } => "CompilationError",
            EngineError::Device { .. } => "DeviceError",
            EngineError::CacheCapacity { .. } => "CacheCapacityError",
            EngineError::Io(_) => "IOError",
            EngineError::Invariant(_) => "InvariantViolation",
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}
