//! The kernel code-generation collaborator seam.
//!
//! A `Version`'s kernel source is produced by a `Skeleton` template keyed on the owning
//! `Task`'s dominant pattern; the textual emission itself is out of scope for this crate
//! (kernel source generation) and left to whatever `CodeGen` the embedding
//! application supplies. `CodeGen::emit` must be a pure function of the `Version`'s
//! signature so `Program::compile`'s compiled-artifact cache stays valid across calls.

use crate::program::Version;

/// Emits kernel source text for a `Version`. Pure: the same `Version` always yields the
/// same source string, which is what lets `Program::compile` cache compiled artifacts by
/// `Task::signature()` rather than by the source text itself.
pub trait CodeGen: Send + Sync {
    /// Produces the kernel source for `version`.
    fn emit(&self, version: &Version) -> String;
}
