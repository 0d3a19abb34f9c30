//! Error handling for the heap coordinator.
//!
//! Failures the coordinator can recover from surface as [`Error`] values.
//! Failures that violate a structural invariant of the managed heap do not:
//! they abort the process via [`fatal`], because continuing would corrupt the
//! managed world. Allocation exhaustion is neither; it is reported as a
//! `None` return with a managed out-of-memory exception raised on the
//! current thread.

use tracing::error;

/// Heap coordinator result type
///
/// This is a type alias for the standard library's
/// [`Result`](core::result::Result) type with the error type defaulting to
/// [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors that can occur while configuring or starting the heap coordinator,
/// or while a collaborator prepares a collection cycle.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid heap configuration
    #[error("Invalid heap configuration: {0}")]
    Configuration(String),
    /// Mark step setup error reported by the mark-sweep engine
    #[error("Failed to begin mark step: {0}")]
    MarkStep(String),
    /// Reference table capacity exhausted
    #[error("Reference table overflow: {0} entries")]
    ReferenceTableOverflow(usize),
    /// Heap startup error
    #[error("Heap startup error: {0}")]
    Startup(String),
}

/// Aborts the process after logging `message`.
///
/// Used on the paths where the heap is structurally unrecoverable: a
/// finalizable object that cannot be recorded, a mark step that fails to
/// begin, a wedged finalizer worker, or a verification failure.
pub(crate) fn fatal(message: &str) -> ! {
    error!("{message}");
    std::process::abort();
}
