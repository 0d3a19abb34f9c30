//! Card table interface.

/// Remembered-set bitmap used by concurrent marking.
///
/// Mutators dirty cards through a write barrier outside this crate. The
/// driver clears the table under the heap lock when a concurrent trace
/// begins and the engine reads it during the dirty-card re-scan.
pub trait CardTable: Send + Sync {
    /// Sizes the table to cover `heap_maximum` bytes of heap. Returns
    /// `false` on failure, which aborts heap startup.
    fn startup(&self, heap_maximum: usize) -> bool;

    /// Clears every card. Called with all mutators suspended.
    fn clear(&self);

    /// Checks the table for internal consistency. A `false` return aborts
    /// the process in verify-enabled configurations.
    fn verify(&self) -> bool;

    /// Releases the table's storage.
    fn shutdown(&self);
}
