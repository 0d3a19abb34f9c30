//! Mark-sweep engine interface.
//!
//! The engine owns the tracing algorithm: it marks the root set, scans the
//! live graph, and sweeps unmarked chunks. The driver calls these hooks in a
//! fixed order per cycle; the engine never takes the heap lock itself.

use crate::error::Result;
use crate::refs::{DiscoveredReferences, ReferenceTable};
use crate::worker::PendingWork;

/// Which part of the heap a cycle collects.
///
/// A partial cycle scans the small-object area only; the remaining regions
/// contribute roots, and references and finalizers reachable from the
/// scanned area are still processed. The exact region boundary is the heap
/// source's business.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GcMode {
    Partial,
    Full,
}

/// Totals accumulated while sweeping unmarked chunks.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SweepOutcome {
    pub objects_freed: usize,
    pub bytes_freed: usize,
}

/// Mutable state handed to the reference processor.
///
/// The driver holds the heap lock and the worker-list lock while the
/// processor runs, so the discovered lists, the finalizable table, and the
/// pending worker queues can all be mutated safely through this context.
pub struct ReferenceContext<'a> {
    /// Clear softly reachable objects instead of preserving them. Set on the
    /// last-ditch collection before an out-of-memory report.
    pub clear_soft_references: bool,
    /// Per-cycle discovered soft/weak/phantom lists, empty at cycle start.
    pub discovered: &'a mut DiscoveredReferences,
    /// Live finalizable objects; the processor drains the unreachable ones.
    pub finalizable: &'a mut ReferenceTable,
    /// Worker hand-off queues. Unreachable finalizable objects go to
    /// `pending_finalizations`; references awaiting a user-visible enqueue
    /// go to `reference_operations`.
    pub pending: &'a mut PendingWork,
}

/// The tracing collector the driver orchestrates.
pub trait MarkSweep: Send + Sync {
    /// Prepares a mark step for one cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the mark state cannot be set up. The driver
    /// treats this as unrecoverable and aborts the process.
    fn begin(&self, mode: GcMode) -> Result<()>;

    /// Marks the root set. All mutators are suspended.
    fn mark_roots(&self);

    /// Visits the transitive closure from the initial gray set. Runs with
    /// mutators resumed during a concurrent cycle.
    fn scan_marked_objects(&self);

    /// Conservatively re-marks the roots after a concurrent trace. Root
    /// writes carry no write barrier, so every root is treated as
    /// potentially new.
    fn re_mark_roots(&self);

    /// Re-scans objects reachable through cards dirtied by mutators during
    /// the concurrent trace.
    fn re_scan_dirty_cards(&self);

    /// Processes soft, weak, and phantom references and drains unreachable
    /// finalizable objects into the pending worker queues. Runs strictly
    /// after all tracing, including the dirty-card re-scan.
    fn process_references(&self, context: ReferenceContext<'_>);

    /// Sweeps runtime-internal weak tables (interned strings and the like).
    fn sweep_system_weaks(&self);

    /// Frees unmarked chunks. During a concurrent cycle this runs with
    /// mutators resumed and must only touch spans the allocator is not
    /// handing out.
    fn sweep(&self, mode: GcMode, concurrent: bool) -> SweepOutcome;

    /// Tears down the per-cycle mark state.
    fn finish(&self);

    /// Verifies roots and the live bitmap. A `false` return aborts the
    /// process in verify-enabled configurations.
    fn verify(&self) -> bool {
        true
    }
}
