//! Heap source interface.
//!
//! The heap source is the page-managed allocator that owns object storage.
//! The coordinator drives it through this trait and never touches chunk
//! memory itself.

use crate::object::ObjectRef;
use std::time::Duration;

/// The underlying page-managed allocator.
///
/// # Contracts
///
/// - Returned chunks are zero-filled and aligned to
///   [`OBJECT_ALIGNMENT`](crate::OBJECT_ALIGNMENT).
/// - [`contains`](HeapSource::contains) is lock-free: it reads the live
///   bitmap without taking the allocator lock, and must never report a false
///   negative for a pointer that has been fully published to another thread.
///   A very recently allocated object may briefly read as unknown on other
///   threads; the read-modify-write setting its live bit completes before
///   the pointer escapes the allocating thread.
/// - While a concurrent collection is running, freshly allocated objects are
///   created already marked so they survive the in-flight cycle.
/// - Sweeping a span and allocating from a distinct span are safe
///   concurrently.
pub trait HeapSource: Send + Sync {
    /// Allocates `size` bytes within the current footprint. Returns `None`
    /// when the request cannot be satisfied without growing.
    fn alloc(&self, size: usize) -> Option<ObjectRef>;

    /// Allocates `size` bytes, raising the footprint toward the maximum heap
    /// size if required. Returns `None` when the request cannot be satisfied
    /// even after growth; the footprint is left unchanged in that case.
    fn alloc_and_grow(&self, size: usize) -> Option<ObjectRef>;

    /// Returns `true` if `object` is a chunk known to the allocator.
    /// Lock-free; see the trait contracts.
    fn contains(&self, object: ObjectRef) -> bool;

    /// Returns the exact size of the chunk backing `object`.
    fn chunk_size(&self, object: ObjectRef) -> usize;

    /// Publishes the mark bitmap as the new live bitmap and clears the old
    /// live bitmap to serve as the next mark bitmap. Atomic with respect to
    /// [`contains`](HeapSource::contains).
    fn swap_bitmaps(&self);

    /// Total bytes currently allocated to live chunks.
    fn bytes_allocated(&self) -> usize;

    /// Current committed heap footprint in bytes.
    fn footprint(&self) -> usize;

    /// Adjusts the ideal footprint toward the configured live-to-footprint
    /// ratio. Pages are not unmapped immediately.
    fn grow_for_utilization(&self);

    /// Requests that free pages be returned to the operating system after
    /// `delay`, cancelling any previously scheduled trim.
    fn schedule_trim(&self, delay: Duration);

    /// One-time follow-up after the process forks from the runtime template.
    fn post_fork(&self);

    /// Joins the allocator's background thread during runtime teardown.
    fn thread_shutdown(&self);

    /// Releases object storage. [`contains`](HeapSource::contains) returns
    /// `false` for every object afterwards.
    fn shutdown(&self);
}
