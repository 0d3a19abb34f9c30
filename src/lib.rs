//! # Lungo Heap
//!
//! The garbage-collected heap coordinator of the Lungo VM: the component
//! that mediates between mutator threads allocating objects and a mark-sweep
//! collector reclaiming them.
//!
//! ## Overview
//!
//! [`GcHeap`] owns the global allocation lock, orchestrates the
//! stop-the-world phases of an (optionally concurrent) mark-sweep cycle,
//! enforces out-of-memory semantics, and feeds the finalizer worker through
//! a pair of hand-off queues. The pieces that own storage and algorithms are
//! collaborators consumed through traits:
//!
//! - [`HeapSource`] — the page-managed allocator that owns object storage
//! - [`MarkSweep`] — the tracing engine that marks roots, scans the live
//!   graph, and sweeps unmarked chunks
//! - [`CardTable`] — the remembered set dirtied by the write barrier during
//!   concurrent marking
//! - [`ThreadRegistry`] — suspend/resume primitives, per-thread status, and
//!   exception state
//! - [`HeapMonitor`] — optional sink for heap info snapshots
//!
//! ## Allocation
//!
//! [`GcHeap::alloc`] runs a five-step recovery ladder under the heap lock:
//! fast allocation, waiting out a concurrent cycle, a blocking collection,
//! growth toward the maximum footprint, and finally a collection that clears
//! soft references. Exhaustion is a value, not a panic: the ladder returns
//! `None` and the coordinator raises a managed `OutOfMemoryError` on the
//! calling thread, falling back to a pre-built exception when throwing
//! itself cannot allocate.
//!
//! ## Collection cycle
//!
//! One cycle moves through root suspension, marking, optional concurrent
//! tracing with a dirty-card re-scan, reference processing, a system-weak
//! sweep, the bitmap swap that publishes the new live set, sweeping, heap
//! resizing, and a scheduled trim. A concurrent cycle pauses mutators twice
//! (roots and dirty cards); a blocking cycle pauses them once. Every cycle
//! ends with a one-line summary such as:
//!
//! ```text
//! GC_CONCURRENT freed 120K, 53% free 1024K/2048K, paused 1ms+2ms
//! ```
//!
//! ## Thread safety
//!
//! Three locks, always acquired heap → worker → worker-list, cover the
//! allocator state, the worker's in-flight operation, and the hand-off
//! queues. Threads that must block on the heap lock or the GC-done
//! condition first downgrade their status so the safepoint suspender never
//! waits on them.

#![deny(clippy::unwrap_in_result)]
#![deny(clippy::unwrap_used)]

mod cards;
mod config;
mod driver;
mod engine;
mod error;
mod heap;
mod monitor;
mod object;
mod refs;
mod source;
mod threads;
mod worker;

pub use cards::CardTable;
pub use config::{AllocationProfile, Configuration};
pub use driver::{GcPauses, GcReason, GcSummary};
pub use engine::{GcMode, MarkSweep, ReferenceContext, SweepOutcome};
pub use error::{Error, Result};
pub use heap::{GcHeap, HeapGuard};
pub use monitor::{HeapMonitor, HeapSnapshot, MonitorWhen};
pub use object::{AllocFlags, OBJECT_ALIGNMENT, ObjectRef};
pub use refs::{DiscoveredReferences, ReferenceTable};
pub use source::HeapSource;
pub use threads::{SuspendReason, ThreadRegistry, ThreadStatus};
pub use worker::{PendingWork, WorkerOp};
