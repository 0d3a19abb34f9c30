//! Worker hand-off queues and worker introspection state.
//!
//! The collector does not run finalizers or reference enqueues itself; it
//! appends the affected objects to two FIFOs that a dedicated worker thread
//! drains through [`next_worker_object`](crate::GcHeap::next_worker_object).

use crate::object::ObjectRef;
use std::collections::VecDeque;
use std::time::Instant;

/// What the worker should do with an object it dequeued.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerOp {
    /// Perform the user-visible reference enqueue.
    Enqueue,
    /// Run the object's finalizer.
    Finalize,
}

/// The two worker FIFOs, guarded by the worker-list lock.
///
/// Reference enqueues drain strictly before finalizations when both are
/// pending, so a finalizer can never resurrect an object whose reference
/// clear is still in flight.
#[derive(Debug, Default)]
pub struct PendingWork {
    /// Objects awaiting a user-visible reference enqueue.
    pub reference_operations: VecDeque<ObjectRef>,
    /// Objects unreachable except through their finalizer.
    pub pending_finalizations: VecDeque<ObjectRef>,
}

impl PendingWork {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.reference_operations.is_empty() && self.pending_finalizations.is_empty()
    }
}

/// What the worker thread is doing right now, guarded by the worker lock.
///
/// The driver holds the worker lock for the whole cycle, which keeps new
/// operations from starting, and uses `interp_started` to detect a worker
/// wedged inside a finalizer.
#[derive(Debug, Default)]
pub(crate) struct WorkerBusy {
    pub(crate) current_object: Option<ObjectRef>,
    pub(crate) current_op: Option<WorkerOp>,
    pub(crate) interp_started: Option<Instant>,
}
