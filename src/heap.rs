//! The garbage-collected heap coordinator.
//!
//! [`GcHeap`] owns the global allocation lock, the worker hand-off queues,
//! and the concurrent-collection daemon, and mediates between mutator
//! threads allocating objects and the mark-sweep engine reclaiming them.

use crate::cards::CardTable;
use crate::config::{AllocationProfile, Configuration};
use crate::driver::{GcReason, GcSummary};
use crate::engine::MarkSweep;
use crate::error::{Error, Result, fatal};
use crate::monitor::{HeapMonitor, MonitorWhen};
use crate::object::{AllocFlags, ObjectRef};
use crate::refs::{DiscoveredReferences, ReferenceTable};
use crate::source::HeapSource;
use crate::threads::{ThreadRegistry, ThreadStatus};
use crate::worker::{PendingWork, WorkerBusy, WorkerOp};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Deferred work drained during the all-threads-quiescent window of a cycle.
pub(crate) type SafepointHook = Arc<dyn Fn() + Send + Sync>;

/// Allocator state guarded by the heap lock.
pub(crate) struct HeapState {
    /// True while any collection phase is active, including the windows
    /// where a concurrent cycle has released the heap lock.
    pub(crate) running: bool,
    /// Live objects whose class overrides finalization.
    pub(crate) finalizable: ReferenceTable,
    /// Per-cycle discovered soft/weak/phantom references.
    pub(crate) discovered: DiscoveredReferences,
    /// Allocation counters, maintained when profiling is enabled.
    pub(crate) profile: AllocationProfile,
    /// When to publish heap info to the monitoring sink.
    pub(crate) heap_info_mode: MonitorWhen,
}

impl HeapState {
    fn new() -> Self {
        Self {
            running: false,
            finalizable: ReferenceTable::default(),
            discovered: DiscoveredReferences::default(),
            profile: AllocationProfile::default(),
            heap_info_mode: MonitorWhen::Never,
        }
    }
}

/// RAII guard for the heap lock.
///
/// Acquired through [`GcHeap::lock_heap`]; the lock is released when the
/// guard is dropped. Acquisition performs the safepoint status dance: a
/// thread that has to block first downgrades itself to
/// [`ThreadStatus::VmWait`] so the suspend protocol never waits on it.
pub struct HeapGuard<'heap> {
    pub(crate) state: MutexGuard<'heap, HeapState>,
}

impl HeapGuard<'_> {
    /// Returns `true` while a collection cycle is active.
    #[must_use]
    pub fn gc_running(&self) -> bool {
        self.state.running
    }

    /// The live finalizable objects recorded by the allocator, in
    /// allocation order.
    #[must_use]
    pub fn finalizable_objects(&self) -> &[ObjectRef] {
        self.state.finalizable.as_slice()
    }
}

/// The heap coordinator.
///
/// One instance manages the process-wide managed heap. Collaborators are
/// supplied at [`startup`](GcHeap::startup); mutators allocate through
/// [`alloc`](GcHeap::alloc), and the finalizer worker polls
/// [`next_worker_object`](GcHeap::next_worker_object).
pub struct GcHeap {
    this: Weak<GcHeap>,
    pub(crate) config: Configuration,
    pub(crate) source: Arc<dyn HeapSource>,
    pub(crate) engine: Arc<dyn MarkSweep>,
    pub(crate) cards: Arc<dyn CardTable>,
    pub(crate) threads: Arc<dyn ThreadRegistry>,
    pub(crate) monitor: Option<Arc<dyn HeapMonitor>>,

    /// The heap lock and its GC-done condition.
    pub(crate) state: Mutex<HeapState>,
    pub(crate) gc_done: Condvar,

    /// The worker lock: held by the worker while an operation is in flight,
    /// held by the driver for the whole cycle.
    pub(crate) worker: Mutex<WorkerBusy>,
    /// The worker-list lock guarding the two hand-off FIFOs.
    pub(crate) worker_list: Mutex<PendingWork>,

    pub(crate) last_summary: Mutex<Option<GcSummary>>,
    pub(crate) safepoint_hook: Mutex<Option<SafepointHook>>,

    daemon: Mutex<Option<thread::JoinHandle<()>>>,
    daemon_shutdown: AtomicBool,
    trigger: Mutex<bool>,
    trigger_cond: Condvar,
}

impl GcHeap {
    /// Starts the heap coordinator.
    ///
    /// Resolves and validates `configuration` (a growth limit of zero
    /// becomes the maximum size), sizes the card table to the maximum heap
    /// size, and starts the concurrent-collection daemon.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the card table
    /// fails to start. Partially constructed state is torn down before the
    /// error is returned.
    pub fn startup(
        configuration: Configuration,
        source: Arc<dyn HeapSource>,
        engine: Arc<dyn MarkSweep>,
        cards: Arc<dyn CardTable>,
        threads: Arc<dyn ThreadRegistry>,
        monitor: Option<Arc<dyn HeapMonitor>>,
    ) -> Result<Arc<Self>> {
        let configuration = configuration.resolved()?;
        if !cards.startup(configuration.maximum_size) {
            source.shutdown();
            return Err(Error::Startup("card table startup failed".to_string()));
        }

        let heap = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config: configuration,
            source,
            engine,
            cards,
            threads,
            monitor,
            state: Mutex::new(HeapState::new()),
            gc_done: Condvar::new(),
            worker: Mutex::new(WorkerBusy::default()),
            worker_list: Mutex::new(PendingWork::default()),
            last_summary: Mutex::new(None),
            safepoint_hook: Mutex::new(None),
            daemon: Mutex::new(None),
            daemon_shutdown: AtomicBool::new(false),
            trigger: Mutex::new(false),
            trigger_cond: Condvar::new(),
        });
        heap.start_daemon();
        debug!(
            "heap started ({}K/{}K, growth limit {}K)",
            heap.config.starting_size / 1024,
            heap.config.maximum_size / 1024,
            heap.config.growth_limit / 1024
        );
        Ok(heap)
    }

    /// One-time follow-up into the heap source after the child process has
    /// forked from the runtime template.
    pub fn post_fork(&self) {
        self.source.post_fork();
    }

    /// Shuts the heap down: stops the concurrent daemon, releases the card
    /// table, empties the reference tables and worker queues, and releases
    /// object storage.
    pub fn shutdown(&self) {
        self.stop_daemon();
        self.cards.shutdown();
        {
            let mut state = self.state.lock();
            state.finalizable.clear();
            state.discovered.clear();
        }
        {
            let mut pending = self.worker_list.lock();
            if !pending.is_empty() {
                warn!(
                    "discarding {} queued reference operations and {} pending finalizations",
                    pending.reference_operations.len(),
                    pending.pending_finalizations.len()
                );
            }
            pending.reference_operations.clear();
            pending.pending_finalizations.clear();
        }
        self.source.shutdown();
        debug!("heap shut down");
    }

    /// Joins the heap source's background thread during runtime teardown.
    pub fn thread_shutdown(&self) {
        self.source.thread_shutdown();
    }

    /// The configuration the heap runs with, growth limit resolved.
    #[must_use]
    pub fn configuration(&self) -> &Configuration {
        &self.config
    }

    // ------------------------------------------------------------------
    // Heap lock
    // ------------------------------------------------------------------

    /// Acquires the heap lock for coarse external synchronization.
    ///
    /// Tries a non-blocking acquisition first; if that fails, the calling
    /// thread transitions to [`ThreadStatus::VmWait`] before blocking and
    /// restores its prior status after acquisition, so a thread stuck on
    /// the heap lock never appears runnable to the suspend protocol.
    pub fn lock_heap(&self) -> HeapGuard<'_> {
        if let Some(state) = self.state.try_lock() {
            return HeapGuard { state };
        }
        let prior = self.threads.change_status(ThreadStatus::VmWait);
        let state = self.state.lock();
        self.threads.change_status(prior);
        HeapGuard { state }
    }

    /// Blocks until no concurrent collection cycle is running.
    ///
    /// The caller holds the heap lock through `guard`. While a cycle is
    /// active the calling thread downgrades to [`ThreadStatus::VmWait`] and
    /// waits on the GC-done condition, which atomically releases and
    /// reacquires the heap lock. On return no cycle is running and the
    /// caller still holds the lock.
    pub fn wait_for_concurrent_gc_to_complete(&self, guard: &mut HeapGuard<'_>) {
        while guard.state.running {
            let prior = self.threads.change_status(ThreadStatus::VmWait);
            self.gc_done.wait(&mut guard.state);
            self.threads.change_status(prior);
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocates `size` zero-filled bytes, returning an aligned object
    /// reference or `None` with an out-of-memory exception raised on the
    /// calling thread.
    ///
    /// On success the object is recorded in the finalizable table when
    /// `flags` contains [`AllocFlags::FINALIZABLE`] (a recording failure
    /// aborts the process), and added to the calling thread's
    /// tracked-allocation set unless `flags` contains
    /// [`AllocFlags::DONT_TRACK`]. The tracking insertion happens after the
    /// heap lock is released because the tracking table itself allocates.
    pub fn alloc(&self, size: usize, flags: AllocFlags) -> Option<ObjectRef> {
        let state = self.lock_heap();
        let (mut state, allocated) = self.try_alloc(state, size);
        match allocated {
            Some(object) => {
                debug_assert!(object.is_aligned());
                if flags.contains(AllocFlags::FINALIZABLE) {
                    if let Err(overflow) = state.state.finalizable.add(object) {
                        fatal(&format!(
                            "unable to record finalizable object {object:?}: {overflow}"
                        ));
                    }
                }
                if self.config.alloc_prof_enabled {
                    state.state.profile.allocations += 1;
                    state.state.profile.allocated_bytes += size;
                }
            }
            None => {
                if self.config.alloc_prof_enabled {
                    state.state.profile.failed_allocations += 1;
                    state.state.profile.failed_bytes += size;
                }
            }
        }
        drop(state);

        match allocated {
            Some(object) => {
                if !flags.contains(AllocFlags::DONT_TRACK) {
                    self.threads.add_tracked(object);
                }
                self.maybe_trigger_concurrent();
                Some(object)
            }
            None => {
                self.throw_out_of_memory(size);
                None
            }
        }
    }

    /// The allocation recovery ladder. Returns the guard together with the
    /// allocation result; a `None` result commits the caller to reporting
    /// out of memory.
    fn try_alloc<'heap>(
        &'heap self,
        state: HeapGuard<'heap>,
        size: usize,
    ) -> (HeapGuard<'heap>, Option<ObjectRef>) {
        // A request at or above the growth limit can never be satisfied
        // from the current footprint; go straight to the soft-reference
        // pass instead of churning the allocator.
        if size >= self.config.growth_limit {
            return self.alloc_clearing_soft_references(state, size);
        }

        if let Some(object) = self.source.alloc(size) {
            return (state, Some(object));
        }

        let mut state = state;
        if state.state.running {
            // A concurrent cycle may be sweeping; wait it out rather than
            // allocating from a span being reclaimed.
            self.wait_for_concurrent_gc_to_complete(&mut state);
            if let Some(object) = self.source.alloc(size) {
                return (state, Some(object));
            }
        }

        debug!("forcing a blocking collection for a {size}-byte allocation");
        let state = self.run_collection(state, GcReason::ForMalloc, false);
        if let Some(object) = self.source.alloc(size) {
            return (state, Some(object));
        }
        if let Some(object) = self.source.alloc_and_grow(size) {
            info!(
                "grew heap to {}K for a {size}-byte allocation",
                self.source.footprint() / 1024
            );
            return (state, Some(object));
        }

        self.alloc_clearing_soft_references(state, size)
    }

    /// Last rung of the ladder: collect with soft references cleared, then
    /// allocate with growth permitted. Softly reachable objects must all be
    /// cleared before the runtime reports out of memory.
    fn alloc_clearing_soft_references<'heap>(
        &'heap self,
        state: HeapGuard<'heap>,
        size: usize,
    ) -> (HeapGuard<'heap>, Option<ObjectRef>) {
        let mut state = state;
        if state.state.running {
            self.wait_for_concurrent_gc_to_complete(&mut state);
        }
        info!("forcing collection of soft references for a {size}-byte allocation");
        let state = self.run_collection(state, GcReason::ForMalloc, true);
        let object = self.source.alloc_and_grow(size);
        (state, object)
    }

    /// Raises a managed out-of-memory error on the calling thread. Called
    /// without the heap lock because throwing allocates.
    fn throw_out_of_memory(&self, size: usize) {
        error!("out of memory on a {size}-byte allocation");
        if self.threads.current_is_attached() && !self.threads.is_throwing_oome() {
            self.threads.set_throwing_oome(true);
            // No message: one fewer allocation while memory is exhausted.
            self.threads.throw_exception("OutOfMemoryError", None);
            self.threads.set_throwing_oome(false);
        } else {
            // Either we overflowed while throwing, or the thread is not on
            // the thread list yet; no allocation is possible on this path.
            self.threads.set_prebuilt_out_of_memory();
        }
    }

    // ------------------------------------------------------------------
    // Collection entry points
    // ------------------------------------------------------------------

    /// Runs an explicit collection cycle.
    ///
    /// Blocks while a concurrent cycle is in flight, then runs a cycle with
    /// the given reason and soft-reference policy.
    pub fn collect_garbage(&self, clear_soft_references: bool, reason: GcReason) {
        let mut state = self.lock_heap();
        if state.state.running {
            self.wait_for_concurrent_gc_to_complete(&mut state);
        }
        let state = self.run_collection(state, reason, clear_soft_references);
        drop(state);
    }

    /// Wakes the concurrent-collection daemon. The daemon runs a cycle with
    /// [`GcReason::Concurrent`] unless one is already active.
    pub fn request_concurrent_gc(&self) {
        let mut triggered = self.trigger.lock();
        *triggered = true;
        self.trigger_cond.notify_one();
    }

    fn maybe_trigger_concurrent(&self) {
        let threshold = self.config.concurrent_start;
        if threshold == 0 {
            return;
        }
        if self.source.bytes_allocated() >= threshold {
            self.request_concurrent_gc();
        }
    }

    fn start_daemon(&self) {
        let mut daemon = self.daemon.lock();
        if daemon.is_some() {
            return;
        }
        let Some(heap) = self.this.upgrade() else {
            error!("unable to obtain a heap handle for the collection daemon");
            return;
        };
        let builder = thread::Builder::new().name("heap-gc-daemon".to_string());
        match builder.spawn(move || heap.daemon_main()) {
            Ok(handle) => *daemon = Some(handle),
            Err(spawn_error) => warn!("unable to start the collection daemon: {spawn_error}"),
        }
    }

    fn daemon_main(&self) {
        debug!("collection daemon started");
        loop {
            {
                let mut triggered = self.trigger.lock();
                while !*triggered && !self.daemon_shutdown.load(Ordering::Acquire) {
                    self.trigger_cond.wait(&mut triggered);
                }
                if self.daemon_shutdown.load(Ordering::Acquire) {
                    break;
                }
                *triggered = false;
            }

            let state = self.lock_heap();
            if state.state.running {
                // A blocking cycle beat us to it; nothing left to reclaim.
                drop(state);
                continue;
            }
            let state = self.run_collection(state, GcReason::Concurrent, false);
            drop(state);
        }
        debug!("collection daemon shutting down");
    }

    fn stop_daemon(&self) {
        let handle = self.daemon.lock().take();
        let Some(handle) = handle else {
            return;
        };
        self.daemon_shutdown.store(true, Ordering::Release);
        {
            let mut triggered = self.trigger.lock();
            *triggered = true;
            self.trigger_cond.notify_one();
        }
        if handle.join().is_err() {
            warn!("collection daemon terminated abnormally");
        }
    }

    // ------------------------------------------------------------------
    // Worker hand-off
    // ------------------------------------------------------------------

    /// Dequeues the next object for the finalizer worker.
    ///
    /// Reference enqueues drain strictly before finalizations. The returned
    /// object is added to the calling thread's tracked-allocation set
    /// before the worker-list lock is released, so it cannot be collected
    /// before the worker gets to it.
    pub fn next_worker_object(&self) -> Option<(ObjectRef, WorkerOp)> {
        let mut pending = self.worker_list.lock();
        let (object, op) = if let Some(object) = pending.reference_operations.pop_front() {
            (object, WorkerOp::Enqueue)
        } else if let Some(object) = pending.pending_finalizations.pop_front() {
            (object, WorkerOp::Finalize)
        } else {
            return None;
        };
        self.threads.add_tracked(object);
        drop(pending);
        Some((object, op))
    }

    /// Records that the worker is starting `op` on `object`.
    pub fn worker_op_begin(&self, object: ObjectRef, op: WorkerOp) {
        let mut busy = self.worker.lock();
        busy.current_object = Some(object);
        busy.current_op = Some(op);
        busy.interp_started = None;
    }

    /// Records that the worker is entering interpreted code for the current
    /// operation. The driver's watchdog measures from this point.
    pub fn worker_interp_begin(&self) {
        self.worker.lock().interp_started = Some(Instant::now());
    }

    /// Records that the worker finished its current operation and releases
    /// the tracking claim taken when the object was dequeued.
    pub fn worker_op_end(&self) {
        let finished = {
            let mut busy = self.worker.lock();
            let finished = busy.current_object;
            *busy = WorkerBusy::default();
            finished
        };
        if let Some(object) = finished {
            self.threads.remove_tracked(object);
        }
    }

    /// The object and operation the worker is currently executing, if any.
    #[must_use]
    pub fn current_worker_object(&self) -> Option<(ObjectRef, WorkerOp)> {
        let busy = self.worker.lock();
        match (busy.current_object, busy.current_op) {
            (Some(object), Some(op)) => Some((object, op)),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Returns `true` if `object` is an aligned pointer to a chunk the heap
    /// source knows. Lock-free; no false negatives for fully published
    /// pointers.
    #[must_use]
    pub fn is_valid_object(&self, object: ObjectRef) -> bool {
        !object.is_null() && object.is_aligned() && self.source.contains(object)
    }

    /// The exact size of the chunk backing `object`.
    #[must_use]
    pub fn object_size(&self, object: ObjectRef) -> usize {
        self.source.chunk_size(object)
    }

    /// Total bytes currently allocated to live chunks.
    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.source.bytes_allocated()
    }

    /// Current committed heap footprint in bytes.
    #[must_use]
    pub fn footprint(&self) -> usize {
        self.source.footprint()
    }

    /// The report of the most recent collection cycle, if any.
    #[must_use]
    pub fn last_gc_summary(&self) -> Option<GcSummary> {
        self.last_summary.lock().clone()
    }

    /// A copy of the allocation counters.
    #[must_use]
    pub fn allocation_profile(&self) -> AllocationProfile {
        self.state.lock().profile.clone()
    }

    /// Sets when heap info is published to the monitoring sink.
    pub fn set_heap_info_mode(&self, when: MonitorWhen) {
        self.state.lock().heap_info_mode = when;
    }

    /// Installs the hook the driver runs during the all-threads-quiescent
    /// window of each cycle, used to drain deferred JIT chaining-cell
    /// patches.
    pub fn set_jit_safepoint_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.safepoint_hook.lock() = Some(Arc::new(hook));
    }
}

impl Drop for GcHeap {
    fn drop(&mut self) {
        self.stop_daemon();
    }
}
