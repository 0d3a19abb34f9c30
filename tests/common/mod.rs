//! Simulated collaborators for exercising the heap coordinator end to end:
//! a chunk-map heap source, a scripted mark-sweep engine, a counting thread
//! registry, a flagging card table, and a recording monitor sink.

#![allow(dead_code)]

use lungo_heap::{
    AllocFlags, CardTable, Configuration, GcHeap, GcMode, HeapMonitor, HeapSnapshot, HeapSource,
    MarkSweep, ObjectRef, ReferenceContext, SuspendReason, SweepOutcome, ThreadRegistry,
    ThreadStatus,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

fn round_up(size: usize) -> usize {
    ((size + 7) & !7).max(8)
}

struct SourceInner {
    chunks: HashMap<usize, usize>,
    next_address: usize,
    allocated: usize,
    footprint: usize,
    maximum_size: usize,
}

/// A chunk-map heap source: chunks are identifiers into a map, the
/// footprint is a high-water mark bounded by the maximum heap size, and
/// addresses are never reused.
pub struct SimSource {
    inner: Mutex<SourceInner>,
    pub alloc_calls: AtomicUsize,
    pub grow_calls: AtomicUsize,
    pub swap_calls: AtomicUsize,
    pub utilization_calls: AtomicUsize,
    pub trim_requests: Mutex<Vec<Duration>>,
    pub post_fork_calls: AtomicUsize,
    pub thread_shutdown_calls: AtomicUsize,
    pub shutdown_calls: AtomicUsize,
}

impl SimSource {
    pub fn new(starting_size: usize, maximum_size: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SourceInner {
                chunks: HashMap::new(),
                next_address: 0x10000,
                allocated: 0,
                footprint: starting_size,
                maximum_size,
            }),
            alloc_calls: AtomicUsize::new(0),
            grow_calls: AtomicUsize::new(0),
            swap_calls: AtomicUsize::new(0),
            utilization_calls: AtomicUsize::new(0),
            trim_requests: Mutex::new(Vec::new()),
            post_fork_calls: AtomicUsize::new(0),
            thread_shutdown_calls: AtomicUsize::new(0),
            shutdown_calls: AtomicUsize::new(0),
        })
    }

    fn take_chunk(inner: &mut SourceInner, size: usize) -> ObjectRef {
        let address = inner.next_address;
        inner.next_address += size;
        inner.chunks.insert(address, size);
        inner.allocated += size;
        ObjectRef::from_address(address)
    }

    /// Frees a chunk, returning its size. Used by the simulated engine's
    /// sweep.
    pub fn free(&self, object: ObjectRef) -> usize {
        let mut inner = self.inner.lock();
        let size = inner.chunks.remove(&object.address()).unwrap_or(0);
        inner.allocated -= size;
        size
    }

    /// Every live chunk, in no particular order.
    pub fn live_objects(&self) -> Vec<ObjectRef> {
        self.inner
            .lock()
            .chunks
            .keys()
            .map(|&address| ObjectRef::from_address(address))
            .collect()
    }
}

impl HeapSource for SimSource {
    fn alloc(&self, size: usize) -> Option<ObjectRef> {
        self.alloc_calls.fetch_add(1, Ordering::SeqCst);
        let size = round_up(size);
        let mut inner = self.inner.lock();
        if inner.allocated + size > inner.footprint {
            return None;
        }
        Some(Self::take_chunk(&mut inner, size))
    }

    fn alloc_and_grow(&self, size: usize) -> Option<ObjectRef> {
        self.grow_calls.fetch_add(1, Ordering::SeqCst);
        let size = round_up(size);
        let mut inner = self.inner.lock();
        if inner.allocated + size > inner.maximum_size {
            return None;
        }
        if inner.allocated + size > inner.footprint {
            inner.footprint = inner.allocated + size;
        }
        Some(Self::take_chunk(&mut inner, size))
    }

    fn contains(&self, object: ObjectRef) -> bool {
        self.inner.lock().chunks.contains_key(&object.address())
    }

    fn chunk_size(&self, object: ObjectRef) -> usize {
        self.inner
            .lock()
            .chunks
            .get(&object.address())
            .copied()
            .unwrap_or(0)
    }

    fn swap_bitmaps(&self) {
        self.swap_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn bytes_allocated(&self) -> usize {
        self.inner.lock().allocated
    }

    fn footprint(&self) -> usize {
        self.inner.lock().footprint
    }

    fn grow_for_utilization(&self) {
        self.utilization_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn schedule_trim(&self, delay: Duration) {
        self.trim_requests.lock().push(delay);
    }

    fn post_fork(&self) {
        self.post_fork_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn thread_shutdown(&self) {
        self.thread_shutdown_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn shutdown(&self) {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.inner.lock();
        inner.chunks.clear();
        inner.allocated = 0;
    }
}

/// A scripted mark-sweep engine over the simulated source: roots and an
/// adjacency map describe the object graph, and soft/weak/phantom referents
/// are plain sets the tests populate.
pub struct SimEngine {
    source: Arc<SimSource>,
    registry: Mutex<Option<Arc<SimRegistry>>>,
    pub roots: Mutex<HashSet<ObjectRef>>,
    pub references: Mutex<HashMap<ObjectRef, Vec<ObjectRef>>>,
    pub soft_referents: Mutex<HashSet<ObjectRef>>,
    pub weak_referents: Mutex<HashSet<ObjectRef>>,
    pub phantom_referents: Mutex<HashSet<ObjectRef>>,
    marked: Mutex<HashSet<ObjectRef>>,
    /// Artificial delay inside the trace, used to widen the concurrent
    /// window for handshake tests.
    pub scan_delay: Mutex<Option<Duration>>,
    pub cleared_soft: Mutex<Vec<ObjectRef>>,
    pub begin_modes: Mutex<Vec<GcMode>>,
    pub clear_soft_history: Mutex<Vec<bool>>,
    pub re_mark_calls: AtomicUsize,
    pub dirty_scan_calls: AtomicUsize,
    pub system_weak_sweeps: AtomicUsize,
    pub finish_calls: AtomicUsize,
}

impl SimEngine {
    pub fn new(source: Arc<SimSource>) -> Arc<Self> {
        Arc::new(Self {
            source,
            registry: Mutex::new(None),
            roots: Mutex::new(HashSet::new()),
            references: Mutex::new(HashMap::new()),
            soft_referents: Mutex::new(HashSet::new()),
            weak_referents: Mutex::new(HashSet::new()),
            phantom_referents: Mutex::new(HashSet::new()),
            marked: Mutex::new(HashSet::new()),
            scan_delay: Mutex::new(None),
            cleared_soft: Mutex::new(Vec::new()),
            begin_modes: Mutex::new(Vec::new()),
            clear_soft_history: Mutex::new(Vec::new()),
            re_mark_calls: AtomicUsize::new(0),
            dirty_scan_calls: AtomicUsize::new(0),
            system_weak_sweeps: AtomicUsize::new(0),
            finish_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_registry(&self, registry: Arc<SimRegistry>) {
        *self.registry.lock() = Some(registry);
    }

    pub fn add_root(&self, object: ObjectRef) {
        self.roots.lock().insert(object);
    }

    pub fn remove_root(&self, object: ObjectRef) {
        self.roots.lock().remove(&object);
    }

    pub fn add_reference(&self, from: ObjectRef, to: ObjectRef) {
        self.references.lock().entry(from).or_default().push(to);
    }

    fn trace_closure(&self) {
        let references = self.references.lock();
        let mut marked = self.marked.lock();
        let mut queue: VecDeque<ObjectRef> = marked.iter().copied().collect();
        while let Some(object) = queue.pop_front() {
            if let Some(children) = references.get(&object) {
                for &child in children {
                    if marked.insert(child) {
                        queue.push_back(child);
                    }
                }
            }
        }
    }

    fn root_set(&self) -> HashSet<ObjectRef> {
        let mut roots = self.roots.lock().clone();
        if let Some(registry) = self.registry.lock().as_ref() {
            roots.extend(registry.tracked.lock().iter().copied());
        }
        roots
    }
}

impl MarkSweep for SimEngine {
    fn begin(&self, mode: GcMode) -> lungo_heap::Result<()> {
        self.begin_modes.lock().push(mode);
        Ok(())
    }

    fn mark_roots(&self) {
        *self.marked.lock() = self.root_set();
    }

    fn scan_marked_objects(&self) {
        let delay = *self.scan_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        self.trace_closure();
    }

    fn re_mark_roots(&self) {
        self.re_mark_calls.fetch_add(1, Ordering::SeqCst);
        let roots = self.root_set();
        self.marked.lock().extend(roots);
    }

    fn re_scan_dirty_cards(&self) {
        self.dirty_scan_calls.fetch_add(1, Ordering::SeqCst);
        self.trace_closure();
    }

    fn process_references(&self, context: ReferenceContext<'_>) {
        self.clear_soft_history
            .lock()
            .push(context.clear_soft_references);

        // Soft referents survive unless this cycle clears them.
        let soft: Vec<ObjectRef> = self.soft_referents.lock().iter().copied().collect();
        for referent in soft {
            if self.marked.lock().contains(&referent) {
                continue;
            }
            if context.clear_soft_references {
                context.discovered.soft.push(referent);
                self.soft_referents.lock().remove(&referent);
                self.cleared_soft.lock().push(referent);
            } else {
                self.marked.lock().insert(referent);
            }
        }
        self.trace_closure();

        // Dead weak and phantom referents get a user-visible enqueue.
        let weak: Vec<ObjectRef> = self.weak_referents.lock().iter().copied().collect();
        for referent in weak {
            if !self.marked.lock().contains(&referent) {
                context.discovered.weak.push(referent);
                context.pending.reference_operations.push_back(referent);
            }
        }
        let phantom: Vec<ObjectRef> = self.phantom_referents.lock().iter().copied().collect();
        for referent in phantom {
            if !self.marked.lock().contains(&referent) {
                context.discovered.phantom.push(referent);
                context.pending.reference_operations.push_back(referent);
            }
        }

        // Unreachable finalizable objects are resurrected for their
        // finalizer and handed to the worker.
        let marked_snapshot = self.marked.lock().clone();
        let unreachable = context
            .finalizable
            .drain_matching(|object| !marked_snapshot.contains(&object));
        for object in unreachable {
            self.marked.lock().insert(object);
            context.pending.pending_finalizations.push_back(object);
        }
        self.trace_closure();
    }

    fn sweep_system_weaks(&self) {
        self.system_weak_sweeps.fetch_add(1, Ordering::SeqCst);
    }

    fn sweep(&self, _mode: GcMode, _concurrent: bool) -> SweepOutcome {
        let marked = self.marked.lock().clone();
        let mut outcome = SweepOutcome::default();
        for object in self.source.live_objects() {
            if !marked.contains(&object) {
                outcome.bytes_freed += self.source.free(object);
                outcome.objects_freed += 1;
            }
        }
        outcome
    }

    fn finish(&self) {
        self.finish_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// A thread registry that counts suspensions and records status changes,
/// exceptions, and tracked allocations for a single simulated thread.
#[derive(Default)]
pub struct SimRegistry {
    pub suspend_calls: AtomicUsize,
    pub resume_calls: AtomicUsize,
    status: Mutex<Option<ThreadStatus>>,
    pub status_changes: Mutex<Vec<ThreadStatus>>,
    pub detached: AtomicBool,
    pub throwing: AtomicBool,
    pub exceptions: Mutex<Vec<(String, Option<String>)>>,
    pub prebuilt_oomes: AtomicUsize,
    pub tracked: Mutex<Vec<ObjectRef>>,
}

impl ThreadRegistry for SimRegistry {
    fn suspend_all(&self, _reason: SuspendReason) {
        self.suspend_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn resume_all(&self, _reason: SuspendReason) {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn change_status(&self, status: ThreadStatus) -> ThreadStatus {
        let mut current = self.status.lock();
        let prior = current.unwrap_or(ThreadStatus::Running);
        *current = Some(status);
        self.status_changes.lock().push(status);
        prior
    }

    fn current_is_attached(&self) -> bool {
        !self.detached.load(Ordering::SeqCst)
    }

    fn is_throwing_oome(&self) -> bool {
        self.throwing.load(Ordering::SeqCst)
    }

    fn set_throwing_oome(&self, throwing: bool) {
        self.throwing.store(throwing, Ordering::SeqCst);
    }

    fn throw_exception(&self, class_name: &str, message: Option<&str>) {
        self.exceptions
            .lock()
            .push((class_name.to_string(), message.map(str::to_string)));
    }

    fn set_prebuilt_out_of_memory(&self) {
        self.prebuilt_oomes.fetch_add(1, Ordering::SeqCst);
    }

    fn add_tracked(&self, object: ObjectRef) {
        self.tracked.lock().push(object);
    }

    fn remove_tracked(&self, object: ObjectRef) {
        self.tracked.lock().retain(|&tracked| tracked != object);
    }
}

/// A card table that records its lifecycle and clear calls.
#[derive(Default)]
pub struct SimCards {
    pub started_with: Mutex<Option<usize>>,
    pub fail_startup: AtomicBool,
    pub clear_calls: AtomicUsize,
    pub verify_calls: AtomicUsize,
    pub shutdown_calls: AtomicUsize,
}

impl CardTable for SimCards {
    fn startup(&self, heap_maximum: usize) -> bool {
        if self.fail_startup.load(Ordering::SeqCst) {
            return false;
        }
        *self.started_with.lock() = Some(heap_maximum);
        true
    }

    fn clear(&self) {
        self.clear_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn verify(&self) -> bool {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn shutdown(&self) {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// A monitoring sink that records every snapshot it receives.
#[derive(Default)]
pub struct SimMonitor {
    pub snapshots: Mutex<Vec<HeapSnapshot>>,
}

impl HeapMonitor for SimMonitor {
    fn heap_info(&self, snapshot: &HeapSnapshot) {
        self.snapshots.lock().push(*snapshot);
    }
}

/// A started heap with handles to every simulated collaborator.
pub struct Harness {
    pub heap: Arc<GcHeap>,
    pub source: Arc<SimSource>,
    pub engine: Arc<SimEngine>,
    pub registry: Arc<SimRegistry>,
    pub cards: Arc<SimCards>,
    pub monitor: Arc<SimMonitor>,
}

impl Harness {
    /// Allocates an object that nothing keeps alive.
    pub fn alloc_garbage(&self, size: usize) -> ObjectRef {
        self.heap
            .alloc(size, AllocFlags::DONT_TRACK)
            .expect("allocation")
    }

    /// Allocates an object and registers it as a root.
    pub fn alloc_rooted(&self, size: usize) -> ObjectRef {
        let object = self.alloc_garbage(size);
        self.engine.add_root(object);
        object
    }
}

pub fn harness(configuration: Configuration) -> Harness {
    let source = SimSource::new(configuration.starting_size, configuration.maximum_size);
    let engine = SimEngine::new(source.clone());
    let registry = Arc::new(SimRegistry::default());
    engine.set_registry(registry.clone());
    let cards = Arc::new(SimCards::default());
    let monitor = Arc::new(SimMonitor::default());
    let heap = GcHeap::startup(
        configuration,
        source.clone(),
        engine.clone(),
        cards.clone(),
        registry.clone(),
        Some(monitor.clone()),
    )
    .expect("heap startup");
    Harness {
        heap,
        source,
        engine,
        registry,
        cards,
        monitor,
    }
}

pub fn default_harness() -> Harness {
    harness(Configuration::default())
}

/// A small heap: 64K committed, 128K growth limit and maximum.
pub fn small_configuration() -> Configuration {
    Configuration {
        starting_size: 64 * 1024,
        maximum_size: 128 * 1024,
        growth_limit: 0,
        ..Default::default()
    }
}
