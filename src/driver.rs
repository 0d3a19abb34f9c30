//! The collection driver: one mark-sweep cycle from suspension to report.

use crate::engine::{GcMode, ReferenceContext};
use crate::error::fatal;
use crate::heap::{GcHeap, HeapGuard, HeapState};
use crate::monitor::{HeapSnapshot, MonitorWhen};
use crate::threads::SuspendReason;
use std::fmt;
use std::time::{Duration, Instant};
use thread_priority::{
    ThreadPriority, ThreadPriorityValue, get_current_thread_priority, set_current_thread_priority,
};
use tracing::{debug, info, warn};

/// How long the worker may stay inside interpreted code before the driver
/// declares it wedged. A wedged worker would deadlock the cycle, which
/// acquires the worker lock before marking.
const WORKER_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay before free pages are returned to the operating system, long
/// enough to absorb an immediate re-allocation burst.
const TRIM_DELAY: Duration = Duration::from_secs(5);

/// Target priority for a collecting thread found running below normal.
const NORMAL_THREAD_PRIORITY: u8 = 50;

/// Why a collection cycle was started.
///
/// The reason drives the collection mode, the concurrency choice, and the
/// report format.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GcReason {
    /// An allocation failed; collect the small-object area synchronously.
    ForMalloc,
    /// Background collection with mutators running during trace and sweep.
    Concurrent,
    /// An explicit request from the program or the runtime.
    Explicit,
}

impl GcReason {
    /// Returns `true` if mutators run during the trace and sweep phases.
    #[must_use]
    pub fn is_concurrent(self) -> bool {
        matches!(self, GcReason::Concurrent)
    }

    /// The collection mode this reason selects.
    #[must_use]
    pub fn mode(self) -> GcMode {
        if matches!(self, GcReason::ForMalloc) {
            GcMode::Partial
        } else {
            GcMode::Full
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            GcReason::ForMalloc => "GC_FOR_MALLOC",
            GcReason::Concurrent => "GC_CONCURRENT",
            GcReason::Explicit => "GC_EXPLICIT",
        }
    }
}

impl fmt::Display for GcReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stop-the-world time of one cycle.
#[derive(Clone, Copy, Debug)]
pub enum GcPauses {
    /// One interval covering mark and sweep.
    Blocking(Duration),
    /// Two brief intervals: the root suspension and the dirty-card
    /// suspension.
    Concurrent { root: Duration, dirty: Duration },
}

impl fmt::Display for GcPauses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcPauses::Blocking(pause) => write!(f, "{}ms", pause.as_millis()),
            GcPauses::Concurrent { root, dirty } => {
                write!(f, "{}ms+{}ms", root.as_millis(), dirty.as_millis())
            }
        }
    }
}

/// Report of one completed collection cycle.
///
/// `Display` renders the stable one-line log format:
/// `<REASON> freed <K>K, <P>% free <A>K/<F>K, paused <T>ms` (with
/// `paused <R>ms+<D>ms` for a concurrent cycle, and `<1K` when a non-zero
/// amount under 1024 bytes was freed).
#[derive(Clone, Debug)]
pub struct GcSummary {
    pub reason: GcReason,
    pub objects_freed: usize,
    pub bytes_freed: usize,
    pub bytes_allocated: usize,
    pub footprint: usize,
    pub pauses: GcPauses,
    /// Duration of the concurrent trace, when the cycle had one.
    pub concurrent_trace: Option<Duration>,
    pub total: Duration,
}

impl GcSummary {
    /// Percentage of the footprint not occupied by live objects.
    #[must_use]
    pub fn percent_free(&self) -> usize {
        let footprint = self.footprint.max(1);
        100_usize.saturating_sub(100 * self.bytes_allocated / footprint)
    }
}

impl fmt::Display for GcSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} freed ", self.reason)?;
        if self.bytes_freed > 0 && self.bytes_freed < 1024 {
            f.write_str("<1K")?;
        } else {
            write!(f, "{}K", self.bytes_freed / 1024)?;
        }
        write!(
            f,
            ", {}% free {}K/{}K, paused {}",
            self.percent_free(),
            self.bytes_allocated / 1024,
            self.footprint / 1024,
            self.pauses
        )
    }
}

/// Scoped priority elevation for a blocking collection.
///
/// A collecting thread running below normal priority holds every suspended
/// mutator hostage to its own scheduling, so it is raised to normal for the
/// duration of the cycle and restored afterwards. Failures are logged and
/// ignored.
struct PriorityBoost {
    prior: Option<ThreadPriority>,
}

impl PriorityBoost {
    fn engage() -> Self {
        let prior = match get_current_thread_priority() {
            Ok(priority) if is_below_normal(priority) => {
                match ThreadPriorityValue::try_from(NORMAL_THREAD_PRIORITY) {
                    Ok(normal) => {
                        match set_current_thread_priority(ThreadPriority::Crossplatform(normal)) {
                            Ok(()) => {
                                debug!("raised collector thread priority from {priority:?}");
                                Some(priority)
                            }
                            Err(error) => {
                                warn!("unable to raise collector thread priority: {error}");
                                None
                            }
                        }
                    }
                    Err(error) => {
                        warn!("unable to express normal thread priority: {error}");
                        None
                    }
                }
            }
            Ok(_) => None,
            Err(error) => {
                warn!("unable to read collector thread priority: {error}");
                None
            }
        };
        Self { prior }
    }
}

impl Drop for PriorityBoost {
    fn drop(&mut self) {
        if let Some(priority) = self.prior.take() {
            if let Err(error) = set_current_thread_priority(priority) {
                warn!("unable to restore collector thread priority: {error}");
            }
        }
    }
}

fn is_below_normal(priority: ThreadPriority) -> bool {
    match priority {
        ThreadPriority::Min => true,
        ThreadPriority::Crossplatform(value) => u8::from(value) < NORMAL_THREAD_PRIORITY,
        _ => false,
    }
}

impl GcHeap {
    /// Runs one collection cycle.
    ///
    /// Entered with the heap lock held through `state`; returns with it
    /// held. A concurrent cycle releases and reacquires the lock around the
    /// trace and sweep phases. Re-entry while a cycle is active is detected
    /// through the running flag and ignored with a warning.
    pub(crate) fn run_collection<'heap>(
        &'heap self,
        mut state: HeapGuard<'heap>,
        reason: GcReason,
        clear_soft_references: bool,
    ) -> HeapGuard<'heap> {
        if state.state.running {
            warn!("attempted recursive garbage collection; ignoring");
            return state;
        }
        state.state.running = true;

        let total_started = Instant::now();
        let concurrent = reason.is_concurrent();
        let mode = reason.mode();
        debug!("starting {reason} collection ({mode:?}, clear soft references: {clear_soft_references})");

        // Keep the worker from starting new finalizations or enqueues for
        // the duration of the cycle.
        let worker = self.worker.lock();

        let suspended_at = Instant::now();
        self.threads.suspend_all(SuspendReason::ForGc);

        let priority_boost = if concurrent {
            None
        } else {
            Some(PriorityBoost::engage())
        };

        // A worker stuck inside a finalizer would never release its claim
        // on the object it holds; the heap cannot be collected safely.
        if let (Some(object), Some(started)) = (worker.current_object, worker.interp_started) {
            if started.elapsed() > WORKER_WATCHDOG_TIMEOUT {
                fatal(&format!(
                    "worker thread wedged for {:?} processing {object:?}",
                    started.elapsed()
                ));
            }
        }

        // Freeze the hand-off queues while the collector inspects them.
        let mut pending = self.worker_list.lock();

        if self.config.pre_verify && !self.engine.verify() {
            fatal("heap verification failed before collection");
        }

        if let Err(error) = self.engine.begin(mode) {
            fatal(&format!("mark step setup failed: {error}"));
        }

        state.state.discovered.clear();
        self.engine.mark_roots();

        let (mut state, root_pause, concurrent_trace, dirty_suspended_at) = if concurrent {
            // Let mutators run while the collector traces; their reference
            // writes dirty cards through the write barrier.
            self.cards.clear();
            drop(state);
            self.threads.resume_all(SuspendReason::ForGc);
            let root_pause = suspended_at.elapsed();

            let trace_started = Instant::now();
            self.engine.scan_marked_objects();
            let trace_time = trace_started.elapsed();

            // Stop the world again for everything written during the trace.
            let reacquired = self.lock_heap();
            let dirty_suspended_at = Instant::now();
            self.threads.suspend_all(SuspendReason::ForGc);
            // Root writes carry no write barrier.
            self.engine.re_mark_roots();
            if self.config.verify_card_table && !self.cards.verify() {
                fatal("card table verification failed");
            }
            self.engine.re_scan_dirty_cards();
            (
                reacquired,
                Some(root_pause),
                Some(trace_time),
                Some(dirty_suspended_at),
            )
        } else {
            self.engine.scan_marked_objects();
            (state, None, None, None)
        };

        // References are processed only after all tracing has completed.
        {
            let HeapState {
                discovered,
                finalizable,
                ..
            } = &mut *state.state;
            self.engine.process_references(ReferenceContext {
                clear_soft_references,
                discovered,
                finalizable,
                pending: &mut *pending,
            });
        }

        // Every thread is quiescent: drain deferred JIT chaining-cell
        // patches in one batch.
        let hook = self.safepoint_hook.lock().clone();
        if let Some(hook) = hook {
            (*hook)();
        }

        self.engine.sweep_system_weaks();

        // The old mark bitmap becomes the new live bitmap, so sweeping can
        // proceed while mutators allocate.
        self.source.swap_bitmaps();

        if self.config.post_verify && !self.engine.verify() {
            fatal("heap verification failed after collection");
        }

        let (mut state, outcome, dirty_pause) = if concurrent {
            drop(state);
            self.threads.resume_all(SuspendReason::ForGc);
            let dirty_pause = dirty_suspended_at.map(|suspended| suspended.elapsed());
            let outcome = self.engine.sweep(mode, true);
            self.engine.finish();
            (self.lock_heap(), outcome, dirty_pause)
        } else {
            let outcome = self.engine.sweep(mode, false);
            self.engine.finish();
            (state, outcome, None)
        };

        self.source.grow_for_utilization();
        self.source.schedule_trim(TRIM_DELAY);

        drop(pending);
        drop(worker);
        state.state.running = false;

        if concurrent {
            self.gc_done.notify_all();
        } else {
            self.threads.resume_all(SuspendReason::ForGc);
        }

        let pauses = match (root_pause, dirty_pause) {
            (Some(root), Some(dirty)) => GcPauses::Concurrent { root, dirty },
            _ => GcPauses::Blocking(suspended_at.elapsed()),
        };
        drop(priority_boost);

        let bytes_allocated = self.source.bytes_allocated();
        let footprint = self.source.footprint();
        let summary = GcSummary {
            reason,
            objects_freed: outcome.objects_freed,
            bytes_freed: outcome.bytes_freed,
            bytes_allocated,
            footprint,
            pauses,
            concurrent_trace,
            total: total_started.elapsed(),
        };
        info!("{summary}");
        if let Some(trace) = concurrent_trace {
            debug!("concurrent trace took {}ms", trace.as_millis());
        }
        *self.last_summary.lock() = Some(summary);

        if state.state.heap_info_mode == MonitorWhen::EveryGc {
            if let Some(monitor) = &self.monitor {
                monitor.heap_info(&HeapSnapshot {
                    bytes_allocated,
                    footprint,
                    maximum_size: self.config.maximum_size,
                });
            }
        }

        state
    }
}
