//! The execution context: the facade the test consumes, and the engine
//! state behind it.
//!
//! [`Engine`] owns everything with per-iteration lifetime: thread records
//! and their clocks, the atomic/var/sync-object pools, the instrumented
//! allocator, the history log, the address-hash table, and the scheduler.
//! [`Cx`] is the thin handle threaded through user code; every operation
//! it exposes follows the same shape — update the model state, append to
//! the history, then hand control to the scheduler, which may resume a
//! different fiber.
//!
//! # State access
//!
//! Engine state lives in an `UnsafeCell` with no lock around it. That is
//! sound because the fiber baton admits exactly one running fiber (or the
//! driver, while every fiber is parked); all access goes through
//! [`Engine::with`], and no borrow is ever held across a fiber switch.
//!
//! # Failure path
//!
//! A failure records the verdict and the history event, switches to the
//! main fiber (ending the iteration), and — once the driver shuts the
//! simulation down — unwinds the failing fiber with the shutdown payload.
//! User-facing operations called after a verdict (for example guard drops
//! during unwinding) degrade to best-effort no-ops.

#![allow(unsafe_code)]

use crate::addr_hash::AddrHash;
use crate::cell::atomic::AtomicCell;
use crate::cell::var::{VarAccessError, VarRecord};
use crate::clock::VectorClock;
use crate::fiber::{FiberPool, ShutdownSignal, MAIN_FIBER};
use crate::history::{Event, History, ObjectKind};
use crate::mem::{MemoryManager, Pool};
use crate::report::TestResult;
use crate::sched::Scheduler;
use crate::sync::condvar::CondvarState;
use crate::sync::event::EventState;
use crate::sync::mutex::{MutexOptions, MutexState};
use crate::sync::semaphore::SemaphoreState;
use crate::sync::waitset::Waitset;
use crate::types::{
    FinishResult, Iteration, Ordering, RandPurpose, ThreadId, Timestamp, UnparkReason,
};
use std::cell::UnsafeCell;
use std::panic::panic_any;
use std::sync::Arc;

/// Engine construction knobs, distilled from the driver parameters.
#[derive(Debug, Clone)]
pub(crate) struct EngineConfig {
    pub(crate) static_threads: usize,
    pub(crate) dynamic_threads: usize,
    pub(crate) execution_depth_limit: u64,
    pub(crate) collect_history: bool,
    /// Denominator of the deferred-free probability: a freed block is
    /// deferred when `rand(defer_denominator) == 0`.
    pub(crate) defer_denominator: usize,
}

impl EngineConfig {
    pub(crate) fn thread_capacity(&self) -> usize {
        self.static_threads + self.dynamic_threads
    }
}

/// Per-thread engine state; lifetime is one iteration.
pub(crate) struct ThreadRecord {
    pub(crate) clock: VectorClock,
    /// Store clocks observed by loads since the last acquire fence; an
    /// acquire fence joins this into the thread clock, upgrading prior
    /// relaxed loads retroactively.
    pub(crate) acquire_bank: VectorClock,
    /// Clock snapshot taken at the last release fence; relaxed stores
    /// after the fence carry it as their release clock.
    pub(crate) release_fence: Option<VectorClock>,
    /// Own timestamp at the last voluntary yield.
    pub(crate) last_yield: Timestamp,
    pub(crate) unpark_reason: UnparkReason,
    /// Entry point for a dynamically created thread.
    pub(crate) dynamic_entry: Option<Arc<dyn Fn(&Cx) + Send + Sync>>,
    pub(crate) finished: bool,
    pub(crate) finish_clock: VectorClock,
    /// Threads waiting to join this one.
    pub(crate) join_waitset: Waitset,
}

impl ThreadRecord {
    fn new(threads: usize) -> Self {
        Self {
            clock: VectorClock::new(threads),
            acquire_bank: VectorClock::new(threads),
            release_fence: None,
            last_yield: 0,
            unpark_reason: UnparkReason::Normal,
            dynamic_entry: None,
            finished: false,
            finish_clock: VectorClock::new(threads),
            join_waitset: Waitset::new(),
        }
    }

    fn reset(&mut self) {
        self.clock.reset();
        self.acquire_bank.reset();
        self.release_fence = None;
        self.last_yield = 0;
        self.unpark_reason = UnparkReason::Normal;
        self.dynamic_entry = None;
        self.finished = false;
        self.finish_clock.reset();
        self.join_waitset = Waitset::new();
    }
}

/// Everything the engine owns. Fields are crate-visible so the sync
/// primitive modules can implement their operations against it.
pub(crate) struct EngineState {
    pub(crate) cfg: EngineConfig,
    pub(crate) sched: Box<dyn Scheduler>,
    pub(crate) threads: Vec<ThreadRecord>,
    pub(crate) current: ThreadId,
    /// The global seq-cst order clock.
    pub(crate) seq_cst_order: VectorClock,
    pub(crate) atomics: Pool<AtomicCell>,
    pub(crate) vars: Pool<VarRecord>,
    pub(crate) mutexes: Pool<MutexState>,
    pub(crate) condvars: Pool<CondvarState>,
    pub(crate) semaphores: Pool<SemaphoreState>,
    pub(crate) events: Pool<EventState>,
    pub(crate) memory: MemoryManager,
    pub(crate) history: History,
    pub(crate) addr_hash: AddrHash,
    pub(crate) result: TestResult,
    pub(crate) result_message: String,
    pub(crate) sched_count: u64,
    pub(crate) special_executing: bool,
    pub(crate) invariant_executing: bool,
    pub(crate) first_thread: bool,
    pub(crate) created_dynamic: usize,
    pub(crate) invariant_hook: Option<Arc<dyn Fn(&Cx) + Send + Sync>>,
}

/// Promote a parked thread to runnable and transfer the waker's clock.
///
/// Free function over the disjoint pieces so callers can hold borrows of
/// other state (typically the waitset being drained).
pub(crate) fn wake_thread(
    sched: &mut Box<dyn Scheduler>,
    threads: &mut [ThreadRecord],
    history: &mut History,
    waker: ThreadId,
    thread: ThreadId,
) {
    sched.unpark(thread, false);
    threads[thread].unpark_reason = UnparkReason::Normal;
    let waker_clock = threads[waker].clock.clone();
    threads[thread].clock.join(&waker_clock);
    debug_assert!(threads[thread].clock.dominates(&waker_clock));
    history.push(waker, Event::Unpark { thread });
}

/// The simulation engine: shared state plus the fiber baton.
pub struct Engine {
    state: UnsafeCell<EngineState>,
    fibers: FiberPool,
}

// SAFETY: the fiber baton guarantees at most one thread executes engine
// or test code at any instant; `state` is only touched through
// `Engine::with` by the running fiber (or the driver while all fibers are
// parked), so there is no concurrent access despite the missing lock.
unsafe impl Send for Engine {}
unsafe impl Sync for Engine {}

impl Engine {
    pub(crate) fn new(cfg: EngineConfig, sched: Box<dyn Scheduler>) -> Self {
        let capacity = cfg.thread_capacity();
        let collect = cfg.collect_history;
        let threads = (0..capacity).map(|_| ThreadRecord::new(capacity)).collect();
        Self {
            state: UnsafeCell::new(EngineState {
                cfg,
                sched,
                threads,
                current: 0,
                seq_cst_order: VectorClock::new(capacity),
                atomics: Pool::new(),
                vars: Pool::new(),
                mutexes: Pool::new(),
                condvars: Pool::new(),
                semaphores: Pool::new(),
                events: Pool::new(),
                memory: MemoryManager::new(),
                history: History::new(collect),
                addr_hash: AddrHash::new(),
                result: TestResult::Success,
                result_message: String::new(),
                sched_count: 0,
                special_executing: false,
                invariant_executing: false,
                first_thread: true,
                created_dynamic: 0,
                invariant_hook: None,
            }),
            fibers: FiberPool::new(),
        }
    }

    pub(crate) fn fibers(&self) -> &FiberPool {
        &self.fibers
    }

    /// Scoped access to the engine state. Never call anything that can
    /// switch fibers from inside the closure.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        // SAFETY: see the `Sync` impl; the baton serializes all access and
        // no borrow escapes the closure.
        unsafe { f(&mut *self.state.get()) }
    }

    /// True once the iteration has a verdict or the simulation is being
    /// torn down; user-facing operations degrade to no-ops.
    pub(crate) fn bypassed(&self) -> bool {
        self.fibers.is_shutdown() || self.with(|st| st.result.is_failure())
    }

    // ------------------------------------------------------------------
    // Failure and scheduling plumbing
    // ------------------------------------------------------------------

    /// Record a failure, end the iteration, and (after teardown resumes
    /// this fiber) unwind it.
    pub(crate) fn fail(&self, result: TestResult, message: &str) -> ! {
        self.with(|st| {
            let mapped = if result == TestResult::UserAssertFailed && st.invariant_executing {
                TestResult::UserInvariantFailed
            } else {
                result
            };
            if st.result == TestResult::Success {
                st.result = mapped;
                st.result_message = message.to_string();
            }
            let cur = st.current;
            st.history.push(
                cur,
                Event::Failure {
                    result: mapped,
                    message: message.to_string(),
                },
            );
        });
        self.switch_to_main();
        debug_assert!(self.fibers.is_shutdown());
        panic_any(ShutdownSignal)
    }

    pub(crate) fn switch_to_main(&self) {
        let me = self.with(|st| st.current);
        self.fibers.switch(me, MAIN_FIBER);
    }

    /// One scheduling point: livelock accounting, the invariant hook, and
    /// a possible fiber switch.
    pub(crate) fn op_point(&self, cx: &Cx) {
        self.op_point_hint(cx, 0);
    }

    pub(crate) fn op_point_hint(&self, cx: &Cx, yield_hint: u32) {
        if self.fibers.is_shutdown() {
            panic_any(ShutdownSignal);
        }
        let over = self.with(|st| {
            st.sched_count += 1;
            st.sched_count > st.cfg.execution_depth_limit
        });
        if over {
            self.fail(
                TestResult::Livelock,
                "scheduling step bound exceeded without progress",
            );
        }
        if self.with(|st| st.special_executing) {
            return;
        }
        self.run_invariant(cx);
        self.schedule_and_switch(yield_hint);
    }

    /// Run the user invariant hook at a scheduling point.
    fn run_invariant(&self, cx: &Cx) {
        let gate = self.with(|st| {
            if st.special_executing {
                None
            } else {
                st.special_executing = true;
                st.invariant_executing = true;
                Some(st.invariant_hook.clone())
            }
        });
        if let Some(hook) = gate {
            if let Some(h) = hook {
                h(cx);
            }
            self.with(|st| {
                st.special_executing = false;
                st.invariant_executing = false;
            });
        }
    }

    fn schedule_and_switch(&self, yield_hint: u32) {
        let (me, next) = self.with(|st| {
            let me = st.current;
            if yield_hint > 0 {
                let own = st.threads[me].clock.get(me);
                st.threads[me].last_yield = own;
            }
            let (next, reason) = st.sched.schedule(yield_hint);
            st.threads[next].unpark_reason = reason;
            st.current = next;
            (me, next)
        });
        if next != me {
            self.fibers.switch(me, next);
            if self.fibers.is_shutdown() {
                panic_any(ShutdownSignal);
            }
        }
    }

    /// Block the current thread and return the reason it resumed. The
    /// caller is responsible for waitset membership (push before, remove
    /// on a non-normal resume).
    pub(crate) fn park(&self, cx: &Cx, timed: bool, allow_spurious: bool) -> UnparkReason {
        if self.with(|st| st.special_executing) {
            self.fail(
                TestResult::UserAssertFailed,
                "blocking operation inside before/after/invariant",
            );
        }
        let ok = self.with(|st| {
            let cur = st.current;
            st.history.push(
                cur,
                Event::Park {
                    timed,
                    allow_spurious,
                },
            );
            st.sched.park_current(timed, allow_spurious)
        });
        if !ok {
            self.fail(TestResult::Deadlock, "deadlock detected");
        }
        self.run_invariant(cx);
        self.schedule_and_switch(1);
        self.with(|st| st.threads[st.current].unpark_reason)
    }

    // ------------------------------------------------------------------
    // Iteration lifecycle (driven by the driver and worker fibers)
    // ------------------------------------------------------------------

    /// Reset all per-iteration state and pick the initial thread.
    pub(crate) fn begin_iteration(&self, iter: Iteration) -> ThreadId {
        self.with(|st| {
            for th in &mut st.threads {
                th.reset();
            }
            st.seq_cst_order.reset();
            st.atomics.reset();
            st.vars.reset();
            st.mutexes.reset();
            st.condvars.reset();
            st.semaphores.reset();
            st.events.reset();
            st.memory.reset();
            st.addr_hash.reset();
            st.history.clear();
            st.result = TestResult::Success;
            st.result_message.clear();
            st.sched_count = 0;
            st.special_executing = false;
            st.invariant_executing = false;
            st.first_thread = true;
            st.created_dynamic = 0;
            st.invariant_hook = None;
            let initial = st.sched.iteration_begin(iter);
            st.current = initial;
            st.history.push(initial, Event::Marker("[iteration begin]"));
            initial
        })
    }

    /// Hand control to the initial fiber and block until the iteration
    /// produced a verdict.
    pub(crate) fn run_from_main(&self, initial: ThreadId) {
        self.fibers.switch(MAIN_FIBER, initial);
    }

    pub(crate) fn iteration_verdict(&self) -> (TestResult, String) {
        self.with(|st| (st.result, st.result_message.clone()))
    }

    pub(crate) fn take_first_thread(&self) -> bool {
        self.with(|st| {
            let first = st.first_thread;
            st.first_thread = false;
            first
        })
    }

    pub(crate) fn enter_special(&self) {
        self.with(|st| st.special_executing = true);
    }

    pub(crate) fn exit_special(&self) {
        self.with(|st| st.special_executing = false);
    }

    pub(crate) fn set_invariant_hook(&self, hook: Arc<dyn Fn(&Cx) + Send + Sync>) {
        self.with(|st| st.invariant_hook = Some(hook));
    }

    pub(crate) fn clear_invariant_hook(&self) {
        self.with(|st| st.invariant_hook = None);
    }

    /// Run the invariant once, outside a scheduling point (iteration
    /// boundaries).
    pub(crate) fn run_invariant_once(&self, cx: &Cx) {
        self.run_invariant(cx);
    }

    /// Flatten every thread's clock (and the seq-cst order) to the global
    /// maximum: the system-wide fence at before/after boundaries.
    pub(crate) fn global_fence_all(&self) {
        self.with(|st| {
            let max = st
                .threads
                .iter()
                .map(|t| t.clock.max_entry())
                .max()
                .unwrap_or(0)
                .max(st.seq_cst_order.max_entry());
            for th in &mut st.threads {
                th.clock.fill(max);
            }
            st.seq_cst_order.fill(max);
        });
    }

    pub(crate) fn push_marker(&self, marker: &'static str) {
        self.with(|st| {
            let cur = st.current;
            st.history.push(cur, Event::Marker(marker));
        });
    }

    pub(crate) fn thread_started(&self, me: ThreadId) {
        self.with(|st| st.history.push(me, Event::ThreadStarted));
    }

    /// Bookkeeping when a thread body returns: finish clock snapshot and
    /// joiner wakeups.
    pub(crate) fn thread_body_finished(&self, me: ThreadId) {
        self.with(|st| {
            st.history.push(me, Event::ThreadFinished);
            let EngineState {
                threads,
                sched,
                history,
                ..
            } = st;
            threads[me].finished = true;
            threads[me].finish_clock = threads[me].clock.clone();
            let mut joiners = std::mem::take(&mut threads[me].join_waitset);
            while let Some(w) = joiners.pop() {
                wake_thread(sched, threads, history, me, w);
            }
        });
    }

    pub(crate) fn scheduler_thread_finished(&self) -> FinishResult {
        self.with(|st| st.sched.thread_finished())
    }

    /// Leak checks at the end of a successful iteration; any hit fails
    /// the iteration.
    pub(crate) fn check_leaks(&self) {
        enum Leak {
            Memory(String),
            Resource(&'static str, usize),
        }
        let leak = self.with(|st| {
            if !st.memory.no_leaks() {
                let leaks = st.memory.leaks();
                let bytes: usize = leaks.iter().map(|&(_, s)| s).sum();
                return Some(Leak::Memory(format!(
                    "{} block(s) totalling {} byte(s) still allocated",
                    leaks.len(),
                    bytes
                )));
            }
            let pools = [
                ("atomic", st.atomics.live()),
                ("var", st.vars.live()),
                ("mutex", st.mutexes.live()),
                ("condvar", st.condvars.live()),
                ("semaphore", st.semaphores.live()),
                ("event", st.events.live()),
            ];
            pools
                .into_iter()
                .find(|&(_, live)| live > 0)
                .map(|(name, live)| Leak::Resource(name, live))
        });
        match leak {
            Some(Leak::Memory(msg)) => self.fail(TestResult::MemoryLeak, &msg),
            Some(Leak::Resource(name, live)) => self.fail(
                TestResult::ResourceLeak,
                &format!("{live} {name} object(s) not destroyed"),
            ),
            None => {}
        }
    }

    /// Successful iteration epilogue: record the marker and hand control
    /// back to the driver. Returns when the fiber is scheduled again in a
    /// later iteration.
    pub(crate) fn iteration_complete(&self) {
        self.push_marker("[iteration end]");
        self.switch_to_main();
        if self.fibers.is_shutdown() {
            panic_any(ShutdownSignal);
        }
    }

    pub(crate) fn dynamic_entry(&self, me: ThreadId) -> Option<Arc<dyn Fn(&Cx) + Send + Sync>> {
        self.with(|st| st.threads[me].dynamic_entry.clone())
    }

    /// Drop closure references that would otherwise keep `Arc` cycles
    /// alive past teardown.
    pub(crate) fn clear_iteration_refs(&self) {
        self.with(|st| {
            st.invariant_hook = None;
            for th in &mut st.threads {
                th.dynamic_entry = None;
            }
        });
    }

    pub(crate) fn state_blob(&self) -> serde_json::Value {
        self.with(|st| st.sched.state())
    }

    pub(crate) fn search_exhausted(&self) -> bool {
        self.with(|st| st.sched.iteration_end())
    }

    pub(crate) fn history_text(&self) -> String {
        let mut buf = Vec::new();
        self.with(|st| st.history.print(&mut buf)).ok();
        String::from_utf8_lossy(&buf).into_owned()
    }

    // ------------------------------------------------------------------
    // Atomic operations
    // ------------------------------------------------------------------

    pub(crate) fn atomic_create(&self) -> usize {
        self.with(|st| {
            let threads = st.threads.len();
            st.atomics.alloc(AtomicCell::new(threads))
        })
    }

    pub(crate) fn atomic_release(&self, slot: usize) {
        self.with(|st| st.atomics.release(slot));
    }

    pub(crate) fn atomic_load(&self, cx: &Cx, slot: usize, ordering: Ordering) -> u64 {
        if self.bypassed() {
            return self.with(|st| {
                st.atomics
                    .get(slot)
                    .and_then(AtomicCell::newest)
                    .map_or(0, |e| e.value)
            });
        }
        if self.with(|st| st.invariant_executing) {
            // The invariant reads the current value without clock effects
            // or scheduling.
            let newest = self.with(|st| {
                st.atomics
                    .get(slot)
                    .and_then(AtomicCell::newest)
                    .map(|e| e.value)
            });
            return match newest {
                Some(v) => v,
                None => self.fail(
                    TestResult::UninitializedAccess,
                    "load of uninitialized atomic",
                ),
            };
        }
        let out = self.with(|st| {
            let EngineState {
                threads,
                atomics,
                sched,
                seq_cst_order,
                history,
                current,
                ..
            } = st;
            let cur = *current;
            let Some(cell) = atomics.get_mut(slot) else {
                return None;
            };
            if !cell.is_initialized() {
                return None;
            }
            let th = &mut threads[cur];
            let candidates =
                cell.visible_indices(cur, &th.clock, ordering.is_seq_cst(), seq_cst_order);
            let choice = if candidates.len() > 1 {
                sched.rand(candidates.len(), RandPurpose::LoadVisibility)
            } else {
                0
            };
            let index = candidates[choice];
            th.clock.advance(cur);
            if ordering.is_seq_cst() {
                th.clock.join(seq_cst_order);
            }
            let age = cell.age(index);
            let (value, seq) = {
                let e = cell.entry(index);
                th.acquire_bank.join(&e.store_clock);
                if ordering.is_acquire() {
                    if let Some(rc) = &e.release_clock {
                        th.clock.join(rc);
                    }
                }
                (e.value, e.seq)
            };
            cell.note_read(cur, seq);
            history.push(
                cur,
                Event::AtomicLoad {
                    cell: slot,
                    age,
                    value,
                    ordering,
                },
            );
            Some(value)
        });
        match out {
            Some(value) => {
                self.op_point(cx);
                value
            }
            None => self.fail(
                TestResult::UninitializedAccess,
                "load of uninitialized atomic",
            ),
        }
    }

    pub(crate) fn atomic_store(&self, cx: &Cx, slot: usize, value: u64, ordering: Ordering) {
        if self.bypassed() {
            return;
        }
        let ok = self.with(|st| {
            if st.invariant_executing {
                return false;
            }
            let EngineState {
                threads,
                atomics,
                seq_cst_order,
                history,
                current,
                ..
            } = st;
            let cur = *current;
            let Some(cell) = atomics.get_mut(slot) else {
                return true;
            };
            let th = &mut threads[cur];
            th.clock.advance(cur);
            let release_clock = if ordering.is_release() {
                Some(th.clock.clone())
            } else {
                th.release_fence.clone()
            };
            if ordering.is_seq_cst() {
                seq_cst_order.join(&th.clock);
            }
            cell.push_store(
                cur,
                value,
                th.clock.clone(),
                release_clock,
                ordering.is_seq_cst(),
            );
            history.push(
                cur,
                Event::AtomicStore {
                    cell: slot,
                    value,
                    ordering,
                },
            );
            true
        });
        if !ok {
            self.fail(
                TestResult::UserAssertFailed,
                "atomic store inside invariant",
            );
        }
        self.op_point(cx);
    }

    /// Unconditional read-modify-write: observes the newest entry in the
    /// modification order, stores `apply(prev)`, and returns `prev`.
    pub(crate) fn atomic_rmw(
        &self,
        cx: &Cx,
        slot: usize,
        ordering: Ordering,
        apply: &mut dyn FnMut(u64) -> u64,
    ) -> u64 {
        if self.bypassed() {
            return self.with(|st| {
                st.atomics
                    .get(slot)
                    .and_then(AtomicCell::newest)
                    .map_or(0, |e| e.value)
            });
        }
        enum Out {
            Done(u64),
            Uninit,
            InInvariant,
        }
        let out = self.with(|st| {
            if st.invariant_executing {
                return Out::InInvariant;
            }
            let EngineState {
                threads,
                atomics,
                seq_cst_order,
                history,
                current,
                ..
            } = st;
            let cur = *current;
            let Some(cell) = atomics.get_mut(slot) else {
                return Out::Uninit;
            };
            if !cell.is_initialized() {
                return Out::Uninit;
            }
            let aba = cell.skipped_stores(cur);
            let th = &mut threads[cur];
            let (prev, prev_release) = {
                let e = cell.newest().map(|e| (e.value, e.release_clock.clone()));
                match e {
                    Some(v) => v,
                    None => return Out::Uninit,
                }
            };
            th.clock.advance(cur);
            if ordering.is_seq_cst() {
                th.clock.join(seq_cst_order);
            }
            if let Some(e) = cell.newest() {
                th.acquire_bank.join(&e.store_clock);
                if ordering.is_acquire() {
                    if let Some(rc) = &e.release_clock {
                        th.clock.join(rc);
                    }
                }
            }
            let value = apply(prev);
            // Release-sequence continuation: the new entry carries the
            // prior release clock even when this op does not release.
            let mut release_clock = if ordering.is_release() {
                Some(th.clock.clone())
            } else {
                th.release_fence.clone()
            };
            if let Some(pr) = prev_release {
                match &mut release_clock {
                    Some(c) => c.join(&pr),
                    None => release_clock = Some(pr),
                }
            }
            if ordering.is_seq_cst() {
                seq_cst_order.join(&th.clock);
            }
            cell.push_store(
                cur,
                value,
                th.clock.clone(),
                release_clock,
                ordering.is_seq_cst(),
            );
            history.push(
                cur,
                Event::AtomicRmw {
                    cell: slot,
                    prev,
                    value,
                    ordering,
                    aba,
                },
            );
            Out::Done(prev)
        });
        match out {
            Out::Done(prev) => {
                self.op_point(cx);
                prev
            }
            Out::Uninit => self.fail(
                TestResult::UninitializedAccess,
                "read-modify-write of uninitialized atomic",
            ),
            Out::InInvariant => self.fail(
                TestResult::UserAssertFailed,
                "read-modify-write inside invariant",
            ),
        }
    }

    /// Compare-exchange. `Ok(prev)` when the store happened, `Err(current)`
    /// otherwise. Weak CAS lets the scheduler fail it spuriously.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn atomic_cas(
        &self,
        cx: &Cx,
        slot: usize,
        expected: u64,
        new: u64,
        success: Ordering,
        failure: Ordering,
        weak: bool,
    ) -> Result<u64, u64> {
        if self.bypassed() {
            let v = self.with(|st| {
                st.atomics
                    .get(slot)
                    .and_then(AtomicCell::newest)
                    .map_or(0, |e| e.value)
            });
            return Err(v);
        }
        enum Out {
            Stored(u64),
            Failed(u64),
            Uninit,
            InInvariant,
        }
        let out = self.with(|st| {
            if st.invariant_executing {
                return Out::InInvariant;
            }
            let EngineState {
                threads,
                atomics,
                sched,
                seq_cst_order,
                history,
                current,
                ..
            } = st;
            let cur = *current;
            let Some(cell) = atomics.get_mut(slot) else {
                return Out::Uninit;
            };
            if !cell.is_initialized() {
                return Out::Uninit;
            }
            let aba = cell.skipped_stores(cur);
            let (prev, prev_release, prev_seq) = {
                let Some(e) = cell.newest() else {
                    return Out::Uninit;
                };
                (e.value, e.release_clock.clone(), e.seq)
            };
            let matches = prev == expected;
            let spurious = matches && weak && sched.rand(2, RandPurpose::CasFail) == 1;
            let th = &mut threads[cur];
            if matches && !spurious {
                th.clock.advance(cur);
                if success.is_seq_cst() {
                    th.clock.join(seq_cst_order);
                }
                if let Some(e) = cell.newest() {
                    th.acquire_bank.join(&e.store_clock);
                    if success.is_acquire() {
                        if let Some(rc) = &e.release_clock {
                            th.clock.join(rc);
                        }
                    }
                }
                let mut release_clock = if success.is_release() {
                    Some(th.clock.clone())
                } else {
                    th.release_fence.clone()
                };
                if let Some(pr) = prev_release {
                    match &mut release_clock {
                        Some(c) => c.join(&pr),
                        None => release_clock = Some(pr),
                    }
                }
                if success.is_seq_cst() {
                    seq_cst_order.join(&th.clock);
                }
                cell.push_store(
                    cur,
                    new,
                    th.clock.clone(),
                    release_clock,
                    success.is_seq_cst(),
                );
                history.push(
                    cur,
                    Event::AtomicRmw {
                        cell: slot,
                        prev,
                        value: new,
                        ordering: success,
                        aba,
                    },
                );
                Out::Stored(prev)
            } else {
                // The failure side is a load with the failure ordering.
                th.clock.advance(cur);
                if failure.is_seq_cst() {
                    th.clock.join(seq_cst_order);
                }
                if let Some(e) = cell.newest() {
                    th.acquire_bank.join(&e.store_clock);
                    if failure.is_acquire() {
                        if let Some(rc) = &e.release_clock {
                            th.clock.join(rc);
                        }
                    }
                }
                cell.note_read(cur, prev_seq);
                history.push(
                    cur,
                    Event::CasFail {
                        cell: slot,
                        current: prev,
                        expected,
                        spurious,
                    },
                );
                Out::Failed(prev)
            }
        });
        match out {
            Out::Stored(prev) => {
                self.op_point(cx);
                Ok(prev)
            }
            Out::Failed(prev) => {
                self.op_point(cx);
                Err(prev)
            }
            Out::Uninit => self.fail(
                TestResult::UninitializedAccess,
                "compare-exchange of uninitialized atomic",
            ),
            Out::InInvariant => self.fail(
                TestResult::UserAssertFailed,
                "compare-exchange inside invariant",
            ),
        }
    }

    pub(crate) fn atomic_wait(&self, cx: &Cx, slot: usize, timed: bool) -> UnparkReason {
        if self.bypassed() {
            return UnparkReason::Normal;
        }
        self.with(|st| {
            let cur = st.current;
            if let Some(cell) = st.atomics.get_mut(slot) {
                cell.waitset.push(cur);
            }
        });
        let reason = self.park(cx, timed, true);
        if reason != UnparkReason::Normal {
            self.with(|st| {
                let cur = st.current;
                if let Some(cell) = st.atomics.get_mut(slot) {
                    cell.waitset.remove(cur);
                }
            });
        }
        reason
    }

    pub(crate) fn atomic_wake(&self, cx: &Cx, slot: usize, count: usize) -> usize {
        if self.bypassed() {
            return 0;
        }
        let woken = self.with(|st| {
            let EngineState {
                threads,
                atomics,
                sched,
                history,
                current,
                ..
            } = st;
            let cur = *current;
            let Some(cell) = atomics.get_mut(slot) else {
                return 0;
            };
            let mut woken = 0;
            while woken < count {
                let Some(w) = cell.waitset.pop() else {
                    break;
                };
                wake_thread(sched, threads, history, cur, w);
                woken += 1;
            }
            woken
        });
        self.op_point(cx);
        woken
    }

    /// Thread fence with the given ordering.
    pub(crate) fn fence(&self, cx: &Cx, ordering: Ordering) {
        if self.bypassed() {
            return;
        }
        let ok = self.with(|st| {
            if st.invariant_executing {
                return false;
            }
            let EngineState {
                threads,
                seq_cst_order,
                history,
                current,
                ..
            } = st;
            let cur = *current;
            let th = &mut threads[cur];
            match ordering {
                Ordering::Relaxed => {}
                Ordering::Acquire => {
                    let bank = th.acquire_bank.clone();
                    th.clock.join(&bank);
                }
                Ordering::Release => {
                    th.release_fence = Some(th.clock.clone());
                }
                Ordering::AcqRel => {
                    let bank = th.acquire_bank.clone();
                    th.clock.join(&bank);
                    th.release_fence = Some(th.clock.clone());
                }
                Ordering::SeqCst => {
                    let bank = th.acquire_bank.clone();
                    th.clock.join(&bank);
                    th.clock.join(seq_cst_order);
                    seq_cst_order.join(&th.clock);
                    th.release_fence = Some(th.clock.clone());
                }
            }
            history.push(cur, Event::Fence { ordering });
            true
        });
        if !ok {
            self.fail(TestResult::UserAssertFailed, "fence inside invariant");
        }
        self.op_point(cx);
    }

    // ------------------------------------------------------------------
    // Plain variables
    // ------------------------------------------------------------------

    pub(crate) fn var_create(&self) -> usize {
        self.with(|st| {
            let threads = st.threads.len();
            st.vars.alloc(VarRecord::new(threads))
        })
    }

    pub(crate) fn var_release(&self, slot: usize) {
        self.with(|st| st.vars.release(slot));
    }

    pub(crate) fn var_init(&self, _cx: &Cx, slot: usize) {
        if self.bypassed() {
            return;
        }
        self.with(|st| {
            let EngineState {
                threads,
                vars,
                history,
                current,
                ..
            } = st;
            let cur = *current;
            if let Some(rec) = vars.get_mut(slot) {
                rec.init(cur, &mut threads[cur].clock);
                history.push(cur, Event::VarStore { var: slot });
            }
        });
    }

    /// Race-check a plain load. Plain accesses are not scheduling points.
    pub(crate) fn var_load(&self, _cx: &Cx, slot: usize) {
        if self.bypassed() {
            return;
        }
        let res = self.with(|st| {
            let EngineState {
                threads,
                vars,
                history,
                current,
                invariant_executing,
                ..
            } = st;
            let cur = *current;
            let Some(rec) = vars.get_mut(slot) else {
                return Err(VarAccessError::Uninitialized);
            };
            if *invariant_executing {
                // Read-only invariant access skips race tracking.
                return if rec.is_initialized() {
                    Ok(())
                } else {
                    Err(VarAccessError::Uninitialized)
                };
            }
            let out = rec.load(cur, &mut threads[cur].clock);
            if out.is_ok() {
                history.push(cur, Event::VarLoad { var: slot });
            }
            out
        });
        match res {
            Ok(()) => {}
            Err(VarAccessError::Race) => self.fail(
                TestResult::DataRace,
                "data race on plain variable (load)",
            ),
            Err(VarAccessError::Uninitialized) => self.fail(
                TestResult::UninitializedAccess,
                "load of uninitialized variable",
            ),
        }
    }

    pub(crate) fn var_store(&self, _cx: &Cx, slot: usize) {
        if self.bypassed() {
            return;
        }
        enum Out {
            Ok,
            Race,
            InInvariant,
        }
        let res = self.with(|st| {
            let EngineState {
                threads,
                vars,
                history,
                current,
                invariant_executing,
                ..
            } = st;
            if *invariant_executing {
                return Out::InInvariant;
            }
            let cur = *current;
            let Some(rec) = vars.get_mut(slot) else {
                return Out::Ok;
            };
            match rec.store(cur, &mut threads[cur].clock) {
                Ok(()) => {
                    history.push(cur, Event::VarStore { var: slot });
                    Out::Ok
                }
                Err(_) => Out::Race,
            }
        });
        match res {
            Out::Ok => {}
            Out::Race => self.fail(
                TestResult::DataRace,
                "data race on plain variable (store)",
            ),
            Out::InInvariant => self.fail(
                TestResult::UserAssertFailed,
                "store to plain variable inside invariant",
            ),
        }
    }

    // ------------------------------------------------------------------
    // Sync object pools (state machines live in `sync::*`)
    // ------------------------------------------------------------------

    pub(crate) fn mutex_create(&self, options: MutexOptions) -> usize {
        self.with(|st| {
            let threads = st.threads.len();
            st.mutexes.alloc(MutexState::new(threads, options))
        })
    }

    pub(crate) fn mutex_release(&self, slot: usize) {
        self.with(|st| st.mutexes.release(slot));
    }

    pub(crate) fn condvar_create(&self, allow_spurious: bool) -> usize {
        self.with(|st| st.condvars.alloc(CondvarState::new(allow_spurious)))
    }

    pub(crate) fn condvar_release(&self, slot: usize) {
        self.with(|st| st.condvars.release(slot));
    }

    pub(crate) fn semaphore_create(&self, initial: u32, max: u32) -> usize {
        self.with(|st| {
            let threads = st.threads.len();
            st.semaphores
                .alloc(SemaphoreState::new(threads, initial, max))
        })
    }

    pub(crate) fn semaphore_release(&self, slot: usize) {
        self.with(|st| st.semaphores.release(slot));
    }

    pub(crate) fn event_create(&self, manual_reset: bool, initially_set: bool) -> usize {
        self.with(|st| {
            let threads = st.threads.len();
            st.events
                .alloc(EventState::new(threads, manual_reset, initially_set))
        })
    }

    pub(crate) fn event_release(&self, slot: usize) {
        self.with(|st| st.events.release(slot));
    }

    // ------------------------------------------------------------------
    // Memory, hashing, user services
    // ------------------------------------------------------------------

    pub(crate) fn malloc(&self, cx: &Cx, size: usize) -> *mut u8 {
        let ptr = self.with(|st| {
            let cur = st.current;
            let ptr = st.memory.alloc(size);
            st.history.push(
                cur,
                Event::Alloc {
                    addr: ptr as usize,
                    size,
                },
            );
            ptr
        });
        if !self.bypassed() {
            self.op_point(cx);
        }
        ptr
    }

    pub(crate) fn mfree(&self, cx: &Cx, addr: usize) {
        if self.bypassed() {
            self.with(|st| st.memory.free(addr, false));
            return;
        }
        let ok = self.with(|st| {
            let EngineState {
                memory,
                sched,
                history,
                current,
                cfg,
                ..
            } = st;
            let cur = *current;
            let defer = sched.rand(cfg.defer_denominator, RandPurpose::MemDefer) == 0;
            let ok = memory.free(addr, defer);
            history.push(
                cur,
                Event::Free {
                    addr,
                    deferred: defer && ok,
                },
            );
            ok
        });
        if !ok {
            self.fail(
                TestResult::DoubleFree,
                "free of a pointer that is not a live allocation",
            );
        }
        self.op_point(cx);
    }

    pub(crate) fn hash_addr(&self, addr: usize) -> usize {
        self.with(|st| st.addr_hash.hash(addr))
    }

    pub(crate) fn user_rand(&self, limit: usize) -> usize {
        assert!(limit > 0, "rand limit must be non-zero");
        if self.bypassed() {
            return 0;
        }
        self.with(|st| st.sched.rand(limit, RandPurpose::User))
    }

    pub(crate) fn yield_now(&self, cx: &Cx) {
        if self.bypassed() {
            return;
        }
        self.with(|st| {
            let cur = st.current;
            st.history.push(cur, Event::Yield);
        });
        self.op_point_hint(cx, 1);
    }

    pub(crate) fn user_message(&self, message: String) {
        self.with(|st| {
            let cur = st.current;
            st.history.push(cur, Event::UserMessage { message });
        });
    }

    // ------------------------------------------------------------------
    // Dynamic threads
    // ------------------------------------------------------------------

    pub(crate) fn spawn_thread(
        &self,
        cx: &Cx,
        entry: Arc<dyn Fn(&Cx) + Send + Sync>,
    ) -> ThreadId {
        if self.bypassed() {
            return 0;
        }
        let spawned = self.with(|st| {
            if st.created_dynamic >= st.cfg.dynamic_threads {
                return None;
            }
            st.created_dynamic += 1;
            let id = st.sched.create_thread();
            let cur = st.current;
            st.threads[id].dynamic_entry = Some(entry);
            st.threads[id].finished = false;
            let parent_clock = st.threads[cur].clock.clone();
            st.threads[id].clock.join(&parent_clock);
            st.history.push(cur, Event::ThreadCreated { thread: id });
            Some(id)
        });
        match spawned {
            Some(id) => {
                self.op_point(cx);
                id
            }
            None => self.fail(
                TestResult::UserAssertFailed,
                "dynamic thread capacity exceeded",
            ),
        }
    }

    pub(crate) fn join_thread(&self, cx: &Cx, thread: ThreadId) {
        if self.bypassed() {
            return;
        }
        let finished = self.with(|st| {
            let cur = st.current;
            st.history.push(
                cur,
                Event::SyncOp {
                    kind: ObjectKind::Thread,
                    slot: thread,
                    op: "join",
                },
            );
            if st.threads[thread].finished {
                let fc = st.threads[thread].finish_clock.clone();
                st.threads[cur].clock.join(&fc);
                true
            } else {
                st.threads[thread].join_waitset.push(cur);
                false
            }
        });
        if finished {
            self.op_point(cx);
            return;
        }
        let reason = self.park(cx, false, false);
        debug_assert_eq!(reason, UnparkReason::Normal);
    }
}

/// The handle threaded through user test code.
///
/// All simulated operations go through a `Cx`; it is deliberately cheap
/// (`Arc` clone) and tied to whichever logical thread is currently
/// executing.
pub struct Cx {
    engine: Arc<Engine>,
}

impl Cx {
    pub(crate) fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    pub(crate) fn engine(&self) -> &Engine {
        &self.engine
    }

    pub(crate) fn engine_arc(&self) -> Arc<Engine> {
        Arc::clone(&self.engine)
    }

    /// Index of the logical thread executing this code.
    #[must_use]
    pub fn thread_index(&self) -> ThreadId {
        self.engine.with(|st| st.current)
    }

    /// Deterministic non-determinism: a value in `[0, limit)` chosen by
    /// the scheduler (and enumerated exhaustively under full search).
    #[must_use]
    pub fn rand(&self, limit: usize) -> usize {
        self.engine.user_rand(limit)
    }

    /// A voluntary scheduling point. Spin-wait loops must call this so
    /// the fair schedulers can deschedule the spinner.
    pub fn yield_now(&self) {
        self.engine.yield_now(self);
    }

    /// Thread fence.
    pub fn fence(&self, ordering: Ordering) {
        self.engine.fence(self, ordering);
    }

    /// Assert a condition. Failure ends the iteration with
    /// `UserAssertFailed` (or `UserInvariantFailed` inside the invariant
    /// hook).
    pub fn ensure(&self, condition: bool, message: &str) {
        if !condition && !self.engine.bypassed() {
            self.engine.fail(TestResult::UserAssertFailed, message);
        }
    }

    /// Stop the whole exploration once `condition` holds, reporting
    /// `UntilConditionHit`. Used to steer searches toward a state of
    /// interest.
    pub fn until(&self, condition: bool, message: &str) {
        if condition && !self.engine.bypassed() {
            self.engine.user_message(message.to_string());
            self.engine.fail(TestResult::UntilConditionHit, message);
        }
    }

    /// Append a free-form message to the history.
    pub fn trace(&self, message: impl Into<String>) {
        self.engine.user_message(message.into());
    }

    /// Allocate a tracked block. Leaked blocks fail the iteration.
    #[must_use]
    pub fn malloc(&self, size: usize) -> *mut u8 {
        self.engine.malloc(self, size)
    }

    /// Free a tracked block. Freeing anything else is a double-free
    /// failure; the block may be held until iteration end to expose
    /// use-after-free.
    pub fn free(&self, ptr: *mut u8) {
        self.engine.mfree(self, ptr as usize);
    }

    /// Address-stable hash of a pointer, reduced to `buckets`. The
    /// surrogate assignment resets every iteration, keeping hash-based
    /// tests deterministic under ASLR.
    #[must_use]
    pub fn hash_ptr<T>(&self, ptr: *const T, buckets: usize) -> usize {
        assert!(buckets > 0, "bucket count must be non-zero");
        self.engine.hash_addr(ptr as usize) % buckets
    }

    /// Create a dynamic thread. The test must declare capacity via
    /// `TestSuite::DYNAMIC_THREADS`.
    pub fn spawn(&self, f: impl Fn(&Cx) + Send + Sync + 'static) -> JoinHandle {
        let thread = self.engine.spawn_thread(self, Arc::new(f));
        JoinHandle {
            engine: self.engine_arc(),
            thread,
        }
    }
}

/// Waitable handle for a dynamically created thread.
#[derive(Clone)]
pub struct JoinHandle {
    engine: Arc<Engine>,
    thread: ThreadId,
}

impl JoinHandle {
    /// The joined thread's index.
    #[must_use]
    pub fn thread_index(&self) -> ThreadId {
        self.thread
    }

    /// Block until the thread's body returns. Establishes happens-before
    /// from everything the thread did.
    pub fn join(&self, cx: &Cx) {
        self.engine.join_thread(cx, self.thread);
    }
}

impl std::fmt::Debug for JoinHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinHandle")
            .field("thread", &self.thread)
            .finish()
    }
}
