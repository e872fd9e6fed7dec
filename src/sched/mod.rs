//! Interleaving schedulers.
//!
//! The execution context funnels every piece of non-determinism through
//! one interface: which thread runs next, which visible store a load
//! observes, whether a weak CAS fails, whether a freed block is deferred,
//! and the values handed to `Cx::rand`. Three strategies implement it:
//!
//! - [`RandomScheduler`]: uniform stochastic stress, bounded by the
//!   iteration count.
//! - [`FullSearchScheduler`]: exhaustive depth-first enumeration of every
//!   interleaving and every decision value.
//! - [`ContextBoundScheduler`]: exhaustive up to a fixed number of
//!   preemptions, which covers most real bugs at polynomial cost.
//!
//! All three serialize their exploration cursor so a failing iteration can
//! be replayed bit-for-bit.

mod context_bound;
mod full_search;
mod random;
mod tree;

pub(crate) use context_bound::ContextBoundScheduler;
pub(crate) use full_search::FullSearchScheduler;
pub(crate) use random::RandomScheduler;

use crate::report::SimError;
use crate::types::{FinishResult, Iteration, RandPurpose, ThreadId, UnparkReason};
use smallvec::SmallVec;

/// A thread may run this many consecutive steps while others are runnable
/// before the fair schedulers force a switch.
const FAIR_CAP: u32 = 64;

/// The capability set the execution context consumes.
///
/// Implementations are single-threaded and driven from the engine; no
/// operation here ever blocks.
pub(crate) trait Scheduler: Send {
    /// Reset per-iteration bookkeeping and choose the initial thread.
    fn iteration_begin(&mut self, iter: Iteration) -> ThreadId;

    /// Choose the next thread to run among runnable threads, or promote a
    /// timed/spurious-parked thread when none is runnable. `yield_hint` is
    /// non-zero when the current thread yielded voluntarily.
    fn schedule(&mut self, yield_hint: u32) -> (ThreadId, UnparkReason);

    /// A non-deterministic value in `[0, limit)`.
    fn rand(&mut self, limit: usize, purpose: RandPurpose) -> usize;

    /// Block the current thread. Returns false when granting the park
    /// would deadlock the system (no runnable thread and no timer or
    /// spurious wakeup to fire).
    fn park_current(&mut self, timed: bool, allow_spurious: bool) -> bool;

    /// Promote a parked thread to runnable. `do_switch` requests that it
    /// be scheduled at the next decision point.
    fn unpark(&mut self, thread: ThreadId, do_switch: bool);

    /// Register a dynamically created thread and make it runnable.
    fn create_thread(&mut self) -> ThreadId;

    /// The current thread's body returned.
    fn thread_finished(&mut self) -> FinishResult;

    /// Advance to the next interleaving. True when the search space is
    /// exhausted.
    fn iteration_end(&mut self) -> bool;

    /// Serialize the exploration cursor.
    fn state(&self) -> serde_json::Value;

    /// Restore a cursor serialized by [`Scheduler::state`].
    fn set_state(&mut self, state: &serde_json::Value) -> Result<(), SimError>;
}

/// Park flags of a blocked thread.
#[derive(Debug, Clone, Copy)]
struct ParkFlags {
    timed: bool,
    spurious: bool,
}

impl ParkFlags {
    fn wakeable(self) -> bool {
        self.timed || self.spurious
    }
}

/// Runnable/blocked bookkeeping shared by all strategies.
#[derive(Debug)]
struct SchedulerBase {
    static_count: usize,
    capacity: usize,
    current: ThreadId,
    /// Runnable thread ids, kept sorted for stable enumeration order.
    runnable: Vec<ThreadId>,
    blocked: Vec<Option<ParkFlags>>,
    /// Threads whose body returned this iteration.
    live: usize,
    created_dynamic: usize,
    /// Thread requested via `unpark(.., do_switch: true)`.
    forced: Option<ThreadId>,
    consecutive: u32,
}

type Candidates = SmallVec<[ThreadId; 8]>;
type WakeCandidates = SmallVec<[(ThreadId, UnparkReason); 8]>;

impl SchedulerBase {
    fn new(static_count: usize, capacity: usize) -> Self {
        let mut base = Self {
            static_count,
            capacity,
            current: 0,
            runnable: Vec::with_capacity(capacity),
            blocked: vec![None; capacity],
            live: 0,
            created_dynamic: 0,
            forced: None,
            consecutive: 0,
        };
        base.reset();
        base
    }

    fn reset(&mut self) {
        self.runnable.clear();
        self.runnable.extend(0..self.static_count);
        for b in &mut self.blocked {
            *b = None;
        }
        self.live = self.static_count;
        self.created_dynamic = 0;
        self.forced = None;
        self.consecutive = 0;
        self.current = 0;
    }

    fn insert_runnable(&mut self, thread: ThreadId) {
        if let Err(pos) = self.runnable.binary_search(&thread) {
            self.runnable.insert(pos, thread);
        }
    }

    fn remove_runnable(&mut self, thread: ThreadId) {
        if let Ok(pos) = self.runnable.binary_search(&thread) {
            self.runnable.remove(pos);
        }
    }

    /// Runnable candidates for the next step, in the order the exhaustive
    /// schedulers try them: ascending thread id with the current thread
    /// moved to the back, so a context switch is always the first
    /// alternative explored. A voluntary yield or an exceeded fairness cap
    /// excludes the current thread entirely while others can run.
    fn candidates(&self, yield_hint: u32) -> Candidates {
        let mut c: Candidates = self.runnable.iter().copied().collect();
        if c.len() > 1 {
            if yield_hint > 0 || self.consecutive >= FAIR_CAP {
                c.retain(|&mut t| t != self.current);
            } else if let Some(pos) = c.iter().position(|&t| t == self.current) {
                c.remove(pos);
                c.push(self.current);
            }
        }
        c
    }

    /// Blocked threads the scheduler may resume when nothing is runnable,
    /// with the reason each would resume with. Timed waits take priority
    /// over spurious wakeups for a thread that allows both.
    fn wake_candidates(&self) -> WakeCandidates {
        let mut w = WakeCandidates::new();
        for (th, flags) in self.blocked.iter().enumerate() {
            if let Some(f) = flags {
                if f.timed {
                    w.push((th, UnparkReason::Timeout));
                } else if f.spurious {
                    w.push((th, UnparkReason::Spurious));
                }
            }
        }
        w
    }

    fn any_wakeable(&self) -> bool {
        self.blocked.iter().flatten().any(|f| f.wakeable())
    }

    fn take_wake(&mut self, thread: ThreadId) {
        self.blocked[thread] = None;
        self.insert_runnable(thread);
    }

    fn note_scheduled(&mut self, thread: ThreadId) {
        if thread == self.current {
            self.consecutive += 1;
        } else {
            self.consecutive = 0;
        }
        self.current = thread;
    }

    fn park_current(&mut self, timed: bool, spurious: bool) -> bool {
        let flags = ParkFlags { timed, spurious };
        self.remove_runnable(self.current);
        self.blocked[self.current] = Some(flags);
        if self.runnable.is_empty() && !self.any_wakeable() {
            // Deadlock: report it without unwinding the bookkeeping; the
            // iteration is over either way.
            return false;
        }
        true
    }

    fn unpark(&mut self, thread: ThreadId, do_switch: bool) {
        if self.blocked[thread].take().is_some() {
            self.insert_runnable(thread);
        }
        if do_switch {
            self.forced = Some(thread);
        }
    }

    fn create_thread(&mut self) -> ThreadId {
        let id = self.static_count + self.created_dynamic;
        debug_assert!(id < self.capacity, "dynamic thread capacity exceeded");
        self.created_dynamic += 1;
        self.live += 1;
        self.insert_runnable(id);
        id
    }

    fn thread_finished(&mut self) -> FinishResult {
        self.remove_runnable(self.current);
        self.live -= 1;
        if self.live == 0 {
            FinishResult::Last
        } else if self.runnable.is_empty() && !self.any_wakeable() {
            FinishResult::Deadlock
        } else {
            FinishResult::Normal
        }
    }

    /// A forced thread from `unpark(.., true)`, if it is still runnable.
    fn take_forced(&mut self) -> Option<ThreadId> {
        let th = self.forced.take()?;
        self.runnable.binary_search(&th).ok().map(|_| th)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_put_current_last() {
        let mut base = SchedulerBase::new(2, 4);
        let a = base.create_thread();
        assert_eq!(a, 2);
        // Current thread (0 after reset) moves to the back; the rest stay
        // in ascending id order.
        assert_eq!(base.candidates(0).as_slice(), &[1, 2, 0]);
        base.note_scheduled(1);
        assert_eq!(base.candidates(0).as_slice(), &[0, 2, 1]);
    }

    #[test]
    fn yield_excludes_current() {
        let mut base = SchedulerBase::new(3, 3);
        base.note_scheduled(1);
        let c = base.candidates(1);
        assert_eq!(c.as_slice(), &[0, 2]);
        // With nothing else runnable the current thread stays eligible.
        base.remove_runnable(0);
        base.remove_runnable(2);
        assert_eq!(base.candidates(1).as_slice(), &[1]);
    }

    #[test]
    fn park_detects_deadlock() {
        let mut base = SchedulerBase::new(2, 2);
        base.note_scheduled(0);
        assert!(base.park_current(false, false));
        base.note_scheduled(1);
        assert!(!base.park_current(false, false));
    }

    #[test]
    fn timed_park_is_not_deadlock() {
        let mut base = SchedulerBase::new(2, 2);
        base.note_scheduled(0);
        assert!(base.park_current(true, false));
        base.note_scheduled(1);
        assert!(base.park_current(false, false));
        let w = base.wake_candidates();
        assert_eq!(w.len(), 1);
        assert_eq!(w[0], (0, UnparkReason::Timeout));
    }

    #[test]
    fn finish_order() {
        let mut base = SchedulerBase::new(2, 2);
        base.note_scheduled(0);
        assert_eq!(base.thread_finished(), FinishResult::Normal);
        base.note_scheduled(1);
        assert_eq!(base.thread_finished(), FinishResult::Last);
    }

    #[test]
    fn finish_into_all_blocked_is_deadlock() {
        let mut base = SchedulerBase::new(3, 3);
        base.note_scheduled(0);
        assert!(base.park_current(false, false));
        base.note_scheduled(1);
        assert!(base.park_current(false, false));
        base.note_scheduled(2);
        assert_eq!(base.thread_finished(), FinishResult::Deadlock);
    }

    #[test]
    fn fairness_cap_excludes_current() {
        let mut base = SchedulerBase::new(2, 2);
        for _ in 0..=FAIR_CAP {
            base.note_scheduled(0);
        }
        assert_eq!(base.candidates(0).as_slice(), &[1]);
    }
}
