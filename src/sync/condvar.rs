//! Condition variables with optional spurious wakeups.
//!
//! `wait` releases the associated mutex, parks in the condvar's FIFO, and
//! re-acquires the mutex before returning — for every resume reason, so
//! the caller always holds the lock again. Spurious wakeups and timeouts
//! are scheduler decisions; callers loop on their predicate as with any
//! real condvar.

use crate::context::{wake_thread, Cx, Engine, EngineState};
use crate::history::{Event, ObjectKind};
use crate::report::TestResult;
use crate::sync::mutex::{lock_exclusive, MutexGuard};
use crate::sync::waitset::Waitset;
use crate::types::UnparkReason;
use std::sync::Arc;

/// Engine-side state of one condition variable.
#[derive(Debug)]
pub(crate) struct CondvarState {
    pub(crate) waitset: Waitset,
    pub(crate) allow_spurious: bool,
}

impl CondvarState {
    pub(crate) fn new(allow_spurious: bool) -> Self {
        Self {
            waitset: Waitset::new(),
            allow_spurious,
        }
    }
}

/// Release the mutex for a wait, remembering the recursion depth.
fn release_mutex_for_wait(engine: &Engine, mutex_slot: usize) -> Option<u32> {
    let released = engine.with(|st| {
        let EngineState {
            threads,
            mutexes,
            sched,
            history,
            current,
            ..
        } = st;
        let cur = *current;
        let Some(m) = mutexes.get_mut(mutex_slot) else {
            return Some(0);
        };
        if m.owner != Some(cur) {
            return None;
        }
        let depth = m.recursion;
        m.owner = None;
        m.recursion = 0;
        let clock = threads[cur].clock.clone();
        m.sync_clock.join(&clock);
        history.push(
            cur,
            Event::SyncOp {
                kind: ObjectKind::Mutex,
                slot: mutex_slot,
                op: "unlock for wait",
            },
        );
        if let Some(w) = m.waitset.pop() {
            wake_thread(sched, threads, history, cur, w);
        }
        Some(depth)
    });
    if released.is_none() {
        engine.fail(
            TestResult::UserAssertFailed,
            "condvar wait without owning the mutex",
        );
    }
    released
}

/// Full wait protocol: unlock, park, re-lock, restore recursion.
pub(crate) fn wait(
    engine: &Engine,
    cx: &Cx,
    cv_slot: usize,
    mutex_slot: usize,
    timed: bool,
) -> UnparkReason {
    if engine.bypassed() {
        return UnparkReason::Normal;
    }
    let depth = release_mutex_for_wait(engine, mutex_slot).unwrap_or(1);
    let allow_spurious = engine.with(|st| {
        let cur = st.current;
        st.history.push(
            cur,
            Event::SyncOp {
                kind: ObjectKind::Condvar,
                slot: cv_slot,
                op: "wait",
            },
        );
        let Some(cv) = st.condvars.get_mut(cv_slot) else {
            return false;
        };
        cv.waitset.push(cur);
        cv.allow_spurious
    });
    let reason = engine.park(cx, timed, allow_spurious);
    if reason != UnparkReason::Normal {
        engine.with(|st| {
            let cur = st.current;
            if let Some(cv) = st.condvars.get_mut(cv_slot) {
                cv.waitset.remove(cur);
            }
        });
    }
    lock_exclusive(engine, cx, mutex_slot, false);
    if depth > 1 {
        engine.with(|st| {
            if let Some(m) = st.mutexes.get_mut(mutex_slot) {
                m.recursion = depth;
            }
        });
    }
    reason
}

/// Wake the oldest waiter, if any.
pub(crate) fn notify_one(engine: &Engine, cx: &Cx, cv_slot: usize) {
    if engine.bypassed() {
        return;
    }
    engine.with(|st| {
        let EngineState {
            threads,
            condvars,
            sched,
            history,
            current,
            ..
        } = st;
        let cur = *current;
        history.push(
            cur,
            Event::SyncOp {
                kind: ObjectKind::Condvar,
                slot: cv_slot,
                op: "signal",
            },
        );
        if let Some(cv) = condvars.get_mut(cv_slot) {
            if let Some(w) = cv.waitset.pop() {
                wake_thread(sched, threads, history, cur, w);
            }
        }
    });
    engine.op_point(cx);
}

/// Wake every waiter.
pub(crate) fn notify_all(engine: &Engine, cx: &Cx, cv_slot: usize) {
    if engine.bypassed() {
        return;
    }
    engine.with(|st| {
        let EngineState {
            threads,
            condvars,
            sched,
            history,
            current,
            ..
        } = st;
        let cur = *current;
        history.push(
            cur,
            Event::SyncOp {
                kind: ObjectKind::Condvar,
                slot: cv_slot,
                op: "broadcast",
            },
        );
        if let Some(cv) = condvars.get_mut(cv_slot) {
            let mut ws = std::mem::take(&mut cv.waitset);
            while let Some(w) = ws.pop() {
                wake_thread(sched, threads, history, cur, w);
            }
        }
    });
    engine.op_point(cx);
}

/// A simulated condition variable.
pub struct Condvar {
    engine: Arc<Engine>,
    slot: usize,
}

impl Condvar {
    /// A condvar with spurious wakeups enabled, like the real thing.
    #[must_use]
    pub fn new(cx: &Cx) -> Self {
        Self::with_spurious(cx, true)
    }

    /// A condvar that never wakes spuriously; for tests that want the
    /// tighter contract.
    #[must_use]
    pub fn without_spurious_wakeups(cx: &Cx) -> Self {
        Self::with_spurious(cx, false)
    }

    fn with_spurious(cx: &Cx, allow_spurious: bool) -> Self {
        let engine = cx.engine_arc();
        let slot = engine.condvar_create(allow_spurious);
        Self { engine, slot }
    }

    /// Atomically release the guard's mutex and wait; the mutex is held
    /// again when this returns. Callers loop on their predicate.
    pub fn wait<'a>(&self, cx: &Cx, guard: MutexGuard<'a>) -> MutexGuard<'a> {
        let mutex = guard.mutex;
        std::mem::forget(guard);
        wait(&self.engine, cx, self.slot, mutex.slot(), false);
        MutexGuard { mutex }
    }

    /// As [`Condvar::wait`], but the scheduler may time the wait out.
    /// Returns the guard and whether the wait timed out.
    pub fn wait_timed<'a>(&self, cx: &Cx, guard: MutexGuard<'a>) -> (MutexGuard<'a>, bool) {
        let mutex = guard.mutex;
        std::mem::forget(guard);
        let reason = wait(&self.engine, cx, self.slot, mutex.slot(), true);
        (
            MutexGuard { mutex },
            reason == UnparkReason::Timeout,
        )
    }

    /// Wake one waiter.
    pub fn notify_one(&self, cx: &Cx) {
        notify_one(&self.engine, cx, self.slot);
    }

    /// Wake all waiters.
    pub fn notify_all(&self, cx: &Cx) {
        notify_all(&self.engine, cx, self.slot);
    }
}

impl Drop for Condvar {
    fn drop(&mut self) {
        self.engine.condvar_release(self.slot);
    }
}

impl std::fmt::Debug for Condvar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Condvar").field("slot", &self.slot).finish()
    }
}
