//! Counting semaphore with a maximum count.
//!
//! Posting releases (the poster's clock folds into the semaphore's sync
//! clock), acquiring synchronizes with every prior post. Contended
//! acquires park FIFO and retry on wake.

use crate::context::{wake_thread, Cx, Engine, EngineState};
use crate::clock::VectorClock;
use crate::history::{Event, ObjectKind};
use crate::sync::waitset::Waitset;
use crate::types::UnparkReason;
use std::sync::Arc;

/// Engine-side state of one semaphore.
#[derive(Debug)]
pub(crate) struct SemaphoreState {
    pub(crate) count: u32,
    pub(crate) max: u32,
    pub(crate) sync_clock: VectorClock,
    pub(crate) waitset: Waitset,
}

impl SemaphoreState {
    pub(crate) fn new(threads: usize, initial: u32, max: u32) -> Self {
        Self {
            count: initial.min(max),
            max,
            sync_clock: VectorClock::new(threads),
            waitset: Waitset::new(),
        }
    }
}

/// Acquire one permit. With `try_only`, a contended attempt returns
/// false instead of blocking; with `timed`, the scheduler may time the
/// wait out (returning false).
pub(crate) fn acquire(
    engine: &Engine,
    cx: &Cx,
    slot: usize,
    try_only: bool,
    timed: bool,
) -> bool {
    if engine.bypassed() {
        return true;
    }
    loop {
        let got = engine.with(|st| {
            let EngineState {
                threads,
                semaphores,
                history,
                current,
                ..
            } = st;
            let cur = *current;
            let Some(s) = semaphores.get_mut(slot) else {
                return true;
            };
            if s.count == 0 {
                return false;
            }
            s.count -= 1;
            let sc = s.sync_clock.clone();
            threads[cur].clock.join(&sc);
            history.push(
                cur,
                Event::SyncOp {
                    kind: ObjectKind::Semaphore,
                    slot,
                    op: "acquire",
                },
            );
            true
        });
        if got {
            engine.op_point(cx);
            return true;
        }
        if try_only {
            engine.op_point(cx);
            return false;
        }
        engine.with(|st| {
            let cur = st.current;
            if let Some(s) = st.semaphores.get_mut(slot) {
                s.waitset.push(cur);
            }
        });
        match engine.park(cx, timed, false) {
            UnparkReason::Timeout => {
                engine.with(|st| {
                    let cur = st.current;
                    if let Some(s) = st.semaphores.get_mut(slot) {
                        s.waitset.remove(cur);
                    }
                });
                return false;
            }
            UnparkReason::Normal | UnparkReason::Spurious => {
                // Retry; a barging thread may have taken the permit.
            }
        }
    }
}

/// Release `n` permits. False when the maximum count would be exceeded
/// (nothing is released in that case).
pub(crate) fn post(engine: &Engine, cx: &Cx, slot: usize, n: u32) -> bool {
    if engine.bypassed() {
        return true;
    }
    let ok = engine.with(|st| {
        let EngineState {
            threads,
            semaphores,
            sched,
            history,
            current,
            ..
        } = st;
        let cur = *current;
        let Some(s) = semaphores.get_mut(slot) else {
            return true;
        };
        if s.count + n > s.max {
            return false;
        }
        s.count += n;
        let clock = threads[cur].clock.clone();
        s.sync_clock.join(&clock);
        history.push(
            cur,
            Event::SyncOp {
                kind: ObjectKind::Semaphore,
                slot,
                op: "post",
            },
        );
        for _ in 0..n {
            let Some(w) = s.waitset.pop() else {
                break;
            };
            wake_thread(sched, threads, history, cur, w);
        }
        true
    });
    engine.op_point(cx);
    ok
}

/// A simulated counting semaphore.
pub struct Semaphore {
    engine: Arc<Engine>,
    slot: usize,
}

impl Semaphore {
    /// A semaphore with `initial` permits and a hard `max`.
    #[must_use]
    pub fn new(cx: &Cx, initial: u32, max: u32) -> Self {
        let engine = cx.engine_arc();
        let slot = engine.semaphore_create(initial, max);
        Self { engine, slot }
    }

    /// Block until a permit is acquired.
    pub fn acquire(&self, cx: &Cx) {
        acquire(&self.engine, cx, self.slot, false, false);
    }

    /// Take a permit without blocking; false when none is available.
    pub fn try_acquire(&self, cx: &Cx) -> bool {
        acquire(&self.engine, cx, self.slot, true, false)
    }

    /// Timed acquire; false when the scheduler timed the wait out.
    pub fn acquire_timed(&self, cx: &Cx) -> bool {
        acquire(&self.engine, cx, self.slot, false, true)
    }

    /// Release `n` permits. False when the maximum would be exceeded.
    pub fn post(&self, cx: &Cx, n: u32) -> bool {
        post(&self.engine, cx, self.slot, n)
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        self.engine.semaphore_release(self.slot);
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("slot", &self.slot)
            .finish()
    }
}
