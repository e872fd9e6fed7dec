//! Manual- and auto-reset events.
//!
//! A manual-reset event stays signaled until reset and releases every
//! waiter; an auto-reset event hands the signal to exactly one waiter
//! and clears itself. `pulse` wakes without leaving the event signaled.

use crate::context::{wake_thread, Cx, Engine, EngineState};
use crate::clock::VectorClock;
use crate::history::{Event as HistoryEvent, ObjectKind};
use crate::sync::waitset::Waitset;
use crate::types::UnparkReason;
use std::sync::Arc;

/// Engine-side state of one event.
#[derive(Debug)]
pub(crate) struct EventState {
    pub(crate) manual_reset: bool,
    pub(crate) set: bool,
    pub(crate) sync_clock: VectorClock,
    pub(crate) waitset: Waitset,
}

impl EventState {
    pub(crate) fn new(threads: usize, manual_reset: bool, initially_set: bool) -> Self {
        Self {
            manual_reset,
            set: initially_set,
            sync_clock: VectorClock::new(threads),
            waitset: Waitset::new(),
        }
    }
}

fn signal(engine: &Engine, cx: &Cx, slot: usize, leave_set: bool) {
    if engine.bypassed() {
        return;
    }
    engine.with(|st| {
        let EngineState {
            threads,
            events,
            sched,
            history,
            current,
            ..
        } = st;
        let cur = *current;
        let Some(e) = events.get_mut(slot) else {
            return;
        };
        history.push(
            cur,
            HistoryEvent::SyncOp {
                kind: ObjectKind::Event,
                slot,
                op: if leave_set { "set" } else { "pulse" },
            },
        );
        let clock = threads[cur].clock.clone();
        e.sync_clock.join(&clock);
        if e.manual_reset {
            let mut ws = std::mem::take(&mut e.waitset);
            while let Some(w) = ws.pop() {
                wake_thread(sched, threads, history, cur, w);
            }
            e.set = leave_set;
        } else if let Some(w) = e.waitset.pop() {
            // The released waiter consumes the signal.
            wake_thread(sched, threads, history, cur, w);
            e.set = false;
        } else {
            e.set = leave_set;
        }
    });
    engine.op_point(cx);
}

/// Wait until the event is signaled. With `timed`, the scheduler may
/// time the wait out; returns false in that case.
pub(crate) fn wait(engine: &Engine, cx: &Cx, slot: usize, timed: bool) -> bool {
    if engine.bypassed() {
        return true;
    }
    loop {
        let ready = engine.with(|st| {
            let EngineState {
                threads,
                events,
                history,
                current,
                ..
            } = st;
            let cur = *current;
            let Some(e) = events.get_mut(slot) else {
                return true;
            };
            if !e.set {
                return false;
            }
            if !e.manual_reset {
                e.set = false;
            }
            let sc = e.sync_clock.clone();
            threads[cur].clock.join(&sc);
            history.push(
                cur,
                HistoryEvent::SyncOp {
                    kind: ObjectKind::Event,
                    slot,
                    op: "wait satisfied",
                },
            );
            true
        });
        if ready {
            engine.op_point(cx);
            return true;
        }
        engine.with(|st| {
            let cur = st.current;
            if let Some(e) = st.events.get_mut(slot) {
                e.waitset.push(cur);
            }
        });
        match engine.park(cx, timed, false) {
            UnparkReason::Timeout => {
                engine.with(|st| {
                    let cur = st.current;
                    if let Some(e) = st.events.get_mut(slot) {
                        e.waitset.remove(cur);
                    }
                });
                return false;
            }
            UnparkReason::Normal => {
                // The signal was delivered to us; for auto-reset events
                // the waker already consumed the flag on our behalf.
                let manual = engine.with(|st| {
                    st.events.get(slot).is_some_and(|e| e.manual_reset)
                });
                if !manual {
                    return true;
                }
                // Manual reset: re-check, the event may have been reset
                // before we ran.
            }
            UnparkReason::Spurious => {}
        }
    }
}

/// A simulated event (manual or auto reset).
pub struct Event {
    engine: Arc<Engine>,
    slot: usize,
}

impl Event {
    /// A manual-reset event: stays signaled until [`Event::reset`].
    #[must_use]
    pub fn manual(cx: &Cx, initially_set: bool) -> Self {
        Self::create(cx, true, initially_set)
    }

    /// An auto-reset event: each signal releases one waiter.
    #[must_use]
    pub fn auto(cx: &Cx, initially_set: bool) -> Self {
        Self::create(cx, false, initially_set)
    }

    fn create(cx: &Cx, manual_reset: bool, initially_set: bool) -> Self {
        let engine = cx.engine_arc();
        let slot = engine.event_create(manual_reset, initially_set);
        Self { engine, slot }
    }

    /// Signal the event.
    pub fn set(&self, cx: &Cx) {
        signal(&self.engine, cx, self.slot, true);
    }

    /// Clear the event.
    pub fn reset(&self, cx: &Cx) {
        if self.engine.bypassed() {
            return;
        }
        self.engine.with(|st| {
            let cur = st.current;
            if let Some(e) = st.events.get_mut(self.slot) {
                e.set = false;
            }
            st.history.push(
                cur,
                HistoryEvent::SyncOp {
                    kind: ObjectKind::Event,
                    slot: self.slot,
                    op: "reset",
                },
            );
        });
        self.engine.op_point(cx);
    }

    /// Wake current waiters without leaving the event signaled.
    pub fn pulse(&self, cx: &Cx) {
        signal(&self.engine, cx, self.slot, false);
    }

    /// Block until signaled.
    pub fn wait(&self, cx: &Cx) {
        wait(&self.engine, cx, self.slot, false);
    }

    /// Timed wait; false when the scheduler timed it out.
    pub fn wait_timed(&self, cx: &Cx) -> bool {
        wait(&self.engine, cx, self.slot, true)
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.engine.event_release(self.slot);
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("slot", &self.slot).finish()
    }
}
