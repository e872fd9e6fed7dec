//! The context-bounded scheduler: exhaustive up to `K` preemptions.
//!
//! A preemption is a switch away from a thread that could have kept
//! running. Switches forced by blocking, finishing, or a voluntary yield
//! are free. Bounding preemptions prunes the interleaving tree to
//! polynomially many schedules in the thread count while still covering
//! most realistic bugs.

use super::tree::{Decision, SearchTree};
use super::{Scheduler, SchedulerBase};
use crate::report::SimError;
use crate::types::{FinishResult, Iteration, RandPurpose, ThreadId, UnparkReason};

#[derive(Debug)]
pub(crate) struct ContextBoundScheduler {
    base: SchedulerBase,
    tree: SearchTree,
    bound: u32,
    preemptions: u32,
}

impl ContextBoundScheduler {
    pub(crate) fn new(static_count: usize, capacity: usize, bound: u32) -> Self {
        Self {
            base: SchedulerBase::new(static_count, capacity),
            tree: SearchTree::new(),
            bound,
            preemptions: 0,
        }
    }
}

impl Scheduler for ContextBoundScheduler {
    fn iteration_begin(&mut self, _iter: Iteration) -> ThreadId {
        self.base.reset();
        self.tree.iteration_begin();
        self.preemptions = 0;
        let initial = self.tree.branch(self.base.static_count);
        self.base.note_scheduled(initial);
        initial
    }

    fn schedule(&mut self, yield_hint: u32) -> (ThreadId, UnparkReason) {
        if let Some(th) = self.base.take_forced() {
            self.base.note_scheduled(th);
            return (th, UnparkReason::Normal);
        }
        let candidates = self.base.candidates(yield_hint);
        if !candidates.is_empty() {
            let current = self.base.current;
            let current_runnable = candidates.contains(&current);
            let voluntary = yield_hint > 0;
            let th = if current_runnable && !voluntary && self.preemptions >= self.bound {
                // Out of budget: the running thread must continue.
                current
            } else {
                let th = candidates[self.tree.branch(candidates.len())];
                if current_runnable && !voluntary && th != current {
                    self.preemptions += 1;
                }
                th
            };
            self.base.note_scheduled(th);
            return (th, UnparkReason::Normal);
        }
        let wakes = self.base.wake_candidates();
        assert!(
            !wakes.is_empty(),
            "schedule called with no runnable and no wakeable thread"
        );
        let (th, reason) = wakes[self.tree.branch(wakes.len())];
        self.base.take_wake(th);
        self.base.note_scheduled(th);
        (th, reason)
    }

    fn rand(&mut self, limit: usize, _purpose: RandPurpose) -> usize {
        self.tree.branch(limit)
    }

    fn park_current(&mut self, timed: bool, allow_spurious: bool) -> bool {
        self.base.park_current(timed, allow_spurious)
    }

    fn unpark(&mut self, thread: ThreadId, do_switch: bool) {
        self.base.unpark(thread, do_switch);
    }

    fn create_thread(&mut self) -> ThreadId {
        self.base.create_thread()
    }

    fn thread_finished(&mut self) -> FinishResult {
        self.base.thread_finished()
    }

    fn iteration_end(&mut self) -> bool {
        self.tree.advance()
    }

    fn state(&self) -> serde_json::Value {
        serde_json::json!({ "nodes": self.tree.nodes(), "bound": self.bound })
    }

    fn set_state(&mut self, state: &serde_json::Value) -> Result<(), SimError> {
        let nodes: Vec<Decision> = state
            .get("nodes")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| SimError::StateParse(e.to_string()))?
            .ok_or_else(|| {
                SimError::StateParse("context-bound scheduler expects nodes".into())
            })?;
        self.tree.set_nodes(nodes);
        if let Some(bound) = state.get("bound").and_then(serde_json::Value::as_u64) {
            self.bound = bound as u32;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exhaustion_count(static_count: usize, steps_per_thread: usize, bound: u32) -> usize {
        let mut s = ContextBoundScheduler::new(static_count, static_count, bound);
        let mut iterations = 0;
        for iter in 1.. {
            let mut remaining = vec![steps_per_thread; static_count];
            let mut th = s.iteration_begin(iter);
            iterations += 1;
            loop {
                if remaining[th] > 0 {
                    remaining[th] -= 1;
                    th = s.schedule(0).0;
                } else {
                    match s.thread_finished() {
                        FinishResult::Last => break,
                        FinishResult::Normal => th = s.schedule(0).0,
                        FinishResult::Deadlock => unreachable!("nothing blocks"),
                    }
                }
            }
            if s.iteration_end() {
                return iterations;
            }
            assert!(iter < 10_000, "runaway search");
        }
        unreachable!()
    }

    #[test]
    fn zero_bound_only_varies_free_switches() {
        // With no preemption budget the only decisions are the initial
        // thread and post-finish picks: n! schedules.
        assert_eq!(exhaustion_count(2, 1, 0), 2);
        assert_eq!(exhaustion_count(3, 2, 0), 6);
    }

    #[test]
    fn bound_widens_the_space() {
        let k0 = exhaustion_count(2, 2, 0);
        let k1 = exhaustion_count(2, 2, 1);
        let k2 = exhaustion_count(2, 2, 2);
        assert!(k0 < k1, "{k0} vs {k1}");
        assert!(k1 < k2, "{k1} vs {k2}");
    }

    #[test]
    fn matches_full_search_when_bound_is_large() {
        // With more budget than steps, the pruning never triggers.
        let bounded = exhaustion_count(2, 1, 16);
        assert_eq!(bounded, 6);
    }
}
