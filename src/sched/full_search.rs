//! The exhaustive fair scheduler: depth-first over every interleaving.

use super::tree::{Decision, SearchTree};
use super::{Scheduler, SchedulerBase};
use crate::report::SimError;
use crate::types::{FinishResult, Iteration, RandPurpose, ThreadId, UnparkReason};

/// Depth-first enumeration of all interleavings and all decision values.
///
/// Candidate threads are tried in ascending id order and `rand` values in
/// ascending numeric order, so the walk is stable and two runs from the
/// same state visit identical paths. Fairness comes from the shared
/// candidate shaping: a yielding thread steps aside, and no thread runs
/// more than the fairness cap consecutively while others are runnable.
#[derive(Debug)]
pub(crate) struct FullSearchScheduler {
    base: SchedulerBase,
    tree: SearchTree,
}

impl FullSearchScheduler {
    pub(crate) fn new(static_count: usize, capacity: usize) -> Self {
        Self {
            base: SchedulerBase::new(static_count, capacity),
            tree: SearchTree::new(),
        }
    }
}

impl Scheduler for FullSearchScheduler {
    fn iteration_begin(&mut self, _iter: Iteration) -> ThreadId {
        self.base.reset();
        self.tree.iteration_begin();
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
            let th = candidates[self.tree.branch(candidates.len())];
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
        serde_json::json!({ "nodes": self.tree.nodes() })
    }

    fn set_state(&mut self, state: &serde_json::Value) -> Result<(), SimError> {
        let nodes: Vec<Decision> = state
            .get("nodes")
            .cloned()
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| SimError::StateParse(e.to_string()))?
            .ok_or_else(|| SimError::StateParse("full-search scheduler expects nodes".into()))?;
        self.tree.set_nodes(nodes);
        Ok(())
    }
}
