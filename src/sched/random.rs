//! The stochastic scheduler: uniform choice at every decision point.

use super::{Scheduler, SchedulerBase};
use crate::report::SimError;
use crate::types::{FinishResult, Iteration, RandPurpose, ThreadId, UnparkReason};
use crate::util::DetRng;

/// Mixes the base seed with the iteration number, so every iteration has
/// an independent but fully reproducible decision stream.
fn iteration_rng(seed: u64, iter: Iteration) -> DetRng {
    DetRng::new(seed ^ iter.wrapping_mul(0x9e37_79b9_7f4a_7c15))
}

/// Uniform random exploration. Not exhaustive: the driver bounds it by
/// `iteration_count`.
#[derive(Debug)]
pub(crate) struct RandomScheduler {
    base: SchedulerBase,
    rng: DetRng,
    seed: u64,
    iter: Iteration,
    iteration_count: Iteration,
}

impl RandomScheduler {
    pub(crate) fn new(
        static_count: usize,
        capacity: usize,
        seed: u64,
        iteration_count: Iteration,
    ) -> Self {
        Self {
            base: SchedulerBase::new(static_count, capacity),
            rng: iteration_rng(seed, 0),
            seed,
            iter: 0,
            iteration_count,
        }
    }
}

impl Scheduler for RandomScheduler {
    fn iteration_begin(&mut self, iter: Iteration) -> ThreadId {
        self.base.reset();
        self.iter = iter;
        self.rng = iteration_rng(self.seed, iter);
        let initial = self.rng.below(self.base.static_count);
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
            let th = candidates[self.rng.below(candidates.len())];
            self.base.note_scheduled(th);
            return (th, UnparkReason::Normal);
        }
        let wakes = self.base.wake_candidates();
        assert!(
            !wakes.is_empty(),
            "schedule called with no runnable and no wakeable thread"
        );
        let (th, reason) = wakes[self.rng.below(wakes.len())];
        self.base.take_wake(th);
        self.base.note_scheduled(th);
        (th, reason)
    }

    fn rand(&mut self, limit: usize, _purpose: RandPurpose) -> usize {
        self.rng.below(limit)
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
        self.iter >= self.iteration_count
    }

    fn state(&self) -> serde_json::Value {
        serde_json::json!({ "seed": self.seed })
    }

    fn set_state(&mut self, state: &serde_json::Value) -> Result<(), SimError> {
        let seed = state
            .get("seed")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| SimError::StateParse("random scheduler expects a seed".into()))?;
        self.seed = seed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_iteration_same_decisions() {
        let mut a = RandomScheduler::new(3, 3, 42, 100);
        let mut b = RandomScheduler::new(3, 3, 42, 100);
        for iter in 1..20 {
            assert_eq!(a.iteration_begin(iter), b.iteration_begin(iter));
            for _ in 0..10 {
                assert_eq!(a.schedule(0), b.schedule(0));
                assert_eq!(
                    a.rand(7, RandPurpose::User),
                    b.rand(7, RandPurpose::User)
                );
            }
        }
    }

    #[test]
    fn exhausts_at_iteration_count() {
        let mut s = RandomScheduler::new(1, 1, 1, 3);
        s.iteration_begin(1);
        assert!(!s.iteration_end());
        s.iteration_begin(3);
        assert!(s.iteration_end());
    }

    #[test]
    fn state_round_trip() {
        let s = RandomScheduler::new(2, 2, 99, 10);
        let state = s.state();
        let mut t = RandomScheduler::new(2, 2, 0, 10);
        t.set_state(&state).unwrap();
        assert_eq!(t.state(), state);
    }
}
