//! Plain (non-atomic) variables with data-race tracking.
//!
//! A plain access is legal only when every prior conflicting access is
//! covered by a happens-before edge. The record keeps, per thread, the
//! timestamp of its last store and last load; an accessor's clock must
//! dominate the conflicting side or the access is a race.

#![allow(unsafe_code)]

use crate::clock::VectorClock;
use crate::context::{Cx, Engine};
use crate::types::{ThreadId, Timestamp, INLINE_THREADS};
use smallvec::SmallVec;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::Arc;

/// Why a plain access is illegal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum VarAccessError {
    /// Load before any store.
    Uninitialized,
    /// Conflicting access without happens-before.
    Race,
}

/// Engine-side clocks of one plain variable.
#[derive(Debug)]
pub(crate) struct VarRecord {
    store_stamp: SmallVec<[Timestamp; INLINE_THREADS]>,
    load_stamp: SmallVec<[Timestamp; INLINE_THREADS]>,
    initialized: bool,
}

impl VarRecord {
    pub(crate) fn new(threads: usize) -> Self {
        Self {
            store_stamp: SmallVec::from_elem(0, threads),
            load_stamp: SmallVec::from_elem(0, threads),
            initialized: false,
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// First store; unconditionally legal.
    pub(crate) fn init(&mut self, thread: ThreadId, clock: &mut VectorClock) {
        self.initialized = true;
        let own = clock.advance(thread);
        self.store_stamp[thread] = own;
    }

    /// A store must happen-after every prior load and store.
    pub(crate) fn store(
        &mut self,
        thread: ThreadId,
        clock: &mut VectorClock,
    ) -> Result<(), VarAccessError> {
        if !self.initialized {
            self.init(thread, clock);
            return Ok(());
        }
        for i in 0..self.store_stamp.len() {
            if clock.get(i) < self.store_stamp[i] || clock.get(i) < self.load_stamp[i] {
                return Err(VarAccessError::Race);
            }
        }
        let own = clock.advance(thread);
        self.store_stamp[thread] = own;
        Ok(())
    }

    /// A load must happen-after every prior store; concurrent loads are
    /// fine.
    pub(crate) fn load(
        &mut self,
        thread: ThreadId,
        clock: &mut VectorClock,
    ) -> Result<(), VarAccessError> {
        if !self.initialized {
            return Err(VarAccessError::Uninitialized);
        }
        for i in 0..self.store_stamp.len() {
            if clock.get(i) < self.store_stamp[i] {
                return Err(VarAccessError::Race);
            }
        }
        let own = clock.advance(thread);
        self.load_stamp[thread] = own;
        Ok(())
    }
}

/// A simulated plain variable.
///
/// The value lives inline; the engine only tracks access clocks. Reads
/// and writes go through the race check first, so the value is never
/// touched on an access the verdict rejects.
pub struct Var<T: Copy> {
    engine: Arc<Engine>,
    slot: usize,
    value: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: access to `value` is serialized by the engine's fiber baton —
// at most one logical thread executes at any instant, and the engine's
// race check has passed before the cell is touched.
unsafe impl<T: Copy + Send> Sync for Var<T> {}
unsafe impl<T: Copy + Send> Send for Var<T> {}

impl<T: Copy> Var<T> {
    /// Create an uninitialized variable.
    #[must_use]
    pub fn new(cx: &Cx) -> Self {
        let engine = cx.engine_arc();
        let slot = engine.var_create();
        Self {
            engine,
            slot,
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Create a variable already holding `value`.
    #[must_use]
    pub fn init(cx: &Cx, value: T) -> Self {
        let var = Self::new(cx);
        var.engine.var_init(cx, var.slot);
        // SAFETY: construction; no other thread holds a reference yet.
        unsafe { (*var.value.get()).write(value) };
        var
    }

    /// Load the value. Fails the iteration on a data race or an
    /// uninitialized read. Inside the invariant hook the race check is
    /// skipped (the invariant is read-only by contract).
    pub fn load(&self, cx: &Cx) -> T {
        self.engine.var_load(cx, self.slot);
        // SAFETY: the engine verified the variable is initialized, and the
        // baton serializes access.
        unsafe { (*self.value.get()).assume_init() }
    }

    /// Store a value. Fails the iteration on a data race.
    pub fn store(&self, cx: &Cx, value: T) {
        self.engine.var_store(cx, self.slot);
        // SAFETY: baton-serialized; the race check passed.
        unsafe { (*self.value.get()).write(value) };
    }
}

impl<T: Copy> Drop for Var<T> {
    fn drop(&mut self) {
        self.engine.var_release(self.slot);
    }
}

impl<T: Copy> std::fmt::Debug for Var<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Var").field("slot", &self.slot).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninitialized_load_rejected() {
        let mut rec = VarRecord::new(2);
        let mut clock = VectorClock::new(2);
        assert_eq!(
            rec.load(0, &mut clock),
            Err(VarAccessError::Uninitialized)
        );
    }

    #[test]
    fn sequential_accesses_are_legal() {
        let mut rec = VarRecord::new(2);
        let mut clock = VectorClock::new(2);
        rec.init(0, &mut clock);
        assert_eq!(rec.load(0, &mut clock), Ok(()));
        assert_eq!(rec.store(0, &mut clock), Ok(()));
    }

    #[test]
    fn concurrent_store_store_races() {
        let mut rec = VarRecord::new(2);
        let mut c0 = VectorClock::new(2);
        let mut c1 = VectorClock::new(2);
        rec.store(0, &mut c0).unwrap();
        // Thread 1 never synchronized with thread 0's store.
        assert_eq!(rec.store(1, &mut c1), Err(VarAccessError::Race));
    }

    #[test]
    fn concurrent_load_store_races() {
        let mut rec = VarRecord::new(2);
        let mut c0 = VectorClock::new(2);
        let mut c1 = VectorClock::new(2);
        rec.store(0, &mut c0).unwrap();
        c1.join(&c0); // reader synchronized with the store
        assert_eq!(rec.load(1, &mut c1), Ok(()));
        // Now thread 0 stores again without seeing the load.
        assert_eq!(rec.store(0, &mut c0), Err(VarAccessError::Race));
    }

    #[test]
    fn concurrent_loads_do_not_race() {
        let mut rec = VarRecord::new(3);
        let mut c0 = VectorClock::new(3);
        rec.init(0, &mut c0);
        let mut c1 = VectorClock::new(3);
        let mut c2 = VectorClock::new(3);
        c1.join(&c0);
        c2.join(&c0);
        assert_eq!(rec.load(1, &mut c1), Ok(()));
        assert_eq!(rec.load(2, &mut c2), Ok(()));
    }

    #[test]
    fn synchronized_store_after_load_is_legal() {
        let mut rec = VarRecord::new(2);
        let mut c0 = VectorClock::new(2);
        let mut c1 = VectorClock::new(2);
        rec.store(0, &mut c0).unwrap();
        c1.join(&c0);
        rec.load(1, &mut c1).unwrap();
        c0.join(&c1); // writer synchronized with the reader
        assert_eq!(rec.store(0, &mut c0), Ok(()));
    }
}
