//! Atomic cells: a bounded history of stores, and the visibility rules
//! that let non-seq-cst loads observe stale values.
//!
//! Each atomic keeps the last [`HISTORY_DEPTH`] stores. A load does not
//! simply read "the" value: the scheduler picks among the entries still
//! visible to the loading thread, which models store buffering and
//! propagation delay. Three rules bound the choice:
//!
//! - the newest entry is always visible;
//! - a thread never reads an entry older than one it has already observed
//!   (its per-thread coherence floor), nor older than a store it knows to
//!   be overwritten via happens-before;
//! - a seq-cst load additionally respects the single total order: it
//!   cannot skip the newest seq-cst store, nor any store the global
//!   seq-cst order has witnessed.

use crate::clock::VectorClock;
use crate::context::{Cx, Engine};
use crate::sync::waitset::Waitset;
use crate::types::{ThreadId, Timestamp, UnparkReason, HISTORY_DEPTH, INLINE_THREADS};
use smallvec::SmallVec;
use std::marker::PhantomData;
use std::sync::Arc;

/// Sequence number a thread holds before it ever observed a cell.
const NEVER_SEEN: u64 = u64::MAX;

/// One store in the bounded history.
#[derive(Debug, Clone)]
pub(crate) struct StoreEntry {
    /// Stored value bits.
    pub value: u64,
    /// Position in the cell's modification order.
    pub seq: u64,
    /// The storing thread.
    pub writer: ThreadId,
    /// The writer's clock at the store (after advancing its own entry).
    pub store_clock: VectorClock,
    /// Clock an acquire load synchronizes with, when the store releases
    /// (directly, or upgraded by an earlier release fence).
    pub release_clock: Option<VectorClock>,
    /// Whether the store participates in the seq-cst total order.
    pub seq_cst: bool,
}

impl StoreEntry {
    /// The writer's own timestamp at the store; the happens-before test
    /// for "has the reader observed this store".
    pub(crate) fn stamp(&self) -> Timestamp {
        self.store_clock.get(self.writer)
    }
}

/// Engine-side state of one atomic variable.
#[derive(Debug)]
pub(crate) struct AtomicCell {
    /// Oldest to newest; at most [`HISTORY_DEPTH`] entries.
    history: SmallVec<[StoreEntry; HISTORY_DEPTH]>,
    next_seq: u64,
    /// Per-thread coherence floor: lowest sequence number still readable.
    min_visible: SmallVec<[u64; INLINE_THREADS]>,
    /// Per-thread newest observed sequence number, for ABA detection.
    last_seen: SmallVec<[u64; INLINE_THREADS]>,
    /// Futex-style waiters on this cell.
    pub(crate) waitset: Waitset,
}

impl AtomicCell {
    pub(crate) fn new(threads: usize) -> Self {
        Self {
            history: SmallVec::new(),
            next_seq: 0,
            min_visible: SmallVec::from_elem(0, threads),
            last_seen: SmallVec::from_elem(NEVER_SEEN, threads),
            waitset: Waitset::new(),
        }
    }

    pub(crate) fn is_initialized(&self) -> bool {
        !self.history.is_empty()
    }

    pub(crate) fn newest(&self) -> Option<&StoreEntry> {
        self.history.last()
    }

    pub(crate) fn entry(&self, index: usize) -> &StoreEntry {
        &self.history[index]
    }

    /// How many stores back from the newest entry `index` is.
    pub(crate) fn age(&self, index: usize) -> usize {
        self.history.len() - 1 - index
    }

    /// Indices of the entries `reader` may observe, oldest first.
    ///
    /// `global_order` is the seq-cst order clock, consulted only for
    /// seq-cst loads.
    pub(crate) fn visible_indices(
        &self,
        reader: ThreadId,
        reader_clock: &VectorClock,
        seq_cst_load: bool,
        global_order: &VectorClock,
    ) -> SmallVec<[usize; HISTORY_DEPTH]> {
        let mut floor = self.min_visible[reader];
        for e in &self.history {
            // A store the reader already knows happened is its new floor:
            // anything older was observed being overwritten.
            if reader_clock.get(e.writer) >= e.stamp() {
                floor = floor.max(e.seq);
            }
        }
        if seq_cst_load {
            for e in &self.history {
                if e.seq_cst || global_order.get(e.writer) >= e.stamp() {
                    floor = floor.max(e.seq);
                }
            }
        }
        self.history
            .iter()
            .enumerate()
            .filter(|(_, e)| e.seq >= floor)
            .map(|(i, _)| i)
            .collect()
    }

    /// Record that `reader` observed the entry with sequence `seq`.
    pub(crate) fn note_read(&mut self, reader: ThreadId, seq: u64) {
        self.min_visible[reader] = self.min_visible[reader].max(seq);
        if self.last_seen[reader] == NEVER_SEEN || self.last_seen[reader] < seq {
            self.last_seen[reader] = seq;
        }
    }

    /// True when `thread` observing the newest entry would skip stores it
    /// never saw (the ABA window for read-modify-writes).
    pub(crate) fn skipped_stores(&self, thread: ThreadId) -> bool {
        match (self.last_seen[thread], self.newest()) {
            (NEVER_SEEN, _) | (_, None) => false,
            (seen, Some(newest)) => newest.seq > seen + 1,
        }
    }

    /// Append a store by `writer`, evicting the oldest entry when the ring
    /// is full. Returns the new entry's sequence number.
    pub(crate) fn push_store(
        &mut self,
        writer: ThreadId,
        value: u64,
        store_clock: VectorClock,
        release_clock: Option<VectorClock>,
        seq_cst: bool,
    ) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        if self.history.len() == HISTORY_DEPTH {
            self.history.remove(0);
        }
        self.history.push(StoreEntry {
            value,
            seq,
            writer,
            store_clock,
            release_clock,
            seq_cst,
        });
        // The writer witnessed the previous newest entry by definition of
        // modification order.
        self.min_visible[writer] = seq;
        self.last_seen[writer] = seq;
        seq
    }
}

/// Conversion between a user value and the 64-bit representation stored
/// in atomic cells.
pub trait AtomicValue: Copy + 'static {
    /// The value as bits.
    fn into_bits(self) -> u64;
    /// Recover the value from bits produced by [`AtomicValue::into_bits`].
    fn from_bits(bits: u64) -> Self;
}

macro_rules! atomic_value_unsigned {
    ($($t:ty),*) => {$(
        impl AtomicValue for $t {
            fn into_bits(self) -> u64 {
                self as u64
            }
            fn from_bits(bits: u64) -> Self {
                bits as $t
            }
        }
    )*};
}

macro_rules! atomic_value_signed {
    ($($t:ty),*) => {$(
        impl AtomicValue for $t {
            fn into_bits(self) -> u64 {
                // Sign-extend through i64 so from_bits round-trips.
                self as i64 as u64
            }
            fn from_bits(bits: u64) -> Self {
                bits as $t
            }
        }
    )*};
}

atomic_value_unsigned!(u8, u16, u32, u64, usize);
atomic_value_signed!(i8, i16, i32, i64, isize);

impl AtomicValue for bool {
    fn into_bits(self) -> u64 {
        u64::from(self)
    }
    fn from_bits(bits: u64) -> Self {
        bits != 0
    }
}

/// Integer operations for the `fetch_*` family.
pub trait AtomicInteger: AtomicValue {
    /// Wrapping addition.
    fn atomic_add(self, rhs: Self) -> Self;
    /// Wrapping subtraction.
    fn atomic_sub(self, rhs: Self) -> Self;
    /// Bitwise and.
    fn atomic_and(self, rhs: Self) -> Self;
    /// Bitwise or.
    fn atomic_or(self, rhs: Self) -> Self;
    /// Bitwise xor.
    fn atomic_xor(self, rhs: Self) -> Self;
}

macro_rules! atomic_integer {
    ($($t:ty),*) => {$(
        impl AtomicInteger for $t {
            fn atomic_add(self, rhs: Self) -> Self {
                self.wrapping_add(rhs)
            }
            fn atomic_sub(self, rhs: Self) -> Self {
                self.wrapping_sub(rhs)
            }
            fn atomic_and(self, rhs: Self) -> Self {
                self & rhs
            }
            fn atomic_or(self, rhs: Self) -> Self {
                self | rhs
            }
            fn atomic_xor(self, rhs: Self) -> Self {
                self ^ rhs
            }
        }
    )*};
}

atomic_integer!(u8, u16, u32, u64, usize, i8, i16, i32, i64, isize);

/// A simulated atomic variable.
///
/// Uninitialized until the first store; loading it before that is an
/// uninitialized-access failure. All methods are explicit scheduling
/// points.
pub struct Atomic<T: AtomicValue> {
    engine: Arc<Engine>,
    slot: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T: AtomicValue> Atomic<T> {
    /// Create an uninitialized atomic owned by the running test.
    #[must_use]
    pub fn new(cx: &Cx) -> Self {
        let engine = cx.engine_arc();
        let slot = engine.atomic_create();
        Self {
            engine,
            slot,
            _marker: PhantomData,
        }
    }

    /// Load with the given ordering. The scheduler picks which visible
    /// store is observed.
    pub fn load(&self, cx: &Cx, ordering: crate::types::Ordering) -> T {
        T::from_bits(self.engine.atomic_load(cx, self.slot, ordering))
    }

    /// Store with the given ordering.
    pub fn store(&self, cx: &Cx, value: T, ordering: crate::types::Ordering) {
        self.engine.atomic_store(cx, self.slot, value.into_bits(), ordering);
    }

    /// Atomically replace the value, returning the previous one.
    pub fn swap(&self, cx: &Cx, value: T, ordering: crate::types::Ordering) -> T {
        let bits = value.into_bits();
        T::from_bits(self.engine.atomic_rmw(cx, self.slot, ordering, &mut |_| bits))
    }

    /// Strong compare-exchange. On success returns the previous value in
    /// `Ok`; on mismatch returns the current value in `Err`.
    pub fn compare_exchange(
        &self,
        cx: &Cx,
        current: T,
        new: T,
        success: crate::types::Ordering,
        failure: crate::types::Ordering,
    ) -> Result<T, T> {
        self.engine
            .atomic_cas(
                cx,
                self.slot,
                current.into_bits(),
                new.into_bits(),
                success,
                failure,
                false,
            )
            .map(T::from_bits)
            .map_err(T::from_bits)
    }

    /// Weak compare-exchange: may fail spuriously even when the value
    /// matches (the scheduler explores both outcomes).
    pub fn compare_exchange_weak(
        &self,
        cx: &Cx,
        current: T,
        new: T,
        success: crate::types::Ordering,
        failure: crate::types::Ordering,
    ) -> Result<T, T> {
        self.engine
            .atomic_cas(
                cx,
                self.slot,
                current.into_bits(),
                new.into_bits(),
                success,
                failure,
                true,
            )
            .map(T::from_bits)
            .map_err(T::from_bits)
    }

    /// Block until another thread wakes this cell. Spurious wakeups are
    /// part of the contract, as with a futex.
    pub fn wait(&self, cx: &Cx) -> UnparkReason {
        self.engine.atomic_wait(cx, self.slot, false)
    }

    /// As [`Atomic::wait`], but the scheduler may also time the wait out.
    pub fn wait_timed(&self, cx: &Cx) -> UnparkReason {
        self.engine.atomic_wait(cx, self.slot, true)
    }

    /// Wake up to `count` waiters. Returns how many were woken.
    pub fn wake(&self, cx: &Cx, count: usize) -> usize {
        self.engine.atomic_wake(cx, self.slot, count)
    }
}

impl<T: AtomicInteger> Atomic<T> {
    /// Atomic wrapping add; returns the previous value.
    pub fn fetch_add(&self, cx: &Cx, rhs: T, ordering: crate::types::Ordering) -> T {
        self.rmw_int(cx, ordering, |v| v.atomic_add(rhs))
    }

    /// Atomic wrapping subtract; returns the previous value.
    pub fn fetch_sub(&self, cx: &Cx, rhs: T, ordering: crate::types::Ordering) -> T {
        self.rmw_int(cx, ordering, |v| v.atomic_sub(rhs))
    }

    /// Atomic bitwise and; returns the previous value.
    pub fn fetch_and(&self, cx: &Cx, rhs: T, ordering: crate::types::Ordering) -> T {
        self.rmw_int(cx, ordering, |v| v.atomic_and(rhs))
    }

    /// Atomic bitwise or; returns the previous value.
    pub fn fetch_or(&self, cx: &Cx, rhs: T, ordering: crate::types::Ordering) -> T {
        self.rmw_int(cx, ordering, |v| v.atomic_or(rhs))
    }

    /// Atomic bitwise xor; returns the previous value.
    pub fn fetch_xor(&self, cx: &Cx, rhs: T, ordering: crate::types::Ordering) -> T {
        self.rmw_int(cx, ordering, |v| v.atomic_xor(rhs))
    }

    fn rmw_int(
        &self,
        cx: &Cx,
        ordering: crate::types::Ordering,
        f: impl Fn(T) -> T,
    ) -> T {
        let mut apply = |bits: u64| f(T::from_bits(bits)).into_bits();
        T::from_bits(self.engine.atomic_rmw(cx, self.slot, ordering, &mut apply))
    }
}

impl<T: AtomicValue> Drop for Atomic<T> {
    fn drop(&mut self) {
        self.engine.atomic_release(self.slot);
    }
}

impl<T: AtomicValue> std::fmt::Debug for Atomic<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Atomic").field("slot", &self.slot).finish()
    }
}
