//! Vector clocks: the canonical representation of happens-before.
//!
//! One entry per logical thread. A thread only ever increments its own
//! entry; entries of other threads flow in through joins at synchronizing
//! operations (acquire loads, mutex acquisition, unpark handoffs).

use crate::types::{Timestamp, INLINE_THREADS};
use smallvec::SmallVec;
use std::fmt;

/// An N-entry vector of per-thread timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorClock {
    entries: SmallVec<[Timestamp; INLINE_THREADS]>,
}

impl VectorClock {
    /// A zeroed clock for `threads` logical threads.
    #[must_use]
    pub fn new(threads: usize) -> Self {
        Self {
            entries: SmallVec::from_elem(0, threads),
        }
    }

    /// Number of thread entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the clock has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The timestamp for `thread`.
    #[must_use]
    pub fn get(&self, thread: usize) -> Timestamp {
        self.entries[thread]
    }

    /// Increment `thread`'s own entry and return the new value.
    pub fn advance(&mut self, thread: usize) -> Timestamp {
        self.entries[thread] += 1;
        self.entries[thread]
    }

    /// Pointwise maximum: `self[i] = max(self[i], other[i])`.
    pub fn join(&mut self, other: &VectorClock) {
        debug_assert_eq!(self.entries.len(), other.entries.len());
        for (a, b) in self.entries.iter_mut().zip(other.entries.iter()) {
            *a = (*a).max(*b);
        }
    }

    /// True when `self[i] >= other[i]` for every entry: everything the
    /// other clock has witnessed happens-before this clock's owner.
    #[must_use]
    pub fn dominates(&self, other: &VectorClock) -> bool {
        debug_assert_eq!(self.entries.len(), other.entries.len());
        self.entries
            .iter()
            .zip(other.entries.iter())
            .all(|(a, b)| a >= b)
    }

    /// Zero every entry.
    pub fn reset(&mut self) {
        for e in &mut self.entries {
            *e = 0;
        }
    }

    /// The largest entry in the clock.
    #[must_use]
    pub fn max_entry(&self) -> Timestamp {
        self.entries.iter().copied().max().unwrap_or(0)
    }

    /// Set every entry to `value`. Used by the global flattening fence,
    /// which conceptually orders all threads at a single point.
    pub fn fill(&mut self, value: Timestamp) {
        for e in &mut self.entries {
            *e = value;
        }
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, e) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{e}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_zero() {
        let vc = VectorClock::new(3);
        assert_eq!(vc.get(0), 0);
        assert_eq!(vc.get(2), 0);
        assert_eq!(vc.len(), 3);
        assert!(!vc.is_empty());
    }

    #[test]
    fn advance_is_per_thread() {
        let mut vc = VectorClock::new(3);
        assert_eq!(vc.advance(1), 1);
        assert_eq!(vc.advance(1), 2);
        assert_eq!(vc.get(0), 0);
        assert_eq!(vc.get(1), 2);
    }

    #[test]
    fn join_is_pointwise_max() {
        let mut a = VectorClock::new(3);
        a.advance(0);
        a.advance(0);
        a.advance(1);
        let mut b = VectorClock::new(3);
        b.advance(1);
        b.advance(1);
        b.advance(2);
        a.join(&b);
        assert_eq!(a.get(0), 2);
        assert_eq!(a.get(1), 2);
        assert_eq!(a.get(2), 1);
    }

    #[test]
    fn dominates_requires_all_entries() {
        let mut a = VectorClock::new(2);
        a.advance(0);
        a.advance(1);
        let mut b = VectorClock::new(2);
        b.advance(0);
        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
        // Concurrent clocks dominate in neither direction.
        let mut c = VectorClock::new(2);
        c.advance(1);
        c.advance(1);
        assert!(!b.dominates(&c));
        assert!(!c.dominates(&b));
    }

    #[test]
    fn fill_flattens_for_the_global_fence() {
        let mut vc = VectorClock::new(3);
        vc.advance(0);
        vc.advance(0);
        vc.fill(vc.max_entry());
        assert_eq!(vc.get(1), 2);
        assert_eq!(vc.get(2), 2);
    }

    #[test]
    fn display_format() {
        let mut vc = VectorClock::new(3);
        vc.advance(1);
        assert_eq!(vc.to_string(), "[0, 1, 0]");
    }
}
