//! Core identifiers and shared enums.
//!
//! Everything in here is small, `Copy`, and used across every layer of the
//! engine: thread indices, per-thread timestamps, iteration counters, memory
//! orderings, and the reasons a parked thread can be resumed.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index of a logical thread, `0..thread_count`. Stable across iterations.
pub type ThreadId = usize;

/// A per-thread logical timestamp. Only ever incremented by its own thread.
pub type Timestamp = u64;

/// Iteration counter of the simulation driver. Iterations are numbered
/// starting at 1.
pub type Iteration = u64;

/// Depth of the bounded store history kept per atomic cell. Older stores
/// fall off the ring and can no longer be observed by any load.
pub const HISTORY_DEPTH: usize = 3;

/// Progress is reported to the progress stream every this many iterations.
pub const PROGRESS_PERIOD: Iteration = 4096;

/// Inline capacity for per-thread collections (vector clocks, waitsets).
/// Tests with more logical threads spill to the heap transparently.
pub const INLINE_THREADS: usize = 8;

/// Memory ordering of an atomic operation or fence.
///
/// The usual C++11 quintet. `AcqRel` on a plain load or store degrades to
/// its one-sided half, matching the language rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Ordering {
    /// No synchronization, only atomicity and per-location coherence.
    Relaxed,
    /// Load side of a synchronizes-with edge.
    Acquire,
    /// Store side of a synchronizes-with edge.
    Release,
    /// Both halves; meaningful for read-modify-write operations and fences.
    AcqRel,
    /// Acquire-release plus participation in the single total order.
    SeqCst,
}

impl Ordering {
    /// True when the load side of this ordering acquires.
    #[must_use]
    pub const fn is_acquire(self) -> bool {
        matches!(self, Self::Acquire | Self::AcqRel | Self::SeqCst)
    }

    /// True when the store side of this ordering releases.
    #[must_use]
    pub const fn is_release(self) -> bool {
        matches!(self, Self::Release | Self::AcqRel | Self::SeqCst)
    }

    /// True for sequentially consistent operations.
    #[must_use]
    pub const fn is_seq_cst(self) -> bool {
        matches!(self, Self::SeqCst)
    }

    /// Short lowercase name used in history output.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Relaxed => "relaxed",
            Self::Acquire => "acquire",
            Self::Release => "release",
            Self::AcqRel => "acq_rel",
            Self::SeqCst => "seq_cst",
        }
    }
}

impl fmt::Display for Ordering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a parked thread resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnparkReason {
    /// A waker transferred it back to the runnable set.
    #[default]
    Normal,
    /// A timed wait elapsed (scheduler decision).
    Timeout,
    /// A spurious wakeup (scheduler decision, only where allowed).
    Spurious,
}

/// What a scheduler `rand` decision is used for.
///
/// Exhaustive schedulers enumerate every value per purpose; the purpose
/// itself is recorded so replays can cross-check decision streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandPurpose {
    /// Which visible history entry an atomic load observes.
    LoadVisibility,
    /// Whether a weak compare-exchange fails spuriously.
    CasFail,
    /// Whether a freed block is deferred to iteration end.
    MemDefer,
    /// A value requested by the test via `Cx::rand`.
    User,
}

/// Which interleaving search strategy drives the simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SearchKind {
    /// Uniform random choice at every decision point. Stochastic, never
    /// exhaustive; bounded by the iteration count.
    #[default]
    Random,
    /// Exhaustive depth-first search over all interleavings and all
    /// decision values, with a fairness cap on consecutive execution.
    FullSearch,
    /// Exhaustive search restricted to a bounded number of preemptions.
    ContextBound,
}

impl SearchKind {
    /// Stable name used in reports and state strings.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::FullSearch => "full_search",
            Self::ContextBound => "context_bound",
        }
    }
}

impl fmt::Display for SearchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Outcome of a thread-body completion, as judged by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishResult {
    /// Other threads remain; keep scheduling.
    Normal,
    /// This was the last live thread; the iteration epilogue runs.
    Last,
    /// Every remaining thread is blocked with no timer or spurious wakeup
    /// available.
    Deadlock,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_sides() {
        assert!(Ordering::Acquire.is_acquire());
        assert!(!Ordering::Acquire.is_release());
        assert!(Ordering::Release.is_release());
        assert!(!Ordering::Release.is_acquire());
        assert!(Ordering::AcqRel.is_acquire() && Ordering::AcqRel.is_release());
        assert!(Ordering::SeqCst.is_acquire() && Ordering::SeqCst.is_release());
        assert!(!Ordering::Relaxed.is_acquire() && !Ordering::Relaxed.is_release());
    }

    #[test]
    fn ordering_names() {
        assert_eq!(Ordering::SeqCst.to_string(), "seq_cst");
        assert_eq!(Ordering::Relaxed.to_string(), "relaxed");
    }

    #[test]
    fn search_kind_round_trip() {
        let json = serde_json::to_string(&SearchKind::ContextBound).unwrap();
        let back: SearchKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, SearchKind::ContextBound);
    }
}
