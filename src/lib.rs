//! racelab: a stress-testing race detector for concurrent algorithms.
//!
//! A test declares a fixed number of logical threads operating on
//! simulated atomics, plain variables, and synchronization primitives.
//! The engine repeatedly executes every feasible interleaving of those
//! threads under the C++11-style memory model (relaxed through seq-cst),
//! detects assertion failures, data races on plain variables, deadlocks,
//! livelocks, double frees, and leaks — and on failure replays the
//! offending interleaving deterministically, printing a step-by-step
//! history.
//!
//! # Architecture
//!
//! - Logical threads are cooperative fibers; exactly one runs at any
//!   instant, and the scheduler owns every switch.
//! - Happens-before is tracked with per-thread vector clocks; atomics
//!   keep a bounded history of stores so loads can legally observe stale
//!   values.
//! - Three search strategies enumerate or sample interleavings: random,
//!   exhaustive depth-first, and context-bounded.
//! - Every piece of non-determinism flows through the scheduler, which
//!   serializes its exploration cursor; a failing iteration replays
//!   bit-for-bit from that state.
//!
//! # Example
//!
//! ```ignore
//! use racelab::{check, Atomic, Cx, Ordering, SearchKind, TestSuite, Var};
//!
//! struct Handoff {
//!     flag: Atomic<bool>,
//!     data: Var<u32>,
//! }
//!
//! impl TestSuite for Handoff {
//!     const THREADS: usize = 2;
//!
//!     fn new(cx: &Cx) -> Self {
//!         Self {
//!             flag: Atomic::new(cx),
//!             data: Var::new(cx),
//!         }
//!     }
//!
//!     fn before(&self, cx: &Cx) {
//!         self.flag.store(cx, false, Ordering::Relaxed);
//!     }
//!
//!     fn thread(&self, cx: &Cx, index: usize) {
//!         if index == 0 {
//!             self.data.store(cx, 42);
//!             self.flag.store(cx, true, Ordering::Release);
//!         } else if self.flag.load(cx, Ordering::Acquire) {
//!             cx.ensure(self.data.load(cx) == 42, "published value visible");
//!         }
//!     }
//! }
//!
//! check::<Handoff>(SearchKind::FullSearch);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod addr_hash;
mod cell;
mod clock;
mod context;
mod driver;
mod fiber;
mod history;
mod mem;
mod report;
mod sched;
mod suite;
mod sync;
mod types;
mod util;

pub use cell::{Atomic, AtomicInteger, AtomicValue, Var};
pub use context::{Cx, JoinHandle};
pub use driver::{check, check_params, simulate, Params};
pub use report::{SimError, SimReport, TestResult};
pub use suite::TestSuite;
pub use sync::{Condvar, Event, Mutex, MutexGuard, RwMutex, RwReadGuard, RwWriteGuard, Semaphore};
pub use types::{Iteration, Ordering, SearchKind, ThreadId, Timestamp, UnparkReason};
