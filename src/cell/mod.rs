//! Shared memory cells: atomics with bounded store history, and plain
//! variables with race tracking.

pub(crate) mod atomic;
pub(crate) mod var;

pub use atomic::{Atomic, AtomicInteger, AtomicValue};
pub use var::Var;
