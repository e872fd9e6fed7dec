//! Synchronization objects: the engine-side state machines and the
//! user-facing handles built on them.
//!
//! All of them share the [`waitset`] abstraction; the context supplies
//! park/wake and the happens-before transfer. Every operation is a
//! scheduling point.

pub(crate) mod condvar;
pub(crate) mod event;
pub(crate) mod mutex;
pub(crate) mod semaphore;
pub(crate) mod waitset;

pub use condvar::Condvar;
pub use event::Event;
pub use mutex::{Mutex, MutexGuard, RwMutex, RwReadGuard, RwWriteGuard};
pub use semaphore::Semaphore;
