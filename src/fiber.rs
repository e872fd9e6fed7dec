//! The cooperative fiber runtime.
//!
//! Each logical thread is an OS thread that spends almost its entire life
//! parked on the baton: a single `(Mutex<owner>, Condvar)` pair naming the
//! one fiber allowed to run. `switch` publishes the next owner and blocks
//! the caller until the baton names it again, so at every instant exactly
//! one fiber executes engine or test code. That mutual exclusion is what
//! makes the engine's single-threaded state sound and every interleaving
//! reproducible; there is no preemption anywhere.
//!
//! Iteration teardown and simulation shutdown unwind fibers parked inside
//! a test body with [`ShutdownSignal`], a typed panic payload caught at the
//! fiber entry loop — it never escapes to user code as an observable panic.

use crate::types::ThreadId;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

/// Baton owner value naming the driver ("main") fiber.
pub(crate) const MAIN_FIBER: ThreadId = usize::MAX;

/// Panic payload used to unwind a fiber out of a test body.
#[derive(Debug)]
pub(crate) struct ShutdownSignal;

/// The baton: which fiber runs, and whether the simulation is over.
#[derive(Debug)]
pub(crate) struct FiberPool {
    owner: Mutex<ThreadId>,
    turned: Condvar,
    shutdown: AtomicBool,
}

impl FiberPool {
    pub(crate) fn new() -> Self {
        Self {
            owner: Mutex::new(MAIN_FIBER),
            turned: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Hand the baton to `to` and block until it comes back to `from`.
    pub(crate) fn switch(&self, from: ThreadId, to: ThreadId) {
        let mut owner = self.owner.lock();
        *owner = to;
        self.turned.notify_all();
        while *owner != from {
            self.turned.wait(&mut owner);
        }
    }

    /// Hand the baton to `to` without waiting for it back. Used by a fiber
    /// that is about to exit its OS thread.
    pub(crate) fn pass(&self, to: ThreadId) {
        let mut owner = self.owner.lock();
        *owner = to;
        self.turned.notify_all();
    }

    /// Block until the baton names `me`. The first activation of a fiber.
    pub(crate) fn wait_for(&self, me: ThreadId) {
        let mut owner = self.owner.lock();
        while *owner != me {
            self.turned.wait(&mut owner);
        }
    }

    /// Mark the simulation over. Fibers observe this at their next baton
    /// wake and unwind.
    pub(crate) fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }
}
