//! Mutexes: exclusive and reader-writer, with recursion and try-lock
//! failure injection.
//!
//! The state machine tracks the exclusive owner (or the set of shared
//! owners), a recursion count, and a sync clock: each unlock folds the
//! releasing thread's clock into it, and each acquisition joins it, which
//! is exactly the release/acquire edge a real mutex provides. Contended
//! lock attempts park in a FIFO waitset and retry on wake, so barging by
//! third threads is part of the explored behavior.

use crate::context::{wake_thread, Cx, Engine, EngineState};
use crate::history::{Event, ObjectKind};
use crate::report::TestResult;
use crate::sync::waitset::Waitset;
use crate::types::{RandPurpose, ThreadId, UnparkReason};
use crate::clock::VectorClock;
use smallvec::SmallVec;
use std::sync::Arc;

/// Construction options; mirrors the distinctions real mutex flavors
/// have.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct MutexOptions {
    /// Reader-writer mutex (shared locking allowed).
    pub(crate) rw: bool,
    /// The exclusive side may be re-acquired by its owner.
    pub(crate) recursive: bool,
    /// `try_lock` may fail spuriously even when the mutex is free.
    pub(crate) failing_try_lock: bool,
}

/// Engine-side state of one mutex.
#[derive(Debug)]
pub(crate) struct MutexState {
    pub(crate) owner: Option<ThreadId>,
    pub(crate) recursion: u32,
    pub(crate) options: MutexOptions,
    pub(crate) shared_owners: SmallVec<[ThreadId; 4]>,
    pub(crate) sync_clock: VectorClock,
    pub(crate) waitset: Waitset,
    pub(crate) shared_waitset: Waitset,
}

impl MutexState {
    pub(crate) fn new(threads: usize, options: MutexOptions) -> Self {
        Self {
            owner: None,
            recursion: 0,
            options,
            shared_owners: SmallVec::new(),
            sync_clock: VectorClock::new(threads),
            waitset: Waitset::new(),
            shared_waitset: Waitset::new(),
        }
    }

    fn free_for_exclusive(&self) -> bool {
        self.owner.is_none() && self.shared_owners.is_empty()
    }

    fn free_for_shared(&self) -> bool {
        self.owner.is_none()
    }
}

enum Attempt {
    Acquired,
    WouldBlock,
    SelfDeadlock,
}

fn try_acquire_exclusive(st: &mut EngineState, slot: usize, spurious_fail: bool) -> Attempt {
    let EngineState {
        threads,
        mutexes,
        history,
        current,
        ..
    } = st;
    let cur = *current;
    let Some(m) = mutexes.get_mut(slot) else {
        return Attempt::Acquired;
    };
    if m.owner == Some(cur) {
        if m.options.recursive {
            m.recursion += 1;
            history.push(
                cur,
                Event::SyncOp {
                    kind: ObjectKind::Mutex,
                    slot,
                    op: "lock recursive",
                },
            );
            return Attempt::Acquired;
        }
        return Attempt::SelfDeadlock;
    }
    if spurious_fail || !m.free_for_exclusive() {
        return Attempt::WouldBlock;
    }
    m.owner = Some(cur);
    m.recursion = 1;
    let sc = m.sync_clock.clone();
    threads[cur].clock.join(&sc);
    history.push(
        cur,
        Event::SyncOp {
            kind: ObjectKind::Mutex,
            slot,
            op: "lock",
        },
    );
    Attempt::Acquired
}

/// Blocking or non-blocking exclusive lock. Returns whether the lock was
/// acquired (always true in the blocking case).
pub(crate) fn lock_exclusive(engine: &Engine, cx: &Cx, slot: usize, try_only: bool) -> bool {
    if engine.bypassed() {
        return true;
    }
    loop {
        let attempt = engine.with(|st| {
            let spurious_fail = try_only
                && st
                    .mutexes
                    .get(slot)
                    .is_some_and(|m| m.options.failing_try_lock)
                && st.sched.rand(2, RandPurpose::CasFail) == 1;
            try_acquire_exclusive(st, slot, spurious_fail)
        });
        match attempt {
            Attempt::Acquired => {
                engine.op_point(cx);
                return true;
            }
            Attempt::SelfDeadlock => engine.fail(
                TestResult::Deadlock,
                "recursive lock of a non-recursive mutex",
            ),
            Attempt::WouldBlock if try_only => {
                engine.with(|st| {
                    let cur = st.current;
                    st.history.push(
                        cur,
                        Event::SyncOp {
                            kind: ObjectKind::Mutex,
                            slot,
                            op: "try_lock failed",
                        },
                    );
                });
                engine.op_point(cx);
                return false;
            }
            Attempt::WouldBlock => {
                engine.with(|st| {
                    let cur = st.current;
                    if let Some(m) = st.mutexes.get_mut(slot) {
                        m.waitset.push(cur);
                    }
                });
                let reason = engine.park(cx, false, false);
                debug_assert_eq!(reason, UnparkReason::Normal);
                // Woken by an unlock; retry (another thread may have
                // barged in first).
            }
        }
    }
}

/// Release the exclusive side.
pub(crate) fn unlock_exclusive(engine: &Engine, cx: &Cx, slot: usize) {
    if engine.bypassed() {
        return;
    }
    let ok = engine.with(|st| {
        let EngineState {
            threads,
            mutexes,
            sched,
            history,
            current,
            ..
        } = st;
        let cur = *current;
        let Some(m) = mutexes.get_mut(slot) else {
            return true;
        };
        if m.owner != Some(cur) {
            return false;
        }
        m.recursion -= 1;
        if m.recursion > 0 {
            history.push(
                cur,
                Event::SyncOp {
                    kind: ObjectKind::Mutex,
                    slot,
                    op: "unlock recursive",
                },
            );
            return true;
        }
        m.owner = None;
        let clock = threads[cur].clock.clone();
        m.sync_clock.join(&clock);
        history.push(
            cur,
            Event::SyncOp {
                kind: ObjectKind::Mutex,
                slot,
                op: "unlock",
            },
        );
        if let Some(w) = m.waitset.pop() {
            wake_thread(sched, threads, history, cur, w);
        } else {
            let mut shared = std::mem::take(&mut m.shared_waitset);
            while let Some(w) = shared.pop() {
                wake_thread(sched, threads, history, cur, w);
            }
        }
        true
    });
    if !ok {
        engine.fail(
            TestResult::UserAssertFailed,
            "unlock of a mutex not owned by this thread",
        );
    }
    engine.op_point(cx);
}

/// Blocking or non-blocking shared (read) lock.
pub(crate) fn lock_shared(engine: &Engine, cx: &Cx, slot: usize, try_only: bool) -> bool {
    if engine.bypassed() {
        return true;
    }
    loop {
        let attempt = engine.with(|st| {
            let EngineState {
                threads,
                mutexes,
                history,
                current,
                ..
            } = st;
            let cur = *current;
            let Some(m) = mutexes.get_mut(slot) else {
                return Attempt::Acquired;
            };
            debug_assert!(m.options.rw, "shared lock on a non-rw mutex");
            if m.owner == Some(cur) {
                return Attempt::SelfDeadlock;
            }
            if !m.free_for_shared() {
                return Attempt::WouldBlock;
            }
            m.shared_owners.push(cur);
            let sc = m.sync_clock.clone();
            threads[cur].clock.join(&sc);
            history.push(
                cur,
                Event::SyncOp {
                    kind: ObjectKind::Mutex,
                    slot,
                    op: "lock shared",
                },
            );
            Attempt::Acquired
        });
        match attempt {
            Attempt::Acquired => {
                engine.op_point(cx);
                return true;
            }
            Attempt::SelfDeadlock => engine.fail(
                TestResult::Deadlock,
                "shared lock while holding the exclusive side",
            ),
            Attempt::WouldBlock if try_only => {
                engine.op_point(cx);
                return false;
            }
            Attempt::WouldBlock => {
                engine.with(|st| {
                    let cur = st.current;
                    if let Some(m) = st.mutexes.get_mut(slot) {
                        m.shared_waitset.push(cur);
                    }
                });
                let reason = engine.park(cx, false, false);
                debug_assert_eq!(reason, UnparkReason::Normal);
            }
        }
    }
}

/// Release one shared hold.
pub(crate) fn unlock_shared(engine: &Engine, cx: &Cx, slot: usize) {
    if engine.bypassed() {
        return;
    }
    let ok = engine.with(|st| {
        let EngineState {
            threads,
            mutexes,
            sched,
            history,
            current,
            ..
        } = st;
        let cur = *current;
        let Some(m) = mutexes.get_mut(slot) else {
            return true;
        };
        let Some(pos) = m.shared_owners.iter().position(|&t| t == cur) else {
            return false;
        };
        m.shared_owners.remove(pos);
        let clock = threads[cur].clock.clone();
        m.sync_clock.join(&clock);
        history.push(
            cur,
            Event::SyncOp {
                kind: ObjectKind::Mutex,
                slot,
                op: "unlock shared",
            },
        );
        if m.shared_owners.is_empty() {
            if let Some(w) = m.waitset.pop() {
                wake_thread(sched, threads, history, cur, w);
            }
        }
        true
    });
    if !ok {
        engine.fail(
            TestResult::UserAssertFailed,
            "shared unlock without holding the lock",
        );
    }
    engine.op_point(cx);
}

/// A simulated exclusive mutex.
pub struct Mutex {
    engine: Arc<Engine>,
    slot: usize,
}

impl Mutex {
    /// A plain, non-recursive mutex.
    #[must_use]
    pub fn new(cx: &Cx) -> Self {
        Self::with_options(cx, MutexOptions::default())
    }

    /// A mutex whose owner may lock it again.
    #[must_use]
    pub fn recursive(cx: &Cx) -> Self {
        Self::with_options(
            cx,
            MutexOptions {
                recursive: true,
                ..MutexOptions::default()
            },
        )
    }

    /// A mutex whose `try_lock` may fail spuriously; useful for testing
    /// lock-free fallbacks.
    #[must_use]
    pub fn with_failing_try_lock(cx: &Cx) -> Self {
        Self::with_options(
            cx,
            MutexOptions {
                failing_try_lock: true,
                ..MutexOptions::default()
            },
        )
    }

    fn with_options(cx: &Cx, options: MutexOptions) -> Self {
        let engine = cx.engine_arc();
        let slot = engine.mutex_create(options);
        Self { engine, slot }
    }

    /// Block until the mutex is acquired.
    pub fn lock<'a>(&'a self, cx: &Cx) -> MutexGuard<'a> {
        lock_exclusive(&self.engine, cx, self.slot, false);
        MutexGuard { mutex: self }
    }

    /// Attempt to acquire without blocking.
    pub fn try_lock<'a>(&'a self, cx: &Cx) -> Option<MutexGuard<'a>> {
        lock_exclusive(&self.engine, cx, self.slot, true).then(|| MutexGuard { mutex: self })
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        self.engine.mutex_release(self.slot);
    }
}

impl std::fmt::Debug for Mutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutex").field("slot", &self.slot).finish()
    }
}

/// Exclusive lock guard; unlocks on drop.
pub struct MutexGuard<'a> {
    pub(crate) mutex: &'a Mutex,
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        let engine = self.mutex.engine();
        let cx = Cx::new(Arc::clone(engine));
        unlock_exclusive(engine, &cx, self.mutex.slot());
    }
}

/// A simulated reader-writer mutex.
pub struct RwMutex {
    engine: Arc<Engine>,
    slot: usize,
}

impl RwMutex {
    #[must_use]
    pub fn new(cx: &Cx) -> Self {
        let engine = cx.engine_arc();
        let slot = engine.mutex_create(MutexOptions {
            rw: true,
            ..MutexOptions::default()
        });
        Self { engine, slot }
    }

    /// Acquire a shared (read) hold.
    pub fn read<'a>(&'a self, cx: &Cx) -> RwReadGuard<'a> {
        lock_shared(&self.engine, cx, self.slot, false);
        RwReadGuard { mutex: self }
    }

    /// Acquire the exclusive (write) side.
    pub fn write<'a>(&'a self, cx: &Cx) -> RwWriteGuard<'a> {
        lock_exclusive(&self.engine, cx, self.slot, false);
        RwWriteGuard { mutex: self }
    }

    /// Non-blocking shared acquire.
    pub fn try_read<'a>(&'a self, cx: &Cx) -> Option<RwReadGuard<'a>> {
        lock_shared(&self.engine, cx, self.slot, true).then(|| RwReadGuard { mutex: self })
    }

    /// Non-blocking exclusive acquire.
    pub fn try_write<'a>(&'a self, cx: &Cx) -> Option<RwWriteGuard<'a>> {
        lock_exclusive(&self.engine, cx, self.slot, true).then(|| RwWriteGuard { mutex: self })
    }
}

impl Drop for RwMutex {
    fn drop(&mut self) {
        self.engine.mutex_release(self.slot);
    }
}

impl std::fmt::Debug for RwMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwMutex").field("slot", &self.slot).finish()
    }
}

/// Shared hold on an [`RwMutex`].
pub struct RwReadGuard<'a> {
    mutex: &'a RwMutex,
}

impl Drop for RwReadGuard<'_> {
    fn drop(&mut self) {
        let cx = Cx::new(Arc::clone(&self.mutex.engine));
        unlock_shared(&self.mutex.engine, &cx, self.mutex.slot);
    }
}

/// Exclusive hold on an [`RwMutex`].
pub struct RwWriteGuard<'a> {
    mutex: &'a RwMutex,
}

impl Drop for RwWriteGuard<'_> {
    fn drop(&mut self) {
        let cx = Cx::new(Arc::clone(&self.mutex.engine));
        unlock_exclusive(&self.mutex.engine, &cx, self.mutex.slot);
    }
}
