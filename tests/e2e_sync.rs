//! Synchronization-object scenarios: Peterson's lock, mutex discipline,
//! deadlock, livelock, condvars, semaphores, and events.

use racelab::{
    check, check_params, Atomic, Condvar, Cx, Event, Mutex, Ordering, Params, RwMutex,
    SearchKind, Semaphore, TestResult, TestSuite, Var,
};

/// Peterson's mutual exclusion with seq-cst operations: the critical
/// section is exclusive in every interleaving, which the plain-variable
/// counter proves (a violation would be a data race).
struct Peterson {
    flag: [Atomic<bool>; 2],
    victim: Atomic<usize>,
    in_cs: Var<u32>,
}

impl Peterson {
    fn acquire(&self, cx: &Cx, me: usize) {
        self.flag[me].store(cx, true, Ordering::SeqCst);
        self.victim.store(cx, me, Ordering::SeqCst);
        while self.flag[1 - me].load(cx, Ordering::SeqCst)
            && self.victim.load(cx, Ordering::SeqCst) == me
        {
            cx.yield_now();
        }
    }

    fn release(&self, cx: &Cx, me: usize) {
        self.flag[me].store(cx, false, Ordering::SeqCst);
    }
}

impl TestSuite for Peterson {
    const THREADS: usize = 2;

    fn new(cx: &Cx) -> Self {
        Self {
            flag: std::array::from_fn(|_| Atomic::new(cx)),
            victim: Atomic::new(cx),
            in_cs: Var::init(cx, 0),
        }
    }

    fn before(&self, cx: &Cx) {
        self.flag[0].store(cx, false, Ordering::SeqCst);
        self.flag[1].store(cx, false, Ordering::SeqCst);
        self.victim.store(cx, 0, Ordering::SeqCst);
    }

    fn thread(&self, cx: &Cx, index: usize) {
        self.acquire(cx, index);
        let v = self.in_cs.load(cx);
        self.in_cs.store(cx, v + 1);
        self.release(cx, index);
    }

    fn after(&self, cx: &Cx) {
        cx.ensure(self.in_cs.load(cx) == 2, "both critical sections ran");
    }
}

#[test]
fn peterson_mutual_exclusion_holds() {
    check_params::<Peterson>(
        Params::new()
            .search(SearchKind::FullSearch)
            .iterations(20_000)
            .quiet(),
    );
}

/// Peterson with one flag store weakened to relaxed: the protocol no
/// longer orders the critical sections, and the counter accesses race.
struct PetersonBroken {
    flag: [Atomic<bool>; 2],
    victim: Atomic<usize>,
    in_cs: Var<u32>,
}

impl TestSuite for PetersonBroken {
    const THREADS: usize = 2;
    const EXPECTED: TestResult = TestResult::DataRace;

    fn new(cx: &Cx) -> Self {
        Self {
            flag: std::array::from_fn(|_| Atomic::new(cx)),
            victim: Atomic::new(cx),
            in_cs: Var::init(cx, 0),
        }
    }

    fn before(&self, cx: &Cx) {
        self.flag[0].store(cx, false, Ordering::SeqCst);
        self.flag[1].store(cx, false, Ordering::SeqCst);
        self.victim.store(cx, 0, Ordering::SeqCst);
    }

    fn thread(&self, cx: &Cx, index: usize) {
        // Relaxed: the other thread may miss this flag entirely.
        self.flag[index].store(cx, true, Ordering::Relaxed);
        self.victim.store(cx, index, Ordering::SeqCst);
        while self.flag[1 - index].load(cx, Ordering::SeqCst)
            && self.victim.load(cx, Ordering::SeqCst) == index
        {
            cx.yield_now();
        }
        let v = self.in_cs.load(cx);
        self.in_cs.store(cx, v + 1);
        self.flag[index].store(cx, false, Ordering::SeqCst);
    }
}

#[test]
fn peterson_with_relaxed_flag_store_races() {
    check_params::<PetersonBroken>(
        Params::new()
            .search(SearchKind::FullSearch)
            .iterations(20_000)
            .quiet(),
    );
}

/// A mutex-protected counter reports success under every scheduler: no
/// false positives on disciplined code.
struct LockedCounter {
    lock: Mutex,
    count: Var<u32>,
}

impl TestSuite for LockedCounter {
    const THREADS: usize = 3;

    fn new(cx: &Cx) -> Self {
        Self {
            lock: Mutex::new(cx),
            count: Var::init(cx, 0),
        }
    }

    fn thread(&self, cx: &Cx, _index: usize) {
        let guard = self.lock.lock(cx);
        let v = self.count.load(cx);
        self.count.store(cx, v + 1);
        drop(guard);
    }

    fn after(&self, cx: &Cx) {
        cx.ensure(self.count.load(cx) == 3, "all increments kept");
    }
}

#[test]
fn locked_counter_has_no_false_positives() {
    check_params::<LockedCounter>(
        Params::new()
            .search(SearchKind::Random)
            .iterations(2_000)
            .quiet(),
    );
    check_params::<LockedCounter>(
        Params::new()
            .search(SearchKind::FullSearch)
            .iterations(20_000)
            .quiet(),
    );
    check_params::<LockedCounter>(
        Params::new()
            .search(SearchKind::ContextBound)
            .context_bound(2)
            .iterations(20_000)
            .quiet(),
    );
}

/// Two mutexes taken in opposite order: the classic deadlock, found
/// within a handful of iterations under full search.
struct OppositeOrder {
    a: Mutex,
    b: Mutex,
}

impl TestSuite for OppositeOrder {
    const THREADS: usize = 2;
    const EXPECTED: TestResult = TestResult::Deadlock;

    fn new(cx: &Cx) -> Self {
        Self {
            a: Mutex::new(cx),
            b: Mutex::new(cx),
        }
    }

    fn thread(&self, cx: &Cx, index: usize) {
        if index == 0 {
            let first = self.a.lock(cx);
            let second = self.b.lock(cx);
            drop(second);
            drop(first);
        } else {
            let first = self.b.lock(cx);
            let second = self.a.lock(cx);
            drop(second);
            drop(first);
        }
    }
}

#[test]
fn opposite_lock_order_deadlocks_quickly() {
    let report = check::<OppositeOrder>(SearchKind::FullSearch);
    assert!(
        report.stop_iteration <= 16,
        "deadlock took {} iterations",
        report.stop_iteration
    );
}

/// Two threads bouncing a value with CAS forever: no iteration
/// terminates, so the step bound reports livelock.
struct CasPingPong {
    x: Atomic<u32>,
}

impl TestSuite for CasPingPong {
    const THREADS: usize = 2;
    const EXPECTED: TestResult = TestResult::Livelock;

    fn new(cx: &Cx) -> Self {
        Self { x: Atomic::new(cx) }
    }

    fn before(&self, cx: &Cx) {
        self.x.store(cx, 0, Ordering::Relaxed);
    }

    fn thread(&self, cx: &Cx, _index: usize) {
        loop {
            let _ = self
                .x
                .compare_exchange(cx, 0, 1, Ordering::AcqRel, Ordering::Relaxed);
            let _ = self
                .x
                .compare_exchange(cx, 1, 0, Ordering::AcqRel, Ordering::Relaxed);
        }
    }
}

#[test]
fn endless_cas_spin_is_reported_as_livelock() {
    check_params::<CasPingPong>(
        Params::new()
            .search(SearchKind::FullSearch)
            .depth_limit(300)
            .quiet(),
    );
}

/// Condvar handoff with the predicate checked under the mutex: no lost
/// wakeups, no deadlock, in any interleaving.
struct CondvarHandoff {
    lock: Mutex,
    cond: Condvar,
    ready: Var<bool>,
}

impl TestSuite for CondvarHandoff {
    const THREADS: usize = 2;

    fn new(cx: &Cx) -> Self {
        Self {
            lock: Mutex::new(cx),
            cond: Condvar::new(cx),
            ready: Var::init(cx, false),
        }
    }

    fn thread(&self, cx: &Cx, index: usize) {
        if index == 0 {
            let guard = self.lock.lock(cx);
            self.ready.store(cx, true);
            drop(guard);
            self.cond.notify_one(cx);
        } else {
            let mut guard = self.lock.lock(cx);
            while !self.ready.load(cx) {
                guard = self.cond.wait(cx, guard);
            }
            drop(guard);
        }
    }
}

#[test]
fn condvar_predicate_loop_never_loses_wakeups() {
    check_params::<CondvarHandoff>(
        Params::new()
            .search(SearchKind::FullSearch)
            .iterations(20_000)
            .quiet(),
    );
}

/// Semaphore as a bounded handoff: two producers post, two permits end
/// up consumed.
struct SemaphoreHandoff {
    sem: Semaphore,
    produced: Atomic<u32>,
}

impl TestSuite for SemaphoreHandoff {
    const THREADS: usize = 3;

    fn new(cx: &Cx) -> Self {
        Self {
            sem: Semaphore::new(cx, 0, 4),
            produced: Atomic::new(cx),
        }
    }

    fn before(&self, cx: &Cx) {
        self.produced.store(cx, 0, Ordering::Relaxed);
    }

    fn thread(&self, cx: &Cx, index: usize) {
        if index < 2 {
            self.produced.fetch_add(cx, 1, Ordering::Release);
            cx.ensure(self.sem.post(cx, 1), "max count not exceeded");
        } else {
            self.sem.acquire(cx);
            self.sem.acquire(cx);
            let seen = self.produced.load(cx, Ordering::Acquire);
            cx.ensure(seen == 2, "both productions visible after both permits");
        }
    }
}

#[test]
fn semaphore_transfers_happens_before() {
    check_params::<SemaphoreHandoff>(
        Params::new()
            .search(SearchKind::FullSearch)
            .iterations(20_000)
            .quiet(),
    );
}

/// Manual-reset event releases every waiter; the payload written before
/// `set` is visible after `wait`.
struct EventBroadcast {
    go: Event,
    payload: Var<u32>,
}

impl TestSuite for EventBroadcast {
    const THREADS: usize = 3;

    fn new(cx: &Cx) -> Self {
        Self {
            go: Event::manual(cx, false),
            payload: Var::init(cx, 0),
        }
    }

    fn thread(&self, cx: &Cx, index: usize) {
        if index == 0 {
            self.payload.store(cx, 7);
            self.go.set(cx);
        } else {
            self.go.wait(cx);
            cx.ensure(self.payload.load(cx) == 7, "payload published by set");
        }
    }
}

#[test]
fn manual_event_releases_all_waiters() {
    check_params::<EventBroadcast>(
        Params::new()
            .search(SearchKind::FullSearch)
            .iterations(20_000)
            .quiet(),
    );
}

/// Reader-writer lock: concurrent readers are legal, the writer is
/// exclusive.
struct RwCounter {
    lock: RwMutex,
    value: Var<u32>,
}

impl TestSuite for RwCounter {
    const THREADS: usize = 3;

    fn new(cx: &Cx) -> Self {
        Self {
            lock: RwMutex::new(cx),
            value: Var::init(cx, 0),
        }
    }

    fn thread(&self, cx: &Cx, index: usize) {
        if index == 0 {
            let guard = self.lock.write(cx);
            let v = self.value.load(cx);
            self.value.store(cx, v + 1);
            drop(guard);
        } else {
            let guard = self.lock.read(cx);
            let v = self.value.load(cx);
            cx.ensure(v <= 1, "value only ever incremented once");
            drop(guard);
        }
    }
}

#[test]
fn rw_lock_allows_readers_excludes_writer() {
    check_params::<RwCounter>(
        Params::new()
            .search(SearchKind::FullSearch)
            .iterations(20_000)
            .quiet(),
    );
}

/// A recursive mutex tolerates nested locking by its owner.
struct RecursiveLock {
    lock: Mutex,
    value: Var<u32>,
}

impl TestSuite for RecursiveLock {
    const THREADS: usize = 2;

    fn new(cx: &Cx) -> Self {
        Self {
            lock: Mutex::recursive(cx),
            value: Var::init(cx, 0),
        }
    }

    fn thread(&self, cx: &Cx, _index: usize) {
        let outer = self.lock.lock(cx);
        let inner = self.lock.lock(cx);
        let v = self.value.load(cx);
        self.value.store(cx, v + 1);
        drop(inner);
        drop(outer);
    }

    fn after(&self, cx: &Cx) {
        cx.ensure(self.value.load(cx) == 2, "nested sections both ran");
    }
}

#[test]
fn recursive_mutex_supports_nesting() {
    check_params::<RecursiveLock>(
        Params::new()
            .search(SearchKind::FullSearch)
            .iterations(20_000)
            .quiet(),
    );
}
