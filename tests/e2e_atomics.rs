//! Memory-model litmus tests: store buffering, message passing, IRIW,
//! and an SPSC ring buffer.

use racelab::{
    check, check_params, Atomic, Cx, Ordering, Params, SearchKind, TestResult, TestSuite, Var,
};

/// Store buffering with relaxed operations: the weak outcome (both
/// threads read zero) must be reachable, and the search is steered to
/// prove it via `until`.
struct StoreBufferingRelaxed {
    x: Atomic<u32>,
    y: Atomic<u32>,
    r0: Var<u32>,
    r1: Var<u32>,
}

impl TestSuite for StoreBufferingRelaxed {
    const THREADS: usize = 2;
    const EXPECTED: TestResult = TestResult::UntilConditionHit;

    fn new(cx: &Cx) -> Self {
        Self {
            x: Atomic::new(cx),
            y: Atomic::new(cx),
            r0: Var::init(cx, 99),
            r1: Var::init(cx, 99),
        }
    }

    fn before(&self, cx: &Cx) {
        self.x.store(cx, 0, Ordering::Relaxed);
        self.y.store(cx, 0, Ordering::Relaxed);
    }

    fn thread(&self, cx: &Cx, index: usize) {
        if index == 0 {
            self.x.store(cx, 1, Ordering::Relaxed);
            let r = self.y.load(cx, Ordering::Relaxed);
            self.r0.store(cx, r);
        } else {
            self.y.store(cx, 1, Ordering::Relaxed);
            let r = self.x.load(cx, Ordering::Relaxed);
            self.r1.store(cx, r);
        }
    }

    fn after(&self, cx: &Cx) {
        let r0 = self.r0.load(cx);
        let r1 = self.r1.load(cx);
        cx.until(r0 == 0 && r1 == 0, "store buffering outcome observed");
    }
}

#[test]
fn store_buffering_relaxed_outcome_is_reachable() {
    check::<StoreBufferingRelaxed>(SearchKind::FullSearch);
}

/// Store buffering with seq-cst operations: the weak outcome is
/// forbidden by the single total order.
struct StoreBufferingSeqCst {
    x: Atomic<u32>,
    y: Atomic<u32>,
    r0: Var<u32>,
    r1: Var<u32>,
}

impl TestSuite for StoreBufferingSeqCst {
    const THREADS: usize = 2;

    fn new(cx: &Cx) -> Self {
        Self {
            x: Atomic::new(cx),
            y: Atomic::new(cx),
            r0: Var::init(cx, 99),
            r1: Var::init(cx, 99),
        }
    }

    fn before(&self, cx: &Cx) {
        self.x.store(cx, 0, Ordering::SeqCst);
        self.y.store(cx, 0, Ordering::SeqCst);
    }

    fn thread(&self, cx: &Cx, index: usize) {
        if index == 0 {
            self.x.store(cx, 1, Ordering::SeqCst);
            let r = self.y.load(cx, Ordering::SeqCst);
            self.r0.store(cx, r);
        } else {
            self.y.store(cx, 1, Ordering::SeqCst);
            let r = self.x.load(cx, Ordering::SeqCst);
            self.r1.store(cx, r);
        }
    }

    fn after(&self, cx: &Cx) {
        let r0 = self.r0.load(cx);
        let r1 = self.r1.load(cx);
        cx.ensure(
            !(r0 == 0 && r1 == 0),
            "seq-cst store buffering must not read both zeros",
        );
    }
}

#[test]
fn store_buffering_seq_cst_forbids_weak_outcome() {
    check::<StoreBufferingSeqCst>(SearchKind::FullSearch);
}

/// Message passing with release/acquire: the payload is visible when the
/// flag is observed.
struct MessagePassing {
    data: Var<u32>,
    flag: Atomic<bool>,
}

impl TestSuite for MessagePassing {
    const THREADS: usize = 2;

    fn new(cx: &Cx) -> Self {
        Self {
            data: Var::new(cx),
            flag: Atomic::new(cx),
        }
    }

    fn before(&self, cx: &Cx) {
        self.flag.store(cx, false, Ordering::Relaxed);
        self.data.store(cx, 0);
    }

    fn thread(&self, cx: &Cx, index: usize) {
        if index == 0 {
            self.data.store(cx, 42);
            self.flag.store(cx, true, Ordering::Release);
        } else if self.flag.load(cx, Ordering::Acquire) {
            cx.ensure(self.data.load(cx) == 42, "published payload visible");
        }
    }
}

#[test]
fn message_passing_release_acquire_is_race_free() {
    check::<MessagePassing>(SearchKind::FullSearch);
}

/// Message passing with a relaxed flag: reading the payload after seeing
/// the flag is a data race (no happens-before edge).
struct MessagePassingRelaxed {
    data: Var<u32>,
    flag: Atomic<bool>,
}

impl TestSuite for MessagePassingRelaxed {
    const THREADS: usize = 2;
    const EXPECTED: TestResult = TestResult::DataRace;

    fn new(cx: &Cx) -> Self {
        Self {
            data: Var::new(cx),
            flag: Atomic::new(cx),
        }
    }

    fn before(&self, cx: &Cx) {
        self.flag.store(cx, false, Ordering::Relaxed);
        self.data.store(cx, 0);
    }

    fn thread(&self, cx: &Cx, index: usize) {
        if index == 0 {
            self.data.store(cx, 42);
            self.flag.store(cx, true, Ordering::Relaxed);
        } else if self.flag.load(cx, Ordering::Relaxed) {
            let _ = self.data.load(cx);
        }
    }
}

#[test]
fn message_passing_relaxed_flag_races() {
    check::<MessagePassingRelaxed>(SearchKind::FullSearch);
}

/// Independent reads of independent writes, with seq-cst fences between
/// the relaxed loads. The engine's fence modelling publishes observed
/// stores into the global seq-cst order, so the contradictory outcome
/// (the two readers disagreeing on the store order) is never produced.
struct IriwFences {
    x: Atomic<u32>,
    y: Atomic<u32>,
    r2x: Var<u32>,
    r2y: Var<u32>,
    r3x: Var<u32>,
    r3y: Var<u32>,
}

impl TestSuite for IriwFences {
    const THREADS: usize = 4;

    fn new(cx: &Cx) -> Self {
        Self {
            x: Atomic::new(cx),
            y: Atomic::new(cx),
            r2x: Var::init(cx, 0),
            r2y: Var::init(cx, 0),
            r3x: Var::init(cx, 0),
            r3y: Var::init(cx, 0),
        }
    }

    fn before(&self, cx: &Cx) {
        self.x.store(cx, 0, Ordering::Relaxed);
        self.y.store(cx, 0, Ordering::Relaxed);
    }

    fn thread(&self, cx: &Cx, index: usize) {
        match index {
            0 => self.x.store(cx, 1, Ordering::Relaxed),
            1 => self.y.store(cx, 1, Ordering::Relaxed),
            2 => {
                let rx = self.x.load(cx, Ordering::Relaxed);
                cx.fence(Ordering::SeqCst);
                let ry = self.y.load(cx, Ordering::Relaxed);
                self.r2x.store(cx, rx);
                self.r2y.store(cx, ry);
            }
            _ => {
                let ry = self.y.load(cx, Ordering::Relaxed);
                cx.fence(Ordering::SeqCst);
                let rx = self.x.load(cx, Ordering::Relaxed);
                self.r3x.store(cx, rx);
                self.r3y.store(cx, ry);
            }
        }
    }

    fn after(&self, cx: &Cx) {
        let forbidden = self.r2x.load(cx) == 1
            && self.r3y.load(cx) == 1
            && self.r2y.load(cx) == 0
            && self.r3x.load(cx) == 0;
        cx.ensure(!forbidden, "readers disagreed on the store order");
    }
}

#[test]
fn iriw_with_seq_cst_fences_never_splits_the_order() {
    check_params::<IriwFences>(
        Params::new()
            .search(SearchKind::Random)
            .iterations(10_000)
            .quiet(),
    );
}

/// Single-producer single-consumer ring buffer: release-store of the
/// tail publishes the slot writes; acquire-load of the tail licenses the
/// slot reads. No data race exists in any interleaving.
struct SpscRing {
    slots: [Var<u32>; 2],
    tail: Atomic<usize>,
}

impl TestSuite for SpscRing {
    const THREADS: usize = 2;

    fn new(cx: &Cx) -> Self {
        Self {
            slots: std::array::from_fn(|_| Var::new(cx)),
            tail: Atomic::new(cx),
        }
    }

    fn before(&self, cx: &Cx) {
        self.tail.store(cx, 0, Ordering::Relaxed);
        for slot in &self.slots {
            slot.store(cx, 0);
        }
    }

    fn thread(&self, cx: &Cx, index: usize) {
        if index == 0 {
            for i in 0..self.slots.len() {
                self.slots[i].store(cx, (i as u32 + 1) * 10);
                self.tail.store(cx, i + 1, Ordering::Release);
            }
        } else {
            let mut read = 0;
            while read < self.slots.len() {
                let t = self.tail.load(cx, Ordering::Acquire);
                while read < t {
                    let v = self.slots[read].load(cx);
                    cx.ensure(v == (read as u32 + 1) * 10, "slot published before tail");
                    read += 1;
                }
                if t < self.slots.len() {
                    cx.yield_now();
                }
            }
        }
    }
}

#[test]
fn spsc_ring_buffer_has_no_race() {
    check::<SpscRing>(SearchKind::FullSearch);
}

/// Relaxed fetch_add from every thread still counts exactly (atomicity
/// of read-modify-write), even though it orders nothing.
struct RelaxedCounter {
    count: Atomic<u32>,
}

impl TestSuite for RelaxedCounter {
    const THREADS: usize = 3;

    fn new(cx: &Cx) -> Self {
        Self {
            count: Atomic::new(cx),
        }
    }

    fn before(&self, cx: &Cx) {
        self.count.store(cx, 0, Ordering::Relaxed);
    }

    fn thread(&self, cx: &Cx, _index: usize) {
        self.count.fetch_add(cx, 1, Ordering::Relaxed);
    }

    fn after(&self, cx: &Cx) {
        let total = self.count.load(cx, Ordering::Relaxed);
        cx.ensure(total == 3, "every increment observed");
    }
}

#[test]
fn rmw_counter_never_loses_increments() {
    check::<RelaxedCounter>(SearchKind::FullSearch);
    check::<RelaxedCounter>(SearchKind::ContextBound);
}

/// A weak compare-exchange retry loop converges even though individual
/// attempts may fail spuriously (the search explores those failures).
struct WeakCasRetry {
    value: Atomic<u32>,
}

impl TestSuite for WeakCasRetry {
    const THREADS: usize = 2;

    fn new(cx: &Cx) -> Self {
        Self {
            value: Atomic::new(cx),
        }
    }

    fn before(&self, cx: &Cx) {
        self.value.store(cx, 0, Ordering::Relaxed);
    }

    fn thread(&self, cx: &Cx, _index: usize) {
        loop {
            let cur = self.value.load(cx, Ordering::Relaxed);
            match self.value.compare_exchange_weak(
                cx,
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(_) => cx.yield_now(),
            }
        }
    }

    fn after(&self, cx: &Cx) {
        cx.ensure(
            self.value.load(cx, Ordering::Relaxed) == 2,
            "both CAS loops landed",
        );
    }
}

#[test]
fn weak_cas_retry_loops_converge() {
    // Bounded: the search space is infinite (every retry may again fail
    // spuriously), so the run is capped rather than exhausted.
    check_params::<WeakCasRetry>(
        Params::new()
            .search(SearchKind::ContextBound)
            .iterations(300)
            .quiet(),
    );
}
