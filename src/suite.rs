//! The user test contract.

use crate::context::Cx;
use crate::report::TestResult;

/// A concurrency test executed by the simulation driver.
///
/// One instance is constructed per iteration, on the first scheduled
/// thread, and dropped after `after` runs. All hooks take `&self`: shared
/// state lives in the simulated cells ([`crate::Atomic`], [`crate::Var`],
/// the sync primitives), which provide the interior mutability under the
/// engine's serialization.
///
/// # Example
///
/// ```ignore
/// struct Counter {
///     lock: racelab::Mutex,
///     count: racelab::Var<u32>,
/// }
///
/// impl racelab::TestSuite for Counter {
///     const THREADS: usize = 3;
///
///     fn new(cx: &racelab::Cx) -> Self {
///         Self {
///             lock: racelab::Mutex::new(cx),
///             count: racelab::Var::init(cx, 0),
///         }
///     }
///
///     fn thread(&self, cx: &racelab::Cx, _index: usize) {
///         let _guard = self.lock.lock(cx);
///         let v = self.count.load(cx);
///         self.count.store(cx, v + 1);
///     }
///
///     fn after(&self, cx: &racelab::Cx) {
///         cx.ensure(self.count.load(cx) == 3, "all increments kept");
///     }
/// }
/// ```
pub trait TestSuite: Send + Sync + 'static {
    /// Number of static logical threads; `thread` runs once per index.
    const THREADS: usize;

    /// Capacity for threads created at runtime via [`Cx::spawn`].
    const DYNAMIC_THREADS: usize = 0;

    /// The verdict the driver's check helpers assert against.
    const EXPECTED: TestResult = TestResult::Success;

    /// Construct the per-iteration state. Runs before any thread body,
    /// outside the schedulable region.
    fn new(cx: &Cx) -> Self;

    /// Runs after construction, before the threads start. Not a
    /// schedulable region; its effects happen-before every thread.
    fn before(&self, _cx: &Cx) {}

    /// The body of logical thread `index`, `0 <= index < THREADS`.
    fn thread(&self, cx: &Cx, index: usize);

    /// Runs after the last thread finishes; its view is the join of all
    /// threads.
    fn after(&self, _cx: &Cx) {}

    /// Called at every scheduling point. Must be side-effect-free: reads
    /// and [`Cx::ensure`] only.
    fn invariant(&self, _cx: &Cx) {}
}
