//! The iteration driver: parameters, the fiber workers, and the
//! simulate/replay pipeline.
//!
//! `simulate` runs iterations until the scheduler exhausts its search
//! space, a failure occurs, or the iteration budget runs out. On failure
//! without history collection it serializes the scheduler state of the
//! offending iteration, re-runs that single iteration with history
//! collection, and requires the identical verdict — anything else is the
//! non-deterministic-test meta-error.

use crate::context::{Cx, Engine, EngineConfig};
use crate::fiber::{ShutdownSignal, MAIN_FIBER};
use crate::report::{SimError, SimReport, TestResult};
use crate::sched::{ContextBoundScheduler, FullSearchScheduler, RandomScheduler, Scheduler};
use crate::suite::TestSuite;
use crate::types::{FinishResult, Iteration, SearchKind, ThreadId, PROGRESS_PERIOD};
use parking_lot::Mutex as PlMutex;
use std::io::{self, Write};
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle as OsJoinHandle;

/// Simulation parameters.
///
/// Builder methods consume `self`; the struct is handed mutably to
/// [`simulate`], which writes `final_state` back on failure.
pub struct Params {
    /// Search strategy.
    pub search: SearchKind,
    /// Iteration budget. The random scheduler stops here; exhaustive
    /// schedulers stop earlier if the space is walked.
    pub iteration_count: Iteration,
    /// Scheduling steps allowed per iteration before a livelock verdict.
    pub execution_depth_limit: u64,
    /// Preemption budget for [`SearchKind::ContextBound`].
    pub context_bound: u32,
    /// Base seed for the random scheduler.
    pub seed: u64,
    /// Collect history during the first run (skips the replay step).
    pub collect_history: bool,
    /// Print the step-by-step history to the output stream on failure.
    pub output_history: bool,
    /// Scheduler state to resume from (`"<iteration> <blob>"`).
    pub initial_state: Option<String>,
    /// Written on failure: the state that replays the failing iteration.
    pub final_state: Option<String>,
    /// Failure reports and history go here.
    pub output: Box<dyn Write + Send>,
    /// Periodic progress goes here.
    pub progress: Box<dyn Write + Send>,
}

impl Params {
    /// Defaults: random search, 1000 iterations, depth limit 2000.
    #[must_use]
    pub fn new() -> Self {
        Self {
            search: SearchKind::Random,
            iteration_count: 1000,
            execution_depth_limit: 2000,
            context_bound: 2,
            seed: 0x5eed_1e55,
            collect_history: false,
            output_history: false,
            initial_state: None,
            final_state: None,
            output: Box::new(io::stdout()),
            progress: Box::new(io::stderr()),
        }
    }

    /// Select the search strategy.
    #[must_use]
    pub fn search(mut self, search: SearchKind) -> Self {
        self.search = search;
        self
    }

    /// Set the iteration budget.
    #[must_use]
    pub fn iterations(mut self, count: Iteration) -> Self {
        self.iteration_count = count;
        self
    }

    /// Set the per-iteration scheduling step bound.
    #[must_use]
    pub fn depth_limit(mut self, limit: u64) -> Self {
        self.execution_depth_limit = limit;
        self
    }

    /// Set the preemption budget for context-bound search.
    #[must_use]
    pub fn context_bound(mut self, bound: u32) -> Self {
        self.context_bound = bound;
        self
    }

    /// Set the random scheduler seed.
    #[must_use]
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Collect history during the first run.
    #[must_use]
    pub fn collect_history(mut self, on: bool) -> Self {
        self.collect_history = on;
        self
    }

    /// Print the history on failure.
    #[must_use]
    pub fn output_history(mut self, on: bool) -> Self {
        self.output_history = on;
        self
    }

    /// Resume from a serialized scheduler state.
    #[must_use]
    pub fn initial_state(mut self, state: impl Into<String>) -> Self {
        self.initial_state = Some(state.into());
        self
    }

    /// Redirect failure output.
    #[must_use]
    pub fn output(mut self, w: Box<dyn Write + Send>) -> Self {
        self.output = w;
        self
    }

    /// Redirect progress output.
    #[must_use]
    pub fn progress(mut self, w: Box<dyn Write + Send>) -> Self {
        self.progress = w;
        self
    }

    /// Silence both streams; used by the check helpers.
    #[must_use]
    pub fn quiet(self) -> Self {
        self.output(Box::new(io::sink())).progress(Box::new(io::sink()))
    }
}

impl Default for Params {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Params {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Params")
            .field("search", &self.search)
            .field("iteration_count", &self.iteration_count)
            .field("execution_depth_limit", &self.execution_depth_limit)
            .field("context_bound", &self.context_bound)
            .field("seed", &self.seed)
            .field("collect_history", &self.collect_history)
            .field("output_history", &self.output_history)
            .field("initial_state", &self.initial_state)
            .field("final_state", &self.final_state)
            .finish_non_exhaustive()
    }
}

type SuiteSlot<T> = Arc<PlMutex<Option<Arc<T>>>>;

/// One simulation: the engine plus its parked fiber threads.
struct Sim<T: TestSuite> {
    engine: Arc<Engine>,
    suite: SuiteSlot<T>,
    workers: Vec<OsJoinHandle<()>>,
}

impl<T: TestSuite> Sim<T> {
    fn new(cfg: EngineConfig, sched: Box<dyn Scheduler>) -> Self {
        let capacity = cfg.thread_capacity();
        let engine = Arc::new(Engine::new(cfg, sched));
        let suite: SuiteSlot<T> = Arc::new(PlMutex::new(None));
        let workers = (0..capacity)
            .map(|i| {
                let engine = Arc::clone(&engine);
                let suite = Arc::clone(&suite);
                std::thread::Builder::new()
                    .name(format!("racelab-fiber-{i}"))
                    .spawn(move || worker_main::<T>(engine, suite, i))
                    .expect("failed to spawn fiber thread")
            })
            .collect();
        Self {
            engine,
            suite,
            workers,
        }
    }

    /// Run one iteration to its verdict.
    fn run_iteration(&self, iter: Iteration) -> (TestResult, String) {
        let initial = self.engine.begin_iteration(iter);
        self.engine.run_from_main(initial);
        self.engine.iteration_verdict()
    }

    fn search_exhausted(&self) -> bool {
        self.engine.search_exhausted()
    }

    fn state_string(&self, iter: Iteration) -> String {
        format!("{iter} {}", self.engine.state_blob())
    }

    fn history_text(&self) -> String {
        self.engine.history_text()
    }

    /// Unwind and join every fiber thread, then break reference cycles.
    fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.engine.fibers().begin_shutdown();
        for i in 0..self.workers.len() {
            self.engine.fibers().switch(MAIN_FIBER, i);
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        self.engine.clear_iteration_refs();
        self.suite.lock().take();
    }
}

impl<T: TestSuite> Drop for Sim<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Entry point of a fiber OS thread: wait for the first activation, run
/// the iteration loop, and always hand the baton back on the way out.
fn worker_main<T: TestSuite>(engine: Arc<Engine>, suite: SuiteSlot<T>, me: ThreadId) {
    let cx = Cx::new(Arc::clone(&engine));
    engine.fibers().wait_for(me);
    let _ = catch_unwind(AssertUnwindSafe(|| worker_loop::<T>(&cx, &suite, me)));
    engine.fibers().pass(MAIN_FIBER);
}

/// The per-fiber iteration loop, mirroring the cooperative lifecycle:
/// optional first-thread prologue, the thread body, then finish
/// bookkeeping. The loop parks inside the engine between iterations and
/// resumes here when scheduled again.
fn worker_loop<T: TestSuite>(cx: &Cx, suite: &SuiteSlot<T>, me: ThreadId) {
    let engine = cx.engine();
    loop {
        if engine.fibers().is_shutdown() {
            return;
        }
        if engine.take_first_thread() {
            let prologue = catch_unwind(AssertUnwindSafe(|| {
                engine.push_marker("[construct]");
                engine.enter_special();
                let constructed = Arc::new(T::new(cx));
                *suite.lock() = Some(Arc::clone(&constructed));
                let hook = {
                    let s = Arc::clone(&constructed);
                    Arc::new(move |cx: &Cx| s.invariant(cx)) as Arc<dyn Fn(&Cx) + Send + Sync>
                };
                engine.set_invariant_hook(hook);
                engine.push_marker("[before]");
                constructed.before(cx);
                engine.exit_special();
                engine.global_fence_all();
                engine.run_invariant_once(cx);
            }));
            if let Err(payload) = prologue {
                handle_user_panic(engine, payload);
            }
        }
        engine.thread_started(me);
        let body = catch_unwind(AssertUnwindSafe(|| {
            if me < T::THREADS {
                let instance = suite
                    .lock()
                    .clone()
                    .expect("suite is constructed before thread bodies run");
                instance.thread(cx, me);
            } else if let Some(entry) = engine.dynamic_entry(me) {
                entry(cx);
            }
        }));
        if let Err(payload) = body {
            handle_user_panic(engine, payload);
        }
        engine.thread_body_finished(me);
        match engine.scheduler_thread_finished() {
            FinishResult::Normal => {
                // Hand control onward; returns when this fiber is
                // scheduled again in a later iteration.
                engine.op_point(cx);
            }
            FinishResult::Last => {
                let epilogue = catch_unwind(AssertUnwindSafe(|| {
                    engine.run_invariant_once(cx);
                    engine.global_fence_all();
                    engine.push_marker("[after]");
                    engine.enter_special();
                    let instance = suite.lock().take();
                    if let Some(s) = &instance {
                        s.after(cx);
                    }
                    engine.exit_special();
                    engine.clear_invariant_hook();
                    drop(instance);
                    engine.check_leaks();
                }));
                if let Err(payload) = epilogue {
                    handle_user_panic(engine, payload);
                }
                engine.iteration_complete();
            }
            FinishResult::Deadlock => {
                engine.fail(TestResult::Deadlock, "deadlock detected");
            }
        }
    }
}

/// Convert a caught panic from user code into a verdict; shutdown
/// unwinding passes through.
fn handle_user_panic(engine: &Engine, payload: Box<dyn std::any::Any + Send>) {
    if payload.is::<ShutdownSignal>() {
        resume_unwind(payload);
    }
    let message = payload
        .downcast_ref::<&'static str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic in test code".to_string());
    engine.fail(TestResult::UserAssertFailed, &message);
}

fn build_scheduler(params: &Params, static_threads: usize, capacity: usize) -> Box<dyn Scheduler> {
    match params.search {
        SearchKind::Random => Box::new(RandomScheduler::new(
            static_threads,
            capacity,
            params.seed,
            params.iteration_count,
        )),
        SearchKind::FullSearch => Box::new(FullSearchScheduler::new(static_threads, capacity)),
        SearchKind::ContextBound => Box::new(ContextBoundScheduler::new(
            static_threads,
            capacity,
            params.context_bound,
        )),
    }
}

fn parse_state(state: &str) -> Result<(Iteration, serde_json::Value), SimError> {
    let (iter, blob) = state
        .split_once(' ')
        .ok_or_else(|| SimError::StateParse("missing iteration prefix".into()))?;
    let iter: Iteration = iter
        .parse()
        .map_err(|e| SimError::StateParse(format!("bad iteration number: {e}")))?;
    let blob: serde_json::Value =
        serde_json::from_str(blob).map_err(|e| SimError::StateParse(e.to_string()))?;
    Ok((iter, blob))
}

/// Outcome of one exploration pass.
struct PassOutcome {
    result: TestResult,
    message: String,
    stop_iteration: Iteration,
    state: Option<String>,
    history: Option<String>,
}

fn explore<T: TestSuite>(
    params: &mut Params,
    collect_history: bool,
) -> Result<PassOutcome, SimError> {
    let capacity = T::THREADS + T::DYNAMIC_THREADS;
    let mut sched = build_scheduler(params, T::THREADS, capacity);
    let mut start_iteration: Iteration = 1;
    if let Some(init) = &params.initial_state {
        let (iter, blob) = parse_state(init)?;
        sched.set_state(&blob)?;
        start_iteration = iter;
    }
    let cfg = EngineConfig {
        static_threads: T::THREADS,
        dynamic_threads: T::DYNAMIC_THREADS,
        execution_depth_limit: params.execution_depth_limit,
        collect_history,
        defer_denominator: if params.search == SearchKind::Random {
            4
        } else {
            2
        },
    };
    let mut sim = Sim::<T>::new(cfg, sched);
    let total = params.iteration_count;
    let mut iter = start_iteration;
    let outcome = loop {
        let (result, message) = sim.run_iteration(iter);
        if result.is_failure() {
            break PassOutcome {
                result,
                message,
                stop_iteration: iter,
                state: Some(sim.state_string(iter)),
                history: collect_history.then(|| sim.history_text()),
            };
        }
        if iter % PROGRESS_PERIOD == 0 {
            let pct = if total > 0 { iter * 100 / total } else { 0 };
            let _ = writeln!(params.progress, "{pct}% ({iter}/{total})");
        }
        if sim.search_exhausted() || iter >= params.iteration_count {
            break PassOutcome {
                result: TestResult::Success,
                message: String::new(),
                stop_iteration: iter,
                state: None,
                history: None,
            };
        }
        iter += 1;
    };
    sim.shutdown();
    Ok(outcome)
}

/// Run the simulation described by `params` over test suite `T`.
///
/// On failure, `params.final_state` receives the scheduler state that
/// replays the failing iteration, and the failure (with history, when
/// `output_history` is set) is written to the output stream.
///
/// # Errors
///
/// [`SimError::Config`] for an unusable parameter set,
/// [`SimError::StateParse`] for a malformed `initial_state`, and
/// [`SimError::NonDeterministic`] when the replay run does not reproduce
/// the original failure.
pub fn simulate<T: TestSuite>(params: &mut Params) -> Result<SimReport, SimError> {
    if T::THREADS == 0 {
        return Err(SimError::Config("at least one static thread required".into()));
    }
    if params.iteration_count == 0 {
        return Err(SimError::Config("iteration count must be non-zero".into()));
    }
    let first = explore::<T>(params, params.collect_history)?;
    if !first.result.is_failure() {
        return Ok(SimReport {
            result: TestResult::Success,
            message: None,
            stop_iteration: first.stop_iteration,
            final_state: None,
        });
    }
    params.final_state.clone_from(&first.state);
    let history = if let Some(h) = first.history {
        // History was collected on the first pass; no replay needed.
        Some(h)
    } else {
        // Replay the failing iteration with history collection and
        // require the identical outcome.
        let saved = params.initial_state.take();
        params.initial_state.clone_from(&first.state);
        let second = explore::<T>(params, true)?;
        params.initial_state = saved;
        if second.result != first.result || second.stop_iteration != first.stop_iteration {
            return Err(SimError::NonDeterministic {
                first: first.result,
                first_iteration: first.stop_iteration,
                second: second.result,
                second_iteration: second.stop_iteration,
            });
        }
        second.history
    };
    let _ = writeln!(
        params.output,
        "{} ({}), iteration {}",
        first.result, first.message, first.stop_iteration
    );
    if params.output_history {
        if let Some(h) = &history {
            let _ = params.output.write_all(h.as_bytes());
        }
    }
    Ok(SimReport {
        result: first.result,
        message: Some(first.message),
        stop_iteration: first.stop_iteration,
        final_state: first.state,
    })
}

/// Run `T` under `search` with quiet defaults and assert its expected
/// verdict. Panics on mismatch; test-harness sugar.
pub fn check<T: TestSuite>(search: SearchKind) -> SimReport {
    check_params::<T>(Params::new().search(search).quiet())
}

/// As [`check`], with explicit parameters.
pub fn check_params<T: TestSuite>(mut params: Params) -> SimReport {
    let report = match simulate::<T>(&mut params) {
        Ok(report) => report,
        Err(e) => panic!("simulation error: {e}"),
    };
    assert_eq!(
        report.result,
        T::EXPECTED,
        "expected verdict {}, got {} ({})",
        T::EXPECTED,
        report.result,
        report.message.as_deref().unwrap_or("")
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_state_round_trip() {
        let (iter, blob) = parse_state("42 {\"seed\":7}").unwrap();
        assert_eq!(iter, 42);
        assert_eq!(blob["seed"], 7);
    }

    #[test]
    fn parse_state_rejects_garbage() {
        assert!(parse_state("noseparator").is_err());
        assert!(parse_state("x {}").is_err());
        assert!(parse_state("3 not-json").is_err());
    }

    #[test]
    fn params_builder() {
        let p = Params::new()
            .search(SearchKind::FullSearch)
            .iterations(50)
            .depth_limit(100)
            .context_bound(3)
            .seed(9)
            .collect_history(true)
            .output_history(true);
        assert_eq!(p.search, SearchKind::FullSearch);
        assert_eq!(p.iteration_count, 50);
        assert_eq!(p.execution_depth_limit, 100);
        assert_eq!(p.context_bound, 3);
        assert_eq!(p.seed, 9);
        assert!(p.collect_history);
        assert!(p.output_history);
    }
}
