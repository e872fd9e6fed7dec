//! Test verdicts, engine errors, and the simulation report.
//!
//! A simulation ends in exactly one [`TestResult`]. User-reachable failures
//! are values, never panics that escape the driver; engine misuse and
//! meta-failures (a test that does not replay deterministically) surface as
//! [`SimError`].

use crate::types::Iteration;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The verdict of a simulation run.
///
/// Every failure kind is fatal to the iteration that produced it; the
/// driver stops, replays it with history collection, and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TestResult {
    /// Every explored interleaving completed without violation.
    #[default]
    Success,
    /// `Cx::ensure` failed (or user code panicked) outside the invariant.
    UserAssertFailed,
    /// `Cx::ensure` failed while the invariant hook was executing.
    UserInvariantFailed,
    /// Conflicting plain-variable accesses without a happens-before edge.
    DataRace,
    /// A load observed a variable or atomic that was never stored to.
    UninitializedAccess,
    /// `free` of a pointer that is not a live allocation.
    DoubleFree,
    /// A tracked allocation was still live at iteration end.
    MemoryLeak,
    /// An engine object (atomic, var, mutex, ...) was still live at
    /// iteration end.
    ResourceLeak,
    /// All remaining threads blocked with no timer or spurious wakeup.
    Deadlock,
    /// The iteration exceeded the scheduling-step bound without progress.
    Livelock,
    /// `Cx::until` observed its condition; exploration stops by request.
    UntilConditionHit,
}

impl TestResult {
    /// Stable lowercase name, used in reports and state strings.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::UserAssertFailed => "user_assert_failed",
            Self::UserInvariantFailed => "user_invariant_failed",
            Self::DataRace => "data_race",
            Self::UninitializedAccess => "uninitialized_access",
            Self::DoubleFree => "double_free",
            Self::MemoryLeak => "memory_leak",
            Self::ResourceLeak => "resource_leak",
            Self::Deadlock => "deadlock",
            Self::Livelock => "livelock",
            Self::UntilConditionHit => "until_condition_hit",
        }
    }

    /// Process exit code for CLI harnesses: 0 for success, a distinct
    /// small integer per failure kind.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::UserAssertFailed => 10,
            Self::UserInvariantFailed => 11,
            Self::DataRace => 12,
            Self::UninitializedAccess => 13,
            Self::DoubleFree => 14,
            Self::MemoryLeak => 15,
            Self::ResourceLeak => 16,
            Self::Deadlock => 17,
            Self::Livelock => 18,
            Self::UntilConditionHit => 19,
        }
    }

    /// True for any verdict other than [`TestResult::Success`].
    #[must_use]
    pub const fn is_failure(self) -> bool {
        !matches!(self, Self::Success)
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors of the engine itself, as opposed to verdicts about the test.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// The replay run produced a different verdict than the original run.
    ///
    /// This almost always means the test consumed non-determinism outside
    /// the engine: wall clock, `std` RNG, or raw pointer values (use
    /// `Cx::rand` and `Cx::hash_ptr` instead).
    #[error(
        "non-deterministic test: first run ended with {first} at iteration \
         {first_iteration}, replay ended with {second} at iteration {second_iteration}"
    )]
    NonDeterministic {
        /// Verdict of the original run.
        first: TestResult,
        /// Iteration the original run stopped at.
        first_iteration: Iteration,
        /// Verdict of the replay run.
        second: TestResult,
        /// Iteration the replay run stopped at.
        second_iteration: Iteration,
    },

    /// A scheduler state string did not parse.
    #[error("malformed scheduler state: {0}")]
    StateParse(String),

    /// The parameter struct is inconsistent (e.g. zero threads).
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Outcome of [`crate::driver::simulate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimReport {
    /// Final verdict.
    pub result: TestResult,
    /// Human-readable detail attached to the verdict, if any.
    pub message: Option<String>,
    /// The iteration the run stopped at: the failing iteration, or the
    /// last iteration explored on success.
    pub stop_iteration: Iteration,
    /// Serialized scheduler state at the failing iteration (present on
    /// failure; feed back via `Params::initial_state` to replay).
    pub final_state: Option<String>,
}

impl SimReport {
    /// True when the run succeeded.
    #[must_use]
    pub fn passed(&self) -> bool {
        self.result == TestResult::Success
    }
}

impl fmt::Display for SimReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{} ({msg})", self.result),
            None => write!(f, "{}", self.result),
        }?;
        write!(f, ", iteration {}", self.stop_iteration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_distinct() {
        let all = [
            TestResult::Success,
            TestResult::UserAssertFailed,
            TestResult::UserInvariantFailed,
            TestResult::DataRace,
            TestResult::UninitializedAccess,
            TestResult::DoubleFree,
            TestResult::MemoryLeak,
            TestResult::ResourceLeak,
            TestResult::Deadlock,
            TestResult::Livelock,
            TestResult::UntilConditionHit,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.exit_code(), b.exit_code(), "{a} vs {b}");
            }
        }
        assert_eq!(TestResult::Success.exit_code(), 0);
    }

    #[test]
    fn failure_predicate() {
        assert!(!TestResult::Success.is_failure());
        assert!(TestResult::Deadlock.is_failure());
    }

    #[test]
    fn report_display() {
        let r = SimReport {
            result: TestResult::DataRace,
            message: Some("plain store".into()),
            stop_iteration: 7,
            final_state: None,
        };
        assert_eq!(r.to_string(), "data_race (plain store), iteration 7");
    }
}
