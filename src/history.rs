//! Execution history: the append-only event record behind failure reports.
//!
//! Each event carries the logical thread that performed it and enough data
//! to reconstruct what the interleaving did: which history entry a load
//! observed, which ordering a store used, which thread a wake promoted.
//! Collection is off during normal exploration and switched on for the
//! replay run, so the hot path pays one branch.

use crate::report::TestResult;
use crate::types::{Ordering, ThreadId};
use std::fmt;
use std::io::{self, Write};

/// The kind of synchronization object an event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// A mutex slot.
    Mutex,
    /// A condition-variable slot.
    Condvar,
    /// A semaphore slot.
    Semaphore,
    /// An event slot.
    Event,
    /// A logical thread's own sync handle (join target).
    Thread,
}

impl ObjectKind {
    const fn name(self) -> &'static str {
        match self {
            Self::Mutex => "mutex",
            Self::Condvar => "condvar",
            Self::Semaphore => "semaphore",
            Self::Event => "event",
            Self::Thread => "thread",
        }
    }
}

/// One recorded step of an execution.
#[derive(Debug, Clone)]
pub enum Event {
    /// Lifecycle marker (suite construction, before/after boundaries).
    Marker(&'static str),
    /// A logical thread began executing its body.
    ThreadStarted,
    /// A logical thread's body returned.
    ThreadFinished,
    /// A dynamic thread was created.
    ThreadCreated {
        /// Index assigned to the new thread.
        thread: ThreadId,
    },
    /// A tracked allocation.
    Alloc {
        /// Address of the block.
        addr: usize,
        /// Size in bytes.
        size: usize,
    },
    /// A tracked free.
    Free {
        /// Address of the block.
        addr: usize,
        /// Whether the block was deferred to iteration end.
        deferred: bool,
    },
    /// An atomic load and the history entry it chose to observe.
    AtomicLoad {
        /// Cell slot index.
        cell: usize,
        /// Distance from the newest store (0 = current value).
        age: usize,
        /// Observed value bits.
        value: u64,
        /// Load ordering.
        ordering: Ordering,
    },
    /// An atomic store.
    AtomicStore {
        /// Cell slot index.
        cell: usize,
        /// Stored value bits.
        value: u64,
        /// Store ordering.
        ordering: Ordering,
    },
    /// A read-modify-write.
    AtomicRmw {
        /// Cell slot index.
        cell: usize,
        /// Value bits before.
        prev: u64,
        /// Value bits after.
        value: u64,
        /// Operation ordering.
        ordering: Ordering,
        /// Whether stores were skipped since this thread last observed the
        /// cell.
        aba: bool,
    },
    /// A compare-exchange that did not store.
    CasFail {
        /// Cell slot index.
        cell: usize,
        /// Current value bits.
        current: u64,
        /// Expected value bits.
        expected: u64,
        /// Whether the failure was spurious (weak CAS).
        spurious: bool,
    },
    /// A thread fence.
    Fence {
        /// Fence ordering.
        ordering: Ordering,
    },
    /// A plain-variable load.
    VarLoad {
        /// Variable slot index.
        var: usize,
    },
    /// A plain-variable store.
    VarStore {
        /// Variable slot index.
        var: usize,
    },
    /// An operation on a synchronization object.
    SyncOp {
        /// Which kind of object.
        kind: ObjectKind,
        /// Slot index.
        slot: usize,
        /// Short operation name ("lock", "unlock", "signal", ...).
        op: &'static str,
    },
    /// The current thread blocked.
    Park {
        /// Whether the wait is timed.
        timed: bool,
        /// Whether spurious wakeups are allowed.
        allow_spurious: bool,
    },
    /// A parked thread was promoted to runnable.
    Unpark {
        /// The resumed thread.
        thread: ThreadId,
    },
    /// An explicit yield.
    Yield,
    /// Free-form user message (`Cx::trace`).
    UserMessage {
        /// The message.
        message: String,
    },
    /// The failure that ended the iteration.
    Failure {
        /// Verdict.
        result: TestResult,
        /// Detail.
        message: String,
    },
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Marker(m) => write!(f, "{m}"),
            Self::ThreadStarted => write!(f, "thread started"),
            Self::ThreadFinished => write!(f, "thread finished"),
            Self::ThreadCreated { thread } => write!(f, "created thread {thread}"),
            Self::Alloc { addr, size } => write!(f, "alloc {size} bytes at {addr:#x}"),
            Self::Free { addr, deferred } => {
                write!(f, "free {addr:#x}")?;
                if *deferred {
                    write!(f, " [deferred]")?;
                }
                Ok(())
            }
            Self::AtomicLoad {
                cell,
                age,
                value,
                ordering,
            } => {
                write!(f, "<atomic {cell}> load {value}, {ordering}")?;
                if *age > 0 {
                    write!(f, " (stale copy, {age} store(s) behind)")?;
                }
                Ok(())
            }
            Self::AtomicStore {
                cell,
                value,
                ordering,
            } => write!(f, "<atomic {cell}> store {value}, {ordering}"),
            Self::AtomicRmw {
                cell,
                prev,
                value,
                ordering,
                aba,
            } => {
                write!(f, "<atomic {cell}> rmw {prev} -> {value}, {ordering}")?;
                if *aba {
                    write!(f, " [ABA]")?;
                }
                Ok(())
            }
            Self::CasFail {
                cell,
                current,
                expected,
                spurious,
            } => {
                write!(
                    f,
                    "<atomic {cell}> cas failed, current {current}, expected {expected}"
                )?;
                if *spurious {
                    write!(f, " [spurious]")?;
                }
                Ok(())
            }
            Self::Fence { ordering } => write!(f, "fence, {ordering}"),
            Self::VarLoad { var } => write!(f, "<var {var}> load"),
            Self::VarStore { var } => write!(f, "<var {var}> store"),
            Self::SyncOp { kind, slot, op } => write!(f, "<{} {slot}> {op}", kind.name()),
            Self::Park {
                timed,
                allow_spurious,
            } => {
                write!(f, "blocking current thread")?;
                if *timed {
                    write!(f, " [timed]")?;
                }
                if *allow_spurious {
                    write!(f, " [spurious allowed]")?;
                }
                Ok(())
            }
            Self::Unpark { thread } => write!(f, "unblocking thread {thread}"),
            Self::Yield => write!(f, "yield"),
            Self::UserMessage { message } => write!(f, "{message}"),
            Self::Failure { result, message } => write!(f, "{result}: {message}"),
        }
    }
}

/// One history line: which thread did what.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// The executing thread.
    pub thread: ThreadId,
    /// The recorded event.
    pub event: Event,
}

/// The append-only event log of one iteration.
#[derive(Debug, Default)]
pub(crate) struct History {
    entries: Vec<HistoryEntry>,
    enabled: bool,
}

impl History {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            entries: Vec::new(),
            enabled,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    #[inline]
    pub(crate) fn push(&mut self, thread: ThreadId, event: Event) {
        if self.enabled {
            self.entries.push(HistoryEntry { thread, event });
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Print the numbered step-by-step record.
    pub(crate) fn print(&self, w: &mut dyn Write) -> io::Result<()> {
        writeln!(w, "execution history ({} steps):", self.entries.len())?;
        for (i, e) in self.entries.iter().enumerate() {
            writeln!(w, "[{i}] thread {}: {}", e.thread, e.event)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_history_records_nothing() {
        let mut h = History::new(false);
        h.push(0, Event::Yield);
        assert!(h.entries().is_empty());
    }

    #[test]
    fn enabled_history_records_in_order() {
        let mut h = History::new(true);
        h.push(0, Event::Yield);
        h.push(
            1,
            Event::AtomicStore {
                cell: 3,
                value: 1,
                ordering: Ordering::Release,
            },
        );
        assert_eq!(h.entries().len(), 2);
        assert_eq!(h.entries()[1].thread, 1);
    }

    #[test]
    fn event_display_shapes() {
        let e = Event::AtomicLoad {
            cell: 2,
            age: 1,
            value: 0,
            ordering: Ordering::Relaxed,
        };
        assert_eq!(
            e.to_string(),
            "<atomic 2> load 0, relaxed (stale copy, 1 store(s) behind)"
        );
        let e = Event::SyncOp {
            kind: ObjectKind::Mutex,
            slot: 0,
            op: "lock",
        };
        assert_eq!(e.to_string(), "<mutex 0> lock");
    }

    #[test]
    fn print_is_numbered() {
        let mut h = History::new(true);
        h.push(2, Event::Yield);
        let mut out = Vec::new();
        h.print(&mut out).unwrap();
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains("[0] thread 2: yield"), "{s}");
    }
}
