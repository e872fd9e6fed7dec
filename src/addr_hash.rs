//! Address-stable pointer hashing.
//!
//! Raw pointer values leak ASLR into a test: a hash table keyed by pointers
//! would take different bucket decisions every process run, breaking replay.
//! The engine therefore intercepts pointer hashing and hands out dense
//! surrogates — the first distinct pointer of an iteration hashes to 0, the
//! next to 1, and so on. The mapping resets every iteration, so identical
//! interleavings see identical hashes.

use std::collections::HashMap;

/// Per-iteration pointer-to-surrogate map.
#[derive(Debug, Default)]
pub(crate) struct AddrHash {
    map: HashMap<usize, usize>,
    next: usize,
}

impl AddrHash {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Forget all assignments; called at iteration begin.
    pub(crate) fn reset(&mut self) {
        self.map.clear();
        self.next = 0;
    }

    /// The surrogate for `addr`, assigning the next counter value on first
    /// sight.
    pub(crate) fn hash(&mut self, addr: usize) -> usize {
        if let Some(&h) = self.map.get(&addr) {
            return h;
        }
        let h = self.next;
        self.next += 1;
        self.map.insert(addr, h);
        h
    }
}
