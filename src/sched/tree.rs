//! The persistent decision tree behind the exhaustive schedulers.
//!
//! Every non-deterministic choice of an iteration is one node: how many
//! alternatives existed and which one this iteration took. Replaying the
//! recorded path reproduces an iteration exactly; advancing the deepest
//! non-exhausted node walks the whole space depth-first, in stable
//! lexicographic order (thread ids ascend, `rand` values ascend).

use serde::{Deserialize, Serialize};

/// One decision point: `index` of `limit` alternatives was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Decision {
    /// Number of alternatives at this point.
    pub limit: u32,
    /// The alternative taken in the current iteration.
    pub index: u32,
}

/// Depth-first enumeration cursor over all decision sequences.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct SearchTree {
    nodes: Vec<Decision>,
    #[serde(skip)]
    cursor: usize,
}

impl SearchTree {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Rewind to the root for a new iteration.
    pub(crate) fn iteration_begin(&mut self) {
        self.cursor = 0;
    }

    /// Take the decision at the current depth.
    ///
    /// Within the recorded prefix this replays the stored choice; past it,
    /// a fresh node starts at alternative 0. A decision with a single
    /// alternative is not a choice and records nothing.
    pub(crate) fn branch(&mut self, limit: usize) -> usize {
        debug_assert!(limit > 0);
        if limit == 1 {
            return 0;
        }
        let choice = if self.cursor < self.nodes.len() {
            let d = self.nodes[self.cursor];
            debug_assert_eq!(
                d.limit as usize, limit,
                "decision stream diverged from recorded path"
            );
            d.index.min(limit as u32 - 1) as usize
        } else {
            self.nodes.push(Decision {
                limit: limit as u32,
                index: 0,
            });
            0
        };
        self.cursor += 1;
        choice
    }

    /// Move to the next path. True when every path has been walked.
    pub(crate) fn advance(&mut self) -> bool {
        // Decisions beyond the cursor belong to a longer, earlier path;
        // the current path ended above them.
        self.nodes.truncate(self.cursor);
        while let Some(last) = self.nodes.last_mut() {
            if last.index + 1 < last.limit {
                last.index += 1;
                return false;
            }
            self.nodes.pop();
        }
        true
    }

    pub(crate) fn nodes(&self) -> &[Decision] {
        &self.nodes
    }

    pub(crate) fn set_nodes(&mut self, nodes: Vec<Decision>) {
        self.nodes = nodes;
        self.cursor = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Walk a fixed decision shape to exhaustion, returning the paths.
    fn enumerate(limits: &[usize]) -> Vec<Vec<usize>> {
        let mut tree = SearchTree::new();
        let mut paths = Vec::new();
        loop {
            tree.iteration_begin();
            let path: Vec<usize> = limits.iter().map(|&l| tree.branch(l)).collect();
            paths.push(path);
            if tree.advance() {
                return paths;
            }
        }
    }

    #[test]
    fn enumerates_lexicographically() {
        let paths = enumerate(&[2, 3]);
        assert_eq!(
            paths,
            vec![
                vec![0, 0],
                vec![0, 1],
                vec![0, 2],
                vec![1, 0],
                vec![1, 1],
                vec![1, 2],
            ]
        );
    }

    #[test]
    fn single_alternative_is_free() {
        let paths = enumerate(&[1, 2, 1]);
        assert_eq!(paths, vec![vec![0, 0, 0], vec![0, 1, 0]]);
    }

    #[test]
    fn single_path_exhausts_immediately() {
        let paths = enumerate(&[1, 1]);
        assert_eq!(paths.len(), 1);
    }

    #[test]
    fn replay_prefix_is_stable() {
        let mut tree = SearchTree::new();
        tree.iteration_begin();
        assert_eq!(tree.branch(3), 0);
        assert_eq!(tree.branch(2), 0);
        assert!(!tree.advance());
        tree.iteration_begin();
        assert_eq!(tree.branch(3), 0);
        assert_eq!(tree.branch(2), 1);
    }

    #[test]
    fn shorter_path_truncates_stale_suffix() {
        let mut tree = SearchTree::new();
        tree.iteration_begin();
        tree.branch(2);
        tree.branch(2);
        assert!(!tree.advance());
        // This path takes only one decision; the stale second node must
        // not resurrect.
        tree.iteration_begin();
        assert_eq!(tree.branch(2), 0);
        assert!(!tree.advance());
        tree.iteration_begin();
        assert_eq!(tree.branch(2), 1);
    }

    #[test]
    fn serde_round_trip() {
        let mut tree = SearchTree::new();
        tree.iteration_begin();
        tree.branch(4);
        tree.branch(2);
        let json = serde_json::to_value(&tree).unwrap();
        let back: SearchTree = serde_json::from_value(json).unwrap();
        assert_eq!(back.nodes(), tree.nodes());
    }
}
