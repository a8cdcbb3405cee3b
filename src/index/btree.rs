//! Cache-aware static search tree over a sorted immutable key sequence.
//!
//! The tree is never materialized as nodes; [`TreeLayout::plan`] is a pure
//! function computing, per level, how many nodes exist and how many data
//! references each spans, with the leaf level covering exactly the key
//! count. Search narrows a data bracket level by level, probing keys
//! through a caller-supplied comparison callback, and finishes with a
//! direct binary search inside the final bracket. Point lookups elsewhere
//! fall back to the perfect-hash index; this structure serves ordered
//! access (prefix scans, seeks).

use std::cmp::Ordering;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelPlan {
    /// Nodes on this level.
    pub node_count: u64,
    /// Data references spanned by one node (the last node may be short).
    pub span: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeLayout {
    pub key_count: u64,
    pub branching: u64,
    /// Levels from the root down; the deepest level's nodes reference the
    /// data directly, `branching` entries per node.
    pub levels: Vec<LevelPlan>,
}

impl TreeLayout {
    /// Plan the tree for `key_count` sorted keys and branching factor `m`.
    ///
    /// Depth is `ceil(log_m(key_count))`; node counts follow by rounded-up
    /// division, level by level, so the leaf level holds exactly
    /// `key_count` references.
    pub fn plan(key_count: u64, branching: u64) -> TreeLayout {
        let m = branching.max(2);
        let mut levels = Vec::new();
        if key_count > 1 {
            let mut span = m;
            let mut node_count = (key_count + m - 1) / m;
            levels.push(LevelPlan { node_count, span });
            while node_count > 1 {
                span *= m;
                node_count = (node_count + m - 1) / m;
                levels.push(LevelPlan { node_count, span });
            }
            levels.reverse();
        }
        TreeLayout {
            key_count,
            branching: m,
            levels,
        }
    }

    pub fn depth(&self) -> u32 {
        self.levels.len() as u32
    }

    /// Data offset recorded on node `j` of `level` (first key it covers).
    pub fn node_offset(&self, level: usize, node: u64) -> u64 {
        node * self.levels[level].span
    }

    /// Index of the first child of node `j` one level down.
    pub fn first_child(&self, node: u64) -> u64 {
        node * self.branching
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekOutcome {
    /// Index of the first key `>=` the target (== key_count when past the end).
    pub index: u64,
    pub exact: bool,
}

pub struct StaticTree {
    layout: TreeLayout,
}

impl StaticTree {
    pub fn new(key_count: u64, branching: u64) -> Self {
        Self {
            layout: TreeLayout::plan(key_count, branching),
        }
    }

    pub fn layout(&self) -> &TreeLayout {
        &self.layout
    }

    /// Find the first key `>=` the target. `cmp(i)` reports how the key at
    /// data index `i` compares to the target. Absent targets resolve to the
    /// insertion point.
    pub fn seek(&self, mut cmp: impl FnMut(u64) -> Result<Ordering>) -> Result<SeekOutcome> {
        let k = self.layout.key_count;
        if k == 0 {
            return Ok(SeekOutcome {
                index: 0,
                exact: false,
            });
        }
        let mut lo = 0u64;
        let mut hi = k;

        for level in &self.layout.levels {
            // Nodes whose ranges intersect the current bracket.
            let first = lo / level.span;
            let last = ((hi + level.span - 1) / level.span).min(level.node_count);

            // Last node whose first key is <= target; keys left of the
            // bracket were already ruled out, so clamp to `first`.
            let mut node_lo = first;
            let mut node_hi = last;
            while node_lo < node_hi {
                let mid = (node_lo + node_hi) / 2;
                if cmp(mid * level.span)? == Ordering::Greater {
                    node_hi = mid;
                } else {
                    node_lo = mid + 1;
                }
            }
            let node = node_lo.saturating_sub(1).max(first);
            lo = lo.max(node * level.span);
            hi = hi.min(((node + 1) * level.span).min(k));
        }

        let mut exact = false;
        while lo < hi {
            let mid = (lo + hi) / 2;
            match cmp(mid)? {
                Ordering::Less => lo = mid + 1,
                Ordering::Equal => {
                    exact = true;
                    hi = mid;
                }
                Ordering::Greater => hi = mid,
            }
        }
        Ok(SeekOutcome { index: lo, exact })
    }
}
