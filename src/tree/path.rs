//! Tree path with scoped-release semantics: node buffers are
//! reference-counted, and `release` drops one reference per held level.
//! Using `Rc<RefCell<NodeBuffer>>` per level lets multiple live paths (e.g.
//! the walker's current path and a `next_leaf` lookahead) share a node for
//! read without an extra clone.

use std::cell::RefCell;
use std::rc::Rc;

use crate::disk::node::NodeBuffer;

pub type SharedNodeBuffer = Rc<RefCell<NodeBuffer>>;

/// One level of a descended path: the node buffer at that level plus the
/// slot chosen by `search_slot`'s binary search.
#[derive(Clone)]
pub struct PathLevel {
    pub node: SharedNodeBuffer,
    pub slot: usize,
}

/// A path from a tree root down to a leaf, indexed **by tree level**: index
/// 0 is always the leaf, index `root_level` is always the root. This lets
/// `next_leaf`/`prev_leaf` walk "up" by incrementing the index regardless of
/// how deep the tree is.
#[derive(Clone, Default)]
pub struct TreePath {
    levels: Vec<Option<PathLevel>>,
    /// Read-ahead policy knob, tuneable per descent.
    pub reada: bool,
}

impl TreePath {
    pub fn new() -> Self {
        TreePath { levels: Vec::new(), reada: false }
    }

    /// Record the node/slot chosen at `level` (0 = leaf). Grows the
    /// backing storage as needed; `search_slot` calls this top-down from
    /// the root, so the vector is sized on the first (root) call.
    pub fn set(&mut self, level: usize, node: SharedNodeBuffer, slot: usize) {
        if self.levels.len() <= level {
            self.levels.resize(level + 1, None);
        }
        self.levels[level] = Some(PathLevel { node, slot });
    }

    pub fn level_count(&self) -> usize {
        self.levels.len()
    }

    pub fn leaf(&self) -> Option<&PathLevel> {
        self.levels.first().and_then(|l| l.as_ref())
    }

    pub fn at(&self, level: usize) -> Option<&PathLevel> {
        self.levels.get(level).and_then(|l| l.as_ref())
    }

    pub fn at_mut(&mut self, level: usize) -> Option<&mut PathLevel> {
        self.levels.get_mut(level).and_then(|l| l.as_mut())
    }

    pub fn root_level(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    /// Drop everything at or below `level` (used when re-descending after a
    /// split/rebalance invalidated part of the path).
    pub fn truncate_below(&mut self, level: usize) {
        for slot in self.levels.iter_mut().take(level) {
            *slot = None;
        }
    }

    /// Release the whole path. Rc drops handle the actual refcounting;
    /// this just empties the path.
    pub fn release(&mut self) {
        self.levels.clear();
    }

    pub fn leaf_slot(&self) -> usize {
        self.leaf().map(|l| l.slot).unwrap_or(0)
    }
}
