//! Hash-backed cell sets for O(1) membership during tree traversals.

use crate::cell::Cell;
use crate::list::CellList;

use fnv::{FnvHashMap, FnvHashSet};

/// A set of cells with O(1) insertion keyed by `(block, anchor, level)`.
/// Drains into a sorted `CellList`.
#[derive(Clone, Debug, Default)]
pub struct CellHash<C: Cell> {
    set: FnvHashSet<C>,
}

impl<C: Cell> CellHash<C> {
    pub fn new() -> Self {
        CellHash { set: FnvHashSet::default() }
    }

    /// Inserts a cell, returning `true` if it was not already present.
    pub fn insert(&mut self, c: C) -> bool {
        self.set.insert(c)
    }

    pub fn contains(&self, c: &C) -> bool {
        self.set.contains(c)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &C> {
        self.set.iter()
    }

    /// Consumes the set into a sorted list.
    pub fn into_list(self) -> CellList<C> {
        CellList::from_vec(self.set.into_iter().collect())
    }
}

/// A map from cell anchors (level ignored) to values; the "as node" index of
/// a container. Two cells anchored at the same point of the same block hit
/// the same slot.
#[derive(Clone, Debug, Default)]
pub struct NodeIndex<C: Cell, V> {
    map: FnvHashMap<C::NodeKey, V>,
}

impl<C: Cell, V> NodeIndex<C, V> {
    pub fn new() -> Self {
        NodeIndex { map: FnvHashMap::default() }
    }

    pub fn insert(&mut self, c: &C, v: V) -> Option<V> {
        self.map.insert(c.node_key(), v)
    }

    pub fn get(&self, c: &C) -> Option<&V> {
        self.map.get(&c.node_key())
    }

    pub fn contains(&self, c: &C) -> bool {
        self.map.contains_key(&c.node_key())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}
