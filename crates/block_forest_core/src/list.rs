//! Sorted, uniquified arrays of cells.
//!
//! A `CellList` is the workhorse representation of a tree: the leaves of a
//! block, kept sorted along the Morton curve. Sortedness buys binary-search
//! containment queries, linear-time merges and a one-pass sibling collapse.

use crate::cell::Cell;
use crate::octant::Octant;
use crate::quadrant::Quadrant;

use itertools::Itertools;

/// A growable array of cells. Most operations require the list to be sorted;
/// `sort_unique` establishes that after a batch of pushes.
#[derive(Clone, Debug, Default)]
pub struct CellList<C> {
    cells: Vec<C>,
}

/// A sorted list of octants.
pub type OctantList = CellList<Octant>;
/// A sorted list of quadrants.
pub type QuadrantList = CellList<Quadrant>;

impl<C: Cell> CellList<C> {
    pub fn new() -> Self {
        CellList { cells: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        CellList { cells: Vec::with_capacity(cap) }
    }

    /// Takes ownership of `cells`, sorting and deduplicating them.
    pub fn from_vec(mut cells: Vec<C>) -> Self {
        cells.sort();
        cells.dedup();
        CellList { cells }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn push(&mut self, c: C) {
        self.cells.push(c);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, C> {
        self.cells.iter()
    }

    pub fn as_slice(&self) -> &[C] {
        &self.cells
    }

    pub fn into_vec(self) -> Vec<C> {
        self.cells
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    /// Sorts and removes duplicates. Duplicate means equal block, anchor and
    /// level; the first of a run wins, so user tags of survivors are kept.
    pub fn sort_unique(&mut self) {
        self.cells.sort();
        self.cells.dedup();
    }

    /// Merges another sorted list into this sorted list, deduplicating.
    pub fn merge(&mut self, other: CellList<C>) {
        let merged = std::mem::replace(&mut self.cells, Vec::new());
        self.cells = merged
            .into_iter()
            .merge(other.cells.into_iter())
            .dedup()
            .collect();
    }

    /// Binary search for a cell. With `as_node` the level is ignored and any
    /// cell anchored at the same point of the same block matches.
    ///
    /// Requires the list to be sorted.
    pub fn find(&self, c: &C, as_node: bool) -> Option<&C> {
        let result = if as_node {
            self.cells.binary_search_by(|x| x.node_cmp(c))
        } else {
            self.cells.binary_search_by(|x| x.cmp(c))
        };
        result.ok().map(|i| &self.cells[i])
    }

    /// The number of leading cells that sort strictly before `c`.
    pub fn lower_bound(&self, c: &C) -> usize {
        self.cells.partition_point(|x| x < c)
    }

    /// The leaf whose region contains the anchor of `c`, if any.
    ///
    /// Requires the list to be sorted and overlap-free.
    pub fn find_enclosing(&self, c: &C) -> Option<&C> {
        let probe = c.as_finest();
        let i = self.cells.partition_point(|x| *x <= probe);
        if i == 0 {
            return None;
        }
        let candidate = &self.cells[i - 1];
        if candidate.contains(&probe) {
            Some(candidate)
        } else {
            None
        }
    }

    /// The index range of cells equal to `c` or descendants of it.
    pub fn descendant_range(&self, c: &C) -> (usize, usize) {
        let lo = self.cells.partition_point(|x| x < c);
        let last = c.last_descendant();
        let hi = self.cells.partition_point(|x| *x <= last);
        (lo, hi)
    }

    /// Collapses every complete group of siblings into its parent, in one
    /// pass. Newly formed parents are not re-collapsed; call again to keep
    /// coarsening. The parent inherits the first child's tag.
    ///
    /// Requires the list to be sorted.
    pub fn coarsen(&mut self) {
        let k = C::NUM_CHILDREN as usize;
        let n = self.cells.len();
        let mut out = Vec::with_capacity(n);
        let mut i = 0;
        while i < n {
            let c = self.cells[i];
            if c.level() > 0 && c.child_index() == 0 && i + k <= n {
                let parent = c.parent();
                let complete = (0..k).all(|j| self.cells[i + j] == parent.child(j as u8));
                if complete {
                    out.push(parent);
                    i += k;
                    continue;
                }
            }
            out.push(c);
            i += 1;
        }
        self.cells = out;
    }

    /// Checks that no cell's region overlaps another's. Requires sortedness.
    pub fn is_overlap_free(&self) -> bool {
        self.cells
            .windows(2)
            .all(|w| !w[0].contains(&w[1]))
    }
}

impl<C: Cell> PartialEq for CellList<C> {
    fn eq(&self, other: &Self) -> bool {
        self.cells == other.cells
    }
}

impl<C: Cell> Eq for CellList<C> {}

impl<C: Cell> std::ops::Index<usize> for CellList<C> {
    type Output = C;

    fn index(&self, i: usize) -> &C {
        &self.cells[i]
    }
}
