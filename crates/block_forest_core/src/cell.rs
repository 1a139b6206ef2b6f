//! The `Cell` trait abstracts over octants and quadrants so the containers
//! can be written once for both dimensions.

use std::cmp::Ordering;
use std::fmt::Debug;
use std::hash::Hash;

/// A tree cell: a cubic (or square) region of a block identified by an
/// anchor and a refinement level, totally ordered along the Morton curve of
/// its block.
pub trait Cell: Copy + Ord + Hash + Eq + Debug {
    /// 8 for octants, 4 for quadrants.
    const NUM_CHILDREN: u8;

    /// The `(block, anchor)` tuple identifying the cell's anchor as a
    /// geometric point, used when deduplicating "as nodes".
    type NodeKey: Copy + Hash + Eq + Debug;

    fn block(&self) -> u32;
    fn level(&self) -> u8;
    fn parent(&self) -> Self;
    fn child(&self, k: u8) -> Self;
    fn child_index(&self) -> u8;

    /// Ancestor-or-equal test.
    fn contains(&self, other: &Self) -> bool;

    /// Ordering by `(block, Morton(anchor))` only, ignoring the level.
    fn node_cmp(&self, other: &Self) -> Ordering;

    fn node_key(&self) -> Self::NodeKey;

    /// The deepest-level cell sharing this cell's anchor. Useful as a probe:
    /// it sorts after every ancestor-or-equal cell.
    fn as_finest(&self) -> Self;

    /// The last Morton key covered by this cell's region.
    fn last_descendant(&self) -> Self;
}
