//! The `Quadrant` type: the 2-dimensional analogue of [`crate::Octant`] for
//! quadtree forests over quadrilateral blocks.
//!
//! A quadrant has 4 children, 4 faces (its edges) and 4 corners; everything
//! else mirrors the octant with one dimension removed.

use crate::cell::Cell;
use crate::morton;
use crate::octant::{MAX_LEVEL, SIDE};

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// A square region of one quadrilateral block.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Quadrant {
    pub block: u32,
    pub x: i32,
    pub y: i32,
    pub level: u8,
    pub tag: i32,
}

impl Quadrant {
    pub fn new(block: u32, x: i32, y: i32, level: u8) -> Self {
        assert!(level <= MAX_LEVEL, "quadrant level {} exceeds {}", level, MAX_LEVEL);
        let h = 1 << (MAX_LEVEL - level);
        for &c in &[x, y] {
            assert!(
                c >= 0 && c + h <= SIDE && c & (h - 1) == 0,
                "quadrant anchor ({}, {}) is not aligned to level {}",
                x,
                y,
                level
            );
        }
        Quadrant { block, x, y, level, tag: 0 }
    }

    pub fn root(block: u32) -> Self {
        Quadrant { block, x: 0, y: 0, level: 0, tag: 0 }
    }

    pub fn with_tag(mut self, tag: i32) -> Self {
        self.tag = tag;
        self
    }

    #[inline]
    pub fn side_length(&self) -> i32 {
        1 << (MAX_LEVEL - self.level)
    }

    #[inline]
    pub fn in_block(&self) -> bool {
        let h = self.side_length();
        self.x >= 0 && self.y >= 0 && self.x + h <= SIDE && self.y + h <= SIDE
    }

    pub fn parent(&self) -> Quadrant {
        assert!(self.level > 0, "the root quadrant has no parent");
        let h2 = 1 << (MAX_LEVEL - self.level + 1);
        Quadrant {
            block: self.block,
            x: self.x & !(h2 - 1),
            y: self.y & !(h2 - 1),
            level: self.level - 1,
            tag: self.tag,
        }
    }

    /// The `k`-th child, `k` in `0..4`, bit 0 along x and bit 1 along y.
    pub fn child(&self, k: u8) -> Quadrant {
        debug_assert!(k < 4);
        assert!(self.level < MAX_LEVEL, "cannot refine below level {}", MAX_LEVEL);
        let half = self.side_length() >> 1;
        Quadrant {
            block: self.block,
            x: self.x + ((k & 1) as i32) * half,
            y: self.y + (((k >> 1) & 1) as i32) * half,
            level: self.level + 1,
            tag: self.tag,
        }
    }

    #[inline]
    pub fn child_index(&self) -> u8 {
        debug_assert!(self.level > 0);
        let h = self.side_length();
        (((self.x / h) & 1) | (((self.y / h) & 1) << 1)) as u8
    }

    pub fn sibling(&self, k: u8) -> Quadrant {
        self.parent().child(k).with_tag(self.tag)
    }

    /// The same-level quadrant across face `f`, `f` in `0..4`.
    pub fn face_neighbor(&self, f: u8) -> Quadrant {
        debug_assert!(f < 4);
        let h = self.side_length();
        let step = if f & 1 == 1 { h } else { -h };
        let mut q = *self;
        if f >> 1 == 0 {
            q.x += step;
        } else {
            q.y += step;
        }
        q
    }

    /// The same-level quadrant diagonally across corner `c`, `c` in `0..4`.
    pub fn corner_neighbor(&self, c: u8) -> Quadrant {
        debug_assert!(c < 4);
        let h = self.side_length();
        let mut q = *self;
        q.x += if c & 1 == 1 { h } else { -h };
        q.y += if c & 2 == 2 { h } else { -h };
        q
    }

    pub fn contains(&self, other: &Quadrant) -> bool {
        if self.block != other.block || self.level > other.level {
            return false;
        }
        let h = self.side_length();
        other.x & !(h - 1) == self.x && other.y & !(h - 1) == self.y
    }

    pub fn ancestor_at(&self, level: u8) -> Quadrant {
        assert!(level <= self.level);
        let h = 1 << (MAX_LEVEL - level);
        Quadrant {
            block: self.block,
            x: self.x & !(h - 1),
            y: self.y & !(h - 1),
            level,
            tag: self.tag,
        }
    }

    pub fn first_descendant(&self) -> Quadrant {
        Quadrant { level: MAX_LEVEL, tag: 0, ..*self }
    }

    pub fn last_descendant(&self) -> Quadrant {
        let h = self.side_length();
        Quadrant {
            block: self.block,
            x: self.x + h - 1,
            y: self.y + h - 1,
            level: MAX_LEVEL,
            tag: 0,
        }
    }
}

impl PartialEq for Quadrant {
    fn eq(&self, other: &Self) -> bool {
        self.block == other.block
            && self.x == other.x
            && self.y == other.y
            && self.level == other.level
    }
}

impl Eq for Quadrant {}

impl Hash for Quadrant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.block.hash(state);
        self.x.hash(state);
        self.y.hash(state);
        self.level.hash(state);
    }
}

impl Ord for Quadrant {
    fn cmp(&self, other: &Self) -> Ordering {
        self.block
            .cmp(&other.block)
            .then_with(|| morton::cmp2(self.x, self.y, other.x, other.y))
            .then_with(|| self.level.cmp(&other.level))
    }
}

impl PartialOrd for Quadrant {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Cell for Quadrant {
    const NUM_CHILDREN: u8 = 4;

    type NodeKey = (u32, i32, i32);

    fn block(&self) -> u32 {
        self.block
    }

    fn level(&self) -> u8 {
        self.level
    }

    fn parent(&self) -> Self {
        Quadrant::parent(self)
    }

    fn child(&self, k: u8) -> Self {
        Quadrant::child(self, k)
    }

    fn child_index(&self) -> u8 {
        Quadrant::child_index(self)
    }

    fn contains(&self, other: &Self) -> bool {
        Quadrant::contains(self, other)
    }

    fn node_cmp(&self, other: &Self) -> Ordering {
        self.block
            .cmp(&other.block)
            .then_with(|| morton::cmp2(self.x, self.y, other.x, other.y))
    }

    fn node_key(&self) -> Self::NodeKey {
        (self.block, self.x, self.y)
    }

    fn as_finest(&self) -> Self {
        self.first_descendant()
    }

    fn last_descendant(&self) -> Self {
        Quadrant::last_descendant(self)
    }
}

#[cfg(feature = "mpi")]
mod mpi_datatype {
    use super::Quadrant;

    use memoffset::offset_of;
    use mpi::datatype::{Equivalence, UncommittedUserDatatype, UserDatatype};
    use mpi::Address;

    unsafe impl Equivalence for Quadrant {
        type Out = UserDatatype;

        fn equivalent_datatype() -> Self::Out {
            UserDatatype::structured(
                &[1, 2, 1, 1],
                &[
                    offset_of!(Quadrant, block) as Address,
                    offset_of!(Quadrant, x) as Address,
                    offset_of!(Quadrant, level) as Address,
                    offset_of!(Quadrant, tag) as Address,
                ],
                &[
                    UncommittedUserDatatype::contiguous(1, &u32::equivalent_datatype()).as_ref(),
                    UncommittedUserDatatype::contiguous(2, &i32::equivalent_datatype()).as_ref(),
                    UncommittedUserDatatype::contiguous(1, &u8::equivalent_datatype()).as_ref(),
                    UncommittedUserDatatype::contiguous(1, &i32::equivalent_datatype()).as_ref(),
                ],
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_parent_round_trip() {
        let root = Quadrant::root(0);
        for k in 0..4 {
            let c = root.child(k);
            assert_eq!(c.parent(), root);
            assert_eq!(c.child_index(), k);
            assert!(root.contains(&c));
        }
    }

    #[test]
    fn face_neighbors_are_symmetric() {
        let q = Quadrant::root(0).child(3).child(0);
        for f in 0..4 {
            assert_eq!(q.face_neighbor(f).face_neighbor(f ^ 1), q);
        }
    }

    #[test]
    fn corner_neighbor_is_diagonal() {
        let q = Quadrant::root(0).child(3);
        let h = q.side_length();
        let n = q.corner_neighbor(0);
        assert_eq!((n.x, n.y), (q.x - h, q.y - h));
    }

    #[test]
    fn children_sort_in_index_order() {
        let q = Quadrant::root(0).child(2);
        let kids: Vec<_> = (0..4).map(|k| q.child(k)).collect();
        let mut sorted = kids.clone();
        sorted.sort();
        assert_eq!(kids, sorted);
    }
}
