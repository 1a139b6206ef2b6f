//! 2:1 balance: after `balance`, leaves sharing a face (and optionally an
//! edge or corner) differ by at most one level.
//!
//! The algorithm is a parallel ripple. Every leaf deposits the coarsest
//! acceptable octant into each neighboring region; deposits ripple outward
//! at one level coarser per step, crossing block boundaries through the
//! topology maps and rank boundaries through all-to-all exchanges, until a
//! global reduction reports quiescence. Each block is then rebuilt by
//! completing the union of its leaves and deposits to the finest covering
//! partition. Inserts commute, so the result does not depend on exchange
//! order, and running balance twice changes nothing.

use crate::forest::{for_each_neighbor, Forest};

use block_forest_core::prelude::*;
use fnv::FnvHashSet;
use log::debug;
use std::collections::BTreeMap;

impl Forest {
    /// Enforces the 2:1 condition across faces; with `balance_corner` also
    /// across edges and corners. Collective.
    pub fn balance(&mut self, balance_corner: bool) {
        assert!(
            self.global_leaf_count() > 0,
            "balance called on an empty forest"
        );
        let me = self.rank();
        let size = self.runtime.size();

        let mut required: BTreeMap<u32, CellHash<Octant>> = BTreeMap::new();
        let mut queue: CellQueue<Octant> = CellQueue::new();
        let mut sends: Vec<Vec<Octant>> = vec![Vec::new(); size];
        let mut sent: FnvHashSet<(usize, Octant)> = FnvHashSet::default();

        for tree in self.trees.values() {
            for leaf in tree.iter() {
                if leaf.level >= 2 {
                    self.enqueue_requirements(leaf, balance_corner, &mut queue);
                }
            }
        }

        let mut rounds = 0u32;
        loop {
            while let Some(r) = queue.pop() {
                self.process_requirement(
                    r,
                    me,
                    balance_corner,
                    &mut required,
                    &mut queue,
                    &mut sends,
                    &mut sent,
                );
            }

            let outgoing: u64 = sends.iter().map(|s| s.len() as u64).sum();
            if self.runtime.all_reduce_sum(outgoing) == 0 {
                break;
            }
            let received = self
                .runtime
                .all_to_all(std::mem::replace(&mut sends, vec![Vec::new(); size]));
            for list in received {
                queue.extend(list);
            }
            rounds += 1;
        }
        debug!(
            "rank {} balance: {} deposits after {} exchange rounds",
            me,
            required.values().map(|h| h.len()).sum::<usize>(),
            rounds
        );

        let blocks: Vec<u32> = self.trees.keys().copied().collect();
        for b in blocks {
            let reqs = required
                .remove(&b)
                .map(|h| h.into_list())
                .unwrap_or_else(OctantList::new);
            let completed = complete_block(b, &self.trees[&b], &reqs, None);
            self.trees.insert(b, completed);
        }
        self.nodes = None;

        #[cfg(debug_assertions)]
        self.verify_leaves_disjoint();
    }

    /// Deposits the coarsest acceptable octant (one level coarser than `o`)
    /// into every region adjacent to `o`, mapping across block boundaries.
    fn enqueue_requirements(&self, o: &Octant, balance_corner: bool, queue: &mut CellQueue<Octant>) {
        debug_assert!(o.level >= 2);
        let coarse = o.level - 1;
        for_each_neighbor(o, balance_corner, |n| {
            if n.in_block() {
                queue.push(n.ancestor_at(coarse));
            } else {
                for img in self.topology.octant_images(&n) {
                    queue.push(img.ancestor_at(coarse));
                }
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn process_requirement(
        &self,
        r: Octant,
        me: usize,
        balance_corner: bool,
        required: &mut BTreeMap<u32, CellHash<Octant>>,
        queue: &mut CellQueue<Octant>,
        sends: &mut [Vec<Octant>],
        sent: &mut FnvHashSet<(usize, Octant)>,
    ) {
        let (lo, hi) = self.owner_span(&r);

        if me < lo || me > hi {
            // Not resident here at all; hand it to every rank whose slice
            // the region touches.
            for rank in lo..=hi {
                if sent.insert((rank, r)) {
                    sends[rank].push(r);
                }
            }
            return;
        }

        let hash = required.entry(r.block).or_insert_with(CellHash::new);
        if hash.contains(&r) {
            return;
        }
        // The rank owning the region's first key performs the coverage check
        // and drives the ripple; other touched ranks only record the deposit.
        if lo == me {
            if let Some(leaf) = self.trees.get(&r.block).and_then(|t| t.find_enclosing(&r)) {
                if leaf.level >= r.level {
                    return;
                }
            }
        }
        hash.insert(r);
        for rank in lo..=hi {
            if rank != me && sent.insert((rank, r)) {
                sends[rank].push(r);
            }
        }
        if lo == me && r.level >= 2 {
            self.enqueue_requirements(&r, balance_corner, queue);
        }
    }
}

/// Rebuilds one block's local leaf set from its current leaves and the
/// balance deposits: the finest of the overlapping cells win, missing
/// siblings are filled, and regions not resident on this rank are left
/// alone. `root_covered` seeds the whole block as resident with the given
/// tag, which turns an arbitrary octant set into a partition.
///
/// Both input lists must be sorted.
pub(crate) fn complete_block(
    block: u32,
    leaves: &OctantList,
    required: &OctantList,
    root_covered: Option<i32>,
) -> OctantList {
    let mut out = Vec::new();
    complete_rec(&Octant::root(block), leaves, required, root_covered, &mut out);
    OctantList::from_vec(out)
}

fn complete_rec(
    oct: &Octant,
    leaves: &OctantList,
    required: &OctantList,
    covered: Option<i32>,
    out: &mut Vec<Octant>,
) {
    let (llo, lhi) = leaves.descendant_range(oct);
    let (rlo, rhi) = required.descendant_range(oct);
    let exact_leaf = llo < lhi && leaves[llo] == *oct;
    let exact_req = rlo < rhi && required[rlo] == *oct;

    // An exact leaf makes the whole subtree resident and fixes the tag its
    // refinement inherits.
    let covered = if exact_leaf {
        Some(leaves[llo].tag)
    } else {
        covered
    };

    let strict_leaves = (lhi - llo) > exact_leaf as usize;
    let strict_reqs = (rhi - rlo) > exact_req as usize;
    if strict_leaves || strict_reqs {
        for k in 0..8 {
            complete_rec(&oct.child(k), leaves, required, covered, out);
        }
    } else if exact_leaf {
        out.push(leaves[llo]);
    } else if let Some(tag) = covered {
        out.push(oct.with_tag(tag));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{leaf_levels, single_block_forest, two_block_forest};
    use block_forest_comm::LocalCluster;

    #[test]
    fn uniform_forest_is_already_balanced() {
        let mut f = single_block_forest();
        f.create_trees_uniform(2);
        let before: Vec<Octant> = f.leaves().copied().collect();
        f.balance(false);
        let after: Vec<Octant> = f.leaves().copied().collect();
        assert_eq!(before, after);
        f.verify_balance(false);
    }

    #[test]
    fn deep_corner_ripples_through_the_block() {
        let mut f = single_block_forest();
        f.create_trees_uniform(1);
        // Drive the first leaf to level 4; balance must grade the rest.
        let mut levels = vec![0i32; 8];
        levels[0] = 4;
        f.refine(Some(&levels));
        f.balance(false);
        f.verify_balance(false);
        f.verify_leaves_disjoint();
        let volume: u128 = f
            .leaves()
            .map(|o| {
                let h = o.side_length() as u128;
                h * h * h
            })
            .sum();
        assert_eq!(volume, (block_forest_core::SIDE as u128).pow(3));
    }

    #[test]
    fn conforming_two_block_forest_is_untouched() {
        // Levels 2 and 1 already satisfy the 2:1 condition at the interface.
        let mut f = two_block_forest();
        f.create_trees(&[2, 1]);
        f.balance(false);
        assert_eq!(f.local_leaf_count(), 64 + 8);
    }

    #[test]
    fn interface_refines_the_coarse_block() {
        let mut f = two_block_forest();
        f.create_trees(&[3, 1]);
        f.balance(false);
        f.verify_balance(false);
        // Block 1's four leaves at the shared face split to level 2:
        // 4 old leaves + 4 * 8 children.
        assert_eq!(f.tree(0).unwrap().len(), 512);
        assert_eq!(f.tree(1).unwrap().len(), 36);
        assert_eq!(leaf_levels(f.tree(1).unwrap()), vec![(1, 4), (2, 32)]);
    }

    #[test]
    fn balance_is_idempotent_on_random_forests() {
        let mut f = single_block_forest();
        f.create_random_trees(100, 0, 6);
        f.balance(true);
        f.verify_balance(true);
        let once: Vec<Octant> = f.leaves().copied().collect();
        f.balance(true);
        let twice: Vec<Octant> = f.leaves().copied().collect();
        assert_eq!(once, twice);
    }

    #[test]
    fn corner_balance_grades_diagonals() {
        let mut f = single_block_forest();
        f.create_trees_uniform(1);
        let mut levels = vec![0i32; 8];
        levels[0] = 5;
        f.refine(Some(&levels));
        f.balance(true);
        f.verify_balance(true);
    }

    #[test]
    fn balance_crosses_rank_boundaries() {
        LocalCluster::run(2, |rt| {
            let mut f = crate::testing::two_block_forest_on(rt);
            f.create_trees(&[3, 1]);
            f.balance(false);
            f.verify_balance(false);
            match f.rank() {
                0 => assert_eq!(f.local_leaf_count(), 512),
                _ => assert_eq!(f.local_leaf_count(), 36),
            }
            assert_eq!(f.global_leaf_count(), 548);
        });
    }

    #[test]
    #[should_panic]
    fn empty_forest_aborts() {
        let mut f = single_block_forest();
        f.balance(false);
    }

    #[test]
    fn completion_fills_missing_siblings() {
        let deep = Octant::root(0).child(0).child(0);
        let required = OctantList::from_vec(vec![deep]);
        let leaves = OctantList::new();
        let completed = complete_block(0, &leaves, &required, Some(0));
        // Level 2 cell plus its 7 siblings plus the 7 remaining level-1
        // cells.
        assert_eq!(completed.len(), 15);
        assert!(completed.is_overlap_free());
        assert!(completed.find(&deep, false).is_some());
    }
}
