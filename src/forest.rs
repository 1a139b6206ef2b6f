//! The distributed forest: one octree per block, partitioned over the ranks
//! of a runtime along the space-filling curve.
//!
//! The forest exclusively owns its octrees. Octants carry only their block
//! index; every cross-tree query goes through the replicated topology graph,
//! so there are no cyclic references between trees and the forest.

use crate::balance::complete_block;

use block_forest_comm::Runtime;
use block_forest_core::prelude::*;
use block_forest_topology::BlockTopology;

use fnv::FnvHashSet;
use log::debug;
use rand::Rng;
use std::collections::BTreeMap;

/// Sorts after every real octant; used for the split keys of ranks that hold
/// no leaves.
pub(crate) const SPLIT_SENTINEL: Octant =
    Octant { block: u32::MAX, x: 0, y: 0, z: 0, level: 0, tag: 0 };

/// A distributed forest of octrees over the blocks of a [`BlockTopology`].
pub struct Forest {
    pub(crate) runtime: Runtime,
    pub(crate) topology: BlockTopology,
    /// Primary owner of each block; the rank holding most of its leaves.
    pub(crate) block_owners: Vec<u32>,
    /// `splits[r]` is the first space-filling-curve key resident on rank `r`.
    pub(crate) splits: Vec<Octant>,
    /// Locally resident leaves, per block, sorted along the Morton curve.
    pub(crate) trees: BTreeMap<u32, OctantList>,
    pub(crate) nodes: Option<crate::nodes::NodeData>,
}

impl Forest {
    /// Creates an empty forest over `topology`, distributing the blocks to
    /// ranks in contiguous chunks. Call one of the `create_trees` methods to
    /// populate it.
    pub fn new(runtime: Runtime, topology: BlockTopology) -> Self {
        let size = runtime.size();
        let block_owners = topology.assign_ranks(size);
        let splits = initial_splits(&block_owners, size);
        Forest {
            runtime,
            topology,
            block_owners,
            splits,
            trees: BTreeMap::new(),
            nodes: None,
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn topology(&self) -> &BlockTopology {
        &self.topology
    }

    pub fn rank(&self) -> usize {
        self.runtime.rank()
    }

    /// The rank currently designated as each block's primary owner.
    pub fn block_owners(&self) -> &[u32] {
        &self.block_owners
    }

    /// The locally resident leaves of `block`, if any.
    pub fn tree(&self, block: u32) -> Option<&OctantList> {
        self.trees.get(&block)
    }

    /// Iterates over the local leaves in space-filling-curve order.
    pub fn leaves(&self) -> impl Iterator<Item = &Octant> {
        self.trees.values().flat_map(|t| t.iter())
    }

    pub fn local_leaf_count(&self) -> usize {
        self.trees.values().map(|t| t.len()).sum()
    }

    /// Total leaf count over all ranks. Collective.
    pub fn global_leaf_count(&self) -> u64 {
        self.runtime.all_reduce_sum(self.local_leaf_count() as u64)
    }

    /// Initializes every owned block as a single root octant refined
    /// uniformly to `levels[block]`.
    pub fn create_trees(&mut self, levels: &[u8]) {
        assert_eq!(
            levels.len(),
            self.topology.num_blocks(),
            "one refinement level per block required"
        );
        let rank = self.rank() as u32;
        self.trees.clear();
        for (b, &level) in levels.iter().enumerate() {
            assert!(level <= MAX_LEVEL);
            if self.block_owners[b] != rank {
                continue;
            }
            let mut leaves = Vec::new();
            push_uniform(Octant::root(b as u32), level, &mut leaves);
            self.trees.insert(b as u32, OctantList::from_vec(leaves));
        }
        self.splits = initial_splits(&self.block_owners, self.runtime.size());
        self.nodes = None;
        debug!(
            "rank {} created {} trees, {} leaves",
            rank,
            self.trees.len(),
            self.local_leaf_count()
        );
    }

    /// `create_trees` with the same depth everywhere.
    pub fn create_trees_uniform(&mut self, level: u8) {
        let levels = vec![level; self.topology.num_blocks()];
        self.create_trees(&levels);
    }

    /// Fills every owned block with `n` random octants with levels in
    /// `min_level..=max_level`, then completes each block to a partition.
    /// Intended for testing.
    pub fn create_random_trees(&mut self, n: usize, min_level: u8, max_level: u8) {
        assert!(min_level <= max_level && max_level <= MAX_LEVEL);
        let rank = self.rank() as u32;
        let mut rng = rand::thread_rng();
        self.trees.clear();
        for b in 0..self.topology.num_blocks() {
            if self.block_owners[b] != rank {
                continue;
            }
            let mut random = Vec::with_capacity(n);
            for _ in 0..n {
                let level = rng.gen_range(min_level..=max_level);
                let cells = 1i32 << level;
                let h = 1 << (MAX_LEVEL - level);
                random.push(Octant::new(
                    b as u32,
                    rng.gen_range(0..cells) * h,
                    rng.gen_range(0..cells) * h,
                    rng.gen_range(0..cells) * h,
                    level,
                ));
            }
            let required = OctantList::from_vec(random);
            let empty = OctantList::new();
            self.trees
                .insert(b as u32, complete_block(b as u32, &empty, &required, Some(0)));
        }
        self.splits = initial_splits(&self.block_owners, self.runtime.size());
        self.nodes = None;
    }

    /// Refines each local leaf to its target level, in leaf order: a leaf is
    /// replaced by its descendants until it reaches `levels[k]`. With `None`
    /// every leaf is refined one level. Purely local, no communication.
    pub fn refine(&mut self, levels: Option<&[i32]>) {
        if let Some(levels) = levels {
            assert_eq!(
                levels.len(),
                self.local_leaf_count(),
                "one target level per local leaf required"
            );
        }
        let mut k = 0usize;
        for tree in self.trees.values_mut() {
            let mut refined = Vec::with_capacity(tree.len());
            for leaf in tree.iter() {
                let target = match levels {
                    Some(l) => l[k],
                    None => leaf.level as i32 + 1,
                };
                k += 1;
                if target > leaf.level as i32 {
                    assert!(
                        target <= MAX_LEVEL as i32,
                        "refinement target {} exceeds the maximum level {}",
                        target,
                        MAX_LEVEL
                    );
                    push_uniform(*leaf, target as u8, &mut refined);
                } else {
                    refined.push(*leaf);
                }
            }
            *tree = OctantList::from_vec(refined);
        }
        self.nodes = None;
    }

    /// Collapses every locally complete sibling octet into its parent, once.
    /// The inverse of a uniform one-level `refine`.
    pub fn coarsen(&mut self) {
        for tree in self.trees.values_mut() {
            tree.coarsen();
        }
        self.nodes = None;
    }

    /// The rank whose slice of the space-filling curve contains `key`.
    pub(crate) fn owner_of(&self, key: &Octant) -> usize {
        let i = self.splits.partition_point(|s| s <= key);
        i.max(1) - 1
    }

    /// The contiguous rank range holding any part of `oct`'s region.
    pub(crate) fn owner_span(&self, oct: &Octant) -> (usize, usize) {
        let lo = self.owner_of(&oct.first_descendant());
        let hi = self.owner_of(&Octant::last_descendant(oct));
        (lo, hi)
    }

    /// Sends every local leaf to the ranks holding regions it touches, and
    /// receives the same from them: the one-deep ghost layer, grouped by
    /// block and tagged with the source rank. Collective.
    pub(crate) fn exchange_adjacent_leaves(&self) -> BTreeMap<u32, Vec<(Octant, u32)>> {
        let me = self.rank();
        let size = self.runtime.size();
        let mut sends: Vec<Vec<Octant>> = vec![Vec::new(); size];
        let mut sent: FnvHashSet<(usize, Octant)> = FnvHashSet::default();

        for tree in self.trees.values() {
            for leaf in tree.iter() {
                for_each_neighbor(leaf, true, |n| {
                    let images = if n.in_block() {
                        vec![n]
                    } else {
                        self.topology.octant_images(&n)
                    };
                    for img in images {
                        let (lo, hi) = self.owner_span(&img);
                        for r in lo..=hi {
                            if r != me && sent.insert((r, *leaf)) {
                                sends[r].push(*leaf);
                            }
                        }
                    }
                });
            }
        }

        let received = self.runtime.all_to_all(sends);
        let mut ghosts: BTreeMap<u32, Vec<(Octant, u32)>> = BTreeMap::new();
        for (src, list) in received.into_iter().enumerate() {
            for o in list {
                ghosts.entry(o.block).or_insert_with(Vec::new).push((o, src as u32));
            }
        }
        for list in ghosts.values_mut() {
            list.sort_by(|a, b| a.0.cmp(&b.0));
        }
        ghosts
    }

    /// Checks the 2:1 condition across every face (and every edge and corner
    /// with `balance_corner`) of every local leaf, consulting the ghost
    /// layer for remote neighbors. Collective; panics on a violation.
    pub fn verify_balance(&self, balance_corner: bool) {
        let ghosts = self.exchange_adjacent_leaves();
        for tree in self.trees.values() {
            for leaf in tree.iter() {
                for_each_neighbor(leaf, balance_corner, |n| {
                    let images = if n.in_block() {
                        vec![n]
                    } else {
                        self.topology.octant_images(&n)
                    };
                    for img in images {
                        let local = self
                            .trees
                            .get(&img.block)
                            .and_then(|t| t.find_enclosing(&img))
                            .copied();
                        let neighbor = local.or_else(|| {
                            ghosts
                                .get(&img.block)
                                .and_then(|g| find_enclosing_ghost(g, &img))
                                .map(|(g, _)| g)
                        });
                        if let Some(neighbor) = neighbor {
                            let diff = neighbor.level as i32 - leaf.level as i32;
                            assert!(
                                diff.abs() <= 1,
                                "2:1 balance violated between {:?} and {:?}",
                                leaf,
                                neighbor
                            );
                        }
                    }
                });
            }
        }
    }

    /// Checks that the local leaves of every block are sorted and
    /// overlap-free.
    pub fn verify_leaves_disjoint(&self) {
        for (b, tree) in &self.trees {
            assert!(
                tree.is_overlap_free(),
                "block {} holds overlapping leaves",
                b
            );
        }
    }
}

/// Appends the uniform refinement of `o` to `level`, in Morton order.
pub(crate) fn push_uniform(o: Octant, level: u8, out: &mut Vec<Octant>) {
    if o.level >= level {
        out.push(o);
    } else {
        for k in 0..8 {
            push_uniform(o.child(k), level, out);
        }
    }
}

/// Calls `f` for each same-level neighbor position of `o`: the 6 face
/// neighbors, and with `all` also the 12 edge and 8 corner neighbors.
pub(crate) fn for_each_neighbor(o: &Octant, all: bool, mut f: impl FnMut(Octant)) {
    for face in 0..6 {
        f(o.face_neighbor(face));
    }
    if all {
        for edge in 0..12 {
            f(o.edge_neighbor(edge));
        }
        for corner in 0..8 {
            f(o.corner_neighbor(corner));
        }
    }
}

/// Finds the ghost leaf enclosing the anchor of `probe` and the rank it came
/// from, if present.
pub(crate) fn find_enclosing_ghost(
    ghosts: &[(Octant, u32)],
    probe: &Octant,
) -> Option<(Octant, u32)> {
    let fine = probe.first_descendant();
    let i = ghosts.partition_point(|(g, _)| *g <= fine);
    if i == 0 {
        return None;
    }
    let (candidate, rank) = ghosts[i - 1];
    if candidate.contains(&fine) {
        Some((candidate, rank))
    } else {
        None
    }
}

fn initial_splits(block_owners: &[u32], size: usize) -> Vec<Octant> {
    let mut splits = vec![SPLIT_SENTINEL; size];
    for (b, &owner) in block_owners.iter().enumerate().rev() {
        splits[owner as usize] = Octant::root(b as u32);
    }
    fixup_splits(&mut splits);
    splits
}

/// Gives empty ranks the split key of the next non-empty rank so the routing
/// search never lands on them.
pub(crate) fn fixup_splits(splits: &mut [Octant]) {
    for r in (0..splits.len().saturating_sub(1)).rev() {
        if splits[r] == SPLIT_SENTINEL && splits[r + 1] != SPLIT_SENTINEL {
            splits[r] = splits[r + 1];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::single_block_forest;
    use block_forest_core::SIDE;

    fn total_volume(f: &Forest) -> u128 {
        f.leaves()
            .map(|o| {
                let h = o.side_length() as u128;
                h * h * h
            })
            .sum()
    }

    #[test]
    fn create_trees_counts() {
        let mut f = single_block_forest();
        f.create_trees_uniform(2);
        assert_eq!(f.local_leaf_count(), 64);
        assert_eq!(f.global_leaf_count(), 64);
        f.verify_leaves_disjoint();
        assert_eq!(total_volume(&f), (SIDE as u128).pow(3));
    }

    #[test]
    fn refine_uniform_then_coarsen_is_identity() {
        let mut f = single_block_forest();
        f.create_random_trees(40, 1, 4);
        let before: Vec<Octant> = f.leaves().copied().collect();
        f.refine(None);
        assert_eq!(f.local_leaf_count(), before.len() * 8);
        f.coarsen();
        let after: Vec<Octant> = f.leaves().copied().collect();
        assert_eq!(before, after);
    }

    #[test]
    fn refine_targets_individual_leaves() {
        let mut f = single_block_forest();
        f.create_trees_uniform(1);
        // Refine only the first leaf, to level 3.
        let mut levels = vec![0i32; 8];
        levels[0] = 3;
        f.refine(Some(&levels));
        assert_eq!(f.local_leaf_count(), 7 + 64);
        f.verify_leaves_disjoint();
        assert_eq!(total_volume(&f), (SIDE as u128).pow(3));
    }

    #[test]
    fn random_trees_partition_the_block() {
        let mut f = single_block_forest();
        f.create_random_trees(100, 0, 6);
        f.verify_leaves_disjoint();
        assert_eq!(total_volume(&f), (SIDE as u128).pow(3));
    }

    #[test]
    fn leaves_iterate_in_curve_order() {
        let mut f = single_block_forest();
        f.create_random_trees(30, 1, 5);
        let leaves: Vec<Octant> = f.leaves().copied().collect();
        let mut sorted = leaves.clone();
        sorted.sort();
        assert_eq!(leaves, sorted);
    }

    #[test]
    fn tags_survive_refinement() {
        let mut f = single_block_forest();
        f.create_trees_uniform(0);
        for tree in f.trees.values_mut() {
            let tagged: Vec<Octant> =
                tree.iter().map(|o| o.with_tag(7)).collect();
            *tree = OctantList::from_vec(tagged);
        }
        f.refine(None);
        assert!(f.leaves().all(|o| o.tag == 7));
    }

    #[test]
    fn split_routing_covers_all_keys() {
        let mut f = single_block_forest();
        f.create_trees_uniform(1);
        assert_eq!(f.owner_of(&Octant::root(0)), 0);
        assert_eq!(f.owner_of(&Octant::root(0).last_descendant()), 0);
    }
}
