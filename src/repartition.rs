//! Space-filling-curve repartitioning.
//!
//! Every leaf has a global position along the curve `(block, Morton)`. A
//! prefix sum of local counts places each rank's leaves on that curve; the
//! curve is then cut into `size` near-equal slices and every leaf is shipped
//! to the rank owning its slice in one all-to-all. Block ownership follows
//! the leaves: the rank holding most of a block becomes its owner, lowest
//! rank on ties, and a block cut by a slice boundary stays resident on every
//! rank holding a piece of it.

use crate::forest::{fixup_splits, Forest, SPLIT_SENTINEL};

use block_forest_core::prelude::*;
use log::debug;
use std::collections::BTreeMap;

impl Forest {
    /// Redistributes the leaves so per-rank counts differ by at most one.
    /// Collective; invalidates node data.
    pub fn repartition(&mut self) {
        let size = self.runtime.size();
        let me = self.rank();

        let local = self.local_leaf_count() as u64;
        let prefix = self.runtime.exclusive_scan_sum(local);
        let total = self.runtime.all_reduce_sum(local);
        assert!(total > 0, "repartition called on an empty forest");

        // Rank r receives total/size leaves, plus one for the first
        // total%size ranks.
        let q = total / size as u64;
        let rem = total % size as u64;
        let dest = |g: u64| -> usize {
            let threshold = (q + 1) * rem;
            if g < threshold {
                (g / (q + 1)) as usize
            } else {
                (rem + (g - threshold) / q) as usize
            }
        };

        let mut sends: Vec<Vec<Octant>> = vec![Vec::new(); size];
        let mut g = prefix;
        for tree in self.trees.values() {
            for leaf in tree.iter() {
                sends[dest(g)].push(*leaf);
                g += 1;
            }
        }
        let shipped: usize = sends
            .iter()
            .enumerate()
            .filter(|(r, _)| *r != me)
            .map(|(_, s)| s.len())
            .sum();

        let received = self.runtime.all_to_all(sends);
        let mut grouped: BTreeMap<u32, Vec<Octant>> = BTreeMap::new();
        for list in received {
            for o in list {
                grouped.entry(o.block).or_insert_with(Vec::new).push(o);
            }
        }
        self.trees = grouped
            .into_iter()
            .map(|(b, v)| (b, OctantList::from_vec(v)))
            .collect();

        // New slice boundaries: every rank's first resident key.
        let first = self
            .leaves()
            .next()
            .copied()
            .unwrap_or(SPLIT_SENTINEL);
        let mut splits = self.runtime.all_gather(first);
        fixup_splits(&mut splits);
        self.splits = splits;

        // Majority ownership, lowest rank on ties.
        let nb = self.topology.num_blocks();
        let mut counts = vec![0u64; nb];
        for (b, tree) in &self.trees {
            counts[*b as usize] = tree.len() as u64;
        }
        let gathered = self.runtime.all_gather_vec(&counts);
        for b in 0..nb {
            let mut best_count = 0u64;
            let mut best_rank = self.block_owners[b];
            for (r, rank_counts) in gathered.iter().enumerate() {
                if rank_counts[b] > best_count {
                    best_count = rank_counts[b];
                    best_rank = r as u32;
                }
            }
            if best_count > 0 {
                self.block_owners[b] = best_rank;
            }
        }

        self.nodes = None;
        debug!(
            "rank {} repartition: {} local leaves, {} shipped",
            me,
            self.local_leaf_count(),
            shipped
        );

        debug_assert!(
            self.local_leaf_count() as u64 <= q + 1,
            "repartition left rank {} with {} leaves, expected at most {}",
            me,
            self.local_leaf_count(),
            q + 1
        );
    }
}
