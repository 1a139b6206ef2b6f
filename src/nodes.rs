//! Global node numbering and the dependent-node constraint layer.
//!
//! `create_nodes` turns the balanced forest into a finite-element node set:
//! every leaf contributes the `p^3` nodes of an order-`p` Lagrange element,
//! nodes on shared block faces, edges and corners are deduplicated through
//! the topology's orientation maps, and every geometric node receives one
//! globally unique index. Nodes sitting in the interior of a coarser
//! neighbor's face or edge are *dependent*: their values are constrained to
//! the coarse side's nodes by the trace of its shape functions, emitted as a
//! CSR triple `(ptr, conn, weights)`.

use crate::forest::{find_enclosing_ghost, Forest};

use block_forest_core::{morton, Octant, MAX_LEVEL, SIDE};
use fnv::FnvHashMap;
use log::debug;
use std::cmp::Ordering;

/// One geometric node: its canonical frame, its owning rank, and its global
/// index. Nodes listed locally include every node of a local element plus
/// the remote nodes referenced by local dependent-node constraints.
#[derive(Clone, Copy, Debug)]
pub struct NodeEntry {
    pub block: u32,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub owner: u32,
    pub index: i64,
    pub dependent: bool,
}

/// Dependent-node constraints in CSR form: dependent node `nodes[i]` is the
/// weighted combination of the independent nodes `conn[ptr[i]..ptr[i + 1]]`.
#[derive(Clone, Debug, Default)]
pub struct DependentConn {
    pub nodes: Vec<i64>,
    pub ptr: Vec<usize>,
    pub conn: Vec<i64>,
    pub weights: Vec<f64>,
}

pub(crate) struct NodeData {
    pub order: u8,
    pub entries: Vec<NodeEntry>,
    pub lookup: FnvHashMap<(u32, i32, i32, i32), usize>,
    pub owned_range: (i64, i64),
    pub rank_offsets: Vec<i64>,
    pub dependent: DependentConn,
}

/// An assigned global index for one node, addressed by one of its frames.
#[derive(Clone, Copy, Debug, Default)]
struct IndexMsg {
    block: u32,
    x: i32,
    y: i32,
    z: i32,
    index: i64,
}

#[cfg(feature = "mpi")]
mod mpi_datatype {
    use super::IndexMsg;

    use memoffset::offset_of;
    use mpi::datatype::{Equivalence, UncommittedUserDatatype, UserDatatype};
    use mpi::Address;

    unsafe impl Equivalence for IndexMsg {
        type Out = UserDatatype;

        fn equivalent_datatype() -> Self::Out {
            UserDatatype::structured(
                &[1, 3, 1],
                &[
                    offset_of!(IndexMsg, block) as Address,
                    offset_of!(IndexMsg, x) as Address,
                    offset_of!(IndexMsg, index) as Address,
                ],
                &[
                    UncommittedUserDatatype::contiguous(1, &u32::equivalent_datatype()).as_ref(),
                    UncommittedUserDatatype::contiguous(3, &i32::equivalent_datatype()).as_ref(),
                    UncommittedUserDatatype::contiguous(1, &i64::equivalent_datatype()).as_ref(),
                ],
            )
        }
    }
}

/// Where a dependent node hangs: the hosting coarse leaf (in its own frame)
/// and the node's offset within it.
#[derive(Clone, Copy, Debug)]
struct Hanging {
    block: u32,
    anchor: [i32; 3],
    level: u8,
    offset: [i32; 3],
}

struct Build {
    frames: Vec<(u32, [i32; 3])>,
    /// Generated from a local leaf; non-resident nodes exist only because a
    /// local constraint references them.
    resident: bool,
    sharing: Vec<u32>,
    hanging: Option<Hanging>,
    owner: u32,
    index: i64,
}

fn frame_cmp(a: &(u32, [i32; 3]), b: &(u32, [i32; 3])) -> Ordering {
    a.0.cmp(&b.0)
        .then_with(|| morton::cmp3(a.1[0], a.1[1], a.1[2], b.1[0], b.1[1], b.1[2]))
}

/// Values of the order-`p` 1D Lagrange basis at parameter `t` in `[0, 1]`.
/// Linear: nodes at 0, 1. Quadratic: nodes at 0, 1/2, 1.
fn basis_1d(p: u8, t: f64) -> Vec<f64> {
    match p {
        2 => vec![1.0 - t, t],
        3 => vec![
            2.0 * (t - 0.5) * (t - 1.0),
            -4.0 * t * (t - 1.0),
            2.0 * t * (t - 0.5),
        ],
        _ => unreachable!(),
    }
}

impl Forest {
    /// Builds the global node numbering for elements of order `order` (2 for
    /// trilinear, 3 for triquadratic). Collective. Any later refine, balance
    /// or repartition invalidates the result.
    pub fn create_nodes(&mut self, order: u8) {
        assert!(
            order == 2 || order == 3,
            "element order must be 2 or 3, got {}",
            order
        );
        assert!(
            self.global_leaf_count() > 0,
            "create_nodes called on an empty forest"
        );

        let me = self.rank();
        let size = self.runtime.size();
        let p = order as i32;

        let ghosts = self.exchange_adjacent_leaves();

        // ------------------------------------------------------------------
        // Candidate generation: p^3 nodes per local leaf, plus the nodes of
        // ghost leaves so local constraints can refer to them. Every frame
        // of a node maps to one entry keyed by its minimal frame.
        // ------------------------------------------------------------------
        let mut entries: Vec<Build> = Vec::new();
        let mut lookup: FnvHashMap<(u32, i32, i32, i32), usize> = FnvHashMap::default();

        {
            let mut add_leaf_nodes = |leaf: &Octant, resident: bool| {
                if order == 3 {
                    assert!(
                        leaf.level < MAX_LEVEL,
                        "order-3 nodes need leaf levels below {}",
                        MAX_LEVEL
                    );
                }
                let h = leaf.side_length();
                let step = h / (p - 1);
                for kz in 0..p {
                    for ky in 0..p {
                        for kx in 0..p {
                            let pt = [
                                leaf.x + kx * step,
                                leaf.y + ky * step,
                                leaf.z + kz * step,
                            ];
                            let key = (leaf.block, pt[0], pt[1], pt[2]);
                            if let Some(&idx) = lookup.get(&key) {
                                entries[idx].resident |= resident;
                                continue;
                            }
                            let mut frames = vec![(leaf.block, pt)];
                            frames.extend(self.topology.point_images(leaf.block, pt));
                            frames.sort_by(frame_cmp);
                            frames.dedup();
                            // Another frame of the same node may already be
                            // registered.
                            let canon_key =
                                (frames[0].0, frames[0].1[0], frames[0].1[1], frames[0].1[2]);
                            if let Some(&idx) = lookup.get(&canon_key) {
                                entries[idx].resident |= resident;
                                for f in &frames {
                                    lookup.insert((f.0, f.1[0], f.1[1], f.1[2]), idx);
                                }
                                continue;
                            }
                            let idx = entries.len();
                            for f in &frames {
                                lookup.insert((f.0, f.1[0], f.1[1], f.1[2]), idx);
                            }
                            entries.push(Build {
                                frames,
                                resident,
                                sharing: Vec::new(),
                                hanging: None,
                                owner: me as u32,
                                index: -1,
                            });
                        }
                    }
                }
            };

            for tree in self.trees.values() {
                for leaf in tree.iter() {
                    add_leaf_nodes(leaf, true);
                }
            }
            for list in ghosts.values() {
                for (leaf, _) in list.iter() {
                    add_leaf_nodes(leaf, false);
                }
            }
        }

        // ------------------------------------------------------------------
        // Incident-leaf scan: which ranks share each node, and does any
        // coarser incident leaf fail to carry it on its own lattice. The
        // coarsest violated leaf hosts the hanging-node constraint.
        // ------------------------------------------------------------------
        for build in entries.iter_mut() {
            let mut sharing: Vec<u32> = Vec::new();
            let mut host: Option<(u8, Hanging)> = None;

            for &(fb, fp) in &build.frames {
                for corner in 0..8u8 {
                    let mut probe = [0i32; 3];
                    let mut outside = false;
                    for axis in 0..3 {
                        probe[axis] = fp[axis] - ((corner >> axis) & 1) as i32;
                        if probe[axis] < 0 || probe[axis] >= SIDE {
                            outside = true;
                        }
                    }
                    if outside {
                        continue;
                    }
                    let probe = Octant {
                        block: fb,
                        x: probe[0],
                        y: probe[1],
                        z: probe[2],
                        level: MAX_LEVEL,
                        tag: 0,
                    };
                    let local = self
                        .trees
                        .get(&fb)
                        .and_then(|t| t.find_enclosing(&probe))
                        .copied();
                    let leaf = match local {
                        Some(l) => l,
                        None => match ghosts.get(&fb).and_then(|g| find_enclosing_ghost(g, &probe)) {
                            Some((l, rank)) => {
                                if !sharing.contains(&rank) {
                                    sharing.push(rank);
                                }
                                l
                            }
                            None => continue,
                        },
                    };

                    let lh = leaf.side_length();
                    let lstep = lh / (p - 1);
                    let anchor = [leaf.x, leaf.y, leaf.z];
                    let mut offset = [0i32; 3];
                    let mut on_lattice = true;
                    for axis in 0..3 {
                        offset[axis] = fp[axis] - anchor[axis];
                        if offset[axis] % lstep != 0 {
                            on_lattice = false;
                        }
                    }
                    if !on_lattice {
                        let replace = match host {
                            Some((level, _)) => leaf.level < level,
                            None => true,
                        };
                        if replace {
                            host = Some((
                                leaf.level,
                                Hanging {
                                    block: fb,
                                    anchor,
                                    level: leaf.level,
                                    offset,
                                },
                            ));
                        }
                    }
                }
            }

            sharing.sort_unstable();
            build.sharing = sharing;
            if build.resident {
                build.hanging = host.map(|(_, h)| h);
            }
            build.owner = if build.resident {
                build
                    .sharing
                    .first()
                    .map(|&r| r.min(me as u32))
                    .unwrap_or(me as u32)
            } else {
                // Not held here; some sharing rank owns it.
                *build
                    .sharing
                    .first()
                    .expect("ghost-derived node with no known holder")
            };
        }

        // ------------------------------------------------------------------
        // Canonical sort and contiguous numbering of owned nodes.
        // ------------------------------------------------------------------
        let mut order_ix: Vec<usize> = (0..entries.len()).collect();
        order_ix.sort_by(|&a, &b| frame_cmp(&entries[a].frames[0], &entries[b].frames[0]));
        let mut remap = vec![0usize; entries.len()];
        for (new, &old) in order_ix.iter().enumerate() {
            remap[old] = new;
        }
        let mut sorted: Vec<Build> = Vec::with_capacity(entries.len());
        for &old in &order_ix {
            let b = &mut entries[old];
            sorted.push(Build {
                frames: std::mem::take(&mut b.frames),
                resident: b.resident,
                sharing: std::mem::take(&mut b.sharing),
                hanging: b.hanging,
                owner: b.owner,
                index: b.index,
            });
        }
        let mut entries = sorted;
        for idx in lookup.values_mut() {
            *idx = remap[*idx];
        }

        let owned = entries
            .iter()
            .filter(|b| b.resident && b.owner == me as u32)
            .count() as u64;
        let offset = self.runtime.exclusive_scan_sum(owned) as i64;
        let counts = self.runtime.all_gather(owned);
        let mut rank_offsets = Vec::with_capacity(size + 1);
        let mut acc = 0i64;
        for c in &counts {
            rank_offsets.push(acc);
            acc += *c as i64;
        }
        rank_offsets.push(acc);

        let mut next = offset;
        for build in entries.iter_mut() {
            if build.resident && build.owner == me as u32 {
                build.index = next;
                next += 1;
            }
        }

        // ------------------------------------------------------------------
        // Owners push assigned indices to every sharing rank, under every
        // frame of the node.
        // ------------------------------------------------------------------
        let mut sends: Vec<Vec<IndexMsg>> = vec![Vec::new(); size];
        for build in entries.iter() {
            if build.index < 0 || build.owner != me as u32 {
                continue;
            }
            for &rank in &build.sharing {
                for &(fb, fp) in &build.frames {
                    sends[rank as usize].push(IndexMsg {
                        block: fb,
                        x: fp[0],
                        y: fp[1],
                        z: fp[2],
                        index: build.index,
                    });
                }
            }
        }
        for list in self.runtime.all_to_all(sends) {
            for msg in list {
                if let Some(&idx) = lookup.get(&(msg.block, msg.x, msg.y, msg.z)) {
                    let build = &mut entries[idx];
                    debug_assert!(build.index < 0 || build.index == msg.index);
                    build.index = msg.index;
                }
            }
        }

        // Any node still unnumbered was generated only from ghost leaves;
        // ask a rank that holds it.
        let mut queries: Vec<Vec<IndexMsg>> = vec![Vec::new(); size];
        for (idx, build) in entries.iter().enumerate() {
            if build.index >= 0 {
                continue;
            }
            let target = *build
                .sharing
                .first()
                .unwrap_or_else(|| panic!("node {} has no index and no holder", idx));
            let (fb, fp) = build.frames[0];
            queries[target as usize].push(IndexMsg {
                block: fb,
                x: fp[0],
                y: fp[1],
                z: fp[2],
                index: -1,
            });
        }
        let incoming = self.runtime.all_to_all(queries);
        let mut replies: Vec<Vec<IndexMsg>> = vec![Vec::new(); size];
        for (src, list) in incoming.into_iter().enumerate() {
            for msg in list {
                let idx = *lookup
                    .get(&(msg.block, msg.x, msg.y, msg.z))
                    .expect("queried for a node this rank does not hold");
                let index = entries[idx].index;
                assert!(index >= 0, "queried node has no index on its holder");
                replies[src].push(IndexMsg { index, ..msg });
            }
        }
        for list in self.runtime.all_to_all(replies) {
            for msg in list {
                let idx = lookup[&(msg.block, msg.x, msg.y, msg.z)];
                entries[idx].index = msg.index;
            }
        }
        for (idx, build) in entries.iter().enumerate() {
            assert!(build.index >= 0, "node {} was never numbered", idx);
        }

        // ------------------------------------------------------------------
        // Dependent rows: the trace of the hosting leaf's shape functions at
        // the hanging node, as weights over the host's own lattice nodes.
        // Chains (a constraint referencing another hanging node) flatten by
        // substitution.
        // ------------------------------------------------------------------
        let mut rows: FnvHashMap<usize, Vec<(usize, f64)>> = FnvHashMap::default();
        for (idx, build) in entries.iter().enumerate() {
            let hanging = match build.hanging {
                Some(h) => h,
                None => continue,
            };
            let lh = 1i32 << (MAX_LEVEL - hanging.level);
            let lstep = lh / (p - 1);
            let weights_1d: Vec<Vec<f64>> = (0..3)
                .map(|axis| basis_1d(order, hanging.offset[axis] as f64 / lh as f64))
                .collect();
            let mut row = Vec::new();
            for jz in 0..p {
                for jy in 0..p {
                    for jx in 0..p {
                        let w = weights_1d[0][jx as usize]
                            * weights_1d[1][jy as usize]
                            * weights_1d[2][jz as usize];
                        if w == 0.0 {
                            continue;
                        }
                        let pt = (
                            hanging.block,
                            hanging.anchor[0] + jx * lstep,
                            hanging.anchor[1] + jy * lstep,
                            hanging.anchor[2] + jz * lstep,
                        );
                        let target = *lookup.get(&pt).unwrap_or_else(|| {
                            panic!("constraint references an unregistered node at {:?}", pt)
                        });
                        row.push((target, w));
                    }
                }
            }
            rows.insert(idx, row);
        }

        // Substitute until no row references another locally known hanging
        // node. Level differences bound the chain length.
        for _ in 0..=MAX_LEVEL {
            let pending: Vec<usize> = rows
                .iter()
                .filter(|(_, row)| row.iter().any(|(j, _)| rows.contains_key(j)))
                .map(|(&i, _)| i)
                .collect();
            if pending.is_empty() {
                break;
            }
            for i in pending {
                let row = rows[&i].clone();
                let mut flat: FnvHashMap<usize, f64> = FnvHashMap::default();
                for (j, w) in row {
                    match rows.get(&j) {
                        Some(sub) if j != i => {
                            for &(k, wk) in sub {
                                *flat.entry(k).or_insert(0.0) += w * wk;
                            }
                        }
                        _ => *flat.entry(j).or_insert(0.0) += w,
                    }
                }
                let mut row: Vec<(usize, f64)> =
                    flat.into_iter().filter(|&(_, w)| w != 0.0).collect();
                row.sort_by_key(|&(j, _)| j);
                rows.insert(i, row);
            }
        }

        let mut dependent = DependentConn::default();
        dependent.ptr.push(0);
        for (idx, build) in entries.iter().enumerate() {
            if build.hanging.is_none() {
                continue;
            }
            let row = &rows[&idx];
            dependent.nodes.push(build.index);
            for &(j, w) in row {
                dependent.conn.push(entries[j].index);
                dependent.weights.push(w);
            }
            dependent.ptr.push(dependent.conn.len());
        }

        let node_entries: Vec<NodeEntry> = entries
            .iter()
            .map(|b| NodeEntry {
                block: b.frames[0].0,
                x: b.frames[0].1[0],
                y: b.frames[0].1[1],
                z: b.frames[0].1[2],
                owner: b.owner,
                index: b.index,
                dependent: b.hanging.is_some(),
            })
            .collect();

        debug!(
            "rank {} create_nodes: {} local nodes, {} owned, {} dependent",
            me,
            node_entries.len(),
            owned,
            dependent.nodes.len()
        );

        self.nodes = Some(NodeData {
            order,
            entries: node_entries,
            lookup,
            owned_range: (offset, offset + owned as i64),
            rank_offsets,
            dependent,
        });
    }

    fn node_data(&self) -> &NodeData {
        self.nodes
            .as_ref()
            .expect("create_nodes must be called before using node data")
    }

    /// The locally known nodes, sorted by `(block, Morton)` of their
    /// canonical frame.
    pub fn node_array(&self) -> &[NodeEntry] {
        &self.node_data().entries
    }

    /// The contiguous global index range owned by this rank.
    pub fn owned_node_range(&self) -> (i64, i64) {
        self.node_data().owned_range
    }

    /// Prefix sums of owned-node counts: rank `r` owns
    /// `rank_offsets[r]..rank_offsets[r + 1]`.
    pub fn node_rank_offsets(&self) -> &[i64] {
        &self.node_data().rank_offsets
    }

    pub fn global_node_count(&self) -> i64 {
        *self.node_data().rank_offsets.last().unwrap()
    }

    pub fn dependent_conn(&self) -> &DependentConn {
        &self.node_data().dependent
    }

    /// The global index of the node at `(block, x, y, z)`, under any frame.
    pub fn node_index(&self, block: u32, x: i32, y: i32, z: i32) -> Option<i64> {
        let data = self.node_data();
        data.lookup
            .get(&(block, x, y, z))
            .map(|&i| data.entries[i].index)
    }

    /// Element-to-node connectivity: for every local leaf in curve order,
    /// the global indices of its `p^3` nodes, x fastest, then y, then z.
    pub fn create_mesh_conn(&self) -> Vec<i64> {
        let data = self.node_data();
        let p = data.order as i32;
        let mut conn = Vec::with_capacity(self.local_leaf_count() * (p * p * p) as usize);
        for tree in self.trees.values() {
            for leaf in tree.iter() {
                push_element_nodes(data, leaf, &mut conn);
            }
        }
        conn
    }

    /// Maps every local leaf and its node indices through `f`: the pluggable
    /// element-creation hook.
    pub fn create_elements<E>(&self, mut f: impl FnMut(&Octant, &[i64]) -> E) -> Vec<E> {
        let data = self.node_data();
        let mut out = Vec::with_capacity(self.local_leaf_count());
        let mut scratch = Vec::new();
        for tree in self.trees.values() {
            for leaf in tree.iter() {
                scratch.clear();
                push_element_nodes(data, leaf, &mut scratch);
                out.push(f(leaf, &scratch));
            }
        }
        out
    }
}

fn push_element_nodes(data: &NodeData, leaf: &Octant, out: &mut Vec<i64>) {
    let p = data.order as i32;
    let step = leaf.side_length() / (p - 1);
    for kz in 0..p {
        for ky in 0..p {
            for kx in 0..p {
                let key = (
                    leaf.block,
                    leaf.x + kx * step,
                    leaf.y + ky * step,
                    leaf.z + kz * step,
                );
                let idx = data.lookup[&key];
                out.push(data.entries[idx].index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        edge_block_forest, single_block_forest, two_block_forest, two_block_forest_on,
    };
    use block_forest_comm::LocalCluster;

    fn assert_indices_cover(f: &Forest) {
        let n = f.global_node_count();
        let mut seen = vec![false; n as usize];
        for e in f.node_array() {
            assert!(e.index >= 0 && e.index < n);
            seen[e.index as usize] = true;
        }
        assert!(seen.iter().all(|&s| s), "node indices are not contiguous");
    }

    #[test]
    fn single_block_order_two() {
        let mut f = single_block_forest();
        f.create_trees_uniform(2);
        f.balance(false);
        f.create_nodes(2);
        assert_eq!(f.global_node_count(), 125);
        assert_eq!(f.owned_node_range(), (0, 125));
        assert!(f.dependent_conn().nodes.is_empty());
        assert_indices_cover(&f);

        let conn = f.create_mesh_conn();
        assert_eq!(conn.len(), 64 * 8);
        // Every node index appears in the connectivity.
        let mut seen = vec![false; 125];
        for &i in &conn {
            seen[i as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn single_block_order_three() {
        let mut f = single_block_forest();
        f.create_trees_uniform(1);
        f.create_nodes(3);
        // 8 leaves x 27 candidates deduplicate to the 5^3 lattice.
        assert_eq!(f.global_node_count(), 125);
        assert!(f.dependent_conn().nodes.is_empty());
        assert_eq!(f.create_mesh_conn().len(), 8 * 27);
    }

    #[test]
    fn nonconforming_interface_order_two() {
        let mut f = two_block_forest();
        f.create_trees(&[2, 1]);
        f.balance(false);
        f.create_nodes(2);

        // 5^3 + 3^3 - 9 shared face nodes.
        assert_eq!(f.global_node_count(), 143);
        assert_indices_cover(&f);

        let dep = f.dependent_conn();
        // Of block 0's 25 interface nodes, 9 coincide with block 1's coarse
        // lattice; the rest hang on it.
        assert_eq!(dep.nodes.len(), 16);

        let mut face_centers = 0;
        let mut edge_mids = 0;
        for i in 0..dep.nodes.len() {
            let row = &dep.conn[dep.ptr[i]..dep.ptr[i + 1]];
            let weights = &dep.weights[dep.ptr[i]..dep.ptr[i + 1]];
            let sum: f64 = weights.iter().sum();
            assert!((sum - 1.0).abs() < 1e-12);
            match row.len() {
                4 => {
                    face_centers += 1;
                    assert!(weights.iter().all(|&w| (w - 0.25).abs() < 1e-12));
                }
                2 => {
                    edge_mids += 1;
                    assert!(weights.iter().all(|&w| (w - 0.5).abs() < 1e-12));
                }
                n => panic!("unexpected dependent row width {}", n),
            }
        }
        assert_eq!(face_centers, 4);
        assert_eq!(edge_mids, 12);
    }

    #[test]
    fn nonconforming_interface_order_three() {
        let mut f = two_block_forest();
        f.create_trees(&[2, 1]);
        f.balance(false);
        f.create_nodes(3);

        // 9^3 + 5^3 - 25 shared face nodes.
        assert_eq!(f.global_node_count(), 829);
        assert_indices_cover(&f);

        let dep = f.dependent_conn();
        // 81 fine-side face nodes minus the 25 on the coarse lattice.
        assert_eq!(dep.nodes.len(), 56);
        for i in 0..dep.nodes.len() {
            let weights = &dep.weights[dep.ptr[i]..dep.ptr[i + 1]];
            let sum: f64 = weights.iter().sum();
            assert!((sum - 1.0).abs() < 1e-12);
        }
        // The quadratic trace at a quarter point carries the 3/8, 3/4, -1/8
        // stencil; rows constrained along one edge show it directly.
        let has_quarter_row = (0..dep.nodes.len()).any(|i| {
            let w = &dep.weights[dep.ptr[i]..dep.ptr[i + 1]];
            w.len() == 3 && {
                let mut v: Vec<f64> = w.to_vec();
                v.sort_by(|a, b| a.partial_cmp(b).unwrap());
                (v[0] + 0.125).abs() < 1e-12
                    && (v[1] - 0.375).abs() < 1e-12
                    && (v[2] - 0.75).abs() < 1e-12
            }
        });
        assert!(has_quarter_row);
    }

    #[test]
    fn shared_edge_nodes_deduplicate_under_reversal() {
        let mut f = edge_block_forest();
        f.create_trees(&[2, 2]);
        f.create_nodes(2);
        // Two 5^3 lattices sharing the 5 nodes of one edge.
        assert_eq!(f.global_node_count(), 245);
        assert_indices_cover(&f);
        assert!(f.dependent_conn().nodes.is_empty());
    }

    #[test]
    fn element_hook_sees_every_leaf() {
        let mut f = single_block_forest();
        f.create_trees_uniform(1);
        f.create_nodes(2);
        let elems = f.create_elements(|leaf, nodes| (leaf.level, nodes.len()));
        assert_eq!(elems.len(), 8);
        assert!(elems.iter().all(|&(level, n)| level == 1 && n == 8));
    }

    #[test]
    fn distributed_numbering_is_contiguous() {
        LocalCluster::run(2, |rt| {
            let rt0 = rt.clone();
            let mut f = two_block_forest_on(rt);
            f.create_trees(&[2, 1]);
            f.balance(false);
            f.create_nodes(2);

            assert_eq!(f.global_node_count(), 143);
            let (lo, hi) = f.owned_node_range();
            assert!(lo <= hi);

            // The owned ranges tile [0, 143).
            let offsets = f.node_rank_offsets().to_vec();
            assert_eq!(offsets.first(), Some(&0));
            assert_eq!(offsets.last(), Some(&143));

            // Interface nodes resolve to the same indices on both ranks.
            let mut sends: Vec<Vec<i64>> = vec![Vec::new(); rt0.size()];
            let my_interface: Vec<i64> = f
                .node_array()
                .iter()
                .filter(|e| e.block == 0 && e.x == block_forest_core::SIDE)
                .map(|e| e.index)
                .collect();
            for s in sends.iter_mut() {
                *s = my_interface.clone();
            }
            let gathered = rt0.all_to_all(sends);
            let mut mine = gathered[rt0.rank()].clone();
            let mut theirs = gathered[1 - rt0.rank()].clone();
            mine.sort_unstable();
            theirs.sort_unstable();
            // Both ranks hold all 25 interface nodes (fine frame) or the 9
            // coarse ones; the coarse set is a subset of the fine one.
            for t in &theirs {
                if !mine.contains(t) {
                    // A node only one side holds must still carry a valid
                    // global index.
                    assert!(*t >= 0 && *t < 143);
                }
            }

            // Dependent classification happens on the fine side only.
            let dep_total: u64 = rt0.all_reduce_sum(f.dependent_conn().nodes.len() as u64);
            assert_eq!(dep_total, 16);
        });
    }
}
