//! The derived topology graph and its coordinate maps.

use crate::connectivity::BlockConnectivity;

use block_forest_core::{Octant, SIDE};
use fnv::FnvHashMap;
use indexmap::IndexMap;

/// Corner nodes of the 6 local faces, in face-local order: the lower tangent
/// axis varies fastest. Face `2a + s` is the face of axis `a` on side `s`.
pub const FACE_CORNERS: [[usize; 4]; 6] = [
    [0, 2, 4, 6], // x = 0
    [1, 3, 5, 7], // x = 1
    [0, 1, 4, 5], // y = 0
    [2, 3, 6, 7], // y = 1
    [0, 1, 2, 3], // z = 0
    [4, 5, 6, 7], // z = 1
];

/// End nodes of the 12 local edges. Edges `4a..4a+4` run along axis `a`; the
/// low-axis end node comes first.
pub const EDGE_NODES: [[usize; 2]; 12] = [
    [0, 1],
    [2, 3],
    [4, 5],
    [6, 7], // along x
    [0, 2],
    [1, 3],
    [4, 6],
    [5, 7], // along y
    [0, 4],
    [1, 5],
    [2, 6],
    [3, 7], // along z
];

/// The two tangent axes of each axis, in increasing order.
const TANGENT_AXES: [[usize; 2]; 3] = [[1, 2], [0, 2], [0, 1]];

/// One of the 8 symmetries of the square, mapping face-local `(u, v)`
/// parameters on one block to the glued block's face parameters. Bit 0
/// reflects u, bit 1 reflects v, bit 2 swaps u and v (applied first).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaceOrientation(pub u8);

impl FaceOrientation {
    #[inline]
    fn flip_u(&self) -> bool {
        self.0 & 1 != 0
    }

    #[inline]
    fn flip_v(&self) -> bool {
        self.0 & 2 != 0
    }

    #[inline]
    fn swap(&self) -> bool {
        self.0 & 4 != 0
    }

    /// Maps a point on the face, coordinates in `[0, SIDE]`.
    pub fn apply_point(&self, u: i32, v: i32) -> (i32, i32) {
        let (p, q) = if self.swap() { (v, u) } else { (u, v) };
        (
            if self.flip_u() { SIDE - p } else { p },
            if self.flip_v() { SIDE - q } else { q },
        )
    }

    /// Maps the anchor of a size-`h` cell on the face; reflections send an
    /// anchor to the far anchor of the reflected cell.
    pub fn apply_cell(&self, u: i32, v: i32, h: i32) -> (i32, i32) {
        let (p, q) = if self.swap() { (v, u) } else { (u, v) };
        (
            if self.flip_u() { SIDE - h - p } else { p },
            if self.flip_v() { SIDE - h - q } else { q },
        )
    }

    /// The map on unit corner coordinates; used to validate gluings.
    fn apply_unit(&self, u: u8, v: u8) -> (u8, u8) {
        let (p, q) = if self.swap() { (v, u) } else { (u, v) };
        (
            if self.flip_u() { 1 - p } else { p },
            if self.flip_v() { 1 - q } else { q },
        )
    }
}

/// The derived block-topology graph. Immutable once constructed; replicated
/// on every rank.
#[derive(Clone, Debug)]
pub struct BlockTopology {
    conn: BlockConnectivity,
    block_faces: Vec<[u32; 6]>,
    face_incidences: Vec<Vec<(u32, u8)>>,
    face_neighbors: Vec<[Option<(u32, u8, FaceOrientation)>; 6]>,
    block_edges: Vec<[u32; 12]>,
    edge_incidences: Vec<Vec<(u32, u8, bool)>>,
    corner_incidences: FnvHashMap<u32, Vec<(u32, u8)>>,
}

impl BlockTopology {
    /// Derives the full adjacency graph from a block-node connectivity.
    pub fn from_connectivity(conn: &BlockConnectivity) -> Self {
        let nb = conn.num_blocks();

        // Faces keyed by their sorted corner-node tuple. IndexMap keeps face
        // ids in first-encountered order.
        let mut face_table: IndexMap<[u32; 4], Vec<(u32, u8)>> = IndexMap::new();
        let mut block_faces = vec![[0u32; 6]; nb];
        for b in 0..nb {
            let nodes = conn.block_nodes(b as u32);
            for f in 0..6 {
                let mut key = [0u32; 4];
                for (i, &corner) in FACE_CORNERS[f].iter().enumerate() {
                    key[i] = nodes[corner];
                }
                key.sort_unstable();
                let entry = face_table.entry(key);
                block_faces[b][f] = entry.index() as u32;
                entry.or_insert_with(Vec::new).push((b as u32, f as u8));
            }
        }
        let face_incidences: Vec<Vec<(u32, u8)>> =
            face_table.into_iter().map(|(_, v)| v).collect();
        for (id, inc) in face_incidences.iter().enumerate() {
            assert!(
                inc.len() <= 2,
                "face {} is shared by {} blocks; at most two blocks may share a face",
                id,
                inc.len()
            );
        }

        let mut face_neighbors = vec![[None; 6]; nb];
        for inc in face_incidences.iter() {
            if inc.len() == 2 {
                let (a, b) = (inc[0], inc[1]);
                face_neighbors[a.0 as usize][a.1 as usize] =
                    Some((b.0, b.1, face_orientation(conn, a, b)));
                face_neighbors[b.0 as usize][b.1 as usize] =
                    Some((a.0, a.1, face_orientation(conn, b, a)));
            }
        }

        // Edges keyed by their sorted end-node pair. The first incidence
        // fixes the canonical direction; every incidence records whether it
        // runs opposite to it.
        let mut edge_table: IndexMap<[u32; 2], Vec<(u32, u8, bool)>> = IndexMap::new();
        let mut block_edges = vec![[0u32; 12]; nb];
        for b in 0..nb {
            let nodes = conn.block_nodes(b as u32);
            for e in 0..12 {
                let lo = nodes[EDGE_NODES[e][0]];
                let hi = nodes[EDGE_NODES[e][1]];
                let mut key = [lo, hi];
                key.sort_unstable();
                let entry = edge_table.entry(key);
                block_edges[b][e] = entry.index() as u32;
                let list = entry.or_insert_with(Vec::new);
                let reversed = match list.first() {
                    Some(&(cb, ce, _)) => {
                        let canon = conn.block_nodes(cb)[EDGE_NODES[ce as usize][0]];
                        lo != canon
                    }
                    None => false,
                };
                list.push((b as u32, e as u8, reversed));
            }
        }
        let edge_incidences: Vec<Vec<(u32, u8, bool)>> =
            edge_table.into_iter().map(|(_, v)| v).collect();

        let mut corner_incidences: FnvHashMap<u32, Vec<(u32, u8)>> = FnvHashMap::default();
        for b in 0..nb {
            let nodes = conn.block_nodes(b as u32);
            for c in 0..8 {
                corner_incidences
                    .entry(nodes[c])
                    .or_insert_with(Vec::new)
                    .push((b as u32, c as u8));
            }
        }

        BlockTopology {
            conn: conn.clone(),
            block_faces,
            face_incidences,
            face_neighbors,
            block_edges,
            edge_incidences,
            corner_incidences,
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.conn.num_blocks()
    }

    pub fn connectivity(&self) -> &BlockConnectivity {
        &self.conn
    }

    pub fn num_faces(&self) -> usize {
        self.face_incidences.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edge_incidences.len()
    }

    /// The globally unique id of a block's local face.
    pub fn face_id(&self, block: u32, face: u8) -> u32 {
        self.block_faces[block as usize][face as usize]
    }

    pub fn edge_id(&self, block: u32, edge: u8) -> u32 {
        self.block_edges[block as usize][edge as usize]
    }

    /// The block glued across `face`, with the orientation code mapping this
    /// block's face parameters to the other block's.
    pub fn face_neighbor(&self, block: u32, face: u8) -> Option<(u32, u8, FaceOrientation)> {
        self.face_neighbors[block as usize][face as usize]
    }

    /// All `(block, edge, reversed)` incidences of a local edge, including
    /// the queried one.
    pub fn edge_incidences(&self, block: u32, edge: u8) -> &[(u32, u8, bool)] {
        &self.edge_incidences[self.block_edges[block as usize][edge as usize] as usize]
    }

    /// All `(block, corner)` incidences of a local corner, including the
    /// queried one.
    pub fn corner_incidences(&self, block: u32, corner: u8) -> &[(u32, u8)] {
        let node = self.conn.block_nodes(block)[corner as usize];
        &self.corner_incidences[&node]
    }

    /// Contiguous block-to-rank assignment. External graph partitioners can
    /// replace this; the forest only consumes the resulting owner array.
    pub fn assign_ranks(&self, num_ranks: usize) -> Vec<u32> {
        assert!(num_ranks > 0);
        let nb = self.num_blocks();
        (0..nb).map(|b| (b * num_ranks / nb) as u32).collect()
    }

    /// Maps an octant that stepped outside its block cube into every block
    /// that contains the crossed face, edge or corner. Returns an empty
    /// vector at a physical boundary. The input octant must be out of range
    /// along at least one axis.
    pub fn octant_images(&self, oct: &Octant) -> Vec<Octant> {
        let h = oct.side_length();
        let coords = [oct.x, oct.y, oct.z];
        // None: in range; Some(s): crossed to the low (false) or high side.
        let mut crossed = [None; 3];
        for axis in 0..3 {
            if coords[axis] < 0 {
                crossed[axis] = Some(false);
            } else if coords[axis] >= SIDE {
                crossed[axis] = Some(true);
            }
        }
        let n_crossed = crossed.iter().filter(|c| c.is_some()).count();
        assert!(n_crossed > 0, "octant_images called with an in-block octant");

        let mut images = Vec::new();
        match n_crossed {
            1 => {
                let axis = crossed.iter().position(|c| c.is_some()).unwrap();
                let face = (2 * axis) as u8 + crossed[axis].unwrap() as u8;
                if let Some((ob, of, orient)) = self.face_neighbor(oct.block, face) {
                    let [t1, t2] = TANGENT_AXES[axis];
                    let (u2, v2) = orient.apply_cell(coords[t1], coords[t2], h);
                    let oa = (of >> 1) as usize;
                    let [ot1, ot2] = TANGENT_AXES[oa];
                    let mut c = [0i32; 3];
                    c[oa] = if of & 1 == 0 { 0 } else { SIDE - h };
                    c[ot1] = u2;
                    c[ot2] = v2;
                    images.push(Octant {
                        block: ob,
                        x: c[0],
                        y: c[1],
                        z: c[2],
                        level: oct.level,
                        tag: oct.tag,
                    });
                }
            }
            2 => {
                let axis = crossed.iter().position(|c| c.is_none()).unwrap();
                let [t1, t2] = TANGENT_AXES[axis];
                let b1 = crossed[t1].unwrap() as u8;
                let b2 = crossed[t2].unwrap() as u8;
                let edge = (4 * axis) as u8 + b1 + 2 * b2;
                let incidences = self.edge_incidences(oct.block, edge);
                let my_rev = incidences
                    .iter()
                    .find(|&&(b, e, _)| b == oct.block && e == edge)
                    .map(|&(_, _, rev)| rev)
                    .unwrap();
                let t = coords[axis];
                for &(ob, oe, orev) in incidences.iter() {
                    if ob == oct.block && oe == edge {
                        continue;
                    }
                    let t_img = if my_rev ^ orev { SIDE - h - t } else { t };
                    let oa = (oe >> 2) as usize;
                    let [ot1, ot2] = TANGENT_AXES[oa];
                    let mut c = [0i32; 3];
                    c[oa] = t_img;
                    c[ot1] = if oe & 1 != 0 { SIDE - h } else { 0 };
                    c[ot2] = if oe & 2 != 0 { SIDE - h } else { 0 };
                    images.push(Octant {
                        block: ob,
                        x: c[0],
                        y: c[1],
                        z: c[2],
                        level: oct.level,
                        tag: oct.tag,
                    });
                }
            }
            _ => {
                let corner = crossed
                    .iter()
                    .enumerate()
                    .map(|(axis, c)| (c.unwrap() as u8) << axis)
                    .fold(0, |acc, b| acc | b);
                for &(ob, oc) in self.corner_incidences(oct.block, corner).iter() {
                    if ob == oct.block && oc == corner {
                        continue;
                    }
                    let mut c = [0i32; 3];
                    for axis in 0..3 {
                        c[axis] = if (oc >> axis) & 1 != 0 { SIDE - h } else { 0 };
                    }
                    images.push(Octant {
                        block: ob,
                        x: c[0],
                        y: c[1],
                        z: c[2],
                        level: oct.level,
                        tag: oct.tag,
                    });
                }
            }
        }
        images
    }

    /// Maps a point on the boundary of a block cube into the other blocks
    /// incident to the face, edge or corner it lies on. Points interior to
    /// the block have no images.
    pub fn point_images(&self, block: u32, p: [i32; 3]) -> Vec<(u32, [i32; 3])> {
        let mut on = [None; 3];
        for axis in 0..3 {
            if p[axis] == 0 {
                on[axis] = Some(false);
            } else if p[axis] == SIDE {
                on[axis] = Some(true);
            }
        }
        let n_on = on.iter().filter(|c| c.is_some()).count();

        let mut images = Vec::new();
        match n_on {
            0 => {}
            1 => {
                let axis = on.iter().position(|c| c.is_some()).unwrap();
                let face = (2 * axis) as u8 + on[axis].unwrap() as u8;
                if let Some((ob, of, orient)) = self.face_neighbor(block, face) {
                    let [t1, t2] = TANGENT_AXES[axis];
                    let (u2, v2) = orient.apply_point(p[t1], p[t2]);
                    let oa = (of >> 1) as usize;
                    let [ot1, ot2] = TANGENT_AXES[oa];
                    let mut c = [0i32; 3];
                    c[oa] = if of & 1 == 0 { 0 } else { SIDE };
                    c[ot1] = u2;
                    c[ot2] = v2;
                    images.push((ob, c));
                }
            }
            2 => {
                let axis = on.iter().position(|c| c.is_none()).unwrap();
                let [t1, t2] = TANGENT_AXES[axis];
                let b1 = on[t1].unwrap() as u8;
                let b2 = on[t2].unwrap() as u8;
                let edge = (4 * axis) as u8 + b1 + 2 * b2;
                let incidences = self.edge_incidences(block, edge);
                let my_rev = incidences
                    .iter()
                    .find(|&&(b, e, _)| b == block && e == edge)
                    .map(|&(_, _, rev)| rev)
                    .unwrap();
                for &(ob, oe, orev) in incidences.iter() {
                    if ob == block && oe == edge {
                        continue;
                    }
                    let t_img = if my_rev ^ orev { SIDE - p[axis] } else { p[axis] };
                    let oa = (oe >> 2) as usize;
                    let [ot1, ot2] = TANGENT_AXES[oa];
                    let mut c = [0i32; 3];
                    c[oa] = t_img;
                    c[ot1] = if oe & 1 != 0 { SIDE } else { 0 };
                    c[ot2] = if oe & 2 != 0 { SIDE } else { 0 };
                    images.push((ob, c));
                }
            }
            _ => {
                let corner = on
                    .iter()
                    .enumerate()
                    .map(|(axis, c)| (c.unwrap() as u8) << axis)
                    .fold(0, |acc, b| acc | b);
                for &(ob, oc) in self.corner_incidences(block, corner).iter() {
                    if ob == block && oc == corner {
                        continue;
                    }
                    let mut c = [0i32; 3];
                    for axis in 0..3 {
                        c[axis] = if (oc >> axis) & 1 != 0 { SIDE } else { 0 };
                    }
                    images.push((ob, c));
                }
            }
        }
        images
    }
}

/// Computes the orientation code mapping face `a`'s parameters onto face
/// `b`'s by matching their global corner-node tuples, then validates the code
/// against all four corners.
fn face_orientation(conn: &BlockConnectivity, a: (u32, u8), b: (u32, u8)) -> FaceOrientation {
    let corner_nodes = |(block, face): (u32, u8)| -> [u32; 4] {
        let nodes = conn.block_nodes(block);
        let mut out = [0u32; 4];
        for (i, &corner) in FACE_CORNERS[face as usize].iter().enumerate() {
            out[i] = nodes[corner];
        }
        out
    };
    let an = corner_nodes(a);
    let bn = corner_nodes(b);

    let mut pos = [0u8; 4];
    for (i, n) in an.iter().enumerate() {
        pos[i] = bn
            .iter()
            .position(|m| m == n)
            .unwrap_or_else(|| {
                panic!(
                    "blocks {} and {} share a face but their corner nodes do not match",
                    a.0, b.0
                )
            }) as u8;
    }

    let swap = (pos[0] ^ pos[1]) & 1 == 0;
    let orient = FaceOrientation((pos[0] & 3) | if swap { 4 } else { 0 });

    for (j, &p) in pos.iter().enumerate() {
        let (u, v) = orient.apply_unit(j as u8 & 1, (j as u8 >> 1) & 1);
        assert_eq!(
            u | v << 1,
            p,
            "inconsistent face gluing between blocks {} and {}",
            a.0,
            b.0
        );
    }
    orient
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_forest_core::MAX_LEVEL;

    /// Two unit blocks stacked along x, identity gluing.
    fn two_blocks() -> BlockTopology {
        let conn = BlockConnectivity::new(
            12,
            vec![[0, 1, 2, 3, 4, 5, 6, 7], [1, 8, 3, 9, 5, 10, 7, 11]],
        );
        BlockTopology::from_connectivity(&conn)
    }

    /// Two blocks sharing only the edge between nodes 6 and 7, listed in
    /// opposite order by the second block.
    fn edge_blocks() -> BlockTopology {
        let conn = BlockConnectivity::new(
            14,
            vec![[0, 1, 2, 3, 4, 5, 6, 7], [7, 6, 8, 9, 10, 11, 12, 13]],
        );
        BlockTopology::from_connectivity(&conn)
    }

    #[test]
    fn face_counts_and_ids() {
        let topo = two_blocks();
        // 6 + 6 faces, one shared.
        assert_eq!(topo.num_faces(), 11);
        assert_eq!(topo.face_id(0, 1), topo.face_id(1, 0));
    }

    #[test]
    fn identity_face_orientation() {
        let topo = two_blocks();
        let (ob, of, orient) = topo.face_neighbor(0, 1).unwrap();
        assert_eq!((ob, of), (1, 0));
        assert_eq!(orient, FaceOrientation(0));
        assert!(topo.face_neighbor(0, 0).is_none());
    }

    #[test]
    fn octant_maps_across_identity_face() {
        let topo = two_blocks();
        // The +x face neighbor of a level-1 octant on block 0's high-x side.
        let o = Octant::root(0).child(1);
        let n = o.face_neighbor(1);
        assert!(!n.in_block());
        let images = topo.octant_images(&n);
        assert_eq!(images.len(), 1);
        let img = images[0];
        assert_eq!(img.block, 1);
        assert_eq!((img.x, img.y, img.z, img.level), (0, 0, 0, 1));
    }

    #[test]
    fn octant_maps_across_reversed_edge() {
        let topo = edge_blocks();
        let h = 1 << (MAX_LEVEL - 1);
        // Block 0's octant at the high-y, high-z edge, low-x end.
        let o = Octant::new(0, 0, h, h, 1);
        // Diagonal neighbor across edge 3 (along x at y = 1, z = 1).
        let n = o.edge_neighbor(3);
        assert!(!n.in_block());
        let images = topo.octant_images(&n);
        assert_eq!(images.len(), 1);
        let img = images[0];
        assert_eq!(img.block, 1);
        // The shared edge runs in opposite directions, so the low-x cell of
        // block 0 lands at the high-x end of block 1's edge 0 (y = 0, z = 0).
        assert_eq!((img.x, img.y, img.z), (h, 0, 0));
    }

    #[test]
    fn point_maps_along_reversed_edge() {
        let topo = edge_blocks();
        let t = 1 << 10;
        let images = topo.point_images(0, [t, SIDE, SIDE]);
        assert_eq!(images.len(), 1);
        let (b, p) = images[0];
        assert_eq!(b, 1);
        assert_eq!(p, [SIDE - t, 0, 0]);
    }

    #[test]
    fn point_face_and_corner_images() {
        let topo = two_blocks();
        // A point interior to the shared face.
        let u = 1 << 9;
        let images = topo.point_images(0, [SIDE, u, 2 * u]);
        assert_eq!(images, vec![(1, [0, u, 2 * u])]);

        // A corner of the shared face: node 7 sits at block 0's corner 7 and
        // block 1's corner 6.
        let images = topo.point_images(0, [SIDE, SIDE, SIDE]);
        assert_eq!(images, vec![(1, [0, SIDE, SIDE])]);

        // Interior points have no images.
        assert!(topo.point_images(0, [u, u, u]).is_empty());
    }

    #[test]
    fn rotated_face_orientation_round_trips() {
        // Block 1 is glued to block 0's +x face with a quarter turn: block
        // 0's face corners (1, 3, 5, 7) appear in block 1's -x face in the
        // order (5, 1, 7, 3).
        //
        // Block 1 node layout: corner 0 = 5, corner 2 = 1, corner 4 = 7,
        // corner 6 = 3 (its -x face corners are [n0, n2, n4, n6]).
        let conn = BlockConnectivity::new(
            12,
            vec![[0, 1, 2, 3, 4, 5, 6, 7], [5, 8, 1, 9, 7, 10, 3, 11]],
        );
        let topo = BlockTopology::from_connectivity(&conn);
        let (ob, of, orient) = topo.face_neighbor(0, 1).unwrap();
        assert_eq!((ob, of), (1, 0));

        // Node 1 sits at block 0 face params (u, v) = (0, 0) and at block 1
        // face params (1, 0); node 7 at (1, 1) maps to (0, 1).
        assert_eq!(orient.apply_point(0, 0), (SIDE, 0));
        assert_eq!(orient.apply_point(SIDE, SIDE), (0, SIDE));

        // The inverse code on the other side undoes the map.
        let (_, _, back) = topo.face_neighbor(1, 0).unwrap();
        let (u, v) = orient.apply_point(1 << 8, 1 << 20);
        assert_eq!(back.apply_point(u, v), (1 << 8, 1 << 20));
    }

    #[test]
    fn contiguous_rank_assignment() {
        let topo = two_blocks();
        assert_eq!(topo.assign_ranks(1), vec![0, 0]);
        assert_eq!(topo.assign_ranks(2), vec![0, 1]);
        // More ranks than blocks: block 0 stays on rank 0.
        assert_eq!(topo.assign_ranks(4), vec![0, 2]);
    }

    #[test]
    #[should_panic]
    fn overshared_face_rejected() {
        // Three blocks claiming the same 4 nodes as a face.
        let conn = BlockConnectivity::new(
            16,
            vec![
                [0, 1, 2, 3, 4, 5, 6, 7],
                [1, 8, 3, 9, 5, 10, 7, 11],
                [1, 12, 3, 13, 5, 14, 7, 15],
            ],
        );
        let _ = BlockTopology::from_connectivity(&conn);
    }
}
