//! Sparse nodal interpolation between two forests over the same topology.

use crate::forest::Forest;

use block_forest_core::SIDE;
use log::debug;

/// Rows mapping target node indices to weighted source node indices, in the
/// same CSR shape as the dependent-node constraints.
#[derive(Clone, Debug, Default)]
pub struct Interpolation {
    pub nodes: Vec<i64>,
    pub ptr: Vec<usize>,
    pub conn: Vec<i64>,
    pub weights: Vec<f64>,
}

impl Forest {
    /// Builds the interpolation carrying this forest's nodal field onto
    /// `target`'s nodes: each target node receives the trilinear weights of
    /// the source leaf containing it, evaluated at its parametric position.
    ///
    /// Both forests must share the block topology and have nodes created,
    /// and each rank must hold the source region under its target nodes
    /// (matching distributions). Rows are built for the target nodes whose
    /// containing source leaf is resident here.
    pub fn create_interpolation(&self, target: &Forest) -> Interpolation {
        assert_eq!(
            self.topology.num_blocks(),
            target.topology.num_blocks(),
            "interpolation requires forests over the same topology"
        );

        let mut out = Interpolation::default();
        out.ptr.push(0);

        for entry in target.node_array() {
            let mut frames = vec![(entry.block, [entry.x, entry.y, entry.z])];
            frames.extend(self.topology.point_images(entry.block, [entry.x, entry.y, entry.z]));

            for (fb, fp) in frames {
                // Points on the far boundary belong to the last cell.
                let probe = block_forest_core::Octant {
                    block: fb,
                    x: fp[0].min(SIDE - 1),
                    y: fp[1].min(SIDE - 1),
                    z: fp[2].min(SIDE - 1),
                    level: block_forest_core::MAX_LEVEL,
                    tag: 0,
                };
                let leaf = match self.trees.get(&fb).and_then(|t| t.find_enclosing(&probe)) {
                    Some(l) => *l,
                    None => continue,
                };
                let h = leaf.side_length();
                let t = [
                    (fp[0] - leaf.x) as f64 / h as f64,
                    (fp[1] - leaf.y) as f64 / h as f64,
                    (fp[2] - leaf.z) as f64 / h as f64,
                ];
                out.nodes.push(entry.index);
                for corner in 0..8u8 {
                    let mut w = 1.0;
                    let mut pt = [0i32; 3];
                    for axis in 0..3 {
                        let bit = (corner >> axis) & 1;
                        w *= if bit == 1 { t[axis] } else { 1.0 - t[axis] };
                        pt[axis] = [leaf.x, leaf.y, leaf.z][axis] + bit as i32 * h;
                    }
                    if w == 0.0 {
                        continue;
                    }
                    let index = self
                        .node_index(fb, pt[0], pt[1], pt[2])
                        .expect("source forest is missing a corner node");
                    out.conn.push(index);
                    out.weights.push(w);
                }
                out.ptr.push(out.conn.len());
                break;
            }
        }

        debug!(
            "rank {} interpolation: {} rows onto {} target nodes",
            self.rank(),
            out.nodes.len(),
            target.node_array().len()
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{single_block_forest, two_block_forest};

    #[test]
    fn coarse_to_fine_rows_sum_to_one() {
        let mut source = single_block_forest();
        source.create_trees_uniform(1);
        source.create_nodes(2);

        let mut target = single_block_forest();
        target.create_trees_uniform(2);
        target.create_nodes(2);

        let interp = source.create_interpolation(&target);
        assert_eq!(interp.nodes.len(), 125);
        for i in 0..interp.nodes.len() {
            let w = &interp.weights[interp.ptr[i]..interp.ptr[i + 1]];
            let sum: f64 = w.iter().sum();
            assert!((sum - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn coincident_nodes_interpolate_exactly() {
        let mut source = single_block_forest();
        source.create_trees_uniform(1);
        source.create_nodes(2);

        let mut target = single_block_forest();
        target.create_trees_uniform(1);
        target.create_nodes(2);

        let interp = source.create_interpolation(&target);
        assert_eq!(interp.nodes.len(), 27);
        for i in 0..interp.nodes.len() {
            let row = &interp.conn[interp.ptr[i]..interp.ptr[i + 1]];
            let w = &interp.weights[interp.ptr[i]..interp.ptr[i + 1]];
            assert_eq!(row.len(), 1);
            assert!((w[0] - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn interpolation_crosses_block_interfaces() {
        let mut source = two_block_forest();
        source.create_trees(&[1, 1]);
        source.create_nodes(2);

        let mut target = two_block_forest();
        target.create_trees(&[2, 2]);
        target.create_nodes(2);

        let interp = source.create_interpolation(&target);
        assert_eq!(interp.nodes.len(), target.node_array().len());
        for i in 0..interp.nodes.len() {
            let w = &interp.weights[interp.ptr[i]..interp.ptr[i + 1]];
            let sum: f64 = w.iter().sum();
            assert!((sum - 1.0).abs() < 1e-12);
        }
    }
}
