//! Distributed adaptive refinement forests of octrees over multi-block
//! hexahedral meshes.
//!
//! A [`Forest`] owns one octree per block of a user-supplied block topology
//! and keeps it distributed over the ranks of a [`Runtime`] along the Morton
//! space-filling curve. On top of the trees it provides the operations a
//! finite-element mesh layer needs:
//!
//! - `refine`: local, per-leaf refinement to target levels;
//! - `balance`: the 2:1 condition across faces (optionally edges and
//!   corners), enforced by a parallel ripple with ghost exchanges;
//! - `repartition`: space-filling-curve redistribution to per-rank counts
//!   within one of each other;
//! - `create_nodes` / `create_mesh_conn`: a globally unique node numbering
//!   with hanging-node constraints at non-conforming interfaces, and the
//!   element-to-node connectivity;
//! - `create_interpolation`: sparse nodal transfer between two forests.
//!
//! ```
//! use block_forest::prelude::*;
//!
//! let conn = BlockConnectivity::new(8, vec![[0, 1, 2, 3, 4, 5, 6, 7]]);
//! let topology = BlockTopology::from_connectivity(&conn);
//!
//! let mut forest = Forest::new(Runtime::serial(), topology);
//! forest.create_trees_uniform(2);
//! assert_eq!(forest.local_leaf_count(), 64);
//!
//! forest.balance(false);
//! forest.create_nodes(2);
//! assert_eq!(forest.global_node_count(), 125);
//! assert_eq!(forest.create_mesh_conn().len(), 64 * 8);
//! assert!(forest.dependent_conn().nodes.is_empty());
//! ```
//!
//! Failures are programmer errors: invalid connectivity, level overflow or
//! an empty forest abort the process with a message rather than returning an
//! error. A corrupted forest would invalidate everything downstream of it.

pub mod balance;
pub mod forest;
pub mod interp;
pub mod nodes;
pub mod repartition;

pub use crate::forest::Forest;
pub use crate::interp::Interpolation;
pub use crate::nodes::{DependentConn, NodeEntry};

pub use block_forest_comm;
pub use block_forest_core;
pub use block_forest_topology;

pub mod prelude {
    pub use crate::forest::Forest;
    pub use crate::interp::Interpolation;
    pub use crate::nodes::{DependentConn, NodeEntry};

    pub use block_forest_comm::{LocalCluster, Runtime};
    pub use block_forest_core::prelude::*;
    pub use block_forest_topology::prelude::*;
}

#[cfg(test)]
pub(crate) mod testing {
    use crate::forest::Forest;
    use block_forest_comm::Runtime;
    use block_forest_core::OctantList;
    use block_forest_topology::{BlockConnectivity, BlockTopology};
    use std::collections::BTreeMap;

    /// One unit block.
    pub fn single_block_forest_on(rt: Runtime) -> Forest {
        let conn = BlockConnectivity::new(8, vec![[0, 1, 2, 3, 4, 5, 6, 7]]);
        Forest::new(rt, BlockTopology::from_connectivity(&conn))
    }

    pub fn single_block_forest() -> Forest {
        single_block_forest_on(Runtime::serial())
    }

    /// Two blocks glued along block 0's +x face with identity orientation.
    pub fn two_block_forest_on(rt: Runtime) -> Forest {
        let conn = BlockConnectivity::new(
            12,
            vec![[0, 1, 2, 3, 4, 5, 6, 7], [1, 8, 3, 9, 5, 10, 7, 11]],
        );
        Forest::new(rt, BlockTopology::from_connectivity(&conn))
    }

    pub fn two_block_forest() -> Forest {
        two_block_forest_on(Runtime::serial())
    }

    /// Two blocks sharing only one edge, listed in opposite directions.
    pub fn edge_block_forest() -> Forest {
        let conn = BlockConnectivity::new(
            14,
            vec![[0, 1, 2, 3, 4, 5, 6, 7], [7, 6, 8, 9, 10, 11, 12, 13]],
        );
        Forest::new(
            Runtime::serial(),
            BlockTopology::from_connectivity(&conn),
        )
    }

    /// Leaf counts per level, ascending.
    pub fn leaf_levels(tree: &OctantList) -> Vec<(u8, usize)> {
        let mut counts: BTreeMap<u8, usize> = BTreeMap::new();
        for leaf in tree.iter() {
            *counts.entry(leaf.level).or_insert(0) += 1;
        }
        counts.into_iter().collect()
    }
}
