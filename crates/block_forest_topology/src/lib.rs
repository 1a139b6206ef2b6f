//! The block-topology graph: how the hexahedral blocks of a multi-block mesh
//! connect through shared faces, edges and corners.
//!
//! The graph is derived once from the user-supplied block-node connectivity
//! and is immutable afterwards. Every cross-block neighbor query in the
//! forest goes through the coordinate maps defined here; the orientation
//! codes computed at construction make those maps pure table lookups.

pub mod connectivity;
pub mod topology;

pub use crate::connectivity::BlockConnectivity;
pub use crate::topology::{BlockTopology, FaceOrientation};

pub mod prelude {
    pub use crate::connectivity::BlockConnectivity;
    pub use crate::topology::{BlockTopology, FaceOrientation};
}
