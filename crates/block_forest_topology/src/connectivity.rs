//! User-supplied block-node connectivity.

/// The input mesh: a set of hexahedral blocks given by 8 node indices each,
/// in the standard ordering where node `k` sits at the local corner
/// `((k & 1), (k >> 1) & 1, (k >> 2) & 1)` — x varies fastest, then y, then z.
///
/// Node coordinates are optional; the forest core never evaluates geometry.
#[derive(Clone, Debug)]
pub struct BlockConnectivity {
    num_nodes: usize,
    conn: Vec<[u32; 8]>,
    coords: Option<Vec<[f64; 3]>>,
}

impl BlockConnectivity {
    /// Creates a connectivity, asserting every node index is in range.
    pub fn new(num_nodes: usize, conn: Vec<[u32; 8]>) -> Self {
        assert!(!conn.is_empty(), "connectivity has no blocks");
        for (b, nodes) in conn.iter().enumerate() {
            for &n in nodes.iter() {
                assert!(
                    (n as usize) < num_nodes,
                    "block {} references node {} but only {} nodes exist",
                    b,
                    n,
                    num_nodes
                );
            }
        }
        BlockConnectivity { num_nodes, conn, coords: None }
    }

    /// Attaches node coordinates (3 per node).
    pub fn with_coords(mut self, coords: Vec<[f64; 3]>) -> Self {
        assert_eq!(
            coords.len(),
            self.num_nodes,
            "coordinate array length does not match the node count"
        );
        self.coords = Some(coords);
        self
    }

    pub fn num_nodes(&self) -> usize {
        self.num_nodes
    }

    pub fn num_blocks(&self) -> usize {
        self.conn.len()
    }

    pub fn block_nodes(&self, block: u32) -> &[u32; 8] {
        &self.conn[block as usize]
    }

    pub fn node_coords(&self, node: u32) -> Option<[f64; 3]> {
        self.coords.as_ref().map(|c| c[node as usize])
    }
}
